use std::collections::HashMap;
use std::path::Path;

use crate::error::ConfigError;

/// Read a module `.env` file into a key/value map, without touching the
/// process environment.
///
/// Format is standard dotenv: one `KEY=VALUE` per line, `#` comments,
/// optional double-quoted values. A missing file yields an empty map —
/// modules without secrets are the common case.
pub fn load_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let mut vars = HashMap::new();
    let iter = dotenvy::from_path_iter(path)
        .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
    for item in iter {
        let (key, value) =
            item.map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        vars.insert(key, value);
    }
    Ok(vars)
}

/// Replace `${VAR}` placeholders in a single string.
///
/// Resolution order: the module's `.env` map first, then the process
/// environment. An unresolvable variable is an error — a descriptor that
/// references a secret must not silently keep the placeholder text.
pub fn resolve_placeholders(
    value: &str,
    module: &str,
    env: &HashMap<String, String>,
) -> Result<String, ConfigError> {
    let mut result = value.to_string();
    while let Some(start) = result.find("${") {
        let end = result[start..]
            .find('}')
            .ok_or_else(|| ConfigError::UnclosedPlaceholder(value.to_string()))?;
        let var = result[start + 2..start + end].trim().to_string();
        let resolved = match env.get(&var) {
            Some(v) => v.clone(),
            None => std::env::var(&var).map_err(|_| ConfigError::MissingEnvVar {
                module: module.to_string(),
                var: var.clone(),
            })?,
        };
        result = format!(
            "{}{}{}",
            &result[..start],
            resolved,
            &result[start + end + 1..]
        );
    }
    Ok(result)
}

/// Walk a JSON value and interpolate placeholders in every string leaf.
pub fn interpolate_value(
    value: &mut serde_json::Value,
    module: &str,
    env: &HashMap<String, String>,
) -> Result<(), ConfigError> {
    match value {
        serde_json::Value::String(s) => {
            if s.contains("${") {
                *s = resolve_placeholders(s, module, env)?;
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                interpolate_value(item, module, env)?;
            }
        }
        serde_json::Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                interpolate_value(v, module, env)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Interpolate placeholders across a descriptor's `custom` map.
pub fn interpolate_custom(
    custom: &mut serde_json::Map<String, serde_json::Value>,
    module: &str,
    env: &HashMap<String, String>,
) -> Result<(), ConfigError> {
    for (_, value) in custom.iter_mut() {
        interpolate_value(value, module, env)?;
    }
    Ok(())
}
