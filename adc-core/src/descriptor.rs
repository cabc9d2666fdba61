use serde::{Deserialize, Serialize};

use crate::registry::ModuleKind;

/// One entry of an app configuration document: a provider, utility,
/// service, or app instance to bring up.
///
/// The `custom` map is arbitrary and participates in instance identity:
/// two descriptors with the same `name` but different `custom` content are
/// distinct instances.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ModuleKind,
    #[serde(default)]
    pub custom: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub providers: Vec<ModuleDescriptor>,
    #[serde(default)]
    pub utilities: Vec<ModuleDescriptor>,
    #[serde(default)]
    pub services: Vec<ModuleDescriptor>,
    #[serde(default)]
    pub fail_on_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ui_module: Option<serde_json::Value>,
}

impl ModuleDescriptor {
    /// A bare descriptor with empty custom config and no sub-modules.
    pub fn new(name: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            name: name.into(),
            kind,
            custom: serde_json::Map::new(),
            providers: Vec::new(),
            utilities: Vec::new(),
            services: Vec::new(),
            fail_on_error: false,
            ui_module: None,
        }
    }

    /// Parse a descriptor from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, crate::error::ConfigError> {
        serde_json::from_str(json).map_err(|e| crate::error::ConfigError::Parse(e.to_string()))
    }

    /// Merge `instance` over `self` (the defaults): instance fields win,
    /// `custom` merges per key, and sub-module lists merge recursively
    /// by name.
    pub fn merged_with(&self, instance: &ModuleDescriptor) -> ModuleDescriptor {
        let mut custom = self.custom.clone();
        for (key, value) in &instance.custom {
            custom.insert(key.clone(), value.clone());
        }

        ModuleDescriptor {
            name: instance.name.clone(),
            kind: instance.kind,
            custom,
            providers: merge_descriptor_lists(&self.providers, &instance.providers),
            utilities: merge_descriptor_lists(&self.utilities, &instance.utilities),
            services: merge_descriptor_lists(&self.services, &instance.services),
            fail_on_error: self.fail_on_error || instance.fail_on_error,
            ui_module: instance.ui_module.clone().or_else(|| self.ui_module.clone()),
        }
    }
}

/// Merge two descriptor lists by name.
///
/// Entries present in both lists are merged field-by-field with the
/// instance side winning; defaults-only entries keep their position and
/// instance-only entries are appended.
pub fn merge_descriptor_lists(
    defaults: &[ModuleDescriptor],
    instance: &[ModuleDescriptor],
) -> Vec<ModuleDescriptor> {
    let mut merged: Vec<ModuleDescriptor> = Vec::with_capacity(defaults.len() + instance.len());

    for default in defaults {
        match instance.iter().find(|d| d.name == default.name) {
            Some(overlay) => merged.push(default.merged_with(overlay)),
            None => merged.push(default.clone()),
        }
    }

    for extra in instance {
        if !defaults.iter().any(|d| d.name == extra.name) {
            merged.push(extra.clone());
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(json: serde_json::Value) -> ModuleDescriptor {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn parses_wire_format() {
        let d = ModuleDescriptor::from_json(
            r#"{
                "name": "sessions",
                "type": "service",
                "custom": {"ttl": 900},
                "providers": [{"name": "object-provider", "type": "provider"}],
                "failOnError": true
            }"#,
        )
        .unwrap();
        assert_eq!(d.name, "sessions");
        assert_eq!(d.kind, ModuleKind::Service);
        assert!(d.fail_on_error);
        assert_eq!(d.providers.len(), 1);
        assert_eq!(d.custom["ttl"], serde_json::json!(900));
    }

    #[test]
    fn fail_on_error_defaults_to_false() {
        let d = ModuleDescriptor::from_json(r#"{"name": "x", "type": "utility"}"#).unwrap();
        assert!(!d.fail_on_error);
    }

    #[test]
    fn instance_custom_wins_per_key() {
        let defaults = descriptor(serde_json::json!({
            "name": "sessions", "type": "service",
            "custom": {"ttl": 900, "issuer": "adc"}
        }));
        let instance = descriptor(serde_json::json!({
            "name": "sessions", "type": "service",
            "custom": {"ttl": 300}
        }));
        let merged = defaults.merged_with(&instance);
        assert_eq!(merged.custom["ttl"], serde_json::json!(300));
        assert_eq!(merged.custom["issuer"], serde_json::json!("adc"));
    }

    #[test]
    fn sub_module_lists_merge_recursively() {
        let defaults = descriptor(serde_json::json!({
            "name": "app", "type": "app",
            "providers": [
                {"name": "object-provider", "type": "provider", "custom": {"db": "main", "pool": 4}},
                {"name": "kv-provider", "type": "provider"}
            ]
        }));
        let instance = descriptor(serde_json::json!({
            "name": "app", "type": "app",
            "providers": [
                {"name": "object-provider", "type": "provider", "custom": {"db": "tenant"}},
                {"name": "http-provider", "type": "provider"}
            ]
        }));
        let merged = defaults.merged_with(&instance);
        let names: Vec<&str> = merged.providers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["object-provider", "kv-provider", "http-provider"]);

        let object = &merged.providers[0];
        assert_eq!(object.custom["db"], serde_json::json!("tenant"));
        assert_eq!(object.custom["pool"], serde_json::json!(4));
    }

    #[test]
    fn merge_list_keeps_defaults_order() {
        let defaults = vec![
            ModuleDescriptor::new("a", ModuleKind::Provider),
            ModuleDescriptor::new("b", ModuleKind::Provider),
        ];
        let instance = vec![
            ModuleDescriptor::new("c", ModuleKind::Provider),
            ModuleDescriptor::new("a", ModuleKind::Provider),
        ];
        let merged = merge_descriptor_lists(&defaults, &instance);
        let names: Vec<&str> = merged.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }
}
