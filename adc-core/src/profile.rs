use std::fmt;

/// Runtime profile, read from `ADC_PROFILE`.
///
/// Controls whether cookies carry `Secure` and whether module hot reload
/// is active. Anything other than a production value means dev.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Profile {
    Dev,
    Prod,
}

impl Profile {
    /// Resolve from the `ADC_PROFILE` environment variable
    /// (`prod`/`production` → [`Profile::Prod`], default dev).
    pub fn from_env() -> Self {
        match std::env::var("ADC_PROFILE") {
            Ok(value) => Self::parse(&value),
            Err(_) => Profile::Dev,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Profile::Prod,
            _ => Profile::Dev,
        }
    }

    pub fn is_prod(&self) -> bool {
        matches!(self, Profile::Prod)
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::Dev => f.write_str("dev"),
            Profile::Prod => f.write_str("prod"),
        }
    }
}

/// Initialize the tracing subscriber with env-filter support.
///
/// Call once at process start; later calls are ignored.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_recognizes_production_values() {
        assert_eq!(Profile::parse("prod"), Profile::Prod);
        assert_eq!(Profile::parse("Production"), Profile::Prod);
        assert_eq!(Profile::parse("dev"), Profile::Dev);
        assert_eq!(Profile::parse("staging"), Profile::Dev);
    }
}
