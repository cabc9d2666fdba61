use std::fmt;

/// Errors raised while reading, merging, or interpolating module descriptors.
#[derive(Debug)]
pub enum ConfigError {
    /// The descriptor document could not be parsed.
    Parse(String),
    /// An I/O error occurred while reading descriptor or env files.
    Io(String),
    /// A `${VAR}` placeholder referenced a variable that is not defined in
    /// the module's `.env` file or the process environment.
    MissingEnvVar { module: String, var: String },
    /// A placeholder was opened with `${` but never closed.
    UnclosedPlaceholder(String),
    /// No factory is registered for the named module.
    UnknownModule { kind: &'static str, name: String },
    /// Two descriptors in the same list conflict in an unmergeable way.
    Conflict(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse(msg) => write!(f, "Descriptor parse error: {msg}"),
            ConfigError::Io(msg) => write!(f, "Config I/O error: {msg}"),
            ConfigError::MissingEnvVar { module, var } => {
                write!(f, "Module '{module}': env var '{var}' is not defined")
            }
            ConfigError::UnclosedPlaceholder(s) => {
                write!(f, "Unclosed placeholder in: {s}")
            }
            ConfigError::UnknownModule { kind, name } => {
                write!(f, "No factory registered for {kind} '{name}'")
            }
            ConfigError::Conflict(msg) => write!(f, "Descriptor conflict: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err.to_string())
    }
}

/// Errors raised during registry lookup and dependency resolution.
#[derive(Debug)]
pub enum DependencyError {
    /// `get` without a config disambiguator matched more than one instance.
    AmbiguousLookup {
        kind: &'static str,
        name: String,
        instances: usize,
    },
    /// No instance is registered under the requested key.
    UnresolvedLookup { kind: &'static str, name: String },
    /// The registered instance is not of the requested type.
    TypeMismatch {
        kind: &'static str,
        name: String,
        expected: &'static str,
    },
    /// A dependency cycle was detected among modules of the same kind.
    CyclicDependency { cycle: Vec<String> },
}

impl fmt::Display for DependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyError::AmbiguousLookup {
                kind,
                name,
                instances,
            } => write!(
                f,
                "Ambiguous lookup for {kind} '{name}': {instances} instances registered. \
                 Pass the instance config to disambiguate.",
            ),
            DependencyError::UnresolvedLookup { kind, name } => {
                write!(f, "No {kind} registered under '{name}'")
            }
            DependencyError::TypeMismatch {
                kind,
                name,
                expected,
            } => write!(
                f,
                "{kind} '{name}' is not of the requested type '{expected}'"
            ),
            DependencyError::CyclicDependency { cycle } => {
                write!(f, "Circular dependency detected: {}", cycle.join(" -> "))
            }
        }
    }
}

impl std::error::Error for DependencyError {}

/// Errors raised by module lifecycle transitions.
#[derive(Debug)]
pub enum LifecycleError {
    /// The caller presented a capability token that does not match the
    /// kernel's token.
    UnauthorizedLifecycle,
    /// A module refused to start.
    StartFailed { module: String, reason: String },
    /// A module did not stop within the shutdown deadline.
    ShutdownTimeout { module: String, seconds: u64 },
    /// `start` was aborted by the shutdown signal.
    Cancelled,
    /// Dependency resolution failed during `start`.
    Dependency(DependencyError),
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::UnauthorizedLifecycle => {
                write!(f, "Privileged lifecycle method called without the kernel capability key")
            }
            LifecycleError::StartFailed { module, reason } => {
                write!(f, "Module '{module}' failed to start: {reason}")
            }
            LifecycleError::ShutdownTimeout { module, seconds } => {
                write!(f, "Module '{module}' exceeded the {seconds}s shutdown deadline")
            }
            LifecycleError::Cancelled => write!(f, "Lifecycle operation cancelled by shutdown signal"),
            LifecycleError::Dependency(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl From<DependencyError> for LifecycleError {
    fn from(err: DependencyError) -> Self {
        LifecycleError::Dependency(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_lookup_names_the_instance_count() {
        let err = DependencyError::AmbiguousLookup {
            kind: "provider",
            name: "object-provider".into(),
            instances: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("object-provider"));
        assert!(msg.contains('2'));
    }

    #[test]
    fn cyclic_dependency_joins_the_cycle() {
        let err = DependencyError::CyclicDependency {
            cycle: vec!["a".into(), "b".into()],
        };
        assert_eq!(
            err.to_string(),
            "Circular dependency detected: a -> b"
        );
    }

    #[test]
    fn lifecycle_wraps_dependency_errors() {
        let err: LifecycleError = DependencyError::UnresolvedLookup {
            kind: "service",
            name: "sessions".into(),
        }
        .into();
        assert!(err.to_string().contains("sessions"));
    }
}
