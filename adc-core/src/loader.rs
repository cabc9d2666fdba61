use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::descriptor::ModuleDescriptor;
use crate::envfile;
use crate::error::ConfigError;
use crate::lifecycle::ErasedModule;
use crate::registry::ModuleKind;

impl ModuleKind {
    /// Directory name a module of this kind lives under.
    pub fn dir_name(&self) -> &'static str {
        match self {
            ModuleKind::Provider => "providers",
            ModuleKind::Utility => "utilities",
            ModuleKind::Service => "services",
            ModuleKind::App => "apps",
        }
    }
}

/// Everything a factory needs to construct a module instance: the fully
/// merged and interpolated descriptor, and the module's directory.
pub struct LoadContext {
    pub descriptor: ModuleDescriptor,
    pub module_dir: PathBuf,
}

/// Constructor for one module type, registered by name.
///
/// Rust has no dynamic code loading, so the loader resolves descriptors
/// against an explicit factory table built at startup — the registration
/// side of the platform's module contract.
pub trait ModuleFactory: Send + Sync + 'static {
    fn build(&self, ctx: &LoadContext) -> Result<Arc<dyn ErasedModule>, ConfigError>;
}

impl<F> ModuleFactory for F
where
    F: Fn(&LoadContext) -> Result<Arc<dyn ErasedModule>, ConfigError> + Send + Sync + 'static,
{
    fn build(&self, ctx: &LoadContext) -> Result<Arc<dyn ErasedModule>, ConfigError> {
        self(ctx)
    }
}

/// A successfully loaded module together with its effective descriptor.
#[derive(Debug)]
pub struct LoadedModule {
    pub descriptor: ModuleDescriptor,
    pub instance: Arc<dyn ErasedModule>,
}

/// Resolves module descriptors into instances.
///
/// For each descriptor the loader:
/// 1. resolves `<root>/<kind-dir>/<name>/`,
/// 2. merges `defaults.json` from that directory under the instance config,
/// 3. interpolates `${VAR}` placeholders from `<dir>/.env`,
/// 4. invokes the registered factory.
///
/// Loading is tolerant: descriptors with `failOnError=false` that fail are
/// logged and skipped; `failOnError=true` aborts the batch.
pub struct ModuleLoader {
    root: PathBuf,
    factories: DashMap<(ModuleKind, String), Arc<dyn ModuleFactory>>,
}

impl ModuleLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            factories: DashMap::new(),
        }
    }

    /// Register the constructor for `(kind, name)`.
    pub fn register_factory(
        &self,
        kind: ModuleKind,
        name: &str,
        factory: impl ModuleFactory,
    ) -> &Self {
        self.factories
            .insert((kind, name.to_string()), Arc::new(factory));
        self
    }

    /// The directory a descriptor resolves to.
    pub fn module_dir(&self, descriptor: &ModuleDescriptor) -> PathBuf {
        self.root
            .join(descriptor.kind.dir_name())
            .join(&descriptor.name)
    }

    /// Merge defaults and interpolate environment, without instantiating.
    pub fn prepare(&self, descriptor: &ModuleDescriptor) -> Result<LoadContext, ConfigError> {
        let module_dir = self.module_dir(descriptor);

        let merged = match read_defaults(&module_dir)? {
            Some(defaults) => defaults.merged_with(descriptor),
            None => descriptor.clone(),
        };

        let env = envfile::load_env_file(&module_dir.join(".env"))?;

        // Interpolate across the whole descriptor, sub-modules included.
        let mut value = serde_json::to_value(&merged)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        envfile::interpolate_value(&mut value, &merged.name, &env)?;
        let descriptor: ModuleDescriptor =
            serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;

        Ok(LoadContext {
            descriptor,
            module_dir,
        })
    }

    /// Prepare and instantiate a single descriptor.
    pub fn instantiate(&self, descriptor: &ModuleDescriptor) -> Result<LoadedModule, ConfigError> {
        let ctx = self.prepare(descriptor)?;
        let factory = self
            .factories
            .get(&(ctx.descriptor.kind, ctx.descriptor.name.clone()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ConfigError::UnknownModule {
                kind: ctx.descriptor.kind.as_str(),
                name: ctx.descriptor.name.clone(),
            })?;

        let instance = factory.build(&ctx)?;
        debug!(kind = %ctx.descriptor.kind, name = %ctx.descriptor.name, "Module instantiated");
        Ok(LoadedModule {
            descriptor: ctx.descriptor,
            instance,
        })
    }

    /// Instantiate a batch, honoring each descriptor's failure policy.
    pub fn instantiate_all(
        &self,
        descriptors: &[ModuleDescriptor],
    ) -> Result<Vec<LoadedModule>, ConfigError> {
        let mut loaded = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            match self.instantiate(descriptor) {
                Ok(module) => loaded.push(module),
                Err(err) if descriptor.fail_on_error => return Err(err),
                Err(err) => {
                    warn!(
                        kind = %descriptor.kind,
                        name = %descriptor.name,
                        error = %err,
                        "Skipping module that failed to load"
                    );
                }
            }
        }
        Ok(loaded)
    }
}

fn read_defaults(module_dir: &Path) -> Result<Option<ModuleDescriptor>, ConfigError> {
    let path = module_dir.join("defaults.json");
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    ModuleDescriptor::from_json(&content).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{LifecycleGate, Module};

    struct Built {
        name: String,
        gate: LifecycleGate,
        custom: serde_json::Map<String, serde_json::Value>,
    }

    impl Module for Built {
        fn name(&self) -> &str {
            &self.name
        }
        fn kind(&self) -> ModuleKind {
            ModuleKind::Service
        }
        fn gate(&self) -> &LifecycleGate {
            &self.gate
        }
    }

    fn test_factory() -> impl ModuleFactory {
        |ctx: &LoadContext| {
            Ok(Arc::new(Built {
                name: ctx.descriptor.name.clone(),
                gate: LifecycleGate::new(),
                custom: ctx.descriptor.custom.clone(),
            }) as Arc<dyn ErasedModule>)
        }
    }

    fn write(dir: &Path, file: &str, content: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(file), content).unwrap();
    }

    #[test]
    fn merges_defaults_and_interpolates_env() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("services").join("sessions");
        write(
            &dir,
            "defaults.json",
            r#"{"name": "sessions", "type": "service", "custom": {"ttl": 900, "issuer": "adc"}}"#,
        );
        write(&dir, ".env", "SESSION_SECRET=topsecret\n");

        let loader = ModuleLoader::new(root.path());
        loader.register_factory(ModuleKind::Service, "sessions", test_factory());

        let descriptor = ModuleDescriptor::from_json(
            r#"{"name": "sessions", "type": "service", "custom": {"ttl": 300, "secret": "${SESSION_SECRET}"}}"#,
        )
        .unwrap();

        let loaded = loader.instantiate(&descriptor).unwrap();
        let built = loaded
            .instance
            .as_any()
            .downcast_ref::<Built>()
            .unwrap();
        assert_eq!(built.custom["ttl"], serde_json::json!(300));
        assert_eq!(built.custom["issuer"], serde_json::json!("adc"));
        assert_eq!(built.custom["secret"], serde_json::json!("topsecret"));
    }

    #[test]
    fn unknown_module_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let loader = ModuleLoader::new(root.path());
        let descriptor = ModuleDescriptor::new("ghost", ModuleKind::Provider);
        let err = loader.instantiate(&descriptor).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownModule { .. }));
    }

    #[test]
    fn tolerant_batch_skips_failures() {
        let root = tempfile::tempdir().unwrap();
        let loader = ModuleLoader::new(root.path());
        loader.register_factory(ModuleKind::Service, "good", test_factory());

        let good = ModuleDescriptor::new("good", ModuleKind::Service);
        let bad = ModuleDescriptor::new("missing", ModuleKind::Service);

        let loaded = loader.instantiate_all(&[bad, good]).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].descriptor.name, "good");
    }

    #[test]
    fn fail_on_error_aborts_the_batch() {
        let root = tempfile::tempdir().unwrap();
        let loader = ModuleLoader::new(root.path());
        loader.register_factory(ModuleKind::Service, "good", test_factory());

        let good = ModuleDescriptor::new("good", ModuleKind::Service);
        let mut bad = ModuleDescriptor::new("missing", ModuleKind::Service);
        bad.fail_on_error = true;

        let err = loader.instantiate_all(&[good, bad]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownModule { .. }));
    }

    #[test]
    fn missing_env_var_fails_the_module() {
        let root = tempfile::tempdir().unwrap();
        let loader = ModuleLoader::new(root.path());
        loader.register_factory(ModuleKind::Service, "sessions", test_factory());

        let descriptor = ModuleDescriptor::from_json(
            r#"{"name": "sessions", "type": "service", "custom": {"secret": "${ADC_TEST_UNSET_VAR}"}}"#,
        )
        .unwrap();
        let err = loader.instantiate(&descriptor).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar { .. }));
    }
}
