use std::sync::Arc;

use tracing::warn;

use crate::descriptor::ModuleDescriptor;
use crate::error::DependencyError;
use crate::kernel::Kernel;

/// Collaborator that exposes an app's UI bundle to the frontend build
/// pipeline. Registration failures are never fatal — a headless deployment
/// simply has no registrar.
pub trait UiRegistrar: Send + Sync {
    fn register_ui(
        &self,
        app_name: &str,
        ui_module: &serde_json::Value,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Shared base for app modules: holds the merged descriptor and resolves
/// this app's dependencies with the config recorded in it.
///
/// Two apps asking for the same provider name get the instance each one
/// configured, because the lookup passes the app's own `custom` block for
/// that provider as the disambiguator.
pub struct AppBase {
    descriptor: ModuleDescriptor,
}

impl AppBase {
    pub fn new(descriptor: ModuleDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// The app's merged configuration (`defaults.json` ⊕ instance).
    pub fn custom(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.descriptor.custom
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    /// Look up a provider declared by this app.
    pub fn my_provider<T: Send + Sync + 'static>(
        &self,
        kernel: &Kernel,
        name: &str,
    ) -> Result<Arc<T>, DependencyError> {
        let declared = self.descriptor.providers.iter().find(|d| d.name == name);
        kernel.get_provider::<T>(name, declared.map(|d| &d.custom))
    }

    /// Look up a utility declared by this app.
    pub fn my_utility<T: Send + Sync + 'static>(
        &self,
        kernel: &Kernel,
        name: &str,
    ) -> Result<Arc<T>, DependencyError> {
        let declared = self.descriptor.utilities.iter().find(|d| d.name == name);
        kernel.get_utility::<T>(name, declared.map(|d| &d.custom))
    }

    /// Look up a service declared by this app.
    pub fn my_service<T: Send + Sync + 'static>(
        &self,
        kernel: &Kernel,
        name: &str,
    ) -> Result<Arc<T>, DependencyError> {
        let declared = self.descriptor.services.iter().find(|d| d.name == name);
        kernel.get_service::<T>(name, declared.map(|d| &d.custom))
    }

    /// Provider descriptors visible to one of this app's services: the
    /// service's own list, or the app's merged list when the service
    /// declares none.
    pub fn providers_for_service(&self, service_name: &str) -> &[ModuleDescriptor] {
        let own = self
            .descriptor
            .services
            .iter()
            .find(|s| s.name == service_name)
            .map(|s| s.providers.as_slice());
        match own {
            Some(providers) if !providers.is_empty() => providers,
            _ => &self.descriptor.providers,
        }
    }

    /// Announce this app's UI bundle to the external UI collaborator.
    /// Failure is logged, never propagated.
    pub fn register_ui(&self, registrar: &dyn UiRegistrar) {
        let Some(ui_module) = &self.descriptor.ui_module else {
            return;
        };
        if let Err(err) = registrar.register_ui(&self.descriptor.name, ui_module) {
            warn!(app = %self.descriptor.name, error = %err, "UI module registration failed");
        }
    }
}
