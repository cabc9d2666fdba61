//! Re-exports of the most commonly used core types.

pub use crate::app::{AppBase, UiRegistrar};
pub use crate::descriptor::ModuleDescriptor;
pub use crate::error::{ConfigError, DependencyError, LifecycleError};
pub use crate::kernel::{Kernel, ModuleRef};
pub use crate::lifecycle::{CapabilityKey, ErasedModule, LifecycleGate, Module};
pub use crate::loader::{LoadContext, LoadedModule, ModuleFactory, ModuleLoader};
pub use crate::profile::Profile;
pub use crate::registry::{ConfigHash, ModuleKey, ModuleKind, Registry};
