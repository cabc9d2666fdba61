//! Core runtime for the ADC platform.
//!
//! The kernel resolves module descriptors into provider/utility/service/app
//! instances, wires their dependencies through a multi-instance registry,
//! and drives their lifecycle behind a capability gate: only a caller
//! holding the kernel's capability key may invoke `start`/`stop`.
//!
//! # Example
//!
//! ```ignore
//! use adc_core::prelude::*;
//!
//! let kernel = Kernel::new();
//! let loader = ModuleLoader::new("./modules");
//! loader.register_factory(ModuleKind::Provider, "object-provider", object_provider_factory);
//!
//! kernel.install(&loader, &descriptors)?;
//! kernel.start().await?;
//! // ...
//! kernel.stop().await;
//! ```

pub mod app;
pub mod descriptor;
pub mod envfile;
pub mod error;
pub mod kernel;
pub mod lifecycle;
pub mod loader;
pub mod prelude;
pub mod profile;
pub mod registry;

pub use app::{AppBase, UiRegistrar};
pub use descriptor::{merge_descriptor_lists, ModuleDescriptor};
pub use error::{ConfigError, DependencyError, LifecycleError};
pub use kernel::{Kernel, ModuleRef};
pub use lifecycle::{CapabilityKey, ErasedModule, LifecycleGate, Module};
pub use loader::{LoadContext, LoadedModule, ModuleFactory, ModuleLoader};
pub use profile::{init_tracing, Profile};
pub use registry::{ConfigHash, ModuleKey, ModuleKind, Registry};
