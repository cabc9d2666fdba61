use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::error::LifecycleError;
use crate::registry::ModuleKind;

/// Unforgeable token generated once at kernel construction.
///
/// Privileged lifecycle methods (`start`/`stop`) must be called with this
/// key; the kernel holds the sole original and never leaks it through
/// logging or serialization. Comparison is constant-time.
#[derive(Clone)]
pub struct CapabilityKey([u8; 32]);

impl CapabilityKey {
    /// Generate a fresh 256-bit capability key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Check that `presented` equals this key.
    pub fn authorize(&self, presented: &CapabilityKey) -> Result<(), LifecycleError> {
        if bool::from(self.0.ct_eq(&presented.0)) {
            Ok(())
        } else {
            Err(LifecycleError::UnauthorizedLifecycle)
        }
    }
}

impl PartialEq for CapabilityKey {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl Eq for CapabilityKey {}

impl fmt::Debug for CapabilityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CapabilityKey(..)")
    }
}

/// Per-instance lifecycle gate embedded in every module.
///
/// The kernel binds its capability key onto the gate at registration time;
/// `start`/`stop` implementations call [`LifecycleGate::authorize`] before
/// doing anything else. The gate also carries the running flag that makes
/// re-`start` a no-op.
#[derive(Default)]
pub struct LifecycleGate {
    expected: OnceLock<CapabilityKey>,
    running: AtomicBool,
}

impl fmt::Debug for LifecycleGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleGate")
            .field("bound", &self.expected.get().is_some())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl LifecycleGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the kernel's key. Later bindings are ignored — the first
    /// binder (the kernel) wins.
    pub fn bind(&self, key: &CapabilityKey) {
        let _ = self.expected.set(key.clone());
    }

    /// Verify the presented key against the bound kernel key.
    ///
    /// An unbound gate refuses every caller: a module that was never
    /// registered with the kernel has no authorized callers.
    pub fn authorize(&self, presented: &CapabilityKey) -> Result<(), LifecycleError> {
        match self.expected.get() {
            Some(expected) => expected.authorize(presented),
            None => Err(LifecycleError::UnauthorizedLifecycle),
        }
    }

    /// Transition to running. Returns `false` when already running
    /// (the caller should treat the start as a no-op).
    pub fn mark_started(&self) -> bool {
        !self.running.swap(true, Ordering::SeqCst)
    }

    /// Transition to stopped. Returns `false` when not running.
    pub fn mark_stopped(&self) -> bool {
        self.running.swap(false, Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// A kernel-managed module: a provider, utility, service, or app.
///
/// `start` and `stop` are privileged — implementations must verify the
/// presented capability key via their [`LifecycleGate`] before acting:
///
/// ```ignore
/// impl Module for SessionService {
///     fn name(&self) -> &str { "sessions" }
///     fn kind(&self) -> ModuleKind { ModuleKind::Service }
///     fn gate(&self) -> &LifecycleGate { &self.gate }
///
///     async fn start(&self, key: &CapabilityKey) -> Result<(), LifecycleError> {
///         self.gate.authorize(key)?;
///         self.store.connect().await?;
///         Ok(())
///     }
/// }
/// ```
///
/// Modules must not invoke their own `start` or `stop`; only the kernel
/// holds the key.
#[diagnostic::on_unimplemented(
    message = "`{Self}` is not a kernel module",
    label = "this type cannot be registered with the kernel",
    note = "implement `Module` with a `LifecycleGate` field and capability-checked start/stop"
)]
pub trait Module: Send + Sync + 'static {
    /// The module's registered name.
    fn name(&self) -> &str;

    /// The module's kind (provider, utility, service, or app).
    fn kind(&self) -> ModuleKind;

    /// The lifecycle gate the kernel binds its key onto.
    fn gate(&self) -> &LifecycleGate;

    /// Bring the module up. Called exactly once by the kernel per
    /// start/stop cycle; the default implementation only checks the key.
    fn start(
        &self,
        key: &CapabilityKey,
    ) -> impl Future<Output = Result<(), LifecycleError>> + Send {
        let checked = self.gate().authorize(key);
        async move { checked }
    }

    /// Tear the module down. Default implementation only checks the key.
    fn stop(
        &self,
        key: &CapabilityKey,
    ) -> impl Future<Output = Result<(), LifecycleError>> + Send {
        let checked = self.gate().authorize(key);
        async move { checked }
    }
}

/// Object-safe twin of [`Module`], used for registry storage.
///
/// Blanket-implemented for every `Module`; user code never implements this
/// directly.
pub trait ErasedModule: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn kind(&self) -> ModuleKind;
    fn gate(&self) -> &LifecycleGate;
    fn start<'a>(
        &'a self,
        key: &'a CapabilityKey,
    ) -> Pin<Box<dyn Future<Output = Result<(), LifecycleError>> + Send + 'a>>;
    fn stop<'a>(
        &'a self,
        key: &'a CapabilityKey,
    ) -> Pin<Box<dyn Future<Output = Result<(), LifecycleError>> + Send + 'a>>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_arc(self: std::sync::Arc<Self>) -> std::sync::Arc<dyn Any + Send + Sync>;
}

impl fmt::Debug for dyn ErasedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErasedModule")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

impl<T: Module> ErasedModule for T {
    fn name(&self) -> &str {
        Module::name(self)
    }

    fn kind(&self) -> ModuleKind {
        Module::kind(self)
    }

    fn gate(&self) -> &LifecycleGate {
        Module::gate(self)
    }

    fn start<'a>(
        &'a self,
        key: &'a CapabilityKey,
    ) -> Pin<Box<dyn Future<Output = Result<(), LifecycleError>> + Send + 'a>> {
        Box::pin(Module::start(self, key))
    }

    fn stop<'a>(
        &'a self,
        key: &'a CapabilityKey,
    ) -> Pin<Box<dyn Future<Output = Result<(), LifecycleError>> + Send + 'a>> {
        Box::pin(Module::stop(self, key))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: std::sync::Arc<Self>) -> std::sync::Arc<dyn Any + Send + Sync> {
        self
    }
}
