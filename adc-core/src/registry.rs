use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::DependencyError;
use crate::lifecycle::ErasedModule;

/// The four module kinds the kernel manages, in start order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Provider,
    Utility,
    Service,
    App,
}

impl ModuleKind {
    /// All kinds in lifecycle start order (leaves first).
    pub const START_ORDER: [ModuleKind; 4] = [
        ModuleKind::Provider,
        ModuleKind::Utility,
        ModuleKind::Service,
        ModuleKind::App,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Provider => "provider",
            ModuleKind::Utility => "utility",
            ModuleKind::Service => "service",
            ModuleKind::App => "app",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable hash over a descriptor's `custom` map.
///
/// Two descriptors with the same name but different `custom` content are
/// distinct instances; this hash is the disambiguator. Computed as SHA-256
/// over the canonical (recursively key-sorted) JSON rendering, so key
/// insertion order never changes identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigHash([u8; 32]);

impl ConfigHash {
    /// Hash of the empty `custom` map.
    pub fn empty() -> Self {
        Self::of(&serde_json::Map::new())
    }

    /// Hash a descriptor's `custom` map.
    pub fn of(custom: &serde_json::Map<String, serde_json::Value>) -> Self {
        let mut hasher = Sha256::new();
        hash_map_canonical(custom, &mut hasher);
        Self(hasher.finalize().into())
    }
}

fn hash_value_canonical(value: &serde_json::Value, hasher: &mut Sha256) {
    match value {
        serde_json::Value::Null => hasher.update(b"n"),
        serde_json::Value::Bool(b) => {
            hasher.update(b"b");
            hasher.update([*b as u8]);
        }
        serde_json::Value::Number(n) => {
            hasher.update(b"#");
            hasher.update(n.to_string().as_bytes());
        }
        serde_json::Value::String(s) => {
            hasher.update(b"s");
            hasher.update((s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        }
        serde_json::Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_value_canonical(item, hasher);
            }
            hasher.update(b"]");
        }
        serde_json::Value::Object(map) => hash_map_canonical(map, hasher),
    }
}

fn hash_map_canonical(
    map: &serde_json::Map<String, serde_json::Value>,
    hasher: &mut Sha256,
) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    hasher.update(b"{");
    for key in keys {
        hasher.update((key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        hash_value_canonical(&map[key], hasher);
    }
    hasher.update(b"}");
}

impl fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfigHash({self})")
    }
}

/// Full registry key: `(kind, name, config-hash)`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ModuleKey {
    pub kind: ModuleKind,
    pub name: String,
    pub hash: ConfigHash,
}

impl ModuleKey {
    pub fn new(kind: ModuleKind, name: impl Into<String>, hash: ConfigHash) -> Self {
        Self {
            kind,
            name: name.into(),
            hash,
        }
    }
}

impl fmt::Debug for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.kind, self.name, self.hash)
    }
}

/// Typed multi-instance module store.
///
/// Entries are keyed by `(kind, name, config-hash)`; an index on
/// `(kind, name)` enumerates the instances sharing a name. Mutations are
/// serialized per key by the shard locking of the underlying map, and `get`
/// is linearizable relative to `register`/`remove` for the same key.
pub struct Registry {
    entries: DashMap<ModuleKey, Arc<dyn ErasedModule>>,
    index: DashMap<(ModuleKind, String), Vec<ConfigHash>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            index: DashMap::new(),
        }
    }

    /// Register an instance under `(kind, name, hash(custom))`.
    ///
    /// Registering over an existing key overwrites the previous instance
    /// and logs a warning.
    pub fn register(
        &self,
        kind: ModuleKind,
        name: &str,
        instance: Arc<dyn ErasedModule>,
        custom: &serde_json::Map<String, serde_json::Value>,
    ) -> ModuleKey {
        let key = ModuleKey::new(kind, name, ConfigHash::of(custom));

        // Keep the index entry before inserting so readers racing with this
        // register either see the old instance or the new one, never a
        // dangling hash.
        let mut hashes = self
            .index
            .entry((kind, name.to_string()))
            .or_default();
        if !hashes.contains(&key.hash) {
            hashes.push(key.hash);
        }
        drop(hashes);

        if self.entries.insert(key.clone(), instance).is_some() {
            warn!(module = ?key, "Overriding existing registry entry");
        }
        key
    }

    /// Look up an instance. Without `custom`, exactly one instance of the
    /// name must exist; otherwise the lookup is ambiguous.
    pub fn get(
        &self,
        kind: ModuleKind,
        name: &str,
        custom: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Arc<dyn ErasedModule>, DependencyError> {
        let hash = match custom {
            Some(map) => ConfigHash::of(map),
            None => {
                let hashes = self.hashes_for(kind, name);
                match hashes.len() {
                    0 => {
                        return Err(DependencyError::UnresolvedLookup {
                            kind: kind.as_str(),
                            name: name.to_string(),
                        })
                    }
                    1 => hashes[0],
                    n => {
                        return Err(DependencyError::AmbiguousLookup {
                            kind: kind.as_str(),
                            name: name.to_string(),
                            instances: n,
                        })
                    }
                }
            }
        };

        self.entries
            .get(&ModuleKey::new(kind, name, hash))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DependencyError::UnresolvedLookup {
                kind: kind.as_str(),
                name: name.to_string(),
            })
    }

    /// Look up an instance and downcast it to `T`.
    pub fn get_as<T: Send + Sync + 'static>(
        &self,
        kind: ModuleKind,
        name: &str,
        custom: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Arc<T>, DependencyError> {
        let module = self.get(kind, name, custom)?;
        module
            .as_any_arc()
            .downcast::<T>()
            .map_err(|_| DependencyError::TypeMismatch {
                kind: kind.as_str(),
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// All instances registered under `(kind, name)`.
    pub fn get_all(&self, kind: ModuleKind, name: &str) -> Vec<Arc<dyn ErasedModule>> {
        self.hashes_for(kind, name)
            .into_iter()
            .filter_map(|hash| {
                self.entries
                    .get(&ModuleKey::new(kind, name, hash))
                    .map(|entry| entry.value().clone())
            })
            .collect()
    }

    /// Remove one instance. Returns the removed module, if any.
    pub fn remove(
        &self,
        kind: ModuleKind,
        name: &str,
        custom: &serde_json::Map<String, serde_json::Value>,
    ) -> Option<Arc<dyn ErasedModule>> {
        let key = ModuleKey::new(kind, name, ConfigHash::of(custom));
        let removed = self.entries.remove(&key).map(|(_, module)| module);
        if removed.is_some() {
            if let Some(mut hashes) = self.index.get_mut(&(kind, name.to_string())) {
                hashes.retain(|h| *h != key.hash);
            }
        }
        removed
    }

    /// Check whether an instance exists. Without `custom`, true when at
    /// least one instance of the name is registered.
    pub fn contains(
        &self,
        kind: ModuleKind,
        name: &str,
        custom: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> bool {
        match custom {
            Some(map) => self
                .entries
                .contains_key(&ModuleKey::new(kind, name, ConfigHash::of(map))),
            None => !self.hashes_for(kind, name).is_empty(),
        }
    }

    /// All keys of a given kind, in no particular order.
    pub fn keys_of_kind(&self, kind: ModuleKind) -> Vec<ModuleKey> {
        self.entries
            .iter()
            .filter(|entry| entry.key().kind == kind)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Fetch by full key.
    pub fn get_by_key(&self, key: &ModuleKey) -> Option<Arc<dyn ErasedModule>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn hashes_for(&self, kind: ModuleKind, name: &str) -> Vec<ConfigHash> {
        self.index
            .get(&(kind, name.to_string()))
            .map(|hashes| hashes.clone())
            .unwrap_or_default()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{LifecycleGate, Module};

    #[derive(Debug)]
    struct Stub {
        name: String,
        gate: LifecycleGate,
        tag: u32,
    }

    impl Stub {
        fn new(name: &str, tag: u32) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                gate: LifecycleGate::new(),
                tag,
            })
        }
    }

    impl Module for Stub {
        fn name(&self) -> &str {
            &self.name
        }
        fn kind(&self) -> ModuleKind {
            ModuleKind::Provider
        }
        fn gate(&self) -> &LifecycleGate {
            &self.gate
        }
    }

    fn custom(pairs: &[(&str, &str)]) -> serde_json::Map<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn config_hash_ignores_key_order() {
        let mut a = serde_json::Map::new();
        a.insert("x".into(), serde_json::json!(1));
        a.insert("y".into(), serde_json::json!({"z": true}));
        let mut b = serde_json::Map::new();
        b.insert("y".into(), serde_json::json!({"z": true}));
        b.insert("x".into(), serde_json::json!(1));
        assert_eq!(ConfigHash::of(&a), ConfigHash::of(&b));
    }

    #[test]
    fn config_hash_distinguishes_content() {
        let a = custom(&[("db", "main")]);
        let b = custom(&[("db", "replica")]);
        assert_ne!(ConfigHash::of(&a), ConfigHash::of(&b));
    }

    #[test]
    fn single_instance_resolves_without_disambiguator() {
        let registry = Registry::new();
        let cfg = custom(&[("db", "main")]);
        registry.register(ModuleKind::Provider, "object-provider", Stub::new("object-provider", 1), &cfg);

        let found = registry
            .get_as::<Stub>(ModuleKind::Provider, "object-provider", None)
            .unwrap();
        assert_eq!(found.tag, 1);
    }

    #[test]
    fn two_instances_require_disambiguator() {
        let registry = Registry::new();
        let main = custom(&[("db", "main")]);
        let replica = custom(&[("db", "replica")]);
        registry.register(ModuleKind::Provider, "object-provider", Stub::new("object-provider", 1), &main);
        registry.register(ModuleKind::Provider, "object-provider", Stub::new("object-provider", 2), &replica);

        let err = registry
            .get(ModuleKind::Provider, "object-provider", None)
            .unwrap_err();
        assert!(matches!(
            err,
            DependencyError::AmbiguousLookup { instances: 2, .. }
        ));

        let found = registry
            .get_as::<Stub>(ModuleKind::Provider, "object-provider", Some(&replica))
            .unwrap();
        assert_eq!(found.tag, 2);
    }

    #[test]
    fn each_instance_resolves_to_its_own_config() {
        let registry = Registry::new();
        for (tag, db) in [(1, "main"), (2, "replica"), (3, "audit")] {
            let cfg = custom(&[("db", db)]);
            registry.register(ModuleKind::Provider, "object-provider", Stub::new("object-provider", tag), &cfg);
        }
        for (tag, db) in [(1, "main"), (2, "replica"), (3, "audit")] {
            let cfg = custom(&[("db", db)]);
            let found = registry
                .get_as::<Stub>(ModuleKind::Provider, "object-provider", Some(&cfg))
                .unwrap();
            assert_eq!(found.tag, tag);
        }
        assert_eq!(registry.get_all(ModuleKind::Provider, "object-provider").len(), 3);
    }

    #[test]
    fn override_replaces_the_instance() {
        let registry = Registry::new();
        let cfg = custom(&[]);
        registry.register(ModuleKind::Provider, "kv", Stub::new("kv", 1), &cfg);
        registry.register(ModuleKind::Provider, "kv", Stub::new("kv", 2), &cfg);

        let found = registry.get_as::<Stub>(ModuleKind::Provider, "kv", None).unwrap();
        assert_eq!(found.tag, 2);
        assert_eq!(registry.get_all(ModuleKind::Provider, "kv").len(), 1);
    }

    #[test]
    fn remove_deletes_entry_and_index() {
        let registry = Registry::new();
        let cfg = custom(&[("db", "main")]);
        registry.register(ModuleKind::Provider, "kv", Stub::new("kv", 1), &cfg);
        assert!(registry.contains(ModuleKind::Provider, "kv", None));

        assert!(registry.remove(ModuleKind::Provider, "kv", &cfg).is_some());
        assert!(!registry.contains(ModuleKind::Provider, "kv", None));
        let err = registry.get(ModuleKind::Provider, "kv", None).unwrap_err();
        assert!(matches!(err, DependencyError::UnresolvedLookup { .. }));
    }

    #[test]
    fn type_mismatch_is_reported() {
        struct Other {
            gate: LifecycleGate,
        }
        impl Module for Other {
            fn name(&self) -> &str {
                "kv"
            }
            fn kind(&self) -> ModuleKind {
                ModuleKind::Provider
            }
            fn gate(&self) -> &LifecycleGate {
                &self.gate
            }
        }

        let registry = Registry::new();
        let cfg = custom(&[]);
        registry.register(
            ModuleKind::Provider,
            "kv",
            Arc::new(Other {
                gate: LifecycleGate::new(),
            }),
            &cfg,
        );
        let err = registry.get_as::<Stub>(ModuleKind::Provider, "kv", None).unwrap_err();
        assert!(matches!(err, DependencyError::TypeMismatch { .. }));
    }
}
