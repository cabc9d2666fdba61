use std::sync::RwLock;

use chrono::{DateTime, Utc};
use rand::RngCore;

/// A 256-bit symmetric sealing key.
pub type SealingKey = [u8; 32];

struct KeyMaterial {
    current: SealingKey,
    previous: Option<SealingKey>,
    rotated_at: DateTime<Utc>,
}

/// Holds the current and previous token-sealing keys.
///
/// Rotation is exclusive relative to key reads; readers take snapshot
/// copies so token verification never blocks a rotation. The
/// previous-previous key is discarded on rotation, which is what bounds
/// the validity of old tokens to a single rotation.
pub struct KeyStore {
    material: RwLock<KeyMaterial>,
}

impl KeyStore {
    /// Create a key store with a freshly generated current key.
    pub fn generate() -> Self {
        Self::new(random_key())
    }

    pub fn new(current: SealingKey) -> Self {
        Self {
            material: RwLock::new(KeyMaterial {
                current,
                previous: None,
                rotated_at: Utc::now(),
            }),
        }
    }

    /// Rotate: the old current becomes previous, `new_key` becomes
    /// current.
    pub fn rotate(&self, new_key: SealingKey) {
        let mut material = self.material.write().unwrap();
        material.previous = Some(material.current);
        material.current = new_key;
        material.rotated_at = Utc::now();
    }

    /// Rotate to a freshly generated key.
    pub fn rotate_fresh(&self) {
        self.rotate(random_key());
    }

    pub fn current_key(&self) -> SealingKey {
        self.material.read().unwrap().current
    }

    pub fn previous_key(&self) -> Option<SealingKey> {
        self.material.read().unwrap().previous
    }

    pub fn rotated_at(&self) -> DateTime<Utc> {
        self.material.read().unwrap().rotated_at
    }
}

/// Generate a random 256-bit key.
pub fn random_key() -> SealingKey {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}
