use std::collections::HashMap;
use std::sync::Mutex;

use argon2::Argon2;
use rand::RngCore;
use zeroize::Zeroizing;

use floe_types::{FloeError, Result};

use crate::config::CipherKind;

pub const SALT_LEN: usize = 16;

/// Argon2id cost parameters, stored in every encrypted stream header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KdfParams {
    pub memory_cost: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_cost: 65536, // 64 MiB
            time_cost: 3,
            parallelism: 4,
        }
    }
}

/// Derive a 32-byte key from a passphrase using Argon2id.
pub fn derive_key(passphrase: &str, salt: &[u8], kdf: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    let params = argon2::Params::new(kdf.memory_cost, kdf.time_cost, kdf.parallelism, Some(32))
        .map_err(|e| FloeError::KeyDerivation(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, output.as_mut())
        .map_err(|e| FloeError::KeyDerivation(format!("argon2 hash: {e}")))?;
    Ok(output)
}

type CacheKey = ([u8; SALT_LEN], KdfParams);

/// Passphrase plus a per-process salt for sealing and a cache of derived
/// keys for opening, so each salt is stretched once.
pub struct PassphraseKey {
    passphrase: Zeroizing<String>,
    cipher: CipherKind,
    params: KdfParams,
    session_salt: [u8; SALT_LEN],
    derived: Mutex<HashMap<CacheKey, Zeroizing<[u8; 32]>>>,
}

impl std::fmt::Debug for PassphraseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassphraseKey")
            .field("cipher", &self.cipher)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl PassphraseKey {
    pub fn new(passphrase: Zeroizing<String>, cipher: CipherKind) -> Self {
        Self::with_params(passphrase, cipher, KdfParams::default())
    }

    pub fn with_params(passphrase: Zeroizing<String>, cipher: CipherKind, params: KdfParams) -> Self {
        let mut session_salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut session_salt);
        Self {
            passphrase,
            cipher,
            params,
            session_salt,
            derived: Mutex::new(HashMap::new()),
        }
    }

    pub fn cipher(&self) -> CipherKind {
        self.cipher
    }

    pub fn params(&self) -> KdfParams {
        self.params
    }

    pub fn session_salt(&self) -> [u8; SALT_LEN] {
        self.session_salt
    }

    /// Key for sealing new streams.
    pub fn sealing_key(&self) -> Result<Zeroizing<[u8; 32]>> {
        self.key_for(&self.session_salt, &self.params)
    }

    /// Key for a stream sealed with `salt` and `params`.
    pub fn key_for(&self, salt: &[u8; SALT_LEN], params: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
        let cache_key = (*salt, *params);
        if let Some(k) = self.derived.lock().unwrap().get(&cache_key) {
            return Ok(k.clone());
        }
        let key = derive_key(&self.passphrase, salt, params)?;
        self.derived
            .lock()
            .unwrap()
            .insert(cache_key, key.clone());
        Ok(key)
    }
}

#[cfg(test)]
pub(crate) fn test_params() -> KdfParams {
    KdfParams {
        memory_cost: 8,
        time_cost: 1,
        parallelism: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic_per_salt() {
        let salt = [1u8; SALT_LEN];
        let a = derive_key("hunter2", &salt, &test_params()).unwrap();
        let b = derive_key("hunter2", &salt, &test_params()).unwrap();
        let c = derive_key("hunter2", &[2u8; SALT_LEN], &test_params()).unwrap();
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
    }

    #[test]
    fn cached_key_matches_fresh_derivation() {
        let key = PassphraseKey::with_params(
            Zeroizing::new("pw".into()),
            CipherKind::Aes256Gcm,
            test_params(),
        );
        let salt = key.session_salt();
        let sealed = key.sealing_key().unwrap();
        let fresh = derive_key("pw", &salt, &test_params()).unwrap();
        assert_eq!(*sealed, *fresh);
        assert_eq!(*key.key_for(&salt, &test_params()).unwrap(), *fresh);
    }

    #[test]
    fn bad_params_are_key_derivation_errors() {
        let bad = KdfParams {
            memory_cost: 0,
            time_cost: 0,
            parallelism: 0,
        };
        assert!(matches!(
            derive_key("pw", &[0u8; SALT_LEN], &bad),
            Err(FloeError::KeyDerivation(_))
        ));
    }
}
