//! Network secrets at rest
//!
//! Pre-shared keys are sealed with ChaCha20-Poly1305 under a key derived with
//! Argon2id from a random device-local secret file. A sealed secret is
//! `base64(nonce || ciphertext)`.

use anyhow::{Context, Result, anyhow, ensure};
use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::rand_core::{OsRng, RngCore},
};
use base64::prelude::*;
use chacha20poly1305::{
    ChaCha20Poly1305, Key, KeyInit, Nonce,
    aead::{Aead, AeadCore},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::Path,
    sync::Arc,
};

const DEVICE_SECRET_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const KDF_SALT: &[u8] = b"arrival-board/network-secrets/v1";
const KDF_MEMORY_KIB: u32 = 19 * 1024;
const KDF_ITERATIONS: u32 = 2;
const KDF_PARALLELISM: u32 = 1;

/// Plaintext network secret, never printed
#[derive(Clone, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Encrypted network secret as persisted in the `networks` record
#[derive(Clone, Deserialize, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SealedSecret(String);

impl fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealedSecret(..)")
    }
}

#[derive(Clone)]
pub struct SecretSealer {
    cipher: Arc<ChaCha20Poly1305>,
}

impl SecretSealer {
    /// Derive the sealing key from the device secret, creating the secret file if missing
    ///
    /// # Arguments
    /// * `device_secret_file` - Path of the 0600 device secret
    pub fn load_or_create(device_secret_file: &Path) -> Result<Self> {
        let device_secret = match fs::read(device_secret_file) {
            Ok(secret) => {
                let mode = fs::metadata(device_secret_file)
                    .context("failed to stat device secret")?
                    .permissions()
                    .mode();
                if mode & 0o077 != 0 {
                    warn!("device secret is accessible by other users (mode {mode:o})");
                }
                secret
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Self::create_device_secret(device_secret_file)?,
            Err(e) => return Err(e).context("failed to read device secret"),
        };

        ensure!(
            device_secret.len() == DEVICE_SECRET_LEN,
            "failed to load device secret: unexpected length {}",
            device_secret.len()
        );

        let params = Params::new(KDF_MEMORY_KIB, KDF_ITERATIONS, KDF_PARALLELISM, Some(32))
            .map_err(|e| anyhow!("invalid key derivation parameters: {e}"))?;
        let mut key = [0u8; 32];
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(&device_secret, KDF_SALT, &mut key)
            .map_err(|e| anyhow!("failed to derive sealing key: {e}"))?;

        Ok(Self {
            cipher: Arc::new(ChaCha20Poly1305::new(Key::from_slice(&key))),
        })
    }

    fn create_device_secret(path: &Path) -> Result<Vec<u8>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("failed to create device secret directory")?;
        }

        let mut secret = vec![0u8; DEVICE_SECRET_LEN];
        OsRng.fill_bytes(&mut secret);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .context("failed to create device secret")?;
        file.write_all(&secret)
            .and_then(|_| file.sync_all())
            .context("failed to write device secret")?;

        info!("created device secret {}", path.display());
        Ok(secret)
    }

    pub fn seal(&self, secret: &Secret) -> Result<SealedSecret> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut chacha20poly1305::aead::OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, secret.expose().as_bytes())
            .map_err(|_| anyhow!("failed to seal secret"))?;

        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(SealedSecret(BASE64_STANDARD.encode(blob)))
    }

    pub fn open(&self, sealed: &SealedSecret) -> Result<Secret> {
        let blob = BASE64_STANDARD
            .decode(&sealed.0)
            .context("failed to decode sealed secret")?;
        ensure!(blob.len() > NONCE_LEN, "failed to open sealed secret: truncated");

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("failed to open sealed secret: authentication failed"))?;

        String::from_utf8(plaintext)
            .map(Secret)
            .context("failed to open sealed secret: not utf-8")
    }
}
