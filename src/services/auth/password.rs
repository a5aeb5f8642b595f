//! Admin password storage
//!
//! Only an argon2 hash is kept, written with temp-file-then-rename.

use anyhow::{Context, Result, anyhow, ensure};
use argon2::{
    Argon2, PasswordHash, PasswordVerifier,
    password_hash::{PasswordHasher, SaltString, rand_core::OsRng},
};
use log::{debug, info};
use std::{
    fs::{self, Permissions},
    io::Write,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;

#[derive(Clone, Debug)]
pub struct PasswordService {
    password_file: PathBuf,
}

impl PasswordService {
    pub fn new(password_file: impl Into<PathBuf>) -> Self {
        Self {
            password_file: password_file.into(),
        }
    }

    /// Validate a password against the stored hash
    ///
    /// # Arguments
    /// * `password` - The plaintext password to validate
    pub fn validate_password(&self, password: &str) -> Result<()> {
        ensure!(!password.is_empty(), "failed to validate password: empty");

        let password_hash = fs::read_to_string(&self.password_file)
            .context("failed to read password file")?;

        ensure!(
            !password_hash.trim().is_empty(),
            "failed to validate password: hash is empty"
        );

        let parsed_hash = PasswordHash::new(password_hash.trim())
            .map_err(|e| anyhow!(e))
            .context("failed to parse password hash")?;

        Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .map_err(|e| anyhow!(e))
            .context("failed to verify password")
    }

    fn hash_password(password: &str) -> Result<String> {
        debug!("hash_password() called");

        let salt = SaltString::generate(&mut OsRng);

        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| anyhow!(e))
            .context("failed to hash password")
    }

    /// Store or replace the password hash
    pub fn store_or_update_password(&self, password: &str) -> Result<()> {
        debug!("store_or_update_password() called");

        ensure!(!password.is_empty(), "failed to store password: empty");

        let hash = Self::hash_password(password)?;
        let dir = self
            .password_file
            .parent()
            .unwrap_or_else(|| Path::new("."));

        fs::create_dir_all(dir).context("failed to create password directory")?;

        let mut staged = NamedTempFile::new_in(dir).context("failed to stage password file")?;
        staged
            .as_file()
            .set_permissions(Permissions::from_mode(0o600))
            .context("failed to restrict password file")?;
        staged
            .write_all(hash.as_bytes())
            .context("failed to write password file")?;
        staged
            .as_file()
            .sync_all()
            .context("failed to sync password file")?;
        staged
            .persist(&self.password_file)
            .map_err(|e| e.error)
            .context("failed to replace password file")?;

        info!("admin password updated");
        Ok(())
    }

    pub fn password_exists(&self) -> bool {
        self.password_file.try_exists().unwrap_or(false)
    }
}
