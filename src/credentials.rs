//! Account credentials for the processing service.
//!
//! The username and account id live in the config file; the password goes
//! to the OS keyring, or to a ChaCha20-Poly1305 encrypted file under
//! `<app dir>/secrets` when no keyring is available.

use std::{fmt, path::PathBuf};

use crate::app_dirs;

const KEYRING_SERVICE: &str = "peakjob";
const DISABLE_KEYRING_ENV: &str = "PEAKJOB_DISABLE_KEYRING";
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Login for the job-control endpoint. Held in memory only.
#[derive(Clone, PartialEq, Eq)]
pub struct AccountCredentials {
    pub username: String,
    pub password: String,
    pub account_id: u32,
}

impl fmt::Debug for AccountCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("account_id", &self.account_id)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialStoreError {
    #[error("Credential store unavailable: {0}")]
    Unavailable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Crypto error: {0}")]
    Crypto(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("App dir error: {0}")]
    AppDir(#[from] app_dirs::AppDirError),
}

/// Password storage keyed by account username.
#[derive(Clone, Debug)]
pub struct CredentialStore {
    fallback_dir: PathBuf,
}

impl CredentialStore {
    pub fn new() -> Result<Self, CredentialStoreError> {
        Self::with_fallback_dir(app_dirs::app_root_dir()?.join("secrets"))
    }

    pub fn with_fallback_dir(fallback_dir: PathBuf) -> Result<Self, CredentialStoreError> {
        std::fs::create_dir_all(&fallback_dir)?;
        Ok(Self { fallback_dir })
    }

    /// Assemble full credentials, or `None` when no password is stored and
    /// the caller has to prompt.
    pub fn account(
        &self,
        username: &str,
        account_id: u32,
    ) -> Result<Option<AccountCredentials>, CredentialStoreError> {
        if username.trim().is_empty() {
            return Ok(None);
        }
        Ok(self.password(username)?.map(|password| AccountCredentials {
            username: username.to_string(),
            password,
            account_id,
        }))
    }

    pub fn password(&self, username: &str) -> Result<Option<String>, CredentialStoreError> {
        if let Some(password) = self.keyring_get(username) {
            return Ok(Some(password));
        }
        self.fallback_get(username)
    }

    pub fn set_password(&self, username: &str, password: &str) -> Result<(), CredentialStoreError> {
        if password.is_empty() {
            return Ok(());
        }
        if self.keyring_set(username, password).is_ok() {
            let _ = self.fallback_delete(username);
            return Ok(());
        }
        tracing::debug!("keyring unavailable, storing password in encrypted fallback");
        self.fallback_set(username, password)
    }

    pub fn delete(&self, username: &str) -> Result<(), CredentialStoreError> {
        if !keyring_disabled() {
            if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, username) {
                let _ = entry.delete_credential();
            }
        }
        self.fallback_delete(username)
    }

    fn keyring_get(&self, username: &str) -> Option<String> {
        if keyring_disabled() {
            return None;
        }
        keyring::Entry::new(KEYRING_SERVICE, username)
            .ok()?
            .get_password()
            .ok()
    }

    fn keyring_set(&self, username: &str, password: &str) -> Result<(), CredentialStoreError> {
        if keyring_disabled() {
            return Err(CredentialStoreError::Unavailable("keyring disabled".into()));
        }
        keyring::Entry::new(KEYRING_SERVICE, username)
            .and_then(|entry| entry.set_password(password))
            .map_err(|err| CredentialStoreError::Unavailable(err.to_string()))
    }

    fn secret_path(&self, username: &str) -> PathBuf {
        self.fallback_dir.join(format!("{}.bin", file_safe(username)))
    }

    fn key_path(&self) -> PathBuf {
        self.fallback_dir.join("store.key")
    }

    fn fallback_get(&self, username: &str) -> Result<Option<String>, CredentialStoreError> {
        let secret_path = self.secret_path(username);
        if !secret_path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(secret_path)?;
        if data.len() < NONCE_LEN {
            return Err(CredentialStoreError::Decode("secret file too short".into()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let key = std::fs::read(self.key_path())?;
        if key.len() != KEY_LEN {
            return Err(CredentialStoreError::Decode("store key invalid".into()));
        }
        let plaintext = cipher::decrypt(&key, nonce, ciphertext)?;
        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|err| CredentialStoreError::Decode(err.to_string()))
    }

    fn fallback_set(&self, username: &str, password: &str) -> Result<(), CredentialStoreError> {
        let key_path = self.key_path();
        let key = if key_path.exists() {
            std::fs::read(&key_path)?
        } else {
            let key = cipher::random_bytes(KEY_LEN)?;
            write_private_file(&key_path, &key)?;
            key
        };
        if key.len() != KEY_LEN {
            return Err(CredentialStoreError::Decode("store key invalid".into()));
        }
        let nonce = cipher::random_bytes(NONCE_LEN)?;
        let mut payload = nonce.clone();
        payload.extend(cipher::encrypt(&key, &nonce, password.as_bytes())?);
        write_private_file(&self.secret_path(username), &payload)
    }

    fn fallback_delete(&self, username: &str) -> Result<(), CredentialStoreError> {
        match std::fs::remove_file(self.secret_path(username)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn keyring_disabled() -> bool {
    std::env::var(DISABLE_KEYRING_ENV)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn file_safe(username: &str) -> String {
    username
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' { ch } else { '_' })
        .collect()
}

fn write_private_file(path: &std::path::Path, bytes: &[u8]) -> Result<(), CredentialStoreError> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)?;
    file.write_all(bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    Ok(())
}

mod cipher {
    use chacha20poly1305::aead::{Aead, KeyInit};
    use chacha20poly1305::{ChaCha20Poly1305, Nonce};

    use super::CredentialStoreError;

    pub(super) fn random_bytes(len: usize) -> Result<Vec<u8>, CredentialStoreError> {
        use rand::TryRngCore;
        let mut out = vec![0u8; len];
        rand::rngs::OsRng
            .try_fill_bytes(&mut out)
            .map_err(|err| CredentialStoreError::Unavailable(err.to_string()))?;
        Ok(out)
    }

    pub(super) fn encrypt(key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CredentialStoreError> {
        ChaCha20Poly1305::new_from_slice(key)
            .map_err(|err| CredentialStoreError::Crypto(err.to_string()))?
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|err| CredentialStoreError::Crypto(err.to_string()))
    }

    pub(super) fn decrypt(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CredentialStoreError> {
        ChaCha20Poly1305::new_from_slice(key)
            .map_err(|err| CredentialStoreError::Crypto(err.to_string()))?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|err| CredentialStoreError::Crypto(err.to_string()))
    }
}
