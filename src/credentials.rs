//! Credentials for the voice service
//!
//! The connection manager asks a `CredentialProvider` for a bearer token on every
//! connect, and for a fresh one when the server rejects the current token.
//!
//! Security notes:
//! - Never log the token value
//! - Use `mask_token` for anything user-facing

use std::sync::Arc;

use async_trait::async_trait;
use keyring::Entry;
use thiserror::Error;

const SERVICE_NAME: &str = "duplex-voice";
const API_KEY_NAME: &str = "voice-api-key";

/// Environment variable read by `EnvCredentials::default()`
pub const API_KEY_ENV: &str = "VOICE_API_KEY";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("no credential configured ({0})")]
    Missing(String),
    #[error("credential store error: {0}")]
    Store(String),
    #[error("credential refresh failed: {0}")]
    Refresh(String),
}

/// Source of bearer tokens
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn token(&self) -> Result<String, CredentialError>;

    /// Called once after the server rejected the current token. Providers that
    /// cannot mint new tokens re-read their source.
    async fn refresh(&self) -> Result<String, CredentialError> {
        self.token().await
    }
}

/// Reads the token from an environment variable on every call
pub struct EnvCredentials {
    var: String,
}

impl EnvCredentials {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new(API_KEY_ENV)
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentials {
    async fn token(&self) -> Result<String, CredentialError> {
        std::env::var(&self.var)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| CredentialError::Missing(format!("set {}", self.var)))
    }
}

/// Token stored in the OS keyring
///
/// - Linux: libsecret (GNOME Keyring/KDE Wallet)
/// - macOS: Keychain
/// - Windows: Credential Manager
pub struct KeyringCredentials {
    service: String,
    account: String,
}

impl KeyringCredentials {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<Entry, CredentialError> {
        Entry::new(&self.service, &self.account)
            .map_err(|e| CredentialError::Store(format!("failed to create keyring entry: {}", e)))
    }

    /// Read the stored key without going through the async trait.
    pub fn load(&self) -> Result<String, CredentialError> {
        match self.entry()?.get_password() {
            Ok(key) if !key.is_empty() => Ok(key),
            Ok(_) | Err(keyring::Error::NoEntry) => Err(CredentialError::Missing(format!(
                "no key stored under {}/{}",
                self.service, self.account
            ))),
            Err(e) => Err(CredentialError::Store(e.to_string())),
        }
    }

    /// Store a key. Pass None to delete it.
    pub fn store(&self, key: Option<&str>) -> Result<(), CredentialError> {
        let entry = self.entry()?;

        match key {
            Some(k) if !k.is_empty() => {
                entry
                    .set_password(k)
                    .map_err(|e| CredentialError::Store(format!("failed to store key: {}", e)))?;
                // Log action without the key value
                log::info!("Credentials: stored new API key");
            }
            _ => match entry.delete_credential() {
                Ok(()) => log::info!("Credentials: deleted API key"),
                Err(keyring::Error::NoEntry) => {}
                Err(e) => {
                    return Err(CredentialError::Store(format!("failed to delete key: {}", e)))
                }
            },
        }

        Ok(())
    }
}

impl Default for KeyringCredentials {
    fn default() -> Self {
        Self::new(SERVICE_NAME, API_KEY_NAME)
    }
}

#[async_trait]
impl CredentialProvider for KeyringCredentials {
    async fn token(&self) -> Result<String, CredentialError> {
        let service = self.service.clone();
        let account = self.account.clone();
        // Keyring backends may block on D-Bus or the keychain daemon
        tokio::task::spawn_blocking(move || KeyringCredentials::new(service, account).load())
            .await
            .map_err(|e| CredentialError::Store(e.to_string()))?
    }
}

/// A fixed token
pub struct StaticCredentials {
    token: String,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn token(&self) -> Result<String, CredentialError> {
        Ok(self.token.clone())
    }
}

/// Tries each provider in order and returns the first token found
pub struct FallbackCredentials {
    providers: Vec<Arc<dyn CredentialProvider>>,
}

impl FallbackCredentials {
    pub fn new(providers: Vec<Arc<dyn CredentialProvider>>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl CredentialProvider for FallbackCredentials {
    async fn token(&self) -> Result<String, CredentialError> {
        let mut last_error = CredentialError::Missing("no providers configured".to_string());
        for provider in &self.providers {
            match provider.token().await {
                Ok(token) => return Ok(token),
                Err(e) => {
                    log::debug!("Credentials: provider skipped: {}", e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn refresh(&self) -> Result<String, CredentialError> {
        let mut last_error = CredentialError::Refresh("no providers configured".to_string());
        for provider in &self.providers {
            match provider.refresh().await {
                Ok(token) => return Ok(token),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

/// Masked version of a key for display (e.g., "sk-...abc123")
pub fn mask_token(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        "*".repeat(chars.len())
    } else {
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 6..].iter().collect();
        format!("{}...{}", head, tail)
    }
}
