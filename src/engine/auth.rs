//! Authentication strategies for remote devices.
//!
//! Strategies are tried in order by an [`AuthChain`] built from
//! [`Credentials`]: password first, then key file, and the SSH agent only
//! when the caller supplied neither.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::{debug, info};

use super::error::EngineError;
use super::handler::DeviceHandler;
use super::types::Credentials;

/// One way of proving identity to a device.
///
/// `Ok(false)` means the server rejected the credentials; `Err` means the
/// attempt could not be made at all (unreadable key, no agent).
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<DeviceHandler>,
        username: &str,
    ) -> Result<bool, EngineError>;

    fn name(&self) -> &'static str;
}

/// Password authentication.
pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<DeviceHandler>,
        username: &str,
    ) -> Result<bool, EngineError> {
        let result = handle
            .authenticate_password(username, &self.password)
            .await
            .map_err(|e| EngineError::Connect(format!("password authentication failed: {}", e)))?;
        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}

/// Public key authentication from a passphrase-less private key file.
pub struct KeyAuth {
    key_path: PathBuf,
}

impl KeyAuth {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
        }
    }
}

/// RSA keys need the strongest hash the server advertises.
async fn preferred_rsa_hash(
    handle: &client::Handle<DeviceHandler>,
) -> Option<keys::HashAlg> {
    handle
        .best_supported_rsa_hash()
        .await
        .ok()
        .flatten()
        .flatten()
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<DeviceHandler>,
        username: &str,
    ) -> Result<bool, EngineError> {
        let key_pair = keys::load_secret_key(&self.key_path, None).map_err(|e| {
            EngineError::Connect(format!(
                "cannot load private key {}: {}",
                self.key_path.display(),
                e
            ))
        })?;

        let hash_alg = preferred_rsa_hash(handle).await;
        let key = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let result = handle
            .authenticate_publickey(username, key)
            .await
            .map_err(|e| EngineError::Connect(format!("key authentication failed: {}", e)))?;
        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}

/// SSH agent authentication via `SSH_AUTH_SOCK`, trying every identity.
#[derive(Default)]
pub struct AgentAuth;

#[async_trait]
impl AuthStrategy for AgentAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<DeviceHandler>,
        username: &str,
    ) -> Result<bool, EngineError> {
        let mut agent = keys::agent::client::AgentClient::connect_env()
            .await
            .map_err(|e| EngineError::Connect(format!("cannot reach SSH agent: {}", e)))?;

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| EngineError::Connect(format!("SSH agent identities: {}", e)))?;

        if identities.is_empty() {
            return Err(EngineError::Connect(
                "no authentication identities in SSH agent".to_string(),
            ));
        }

        for identity in identities {
            let hash_alg = preferred_rsa_hash(handle).await;
            match handle
                .authenticate_publickey_with(username, identity.clone(), hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => {
                    info!("Authenticated {} with SSH agent identity", username);
                    return Ok(true);
                }
                Ok(_) => debug!("Agent identity {:?} rejected", identity.comment()),
                Err(e) => debug!("Agent identity {:?} errored: {}", identity.comment(), e),
            }
        }

        Ok(false)
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}

/// Ordered list of strategies; the first success wins.
#[derive(Default)]
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the chain a set of credentials implies.
    pub fn from_credentials(credentials: &Credentials) -> Self {
        let mut chain = AuthChain::new();
        if let Some(password) = &credentials.password {
            chain = chain.with(PasswordAuth::new(password.clone()));
        }
        if let Some(key_path) = &credentials.key_path {
            chain = chain.with(KeyAuth::new(key_path));
        }
        if chain.strategies.is_empty() {
            chain = chain.with(AgentAuth);
        }
        chain
    }

    pub fn with(mut self, strategy: impl AuthStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<DeviceHandler>,
        username: &str,
    ) -> Result<bool, EngineError> {
        let mut last_error = None;

        for strategy in &self.strategies {
            debug!("Trying {} authentication for {}", strategy.name(), username);
            match strategy.authenticate(handle, username).await {
                Ok(true) => return Ok(true),
                Ok(false) => {
                    last_error = Some(EngineError::Connect(format!(
                        "{} authentication rejected",
                        strategy.name()
                    )));
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            EngineError::Connect("all authentication methods failed".to_string())
        }))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
