//! Named secret bundles
//!
//! Destinations and clients refer to credentials by name; a
//! [`CredentialsProvider`] resolves the name at the point of use.

use crate::error::{IntegrationError, Result};
use crate::types::SensitiveString;
use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Username and password
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Credentials {
    pub username: String,
    pub password: SensitiveString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<SensitiveString>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// SSH login by password or private key
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SshCredentials {
    pub username: String,
    #[serde(default)]
    pub password: Option<SensitiveString>,
    /// Private key file; takes precedence over the password
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<SensitiveString>,
}

impl SshCredentials {
    pub fn password(username: impl Into<String>, password: impl Into<SensitiveString>) -> Self {
        Self {
            username: username.into(),
            password: Some(password.into()),
            private_key_path: None,
            passphrase: None,
        }
    }

    pub fn private_key(username: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            username: username.into(),
            password: None,
            private_key_path: Some(path.into()),
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<SensitiveString>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }
}

/// OAuth2 client-credentials grant
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OAuth2Credentials {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: SensitiveString,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Extra form parameters sent with the token request
    #[serde(default)]
    pub additional_params: HashMap<String, String>,
}

impl OAuth2Credentials {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<SensitiveString>,
    ) -> Self {
        Self {
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scopes: Vec::new(),
            additional_params: HashMap::new(),
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_params.insert(key.into(), value.into());
        self
    }
}

/// A stored credential of any supported kind
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialBundle {
    Basic(Credentials),
    Ssh(SshCredentials),
    #[serde(rename = "oauth2")]
    OAuth2(OAuth2Credentials),
}

impl CredentialBundle {
    fn kind(&self) -> &'static str {
        match self {
            CredentialBundle::Basic(_) => "basic",
            CredentialBundle::Ssh(_) => "ssh",
            CredentialBundle::OAuth2(_) => "oauth2",
        }
    }
}

/// Resolves credentials by name
pub trait CredentialsProvider: Send + Sync {
    fn credentials(&self, name: &str) -> Result<Credentials>;

    fn ssh_credentials(&self, name: &str) -> Result<SshCredentials>;

    fn oauth2_credentials(&self, name: &str) -> Result<OAuth2Credentials>;
}

/// In-memory provider, usually filled from the `credentials` config section
#[derive(Debug, Default)]
pub struct StaticCredentialsProvider {
    entries: RwLock<HashMap<String, CredentialBundle>>,
}

impl StaticCredentialsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(entries: HashMap<String, CredentialBundle>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub fn insert(&self, name: impl Into<String>, bundle: CredentialBundle) {
        self.entries.write().insert(name.into(), bundle);
    }

    pub fn with(self, name: impl Into<String>, bundle: CredentialBundle) -> Self {
        self.insert(name, bundle);
        self
    }

    pub fn remove(&self, name: &str) -> Option<CredentialBundle> {
        self.entries.write().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    fn lookup<T>(
        &self,
        name: &str,
        expected: &str,
        select: impl FnOnce(&CredentialBundle) -> Option<T>,
    ) -> Result<T> {
        let entries = self.entries.read();
        let bundle = entries
            .get(name)
            .ok_or_else(|| IntegrationError::CredentialsNotFound(name.to_string()))?;
        select(bundle).ok_or_else(|| {
            IntegrationError::CredentialsNotFound(format!(
                "{} (expected {} credentials, found {})",
                name,
                expected,
                bundle.kind()
            ))
        })
    }
}

impl CredentialsProvider for StaticCredentialsProvider {
    fn credentials(&self, name: &str) -> Result<Credentials> {
        self.lookup(name, "basic", |b| match b {
            CredentialBundle::Basic(c) => Some(c.clone()),
            // an SSH password login doubles as basic credentials
            CredentialBundle::Ssh(SshCredentials {
                username,
                password: Some(password),
                ..
            }) => Some(Credentials::new(username.clone(), password.clone())),
            _ => None,
        })
    }

    fn ssh_credentials(&self, name: &str) -> Result<SshCredentials> {
        self.lookup(name, "ssh", |b| match b {
            CredentialBundle::Ssh(c) => Some(c.clone()),
            CredentialBundle::Basic(c) => Some(SshCredentials::password(c.username.clone(), c.password.clone())),
            _ => None,
        })
    }

    fn oauth2_credentials(&self, name: &str) -> Result<OAuth2Credentials> {
        self.lookup(name, "oauth2", |b| match b {
            CredentialBundle::OAuth2(c) => Some(c.clone()),
            _ => None,
        })
    }
}
