//! Named profiles, persisted in a TOML file with one table per profile.
//!
//! ```toml
//! [default]
//! key_id = "..."
//! api_key = "..."
//! api_endpoint = "https://commons.example.org"
//! use_shepherd = true
//! min_shepherd_version = "2.0.0"
//! ```
use crate::error::Error as CommonsError;
use crate::Credentials;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Oldest unified-API version this client knows how to talk to.
pub const DEFAULT_MIN_SHEPHERD_VERSION: &str = "2.0.0";

/// How requests to the commons are authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Mint a bearer token from the API key, refreshing it on 401.
    #[default]
    Bearer,
    /// Sign every request with the key pair.
    Hmac,
}

/// A Profile is everything needed to talk to one commons as one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(skip)]
    pub name: String,
    pub key_id: String,
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub api_endpoint: String,
    /// `Some(false)` opts out of the unified API entirely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_shepherd: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_shepherd_version: Option<String>,
    #[serde(default)]
    pub auth_mode: AuthMode,
}

impl Profile {
    pub fn new<S: Into<String>>(name: S, credentials: Credentials, api_endpoint: S) -> Self {
        Profile {
            name: name.into(),
            key_id: credentials.key_id,
            api_key: credentials.api_key,
            access_token: credentials.access_token,
            api_endpoint: api_endpoint.into(),
            use_shepherd: None,
            min_shepherd_version: None,
            auth_mode: AuthMode::default(),
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            key_id: self.key_id.clone(),
            api_key: self.api_key.clone(),
            access_token: self.access_token.clone(),
        }
    }

    pub fn min_shepherd_version(&self) -> &str {
        self.min_shepherd_version
            .as_deref()
            .unwrap_or(DEFAULT_MIN_SHEPHERD_VERSION)
    }

    /// Check that this profile is complete enough to make requests.  Failures are configuration
    /// errors, which abort before any transfer starts.
    pub fn validate(&self) -> Result<(), CommonsError> {
        if self.key_id.is_empty() || self.api_key.is_empty() {
            return Err(CommonsError::Config(format!(
                "profile {} is missing key_id or api_key; run configure",
                self.name
            )));
        }
        validate_endpoint(&self.api_endpoint)?;
        Ok(())
    }
}

/// An endpoint must be an absolute http(s) URL with a host.
pub fn validate_endpoint(endpoint: &str) -> Result<reqwest::Url, CommonsError> {
    let url = reqwest::Url::parse(endpoint)
        .map_err(|e| CommonsError::Config(format!("invalid endpoint {}: {}", endpoint, e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(CommonsError::Config(format!(
            "invalid endpoint {}: scheme must be http or https",
            endpoint
        )));
    }
    if url.host_str().is_none() {
        return Err(CommonsError::Config(format!(
            "invalid endpoint {}: no host",
            endpoint
        )));
    }
    Ok(url)
}

/// Storage for profiles.  Implementations must update a single profile without disturbing the
/// others.
pub trait ProfileStore: Send + Sync {
    /// Load the named profile; a missing profile is a configuration error.
    fn load(&self, name: &str) -> Result<Profile>;

    /// Create or replace the named profile.
    fn save(&self, profile: &Profile) -> Result<()>;

    /// Replace only the access token of an existing profile.
    fn update_access_token(&self, name: &str, access_token: &str) -> Result<()>;
}

/// A ProfileStore backed by a TOML file.
#[derive(Debug, Clone)]
pub struct TomlProfileStore {
    path: PathBuf,
}

impl TomlProfileStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// `$HOME/.commons/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .filter(|h| !h.is_empty())
            .map(|h| Path::new(&h).join(".commons").join("config.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_table(&self) -> Result<toml::Table> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => content
                .parse::<toml::Table>()
                .with_context(|| format!("while parsing {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(toml::Table::new()),
            Err(e) => Err(e).with_context(|| format!("while reading {}", self.path.display())),
        }
    }

    fn write_table(&self, table: &toml::Table) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("while creating {}", parent.display()))?;
        }
        std::fs::write(&self.path, toml::to_string(table)?)
            .with_context(|| format!("while writing {}", self.path.display()))
    }
}

impl ProfileStore for TomlProfileStore {
    fn load(&self, name: &str) -> Result<Profile> {
        let table = self.read_table()?;
        let section = table.get(name).cloned().ok_or_else(|| {
            CommonsError::Config(format!(
                "profile {} not found in {}",
                name,
                self.path.display()
            ))
        })?;
        let mut profile = section.try_into::<Profile>().map_err(|e| {
            CommonsError::Config(format!("profile {} is incomplete: {}", name, e))
        })?;
        profile.name = name.to_owned();
        Ok(profile)
    }

    fn save(&self, profile: &Profile) -> Result<()> {
        let mut table = self.read_table()?;
        table.insert(profile.name.clone(), toml::Value::try_from(profile)?);
        self.write_table(&table)
    }

    fn update_access_token(&self, name: &str, access_token: &str) -> Result<()> {
        let mut table = self.read_table()?;
        let section = table
            .get_mut(name)
            .and_then(|v| v.as_table_mut())
            .ok_or_else(|| CommonsError::Config(format!("profile {} not found", name)))?;
        section.insert(
            "access_token".to_owned(),
            toml::Value::String(access_token.to_owned()),
        );
        self.write_table(&table)
    }
}
