use anyhow::{anyhow, Context, Error};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Credentials represents the long-lived key pair a user downloads from the commons portal,
/// together with the most recent short-lived bearer token minted from it, if any.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Key ID, also used as the access key id when signing requests
    pub key_id: String,

    /// API key; this is the shared secret for request signing and the input to token minting
    pub api_key: String,

    /// Bearer token minted from the API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl Credentials {
    /// Create a new Credentials object from environment variables:
    ///
    /// * `COMMONS_KEY_ID`
    /// * `COMMONS_API_KEY`
    /// * `COMMONS_ACCESS_TOKEN` (optional)
    pub fn from_env() -> Result<Credentials, Error> {
        let key_id = env::var("COMMONS_KEY_ID").context("COMMONS_KEY_ID")?;
        let api_key = env::var("COMMONS_API_KEY").context("COMMONS_API_KEY")?;

        let access_token = match env::var("COMMONS_ACCESS_TOKEN") {
            Err(err) => match err {
                env::VarError::NotPresent => None,
                _ => {
                    return Err(anyhow!(
                        "Cannot read environment variable 'COMMONS_ACCESS_TOKEN': {}",
                        err
                    ))
                }
            },
            Ok(token) if token.is_empty() => None,
            Ok(token) => Some(token),
        };

        Ok(Credentials {
            key_id,
            api_key,
            access_token,
        })
    }

    /// Create a new Credentials object with a key id and API key
    ///
    /// Examples:
    ///
    /// ```
    /// # use commons::Credentials;
    /// let _ = Credentials::new("my_key_id", "my_api_key");
    /// ```
    pub fn new<S1: Into<String>, S2: Into<String>>(key_id: S1, api_key: S2) -> Credentials {
        Credentials {
            key_id: key_id.into(),
            api_key: api_key.into(),
            access_token: None,
        }
    }

    /// Attach a bearer token to these credentials
    pub fn with_access_token<S: Into<String>>(mut self, access_token: S) -> Credentials {
        self.access_token = Some(access_token.into());
        self
    }

    /// Read the credentials file issued by the commons portal, a JSON object of the form
    /// `{"key_id": "..", "api_key": ".."}`.
    pub fn from_api_key_file<P: AsRef<Path>>(path: P) -> Result<Credentials, Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("while reading credentials file {}", path.display()))?;
        Self::from_api_key_json(&content)
            .with_context(|| format!("while parsing credentials file {}", path.display()))
    }

    /// Parse the JSON form of the credentials file.  Both fields are required.
    pub fn from_api_key_json(content: &str) -> Result<Credentials, Error> {
        #[derive(Deserialize)]
        struct ApiKeyFile {
            key_id: String,
            api_key: String,
        }

        let file: ApiKeyFile = serde_json::from_str(content)?;
        if file.key_id.is_empty() || file.api_key.is_empty() {
            return Err(anyhow!("credentials must contain a non-empty key_id and api_key"));
        }
        Ok(Credentials::new(file.key_id, file.api_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use std::sync::{LockResult, Mutex, MutexGuard};

    // environment is global to the process, so we need to ensure that only one test uses
    // it at a time.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() -> LockResult<MutexGuard<'static, ()>> {
        let guard = ENV_LOCK.lock();
        for (key, _) in env::vars() {
            if key.starts_with("COMMONS_") {
                env::remove_var(key);
            }
        }
        guard
    }

    #[test]
    fn test_new() {
        let creds = Credentials::new("a-key", "a-secret");
        assert_eq!(creds.key_id, "a-key");
        assert_eq!(creds.api_key, "a-secret");
        assert_eq!(creds.access_token, None);
    }

    #[test]
    fn test_from_env() {
        let _guard = clear_env();
        env::set_var("COMMONS_KEY_ID", "a-key");
        env::set_var("COMMONS_API_KEY", "a-secret");
        let creds = Credentials::from_env().unwrap();
        assert_eq!(creds.key_id, "a-key");
        assert_eq!(creds.api_key, "a-secret");
        assert_eq!(creds.access_token, None);
    }

    #[test]
    fn test_from_env_missing() {
        let _guard = clear_env();
        env::set_var("COMMONS_KEY_ID", "a-key");
        // (no api key)
        assert!(Credentials::from_env().is_err());
    }

    #[test]
    fn test_from_env_token() {
        let _guard = clear_env();
        env::set_var("COMMONS_KEY_ID", "a-key");
        env::set_var("COMMONS_API_KEY", "a-secret");
        env::set_var("COMMONS_ACCESS_TOKEN", "tok");
        let creds = Credentials::from_env().unwrap();
        assert_eq!(creds.access_token, Some("tok".into()));
    }

    #[test]
    fn test_from_json() {
        let v = json!({
            "key_id": "kid",
            "api_key": "ak",
        });
        let c: Credentials = serde_json::from_value(v).unwrap();
        assert_eq!(c, Credentials::new("kid", "ak"));
    }

    #[test]
    fn test_api_key_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", json!({"key_id": "kid", "api_key": "ak"})).unwrap();
        let c = Credentials::from_api_key_file(file.path()).unwrap();
        assert_eq!(c, Credentials::new("kid", "ak"));
    }

    #[test]
    fn test_api_key_file_empty_key() {
        let res = Credentials::from_api_key_json(r#"{"key_id": "", "api_key": "ak"}"#);
        assert!(res.is_err());
    }
}
