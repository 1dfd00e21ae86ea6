//! Object location: where to send or fetch an object's bytes, and what the object is called.
//!
//! The unified API is preferred when it is enabled for the profile and its version is at least
//! the configured minimum.  Otherwise the index service supplies the name and size and the
//! broker supplies the presigned URL.  Whatever the path, callers see a [`Location`] or a
//! [`Resolution`](crate::Error::Resolution) error.
use crate::error::{error_kind, Error as CommonsError, ErrorKind, ResolutionReason};
use crate::profile::Profile;
use crate::services::{
    Fence, FenceService, Indexd, IndexdService, NewObject, Shepherd, ShepherdService,
};
use crate::util::err_status_code;
use crate::Client;
use anyhow::{Error, Result};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::StatusCode;
use semver::Version;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// What the caller wants to do with the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want<'a> {
    Download,
    /// Upload data for an already-registered object, under this name
    Upload { file_name: &'a str },
}

/// The uniform result of resolution, whichever backend produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub object_id: String,
    pub url: String,
    pub file_name: String,
    /// Known for downloads; uploads define their own size
    pub size: Option<u64>,
}

/// Capability to locate objects.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, object_id: &str, want: Want<'_>) -> Result<Location>;

    /// Register a new object and return where to upload it.
    async fn create_upload(&self, file_name: &str, size: Option<u64>) -> Result<Location>;

    /// Delete an object, typically one whose upload never completed.
    async fn delete(&self, object_id: &str) -> Result<()>;
}

/// The production resolver, backed by the three commons services.
pub struct Resolver {
    shepherd: Arc<dyn ShepherdService>,
    indexd: Arc<dyn IndexdService>,
    fence: Arc<dyn FenceService>,
    use_shepherd: bool,
    min_shepherd_version: Version,
    protocol: Option<String>,
    shepherd_available: OnceCell<bool>,
}

impl Resolver {
    /// Build a resolver for the profile's commons, sharing the given client.
    pub fn new(profile: &Profile, client: &Client) -> Result<Self> {
        let min_version = parse_version(profile.min_shepherd_version()).map_err(|e| {
            CommonsError::Config(format!(
                "min_shepherd_version {:?} is not a version: {}",
                profile.min_shepherd_version(),
                e
            ))
        })?;
        Ok(Self::with_services(
            Arc::new(Shepherd::from_client(client)?),
            Arc::new(Indexd::from_client(client)?),
            Arc::new(Fence::from_client(client)?),
        )
        .use_shepherd(profile.use_shepherd.unwrap_or(true))
        .min_shepherd_version(min_version))
    }

    pub fn with_services(
        shepherd: Arc<dyn ShepherdService>,
        indexd: Arc<dyn IndexdService>,
        fence: Arc<dyn FenceService>,
    ) -> Self {
        Self {
            shepherd,
            indexd,
            fence,
            use_shepherd: true,
            min_shepherd_version: Version::new(2, 0, 0),
            protocol: None,
            shepherd_available: OnceCell::new(),
        }
    }

    pub fn use_shepherd(mut self, use_shepherd: bool) -> Self {
        self.use_shepherd = use_shepherd;
        self
    }

    pub fn min_shepherd_version(mut self, version: Version) -> Self {
        self.min_shepherd_version = version;
        self
    }

    /// Prefer storage URLs of this protocol (`s3`, `gs`, ..) when the legacy backends offer a
    /// choice.
    pub fn protocol(mut self, protocol: Option<String>) -> Self {
        self.protocol = protocol;
        self
    }

    /// Whether the unified API is enabled and new enough.  The probe runs once per resolver; any
    /// failure counts as unavailable.
    pub async fn shepherd_available(&self) -> bool {
        *self
            .shepherd_available
            .get_or_init(|| async {
                if !self.use_shepherd {
                    debug!("unified API disabled for this profile");
                    return false;
                }
                match self.shepherd.version().await {
                    Ok(v) => match parse_version(&v) {
                        Ok(version) if version >= self.min_shepherd_version => true,
                        Ok(version) => {
                            debug!(
                                "unified API version {} is older than {}; using legacy backends",
                                version, self.min_shepherd_version
                            );
                            false
                        }
                        Err(e) => {
                            warn!("unified API returned unparseable version {:?}: {}", v, e);
                            false
                        }
                    },
                    Err(e) => {
                        warn!("unified API version probe failed; using legacy backends: {:#}", e);
                        false
                    }
                }
            })
            .await
    }

    async fn resolve_download_shepherd(&self, object_id: &str) -> Result<Location> {
        let record = self
            .shepherd
            .object(object_id)
            .await
            .map_err(|e| normalize(object_id, "unified API", e))?;
        let (file_name, size) = match (record.file_name, record.size) {
            (Some(name), Some(size)) if !name.is_empty() => (name, size),
            _ => {
                warn!("unified API record for {} lacks a name or size", object_id);
                return Err(malformed(object_id));
            }
        };
        let url = self
            .shepherd
            .download_url(object_id)
            .await
            .map_err(|e| normalize(object_id, "unified API", e))?;
        Ok(Location {
            object_id: object_id.to_owned(),
            url,
            file_name,
            size: Some(size),
        })
    }

    async fn resolve_download_legacy(&self, object_id: &str) -> Result<Location> {
        let record = self
            .indexd
            .record(object_id)
            .await
            .map_err(|e| normalize(object_id, "index", e))?;
        let file_name = match record.file_name.filter(|n| !n.is_empty()) {
            Some(name) => name,
            None => file_name_from_urls(&record.urls, self.protocol.as_deref()).ok_or_else(|| {
                warn!("index record for {} has no name and no usable URL", object_id);
                malformed(object_id)
            })?,
        };
        let size = record.size.ok_or_else(|| {
            warn!("index record for {} has no size", object_id);
            malformed(object_id)
        })?;
        let url = self
            .fence
            .download_url(object_id, self.protocol.as_deref())
            .await
            .map_err(|e| normalize(object_id, "broker", e))?;
        Ok(Location {
            object_id: object_id.to_owned(),
            url,
            file_name,
            size: Some(size),
        })
    }
}

#[async_trait]
impl Resolve for Resolver {
    async fn resolve(&self, object_id: &str, want: Want<'_>) -> Result<Location> {
        match want {
            Want::Download if self.shepherd_available().await => {
                self.resolve_download_shepherd(object_id).await
            }
            Want::Download => self.resolve_download_legacy(object_id).await,
            Want::Upload { file_name } => {
                let url = self
                    .fence
                    .upload_url(object_id, file_name)
                    .await
                    .map_err(|e| normalize(object_id, "broker", e))?;
                Ok(Location {
                    object_id: object_id.to_owned(),
                    url,
                    file_name: file_name.to_owned(),
                    size: None,
                })
            }
        }
    }

    async fn create_upload(&self, file_name: &str, size: Option<u64>) -> Result<Location> {
        let created = if self.shepherd_available().await {
            let mut object = NewObject::new(file_name);
            object.size = size;
            self.shepherd
                .create_object(&object)
                .await
                .map_err(|e| normalize(file_name, "unified API", e))?
        } else {
            self.fence
                .new_upload(file_name)
                .await
                .map_err(|e| normalize(file_name, "broker", e))?
        };
        Ok(Location {
            object_id: created.guid,
            url: created.url,
            file_name: file_name.to_owned(),
            size,
        })
    }

    async fn delete(&self, object_id: &str) -> Result<()> {
        if self.shepherd_available().await {
            self.shepherd
                .delete_object(object_id)
                .await
                .map_err(|e| normalize(object_id, "unified API", e))
        } else {
            self.fence
                .delete(object_id)
                .await
                .map_err(|e| normalize(object_id, "broker", e))
        }
    }
}

fn parse_version(version: &str) -> Result<Version, semver::Error> {
    let version = version.trim();
    Version::parse(version.strip_prefix('v').unwrap_or(version))
}

fn malformed(object_id: &str) -> Error {
    CommonsError::resolution(object_id, ResolutionReason::Malformed).into()
}

/// Turn a backend error into a resolution error.  The backend's own text is logged, not passed
/// on.  Authentication failures keep their kind.
fn normalize(object_id: &str, backend: &str, err: Error) -> Error {
    warn!("{} request for {} failed: {:#}", backend, object_id, err);
    if error_kind(&err) == ErrorKind::Auth {
        return err;
    }
    let reason = match err_status_code(&err) {
        Some(StatusCode::NOT_FOUND) => ResolutionReason::NotFound,
        Some(_) => ResolutionReason::Unavailable,
        None => match err.downcast_ref::<reqwest::Error>() {
            Some(e) if e.is_decode() => ResolutionReason::Malformed,
            _ => ResolutionReason::Unavailable,
        },
    };
    CommonsError::resolution(object_id, reason).into()
}

/// Reconstruct a file name from storage URLs, which end in `/<file name>`.  With a protocol, only
/// URLs of that scheme are considered.
fn file_name_from_urls(urls: &[String], protocol: Option<&str>) -> Option<String> {
    urls.iter()
        .filter(|url| match protocol {
            Some(p) => url.starts_with(&format!("{}://", p)),
            None => true,
        })
        .filter_map(|url| {
            let path = url.split(['?', '#']).next()?;
            let (_, name) = path.rsplit_once('/')?;
            if name.is_empty() {
                None
            } else {
                Some(name.to_owned())
            }
        })
        .next()
}
