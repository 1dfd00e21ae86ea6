//! Downloads into a local directory, deciding what to do about files that are already there.
//!
//! With `skip_completed`, a local file the same size as the object is left alone, a shorter one
//! is completed with a range request, and a longer one is treated as corrupt and overwritten.
//! Otherwise an existing file is either overwritten or, with `rename_existing`, the download is
//! written next to it as `name (N).ext`.
use crate::factory::FileWriterFactory;
use crate::object::download_url_with_factory;
use anyhow::Result;
use commons::retry::Retry;
use commons::{Error as CommonsError, Resolve, Want};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;

/// How to treat files that already exist at the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    pub skip_completed: bool,
    pub rename_existing: bool,
}

/// What happened to one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Disposition {
    Downloaded,
    /// A partial local file was completed from this offset
    Resumed { from: u64 },
    /// The local file was already complete
    Skipped,
    /// The object was written under a new name because `original` already existed
    Renamed { original: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub object_id: String,
    pub path: PathBuf,
    pub disposition: Disposition,
    /// Bytes transferred by this download
    pub bytes: u64,
}

/// The decision for one destination, before any bytes move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Plan {
    Skip,
    Resume { from: u64 },
    Overwrite,
    Rename { to: PathBuf },
    Fresh,
}

/// Decide what to do given the size of any existing local file.  `remote_size` is unknown when
/// the backend did not report it, in which case nothing can be skipped or resumed.
pub(crate) fn plan(
    dest: &Path,
    local_size: Option<u64>,
    remote_size: Option<u64>,
    options: &DownloadOptions,
) -> Plan {
    let local = match local_size {
        None => return Plan::Fresh,
        Some(local) => local,
    };
    if options.skip_completed {
        if let Some(remote) = remote_size {
            if local == remote {
                return Plan::Skip;
            } else if local < remote {
                return Plan::Resume { from: local };
            } else {
                return Plan::Overwrite;
            }
        }
    }
    if options.rename_existing {
        Plan::Rename {
            to: free_name(dest, |p| p.exists()),
        }
    } else {
        Plan::Overwrite
    }
}

/// The first of `stem (1).ext`, `stem (2).ext`, .. for which `exists` is false.
pub(crate) fn free_name<F: Fn(&Path) -> bool>(dest: &Path, exists: F) -> PathBuf {
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = dest.extension().map(|e| e.to_string_lossy().into_owned());
    let mut n = 1u32;
    loop {
        let name = match &ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = dest.with_file_name(name);
        if !exists(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Only the last component of a backend-supplied name is used, so an object can never be
/// written outside the destination directory.
fn local_name(object_id: &str, file_name: &str) -> String {
    Path::new(file_name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| object_id.replace('/', "_"))
}

/// Resolve an object and download it into `dir`, under the name the commons reports for it.
pub async fn download_to_dir<R: Resolve + ?Sized>(
    object_id: &str,
    dir: &Path,
    options: &DownloadOptions,
    retry: &Retry,
    resolver: &R,
) -> Result<DownloadOutcome> {
    let location = resolver.resolve(object_id, Want::Download).await?;
    let dest = dir.join(local_name(object_id, &location.file_name));

    let local_size = match tokio::fs::metadata(&dest).await {
        Ok(meta) => Some(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(CommonsError::local_io(&dest, e).into()),
    };
    let plan = plan(&dest, local_size, location.size, options);
    debug!("{} -> {}: {:?}", object_id, dest.display(), plan);

    let (path, start, disposition) = match plan {
        Plan::Skip => {
            info!("{} is already complete; skipping", dest.display());
            return Ok(DownloadOutcome {
                object_id: object_id.to_owned(),
                path: dest,
                disposition: Disposition::Skipped,
                bytes: 0,
            });
        }
        Plan::Resume { from } => (dest, from, Disposition::Resumed { from }),
        Plan::Overwrite | Plan::Fresh => (dest, 0, Disposition::Downloaded),
        Plan::Rename { to } => {
            info!("{} exists; writing {}", dest.display(), to.display());
            (to, 0, Disposition::Renamed { original: dest })
        }
    };

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .await
        .map_err(|e| CommonsError::local_io(&path, e))?;
    let mut factory = FileWriterFactory::resuming(file, start);
    let fetched = download_url_with_factory(&location.url, retry, &mut factory).await?;
    factory.into_inner().await?;

    // the server may have answered a range request with the whole object
    let disposition = match disposition {
        Disposition::Resumed { .. } if fetched.resumed_from == 0 => Disposition::Downloaded,
        d => d,
    };
    Ok(DownloadOutcome {
        object_id: object_id.to_owned(),
        path,
        disposition,
        bytes: fetched.bytes,
    })
}
