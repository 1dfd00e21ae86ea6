//! Work enumeration: manifest files and directory scans.
use crate::unit::TransferUnit;
use anyhow::Result;
use commons::Error as CommonsError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One entry of a manifest file, which is a JSON array of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(alias = "guid", alias = "did")]
    pub object_id: String,
    #[serde(default, alias = "filename", skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, alias = "filesize", skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

pub fn parse_manifest(content: &str) -> Result<Vec<ManifestEntry>> {
    serde_json::from_str(content)
        .map_err(|e| CommonsError::Config(format!("invalid manifest: {}", e)).into())
}

pub async fn load_manifest(path: &Path) -> Result<Vec<ManifestEntry>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CommonsError::local_io(path, e))?;
    parse_manifest(&content)
}

/// Units uploading each entry's file, found in `dir`, to its registered object.
pub fn upload_units(entries: &[ManifestEntry], dir: &Path) -> Result<Vec<TransferUnit>> {
    entries
        .iter()
        .map(|entry| {
            let file_name = entry.file_name.as_deref().ok_or_else(|| {
                CommonsError::Config(format!(
                    "manifest entry {} has no file_name to upload",
                    entry.object_id
                ))
            })?;
            Ok(TransferUnit::upload(dir.join(file_name))
                .with_object_id(entry.object_id.clone())
                .with_size(entry.size))
        })
        .collect()
}

/// Units downloading each entry into `dir`.
pub fn download_units(entries: &[ManifestEntry], dir: &Path) -> Vec<TransferUnit> {
    entries
        .iter()
        .map(|entry| {
            let unit = TransferUnit::download(entry.object_id.clone(), dir).with_size(entry.size);
            match &entry.file_name {
                Some(name) => unit.with_file_name(name.clone()),
                None => unit,
            }
        })
        .collect()
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

/// All files under `root`, recursively and in sorted order.  Hidden files and directories are
/// skipped unless `include_hidden`; a root that is itself a file is always returned.
pub async fn scan_directory(root: &Path, include_hidden: bool) -> Result<Vec<PathBuf>> {
    let meta = tokio::fs::metadata(root)
        .await
        .map_err(|e| CommonsError::local_io(root, e))?;
    if !meta.is_dir() {
        return Ok(vec![root.to_path_buf()]);
    }
    let mut files = vec![];
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| CommonsError::local_io(&dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CommonsError::local_io(&dir, e))?
        {
            let path = entry.path();
            if !include_hidden && is_hidden(&path) {
                continue;
            }
            // follows symlinks, as a directory walk by path would
            let is_dir = tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if is_dir {
                dirs.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}
