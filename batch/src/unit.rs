use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Upload,
    Download,
}

/// One file to move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferUnit {
    pub direction: Direction,
    /// Unknown for uploads of objects that are not registered yet
    pub object_id: Option<String>,
    /// For uploads, the local file; for downloads, the destination directory
    pub path: PathBuf,
    pub file_name: String,
    /// Known size, if any; saves a metadata round-trip
    pub size: Option<u64>,
}

impl TransferUnit {
    /// Upload a local file under its own name.
    pub fn upload<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            direction: Direction::Upload,
            object_id: None,
            path,
            file_name,
            size: None,
        }
    }

    /// Download an object into a directory.
    pub fn download<S: Into<String>, P: Into<PathBuf>>(object_id: S, dir: P) -> Self {
        let object_id = object_id.into();
        Self {
            direction: Direction::Download,
            file_name: object_id.replace('/', "_"),
            object_id: Some(object_id),
            path: dir.into(),
            size: None,
        }
    }

    pub fn with_object_id<S: Into<String>>(mut self, object_id: S) -> Self {
        self.object_id = Some(object_id.into());
        self
    }

    pub fn with_file_name<S: Into<String>>(mut self, file_name: S) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    /// The local path this unit is tracked under in the ledger.
    pub fn key(&self) -> PathBuf {
        match self.direction {
            Direction::Upload => self.path.clone(),
            Direction::Download => self.path.join(&self.file_name),
        }
    }

    /// Rebuild a unit from its ledger key.
    pub(crate) fn from_key(
        direction: Direction,
        key: &Path,
        file_name: &str,
        object_id: Option<String>,
    ) -> Self {
        let path = match direction {
            Direction::Upload => key.to_path_buf(),
            Direction::Download => key.parent().map(Path::to_path_buf).unwrap_or_default(),
        };
        Self {
            direction,
            object_id,
            path,
            file_name: file_name.to_owned(),
            size: None,
        }
    }
}
