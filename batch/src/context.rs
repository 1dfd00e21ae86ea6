use commons::retry::Retry;
use commons_download::DownloadOptions;
use commons_upload::UploadConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings for one batch invocation, passed explicitly to everything that needs them.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Maximum number of concurrent transfers
    pub parallelism: usize,
    /// Retries of a failed transfer before it is given up (default 5)
    pub max_retries: u32,
    /// Upload mode selection and the per-request retry policy
    pub upload: UploadConfig,
    pub download: DownloadOptions,
    /// Delay between whole-transfer retries: `delay_factor * 2 ^ attempt`, capped at `max_delay`
    pub backoff: Retry,
    /// Where the ledger files live (default `$HOME/.commons/logs`)
    pub ledger_dir: PathBuf,
    pub include_hidden: bool,
    /// Preferred storage protocol, such as `s3`, when the commons offers several
    pub protocol: Option<String>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            parallelism: 4,
            max_retries: 5,
            upload: UploadConfig::default(),
            download: DownloadOptions::default(),
            backoff: Retry {
                retries: 5,
                max_delay: Duration::from_secs(60),
                delay_factor: Duration::from_secs(1),
                randomization_factor: 0.0,
            },
            ledger_dir: default_ledger_dir().unwrap_or_else(|| PathBuf::from(".commons/logs")),
            include_hidden: false,
            protocol: None,
        }
    }
}

/// `$HOME/.commons/logs`
pub fn default_ledger_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(|h| Path::new(&h).join(".commons").join("logs"))
}
