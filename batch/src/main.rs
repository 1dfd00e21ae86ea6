use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use commons::chrono::Utc;
use commons::services::Fence;
use commons::{
    AuthMode, ClientBuilder, Credentials, Error as CommonsError, Profile, ProfileStore, Resolver,
    TokenRefreshHook, TomlProfileStore,
};
use commons_batch::{
    download_units, load_manifest, newest_failed_log, scan_directory, upload_units, BatchReport,
    CommonsTransfer, Ledger, Scheduler, TransferSettings, TransferUnit,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Move files to and from a data commons.
#[derive(Parser, Debug)]
#[command(name = "commons-transfer", version)]
struct Cli {
    /// Profile to use
    #[arg(long, global = true, default_value = "default")]
    profile: String,

    /// Profile store (default ~/.commons/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or replace a profile from a credentials file
    Configure {
        /// Credentials JSON downloaded from the commons
        #[arg(long)]
        cred: PathBuf,
        /// Commons endpoint, such as https://commons.example.org
        #[arg(long)]
        apiendpoint: String,
        /// Never use the unified API, only the legacy backends
        #[arg(long)]
        no_shepherd: bool,
        #[arg(long)]
        min_shepherd_version: Option<String>,
        /// Sign requests with the key pair instead of using bearer tokens
        #[arg(long)]
        hmac: bool,
    },
    /// Upload a file, or every file under a directory, as new objects
    Upload {
        path: PathBuf,
        #[command(flatten)]
        options: BatchOptions,
    },
    /// Upload files for objects registered in a manifest
    UploadMultiple {
        #[arg(long)]
        manifest: PathBuf,
        /// Directory holding the files named in the manifest
        #[arg(long, default_value = ".")]
        upload_path: PathBuf,
        #[command(flatten)]
        options: BatchOptions,
    },
    /// Download one object
    DownloadSingle {
        object_id: String,
        #[arg(long, default_value = ".")]
        download_path: PathBuf,
        #[command(flatten)]
        options: BatchOptions,
    },
    /// Download every object in a manifest
    DownloadMultiple {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long, default_value = ".")]
        download_path: PathBuf,
        #[command(flatten)]
        options: BatchOptions,
    },
    /// Retry the transfers recorded in a failed log
    RetryUpload {
        /// Failed log to retry (default: the newest for the profile)
        #[arg(long)]
        failed_log: Option<PathBuf>,
        #[command(flatten)]
        options: BatchOptions,
    },
}

#[derive(Args, Debug)]
struct BatchOptions {
    /// Number of concurrent transfers
    #[arg(long, default_value_t = 4)]
    numparallel: usize,
    /// Retries of a failed transfer before giving up on it
    #[arg(long, default_value_t = 5)]
    max_retries: u32,
    /// Files of at least this many bytes are uploaded in parts
    #[arg(long)]
    multipart_threshold: Option<u64>,
    /// Upload every file in parts
    #[arg(long)]
    force_multipart: bool,
    /// Leave downloads alone whose local file is already complete
    #[arg(long)]
    skip_completed: bool,
    /// Download to a new name instead of overwriting an existing file
    #[arg(long)]
    rename: bool,
    /// Include files and directories whose names start with '.'
    #[arg(long)]
    include_hidden: bool,
    /// Preferred storage protocol, such as s3 or gs
    #[arg(long)]
    protocol: Option<String>,
    /// Directory for the ledger files (default ~/.commons/logs)
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl BatchOptions {
    fn settings(&self) -> TransferSettings {
        let mut settings = TransferSettings {
            parallelism: self.numparallel,
            max_retries: self.max_retries,
            include_hidden: self.include_hidden,
            protocol: self.protocol.clone(),
            ..TransferSettings::default()
        };
        settings.backoff.retries = self.max_retries;
        settings.upload.force_multipart = self.force_multipart;
        if let Some(threshold) = self.multipart_threshold {
            settings.upload.multipart_threshold = threshold;
        }
        settings.download.skip_completed = self.skip_completed;
        settings.download.rename_existing = self.rename;
        if let Some(dir) = &self.log_dir {
            settings.ledger_dir = dir.clone();
        }
        settings
    }
}

fn profile_store(config: Option<PathBuf>) -> Result<Arc<TomlProfileStore>> {
    let path = config
        .or_else(TomlProfileStore::default_path)
        .ok_or_else(|| CommonsError::Config("cannot locate the profile store".to_owned()))?;
    Ok(Arc::new(TomlProfileStore::new(path)))
}

fn configure(
    store: &TomlProfileStore,
    name: &str,
    cred: &Path,
    apiendpoint: String,
    no_shepherd: bool,
    min_shepherd_version: Option<String>,
    hmac: bool,
) -> Result<()> {
    let credentials = Credentials::from_api_key_file(cred)
        .map_err(|e| CommonsError::Config(format!("{:#}", e)))?;
    let mut profile = Profile::new(name.to_owned(), credentials, apiendpoint);
    if no_shepherd {
        profile.use_shepherd = Some(false);
    }
    profile.min_shepherd_version = min_shepherd_version;
    if hmac {
        profile.auth_mode = AuthMode::Hmac;
    }
    profile.validate()?;
    store.save(&profile)?;
    log::info!("saved profile {} to {}", name, store.path().display());
    Ok(())
}

/// The work a batch subcommand does once the profile is loaded.
enum Work {
    Run(Vec<TransferUnit>),
    Retry(Option<PathBuf>),
}

async fn run_batch(
    store: Arc<TomlProfileStore>,
    profile_name: &str,
    options: &BatchOptions,
    work: Work,
) -> Result<BatchReport> {
    let settings = options.settings();
    let profile = store.load(profile_name)?;
    profile.validate()?;

    let hook_store = store.clone();
    let hook_name = profile.name.clone();
    let client = ClientBuilder::from_profile(&profile)
        .on_token_refresh(TokenRefreshHook::new(move |token| {
            hook_store.update_access_token(&hook_name, token)
        }))
        .build()?;
    let resolver = Resolver::new(&profile, &client)?.protocol(settings.protocol.clone());
    let transfer = CommonsTransfer::new(
        Arc::new(resolver),
        Arc::new(Fence::from_client(&client)?),
        &settings,
    );

    let (ledger, units) = match work {
        Work::Run(units) => (
            Ledger::open(&settings.ledger_dir, &profile.name, Utc::now()).await?,
            Some(units),
        ),
        Work::Retry(failed_log) => {
            let failed_log = match failed_log {
                Some(path) => path,
                None => newest_failed_log(&settings.ledger_dir, &profile.name)
                    .await?
                    .ok_or_else(|| {
                        CommonsError::Config(format!(
                            "no failed log for profile {} in {}",
                            profile.name,
                            settings.ledger_dir.display()
                        ))
                    })?,
            };
            let ledger = Ledger::resume(&settings.ledger_dir, &profile.name, &failed_log).await?;
            ledger.rearm().await?;
            (ledger, None)
        }
    };
    log::info!("recording failures in {}", ledger.failed_log_path().display());

    let scheduler = Scheduler::new(Arc::new(transfer), Arc::new(ledger), &settings);
    let cancel = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupted; finishing transfers in flight");
            cancel.cancel();
        }
    });

    Ok(match units {
        Some(units) => scheduler.run(units).await,
        None => scheduler.retry_all().await,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let store = profile_store(cli.config)?;

    let (options, work) = match cli.command {
        Command::Configure {
            cred,
            apiendpoint,
            no_shepherd,
            min_shepherd_version,
            hmac,
        } => {
            return configure(
                &store,
                &cli.profile,
                &cred,
                apiendpoint,
                no_shepherd,
                min_shepherd_version,
                hmac,
            )
        }
        Command::Upload { path, options } => {
            let units = scan_directory(&path, options.include_hidden)
                .await?
                .into_iter()
                .map(TransferUnit::upload)
                .collect();
            (options, Work::Run(units))
        }
        Command::UploadMultiple {
            manifest,
            upload_path,
            options,
        } => {
            let entries = load_manifest(&manifest).await?;
            (options, Work::Run(upload_units(&entries, &upload_path)?))
        }
        Command::DownloadSingle {
            object_id,
            download_path,
            options,
        } => {
            let unit = TransferUnit::download(object_id, download_path);
            (options, Work::Run(vec![unit]))
        }
        Command::DownloadMultiple {
            manifest,
            download_path,
            options,
        } => {
            let entries = load_manifest(&manifest).await?;
            (options, Work::Run(download_units(&entries, &download_path)))
        }
        Command::RetryUpload {
            failed_log,
            options,
        } => (options, Work::Retry(failed_log)),
    };

    let report = run_batch(store, &cli.profile, &options, work)
        .await
        .context("while setting up the batch")?;
    println!("{}", report);
    Ok(())
}
