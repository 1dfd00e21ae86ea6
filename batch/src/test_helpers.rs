//! Utilities for testing batches
use crate::transfer::{Completed, Transfer};
use crate::unit::{Direction, TransferUnit};
use anyhow::Result;
use async_trait::async_trait;
use commons_download::{Disposition, DownloadOutcome};
use commons_upload::{RegisteredObject, UploadMode};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Event logger, used to log events from various places and then assert on them.
#[derive(Default, Clone)]
pub(crate) struct Logger {
    logged: Arc<Mutex<Vec<String>>>,
}

impl Logger {
    pub(crate) fn log<S: Into<String>>(&self, message: S) {
        self.logged.lock().unwrap().push(message.into())
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.logged.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, message: &str) -> usize {
        self.logged
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.starts_with(message))
            .count()
    }
}

/// What the next attempt at a unit does.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Outcome {
    Succeed,
    /// A transient failure
    Fail,
    /// A transient failure after registering a new object for the unit
    FailRegistered,
    /// The local file is gone
    Missing,
    /// The request could not even be built
    Unsignable,
    /// A download that found its destination taken and wrote to `name (1)` instead
    Renamed,
}

/// Fake transfer that follows a per-file script of outcomes, succeeding once the script is
/// exhausted.
pub(crate) struct FakeTransfer {
    logger: Logger,
    script: Mutex<HashMap<String, VecDeque<Outcome>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTransfer {
    pub(crate) fn new(logger: Logger) -> Self {
        Self {
            logger,
            script: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn script(&self, file_name: &str, outcomes: Vec<Outcome>) {
        self.script
            .lock()
            .unwrap()
            .insert(file_name.to_owned(), outcomes.into());
    }

    pub(crate) fn attempts(&self) -> usize {
        self.logger.count("transfer ")
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next(&self, file_name: &str) -> Outcome {
        self.script
            .lock()
            .unwrap()
            .get_mut(file_name)
            .and_then(|s| s.pop_front())
            .unwrap_or(Outcome::Succeed)
    }
}

#[async_trait]
impl Transfer for FakeTransfer {
    async fn mode_for(&self, _unit: &TransferUnit) -> UploadMode {
        UploadMode::Simple
    }

    async fn transfer(&self, unit: &TransferUnit) -> Result<Completed> {
        self.logger
            .log(format!("transfer {} {:?}", unit.file_name, unit.object_id));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let object_id = unit
            .object_id
            .clone()
            .unwrap_or_else(|| format!("guid-{}", unit.file_name));
        match self.next(&unit.file_name) {
            Outcome::Succeed => Ok(Completed {
                download: (unit.direction == Direction::Download).then(|| DownloadOutcome {
                    object_id: object_id.clone(),
                    path: unit.key(),
                    disposition: Disposition::Downloaded,
                    bytes: 1,
                }),
                object_id,
                mode: UploadMode::Simple,
            }),
            Outcome::Renamed => Ok(Completed {
                download: Some(DownloadOutcome {
                    object_id: object_id.clone(),
                    path: unit.path.join(format!("{} (1)", unit.file_name)),
                    disposition: Disposition::Renamed {
                        original: unit.key(),
                    },
                    bytes: 1,
                }),
                object_id,
                mode: UploadMode::Simple,
            }),
            Outcome::Unsignable => {
                Err(commons::Error::Protocol("cannot sign request".to_owned()).into())
            }
            Outcome::Fail => Err(commons::Error::Transfer("connection reset".to_owned()).into()),
            Outcome::FailRegistered => {
                let err: anyhow::Error =
                    commons::Error::Transfer("connection reset".to_owned()).into();
                match &unit.object_id {
                    Some(_) => Err(err),
                    None => Err(err.context(RegisteredObject(format!("guid-{}", unit.file_name)))),
                }
            }
            Outcome::Missing => Err(commons::Error::local_io(
                &unit.path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            )
            .into()),
        }
    }

    async fn abandon(&self, object_id: &str) -> Result<()> {
        self.logger.log(format!("abandon {}", object_id));
        Ok(())
    }
}
