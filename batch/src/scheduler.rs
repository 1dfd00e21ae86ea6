//! The batch scheduler: a bounded pool of workers over a queue of units, followed by a
//! sequential retry pass over everything that failed.
use crate::context::TransferSettings;
use crate::ledger::{Ledger, RetryRecord};
use crate::scoreboard::BatchReport;
use crate::transfer::{Completed, Transfer};
use crate::unit::{Direction, TransferUnit};
use anyhow::Result;
use commons::retry::Retry;
use commons_download::Disposition;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub struct Scheduler {
    transfer: Arc<dyn Transfer>,
    ledger: Arc<Ledger>,
    parallelism: usize,
    max_retries: u32,
    backoff: Retry,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(transfer: Arc<dyn Transfer>, ledger: Arc<Ledger>, settings: &TransferSettings) -> Self {
        Self {
            transfer,
            ledger,
            parallelism: settings.parallelism,
            max_retries: settings.max_retries,
            backoff: settings.backoff.clone(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// A token that stops the batch: no new units are started, and the retry pass ends before
    /// its next attempt.  Outcomes already produced are still recorded.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Transfer all units, then retry the failures until they succeed or run out of retries.
    pub async fn run(&self, units: Vec<TransferUnit>) -> BatchReport {
        let mut report = BatchReport::new(self.max_retries);
        let mut retries = VecDeque::new();

        let mut queued = Vec::with_capacity(units.len());
        for unit in units {
            if self.ledger.is_succeeded(&unit.key()) {
                info!("{} was already transferred; skipping", unit.key().display());
                report.skipped.push(unit.key());
                report.scoreboard.succeeded(0);
            } else {
                queued.push(unit);
            }
        }

        self.run_pool(queued, &mut report, &mut retries).await;
        self.retry_pass(retries, &mut report).await;
        report
    }

    /// Run only the retry pass, over every record in the ledger.
    pub async fn retry_all(&self) -> BatchReport {
        let mut report = BatchReport::new(self.max_retries);
        let keys = self.ledger.records().into_iter().map(|r| r.path).collect();
        self.retry_pass(keys, &mut report).await;
        report
    }

    async fn run_pool(
        &self,
        units: Vec<TransferUnit>,
        report: &mut BatchReport,
        retries: &mut VecDeque<PathBuf>,
    ) {
        let count = units.len();
        if count == 0 {
            return;
        }
        let workers = self.parallelism.clamp(1, count);
        debug!("transferring {} units with {} workers", count, workers);

        let (work_tx, work_rx) = mpsc::channel::<TransferUnit>(workers);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<(TransferUnit, Result<Completed>)>(workers);

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let transfer = self.transfer.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let unit = {
                        let mut work_rx = work_rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            unit = work_rx.recv() => unit,
                        }
                    };
                    let unit = match unit {
                        Some(unit) => unit,
                        None => break,
                    };
                    debug!("worker {}: {}", worker, unit.key().display());
                    let res = transfer.transfer(&unit).await;
                    if result_tx.send((unit, res)).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        let cancel = self.cancel.clone();
        let feeder = tokio::spawn(async move {
            for unit in units {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    res = work_tx.send(unit) => if res.is_err() { break },
                }
            }
        });

        let mut settled = 0;
        while let Some((unit, res)) = result_rx.recv().await {
            settled += 1;
            self.settle(unit, res, 0, report, retries).await;
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("transfer worker failed: {}", e);
            }
        }
        if let Err(e) = feeder.await {
            error!("transfer feeder failed: {}", e);
        }
        if settled < count {
            warn!("cancelled with {} of {} units not started", count - settled, count);
            report.cancelled = true;
        }
    }

    /// Retry each failed unit in turn, waiting `backoff.delay_for(attempts)` first.  Units that
    /// fail again go to the back of the queue until they run out of retries.
    async fn retry_pass(&self, mut queue: VecDeque<PathBuf>, report: &mut BatchReport) {
        while let Some(key) = queue.pop_front() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if self.ledger.is_succeeded(&key) {
                info!("{} was already transferred; not retrying", key.display());
                if let Err(e) = self.ledger.discard(&key).await {
                    error!("could not update ledger: {:#}", e);
                }
                report.skipped.push(key);
                report.scoreboard.succeeded(0);
                continue;
            }
            let record = match self.ledger.record(&key) {
                Some(record) => record,
                None => continue,
            };

            let delay = self.backoff.delay_for(record.attempts);
            debug!(
                "retrying {} (attempt {}) in {:?}",
                key.display(),
                record.attempts + 1,
                delay
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let unit = record.unit();
            let res = self.transfer.transfer(&unit).await;
            self.settle(unit, res, record.attempts, report, &mut queue)
                .await;
        }
    }

    /// Record one outcome.  Failures with retries left are queued; the rest are given up.
    async fn settle(
        &self,
        unit: TransferUnit,
        res: Result<Completed>,
        retries: u32,
        report: &mut BatchReport,
        queue: &mut VecDeque<PathBuf>,
    ) {
        let key = unit.key();
        match res {
            Ok(completed) => {
                // a download may have landed under another name than the one it is tracked by
                let written = completed
                    .download
                    .as_ref()
                    .map(|d| d.path.clone())
                    .unwrap_or_else(|| key.clone());
                info!("{} -> {}", written.display(), completed.object_id);
                if let Err(e) = self
                    .ledger
                    .record_success(&key, &written, &completed.object_id)
                    .await
                {
                    error!("could not update ledger: {:#}", e);
                }
                report.scoreboard.succeeded(retries);
                match completed.download.map(|d| (d.path, d.disposition)) {
                    Some((path, Disposition::Renamed { original })) => {
                        report.renamed.push((original, path))
                    }
                    Some((path, Disposition::Skipped)) => report.skipped.push(path),
                    _ => {}
                }
            }
            Err(err) => {
                warn!("{} failed: {:#}", key.display(), err);
                let mode = self.transfer.mode_for(&unit).await;
                match self.ledger.record_failure(&unit, mode, &err).await {
                    Ok(record) if record.retriable && record.attempts <= self.max_retries => {
                        queue.push_back(key)
                    }
                    Ok(record) => self.give_up(record, report).await,
                    Err(e) => {
                        error!("could not update ledger: {:#}", e);
                        report.failed.push((key, format!("{:#}", err)));
                        report.scoreboard.failed();
                    }
                }
            }
        }
    }

    /// Mark a unit permanently failed, deleting any object registered for it.  The record stays
    /// in the ledger for a later manual retry.
    async fn give_up(&self, record: RetryRecord, report: &mut BatchReport) {
        error!(
            "giving up on {} after {} attempts: {}",
            record.path.display(),
            record.attempts,
            record.last_error
        );
        if record.direction == Direction::Upload && record.registered {
            if let Some(object_id) = &record.object_id {
                match self.transfer.abandon(object_id).await {
                    Ok(()) => {
                        info!("deleted abandoned object {}", object_id);
                        if let Err(e) = self.ledger.forget_object(&record.path).await {
                            error!("could not update ledger: {:#}", e);
                        }
                    }
                    Err(e) => warn!("could not delete abandoned object {}: {:#}", object_id, e),
                }
            }
        }
        report.failed.push((record.path, record.last_error));
        report.scoreboard.failed();
    }
}
