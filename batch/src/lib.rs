/*!
# Batch Transfers

This crate moves many files to or from a data commons at once, on top of `commons-upload` and
`commons-download`.

A batch is a list of [`TransferUnit`]s, built by hand, from a directory scan
([`scan_directory`]), or from a manifest ([`load_manifest`]).  A [`Scheduler`] runs the units
through a bounded pool of workers, records every outcome in a [`Ledger`], and then retries the
failures one at a time with exponential backoff.  Units that run out of retries are given up:
an object registered by this batch for a failed upload is deleted again, and the failure stays
in the ledger for a later `retry-upload`.

```no_run
# use std::sync::Arc;
# use commons::{chrono::Utc, services::Fence, ClientBuilder, Credentials, Profile, Resolver};
# use commons_batch::*;
# async fn f() -> anyhow::Result<()> {
# let profile = Profile::new("default", Credentials::new("k", "a"), "https://commons.example.org");
let settings = TransferSettings::default();
let client = ClientBuilder::from_profile(&profile).build()?;
let transfer = CommonsTransfer::new(
    Arc::new(Resolver::new(&profile, &client)?),
    Arc::new(Fence::from_client(&client)?),
    &settings,
);
let ledger = Ledger::open(&settings.ledger_dir, &profile.name, Utc::now()).await?;
let scheduler = Scheduler::new(Arc::new(transfer), Arc::new(ledger), &settings);
let units = scan_directory("data".as_ref(), false)
    .await?
    .into_iter()
    .map(TransferUnit::upload)
    .collect();
println!("{}", scheduler.run(units).await);
# Ok(())
# }
```

Outcomes are observable through the returned [`BatchReport`]; nothing in a batch fails the
batch as a whole.
*/

mod context;
mod ledger;
mod manifest;
mod scheduler;
mod scoreboard;
mod transfer;
mod unit;

#[cfg(test)]
mod test_helpers;

pub use context::{default_ledger_dir, TransferSettings};
pub use ledger::{failed_log_name, newest_failed_log, succeeded_log_name, Ledger, RetryRecord};
pub use manifest::{
    download_units, load_manifest, parse_manifest, scan_directory, upload_units, ManifestEntry,
};
pub use scheduler::Scheduler;
pub use scoreboard::{BatchReport, Scoreboard};
pub use transfer::{CommonsTransfer, Completed, Transfer};
pub use unit::{Direction, TransferUnit};
