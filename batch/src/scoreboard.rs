use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// How many transfers succeeded after N retries (N in `0..=max_retries`) or failed for good.
/// Purely observational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scoreboard {
    succeeded_after: Vec<u64>,
    failed: u64,
}

impl Scoreboard {
    pub fn new(max_retries: u32) -> Self {
        Self {
            succeeded_after: vec![0; max_retries as usize + 1],
            failed: 0,
        }
    }

    /// Count a success after `retries` retries.  Anything beyond the table lands in the last row.
    pub fn succeeded(&mut self, retries: u32) {
        let last = self.succeeded_after.len() - 1;
        self.succeeded_after[(retries as usize).min(last)] += 1;
    }

    pub fn failed(&mut self) {
        self.failed += 1;
    }

    pub fn succeeded_after(&self, retries: u32) -> u64 {
        self.succeeded_after
            .get(retries as usize)
            .copied()
            .unwrap_or(0)
    }

    pub fn failures(&self) -> u64 {
        self.failed
    }

    pub fn total(&self) -> u64 {
        self.succeeded_after.iter().sum::<u64>() + self.failed
    }
}

impl fmt::Display for Scoreboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<20}{:>8}", "Retries", "Files")?;
        for (retries, count) in self.succeeded_after.iter().enumerate() {
            writeln!(f, "{:<20}{:>8}", retries, count)?;
        }
        writeln!(f, "{:<20}{:>8}", "Failed", self.failed)?;
        write!(f, "{:<20}{:>8}", "Total", self.total())
    }
}

/// Everything a batch reports to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub scoreboard: Scoreboard,
    /// (requested destination, actual destination)
    pub renamed: Vec<(PathBuf, PathBuf)>,
    pub skipped: Vec<PathBuf>,
    /// (path, last error)
    pub failed: Vec<(PathBuf, String)>,
    /// Set when the batch stopped early on request
    pub cancelled: bool,
}

impl BatchReport {
    pub fn new(max_retries: u32) -> Self {
        Self {
            scoreboard: Scoreboard::new(max_retries),
            renamed: vec![],
            skipped: vec![],
            failed: vec![],
            cancelled: false,
        }
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.scoreboard)?;
        if !self.renamed.is_empty() {
            writeln!(f, "\nRenamed files:")?;
            for (from, to) in &self.renamed {
                writeln!(f, "  {} -> {}", from.display(), to.display())?;
            }
        }
        if !self.skipped.is_empty() {
            writeln!(f, "\nSkipped files:")?;
            for path in &self.skipped {
                writeln!(f, "  {}", path.display())?;
            }
        }
        if !self.failed.is_empty() {
            writeln!(f, "\nFailed files:")?;
            for (path, err) in &self.failed {
                writeln!(f, "  {}: {}", path.display(), err)?;
            }
        }
        if self.cancelled {
            writeln!(f, "\nCancelled before all files were transferred")?;
        }
        Ok(())
    }
}
