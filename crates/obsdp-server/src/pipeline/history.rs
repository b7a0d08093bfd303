//! Run history
//!
//! Append-only record of finished harvest and process runs, kept per source for
//! harvests. Used by status queries and to tell what a process run consumed.

use obsdp_common::types::SourceId;
use std::collections::HashMap;
use std::sync::RwLock;

use super::types::{HarvestRun, ProcessRun, RunOutcome};

/// Runs kept per source and for processing
const DEFAULT_RETAINED: usize = 100;

#[derive(Debug, Default)]
struct Runs {
    harvests: HashMap<SourceId, Vec<HarvestRun>>,
    processes: Vec<ProcessRun>,
}

#[derive(Debug)]
pub struct RunHistory {
    runs: RwLock<Runs>,
    retained: usize,
}

impl Default for RunHistory {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED)
    }
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retained: usize) -> Self {
        Self {
            runs: RwLock::new(Runs::default()),
            retained: retained.max(1),
        }
    }

    pub fn record_harvest(&self, run: HarvestRun) {
        let mut runs = self.runs.write().unwrap_or_else(|p| p.into_inner());
        let entries = runs.harvests.entry(run.source_id).or_default();
        entries.push(run);
        trim(entries, self.retained);
    }

    pub fn record_process(&self, run: ProcessRun) {
        let mut runs = self.runs.write().unwrap_or_else(|p| p.into_inner());
        runs.processes.push(run);
        trim(&mut runs.processes, self.retained);
    }

    /// Harvest runs of a source, oldest first
    pub fn harvests(&self, source_id: SourceId) -> Vec<HarvestRun> {
        let runs = self.runs.read().unwrap_or_else(|p| p.into_inner());
        runs.harvests.get(&source_id).cloned().unwrap_or_default()
    }

    pub fn latest_harvest(&self, source_id: SourceId) -> Option<HarvestRun> {
        let runs = self.runs.read().unwrap_or_else(|p| p.into_inner());
        runs.harvests.get(&source_id)?.last().cloned()
    }

    pub fn latest_successful_harvest(&self, source_id: SourceId) -> Option<HarvestRun> {
        let runs = self.runs.read().unwrap_or_else(|p| p.into_inner());
        runs.harvests
            .get(&source_id)?
            .iter()
            .rev()
            .find(|r| r.outcome == RunOutcome::Success)
            .cloned()
    }

    /// Process runs, oldest first
    pub fn processes(&self) -> Vec<ProcessRun> {
        self.runs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .processes
            .clone()
    }

    pub fn latest_process(&self) -> Option<ProcessRun> {
        self.runs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .processes
            .last()
            .cloned()
    }
}

fn trim<T>(entries: &mut Vec<T>, retained: usize) {
    if entries.len() > retained {
        let excess = entries.len() - retained;
        entries.drain(..excess);
    }
}
