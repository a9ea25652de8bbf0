//! Bounded in-memory record of retired runs.

use std::collections::VecDeque;

use coderun_core::RunId;

use crate::run::RunSnapshot;

/// Default number of retired runs kept.
pub const DEFAULT_HISTORY_LIMIT: usize = 16;

/// Retired runs, newest first. The oldest entry is evicted once the limit is
/// reached. Data is lost on restart.
#[derive(Debug, Clone)]
pub struct RunHistory {
    runs: VecDeque<RunSnapshot>,
    limit: usize,
}

impl Default for RunHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl RunHistory {
    /// Empty history keeping at most `limit` runs.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            runs: VecDeque::with_capacity(limit.min(64)),
            limit,
        }
    }

    /// Record a retired run.
    pub fn push(&mut self, run: RunSnapshot) {
        if self.limit == 0 {
            return;
        }
        while self.runs.len() >= self.limit {
            self.runs.pop_back();
        }
        self.runs.push_front(run);
    }

    /// Look up a run by id.
    #[must_use]
    pub fn get(&self, id: RunId) -> Option<&RunSnapshot> {
        self.runs.iter().find(|run| run.id == id)
    }

    /// All recorded runs, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &RunSnapshot> {
        self.runs.iter()
    }

    /// Number of recorded runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Whether nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
