//! Atomically swappable handle to the live [`RuleTable`].
//!
//! Readers clone an `Arc` out from under a short read lock and then work on
//! that snapshot with no lock held. A reload builds the whole new table
//! first and replaces the pointer in one write, so a reader sees either the
//! old table or the new one in full.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::info;

use super::rules::RuleTable;
use crate::config::validation::ConfigError;
use crate::config::RoutingConfig;

/// Shared, reloadable rule table.
///
/// # Panics
///
/// This type and its methods never panic. A poisoned lock is recovered
/// because the guarded value is a plain `Arc` that cannot be left half
/// written.
#[derive(Debug)]
pub struct RuleTableHandle {
    current: RwLock<Arc<RuleTable>>,
    generation: AtomicU64,
}

impl RuleTableHandle {
    /// Wrap an initial table.
    pub fn new(table: RuleTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
            generation: AtomicU64::new(0),
        }
    }

    /// The table as of now.
    pub fn snapshot(&self) -> Arc<RuleTable> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the table, returning the new generation number.
    pub fn swap(&self, table: Arc<RuleTable>) -> u64 {
        {
            let mut guard = match self.current.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = table;
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!(generation, "rule table swapped");
        generation
    }

    /// Compile `source` and swap it in.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] from [`RuleTable::load`]; the current
    /// table is left untouched.
    pub fn reload(&self, source: &RoutingConfig) -> Result<Arc<RuleTable>, ConfigError> {
        let table = Arc::new(RuleTable::load(source)?);
        self.swap(Arc::clone(&table));
        Ok(table)
    }

    /// Number of swaps since creation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}
