//! Runtime helper table.
//!
//! Stores the entry addresses of runtime helper routines by helper index.
//! Helper trampolines load the current entry from this table each time they
//! run: through a dedicated base register on Power, through the table
//! address embedded in the trampoline elsewhere. The table must never move
//! once code refers to it.
//!
//! Index 0 is reserved and never used.

use std::sync::atomic::{AtomicU64, Ordering};

/// Well-known helper indices.
pub mod helpers {
    /// Entry of an invalidated body: recompile, then dispatch.
    pub const RECOMPILE_ON_INVOCATION: usize = 1;
    /// Inline-cache miss on an interface call.
    pub const INTERFACE_MISS: usize = 2;
}

/// A table of helper entry points.
///
/// Entries can be updated while code runs; generated code reads them with
/// plain loads.
pub struct HelperTable {
    /// Slot `i` holds helper `i + 1`.
    data: Box<[AtomicU64]>,
}

impl HelperTable {
    /// Create a table with room for helpers `1..=count`, all unset (0).
    pub fn new(count: usize) -> Self {
        HelperTable {
            data: (0..count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Number of helper indices the table can hold.
    pub fn count(&self) -> usize {
        self.data.len()
    }

    /// Update the entry address of helper `index`.
    ///
    /// Returns false for index 0 or an index past the table.
    pub fn update(&self, index: usize, entry_addr: u64) -> bool {
        match index.checked_sub(1).and_then(|i| self.data.get(i)) {
            Some(slot) => {
                slot.store(entry_addr, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Entry address of helper `index`, 0 when unset or out of range.
    pub fn get(&self, index: usize) -> u64 {
        index
            .checked_sub(1)
            .and_then(|i| self.data.get(i))
            .map_or(0, |slot| slot.load(Ordering::Acquire))
    }

    /// Address of the table in memory; helper trampolines index off it.
    pub fn base_addr(&self) -> u64 {
        self.data.as_ptr() as u64
    }
}
