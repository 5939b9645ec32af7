//! Trampoline pools.
//!
//! Each code cache owns one pool. Helper trampolines sit at the bottom of
//! the cache, one per helper index. Permanent per-method trampolines are
//! carved downward from the top of the cache, at most one per callee, and
//! are repointed rather than duplicated when the callee gets a new body.
//! Architectures whose trampolines cannot be rewritten in place also get a
//! fixed area of temporary trampolines at the very top; a retired temporary
//! stays mapped until [`TrampolinePool::reclaim_retired`] is called from a
//! point where no thread can still be running it.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::code_cache::CodeCache;
use super::codebuf::CodeBuffer;
use super::encoder::{InstructionEncoder, RepointMode};
use super::helper_table::HelperTable;
use super::patch::{CodeSpace, PatchError};
use crate::recomp::MethodId;

#[derive(Debug, thiserror::Error)]
pub enum TrampolineError {
    #[error("trampoline space exhausted in code cache {cache}")]
    TrampolineSpaceExhausted { cache: usize },

    #[error("no temporary trampoline left in code cache {cache}")]
    TemporarySpaceExhausted { cache: usize },

    #[error("helper {index} has no trampoline")]
    UnknownHelper { index: usize },
}

/// Kinds of trampoline slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrampolineKind {
    Helper,
    Method,
    Temporary,
}

/// Result of [`TrampolinePool::find_or_create_for_target`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrampolineSlot {
    pub address: u64,
    /// A new permanent slot was allocated.
    pub fresh: bool,
    /// An existing trampoline was pointed at the new target.
    pub repointed: bool,
}

#[derive(Debug)]
struct MethodTrampoline {
    address: u64,
    target: u64,
    active_temporary: Option<u64>,
}

#[derive(Debug, Default)]
struct PoolState {
    by_method: FxHashMap<MethodId, MethodTrampoline>,
    free_temporaries: Vec<u64>,
    retired: Vec<u64>,
}

pub struct TrampolinePool {
    cache_index: usize,
    temporary_slots: usize,
    state: Mutex<PoolState>,
}

impl TrampolinePool {
    pub fn new(
        cache_index: usize,
        temporary_base: u64,
        temporary_slots: usize,
        slot_size: usize,
    ) -> Self {
        let free_temporaries = (0..temporary_slots)
            .rev()
            .map(|i| temporary_base + (i * slot_size) as u64)
            .collect();
        Self {
            cache_index,
            temporary_slots,
            state: Mutex::new(PoolState {
                free_temporaries,
                ..PoolState::default()
            }),
        }
    }

    /// Number of temporary trampoline slots to reserve for a cache.
    pub fn configure(encoder: &dyn InstructionEncoder, cache_size: usize) -> usize {
        encoder.configure(cache_size)
    }

    /// Emit helper trampolines for indices `1..=helpers.count()` starting at
    /// `base`. Must run before the cache is published.
    pub fn create_helper_trampolines(
        encoder: &dyn InstructionEncoder,
        space: &dyn CodeSpace,
        base: u64,
        helpers: &HelperTable,
    ) -> Result<(), PatchError> {
        let size = encoder.helper_trampoline_size();
        let mut buf = CodeBuffer::with_capacity(encoder.endian(), size * helpers.count());
        for index in 1..=helpers.count() {
            encoder.emit_helper_trampoline(&mut buf, index, helpers.base_addr());
            buf.pad_to(index * size, 0);
        }
        space.write_racy(base, buf.code())?;
        encoder.sync(space, base, buf.len());
        Ok(())
    }

    /// Program the trampoline at `slot` to jump to `target`. The slot must
    /// not be reachable from any call site yet.
    pub fn create_method_trampoline(
        encoder: &dyn InstructionEncoder,
        space: &dyn CodeSpace,
        slot: u64,
        target: u64,
    ) -> Result<(), PatchError> {
        let mut buf = CodeBuffer::with_capacity(encoder.endian(), encoder.trampoline_size());
        encoder.emit_method_trampoline(&mut buf, target);
        space.write_racy(slot, buf.code())?;
        encoder.sync(space, slot, buf.len());
        Ok(())
    }

    /// Get a trampoline in `cache` that jumps to `target` for `callee`.
    ///
    /// Reuses the callee's trampoline when it already points at `target`,
    /// repoints it when it points elsewhere, and otherwise allocates a new
    /// permanent slot.
    pub fn find_or_create_for_target(
        &self,
        cache: &CodeCache,
        callee: MethodId,
        target: u64,
    ) -> Result<TrampolineSlot, PatchError> {
        let encoder = cache.encoder();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(existing) = state.by_method.get_mut(&callee) {
            let address = existing.address;
            if existing.target == target {
                return Ok(TrampolineSlot {
                    address,
                    fresh: false,
                    repointed: false,
                });
            }
            match encoder.repoint_mode() {
                RepointMode::InPlace => encoder.repoint_trampoline(cache, address, target)?,
                RepointMode::Chained => {
                    let temporary = state.free_temporaries.pop().ok_or(
                        TrampolineError::TemporarySpaceExhausted {
                            cache: self.cache_index,
                        },
                    )?;
                    let programmed =
                        Self::create_method_trampoline(encoder, cache, temporary, target)
                            .and_then(|()| encoder.chain_trampoline(cache, address, temporary));
                    if let Err(e) = programmed {
                        state.free_temporaries.push(temporary);
                        return Err(e);
                    }
                    if let Some(old) = existing.active_temporary.replace(temporary) {
                        state.retired.push(old);
                    }
                }
            }
            existing.target = target;
            tracing::debug!(
                cache = self.cache_index,
                ?callee,
                address,
                target,
                "repointed trampoline"
            );
            return Ok(TrampolineSlot {
                address,
                fresh: false,
                repointed: true,
            });
        }

        let address = cache
            .carve_trampoline()
            .ok_or(TrampolineError::TrampolineSpaceExhausted {
                cache: self.cache_index,
            })?;
        Self::create_method_trampoline(encoder, cache, address, target)?;
        state.by_method.insert(
            callee,
            MethodTrampoline {
                address,
                target,
                active_temporary: None,
            },
        );
        tracing::debug!(cache = self.cache_index, ?callee, address, target, "created trampoline");
        Ok(TrampolineSlot {
            address,
            fresh: true,
            repointed: false,
        })
    }

    /// The callee's permanent trampoline, if it has one.
    pub fn trampoline_for(&self, callee: MethodId) -> Option<u64> {
        self.state.lock().by_method.get(&callee).map(|t| t.address)
    }

    pub fn live_trampolines(&self) -> usize {
        self.state.lock().by_method.len()
    }

    pub fn free_temporaries(&self) -> usize {
        self.state.lock().free_temporaries.len()
    }

    pub fn temporary_slots(&self) -> usize {
        self.temporary_slots
    }

    pub fn retired_temporaries(&self) -> usize {
        self.state.lock().retired.len()
    }

    /// Return retired temporary trampolines to the free list. Only call
    /// once no thread can still be executing them.
    pub fn reclaim_retired(&self) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let count = state.retired.len();
        state.free_temporaries.append(&mut state.retired);
        count
    }
}
