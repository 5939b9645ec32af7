//! Raw code-memory access: the only place that writes through pointers
//! into code that other threads may be executing.
//!
//! Every access is performed on naturally aligned 64-bit words with atomic
//! operations, so a concurrent reader sees each word either wholly before or
//! wholly after a store. Multi-word patches are made safe one level up (the
//! encoders' self-loop and chaining protocols); this module only promises
//! per-word atomicity and provides the fences and cache maintenance those
//! protocols need.

use std::sync::atomic::{AtomicU64, Ordering, fence};

use super::memory::CodeMemory;
use super::trampoline::TrampolineError;

const WORD: u64 = 8;

/// Errors raised while reading, decoding or patching code.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("address {addr:#x} (+{len} bytes) is outside every code cache")]
    OutOfBounds { addr: u64, len: usize },

    #[error("{len}-byte atomic write at {addr:#x} straddles an 8-byte word")]
    StraddlesWord { addr: u64, len: usize },

    #[error("unrecognized call site at {addr:#x}")]
    UnrecognizedCallSite { addr: u64 },

    #[error("site at {addr:#x} is aligned so that it cannot be patched without tearing")]
    UnpatchableAlignment { addr: u64 },

    #[error("target {target:#x} is not reachable from {site:#x} even through a trampoline")]
    Unreachable { site: u64, target: u64 },

    #[error(transparent)]
    Trampoline(#[from] TrampolineError),
}

/// Memory that holds patchable code.
///
/// `write_atomic` is the building block of the no-torn-write invariant:
/// the bytes must lie inside one aligned 8-byte word and become visible all
/// at once. `write_racy` may span words and is only used for bytes no
/// thread can currently decode (unpublished slots, or bytes guarded by a
/// self-loop).
pub trait CodeSpace {
    fn contains(&self, addr: u64, len: usize) -> bool;

    fn read(&self, addr: u64, out: &mut [u8]) -> Result<(), PatchError>;

    fn write_atomic(&self, addr: u64, bytes: &[u8]) -> Result<(), PatchError>;

    fn write_racy(&self, addr: u64, bytes: &[u8]) -> Result<(), PatchError>;

    /// Make freshly written bytes visible to instruction fetch.
    fn sync_icache(&self, addr: u64, len: usize);

    fn read_u32(&self, addr: u64, big_endian: bool) -> Result<u32, PatchError> {
        let mut bytes = [0u8; 4];
        self.read(addr, &mut bytes)?;
        Ok(if big_endian {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_le_bytes(bytes)
        })
    }

    fn read_u64(&self, addr: u64, big_endian: bool) -> Result<u64, PatchError> {
        let mut bytes = [0u8; 8];
        self.read(addr, &mut bytes)?;
        Ok(if big_endian {
            u64::from_be_bytes(bytes)
        } else {
            u64::from_le_bytes(bytes)
        })
    }
}

/// True when `[addr, addr + len)` fits inside one naturally aligned word.
pub fn within_word(addr: u64, len: usize) -> bool {
    len > 0 && len as u64 <= WORD && addr / WORD == (addr + len as u64 - 1) / WORD
}

/// Full fence between the steps of a multi-store patch protocol.
pub fn patching_fence() {
    fence(Ordering::SeqCst);
}

fn word_ref(mem: &CodeMemory, word_addr: u64) -> &AtomicU64 {
    let offset = (word_addr - mem.base()) as usize;
    // SAFETY: callers check the word lies inside the mapping; the mapping is
    // page aligned so every word address is 8-byte aligned, and all accesses
    // to code memory go through AtomicU64.
    unsafe { &*(mem.as_ptr().add(offset) as *const AtomicU64) }
}

/// Replace `bytes.len()` bytes starting at byte `shift` of one word.
fn store_into_word(cell: &AtomicU64, shift: usize, bytes: &[u8]) {
    let mut current = cell.load(Ordering::Acquire);
    loop {
        let mut word = current.to_ne_bytes();
        word[shift..shift + bytes.len()].copy_from_slice(bytes);
        let updated = u64::from_ne_bytes(word);
        match cell.compare_exchange_weak(current, updated, Ordering::SeqCst, Ordering::Acquire) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

impl CodeSpace for CodeMemory {
    fn contains(&self, addr: u64, len: usize) -> bool {
        self.contains_range(addr, len)
    }

    fn read(&self, addr: u64, out: &mut [u8]) -> Result<(), PatchError> {
        if !self.contains_range(addr, out.len()) {
            return Err(PatchError::OutOfBounds {
                addr,
                len: out.len(),
            });
        }
        let mut filled = 0;
        while filled < out.len() {
            let at = addr + filled as u64;
            let word_addr = at & !(WORD - 1);
            let shift = (at - word_addr) as usize;
            let take = (WORD as usize - shift).min(out.len() - filled);
            let word = word_ref(self, word_addr).load(Ordering::Acquire).to_ne_bytes();
            out[filled..filled + take].copy_from_slice(&word[shift..shift + take]);
            filled += take;
        }
        Ok(())
    }

    fn write_atomic(&self, addr: u64, bytes: &[u8]) -> Result<(), PatchError> {
        if !self.contains_range(addr, bytes.len()) {
            return Err(PatchError::OutOfBounds {
                addr,
                len: bytes.len(),
            });
        }
        if !within_word(addr, bytes.len()) {
            return Err(PatchError::StraddlesWord {
                addr,
                len: bytes.len(),
            });
        }
        let word_addr = addr & !(WORD - 1);
        store_into_word(word_ref(self, word_addr), (addr - word_addr) as usize, bytes);
        Ok(())
    }

    fn write_racy(&self, addr: u64, bytes: &[u8]) -> Result<(), PatchError> {
        if !self.contains_range(addr, bytes.len()) {
            return Err(PatchError::OutOfBounds {
                addr,
                len: bytes.len(),
            });
        }
        let mut written = 0;
        while written < bytes.len() {
            let at = addr + written as u64;
            let word_addr = at & !(WORD - 1);
            let shift = (at - word_addr) as usize;
            let take = (WORD as usize - shift).min(bytes.len() - written);
            store_into_word(
                word_ref(self, word_addr),
                shift,
                &bytes[written..written + take],
            );
            written += take;
        }
        Ok(())
    }

    fn sync_icache(&self, addr: u64, len: usize) {
        flush_instruction_cache(addr, len);
    }
}

#[cfg(any(target_arch = "aarch64", target_arch = "powerpc64"))]
unsafe extern "C" {
    fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
}

/// Instruction-cache maintenance for the host. A no-op on hosts with
/// coherent instruction fetch (x86-64, s390x).
pub fn flush_instruction_cache(addr: u64, len: usize) {
    #[cfg(any(target_arch = "aarch64", target_arch = "powerpc64"))]
    {
        // SAFETY: the range was just written through this module and is mapped
        unsafe {
            __clear_cache(
                addr as *mut libc::c_char,
                (addr + len as u64) as *mut libc::c_char,
            );
        }
    }
    #[cfg(not(any(target_arch = "aarch64", target_arch = "powerpc64")))]
    {
        let _ = (addr, len);
        fence(Ordering::SeqCst);
    }
}
