//! Inline caches for interface dispatch.
//!
//! An interface call site reads its target from a small block in code
//! memory holding two `[class, target]` pairs. The block is filled as
//! receiver classes are observed and patched slot by slot when a cached
//! target is recompiled; each field is one aligned 8-byte word, so slot
//! updates are single atomic stores.

use super::codebuf::{CodeBuffer, Endian};
use super::patch::{CodeSpace, PatchError};

pub const SLOTS: usize = 2;
pub const BLOCK_SIZE: usize = SLOTS * 16;

/// Cache state for inline caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// No receiver class recorded yet
    Uninitialized,
    /// Single class observed (fastest path)
    Monomorphic,
    /// Both slots in use
    Polymorphic,
}

/// One `[class, target]` pair. A zero class marks an empty slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheEntry {
    pub class: u64,
    pub target: u64,
}

/// View of an inline-cache block at a fixed address.
#[derive(Debug, Clone, Copy)]
pub struct InlineCacheBlock {
    addr: u64,
    endian: Endian,
}

impl InlineCacheBlock {
    pub fn at(addr: u64, endian: Endian) -> Self {
        Self { addr, endian }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Emit a block preloaded with `entries`. The cursor must be 8-byte
    /// aligned relative to an 8-byte aligned base.
    pub fn emit(buf: &mut CodeBuffer, entries: &[CacheEntry]) {
        for slot in 0..SLOTS {
            let entry = entries.get(slot).copied().unwrap_or_default();
            buf.emit_u64(entry.class);
            buf.emit_u64(entry.target);
        }
    }

    fn big_endian(&self) -> bool {
        self.endian == Endian::Big
    }

    fn field(&self, slot: usize, target: bool) -> u64 {
        self.addr + (slot * 16) as u64 + if target { 8 } else { 0 }
    }

    fn encode(&self, value: u64) -> [u8; 8] {
        match self.endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        }
    }

    pub fn entry(&self, space: &dyn CodeSpace, slot: usize) -> Result<CacheEntry, PatchError> {
        Ok(CacheEntry {
            class: space.read_u64(self.field(slot, false), self.big_endian())?,
            target: space.read_u64(self.field(slot, true), self.big_endian())?,
        })
    }

    pub fn state(&self, space: &dyn CodeSpace) -> Result<CacheState, PatchError> {
        let mut used = 0;
        for slot in 0..SLOTS {
            if self.entry(space, slot)?.class != 0 {
                used += 1;
            }
        }
        Ok(match used {
            0 => CacheState::Uninitialized,
            1 => CacheState::Monomorphic,
            _ => CacheState::Polymorphic,
        })
    }

    /// Check if this cache hits for the given class.
    pub fn lookup(&self, space: &dyn CodeSpace, class: u64) -> Result<Option<u64>, PatchError> {
        for slot in 0..SLOTS {
            let entry = self.entry(space, slot)?;
            if entry.class != 0 && entry.class == class {
                return Ok(Some(entry.target));
            }
        }
        Ok(None)
    }

    /// Pick the slot to patch: the one keyed by `receiver_class` (primary
    /// slot first), or without a class the one whose target is `old_target`.
    pub fn find_slot(
        &self,
        space: &dyn CodeSpace,
        receiver_class: Option<u64>,
        old_target: u64,
    ) -> Result<Option<usize>, PatchError> {
        for slot in 0..SLOTS {
            let entry = self.entry(space, slot)?;
            let hit = match receiver_class {
                Some(class) => entry.class != 0 && entry.class == class,
                None => entry.class != 0 && entry.target == old_target,
            };
            if hit {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Atomically replace the target of `slot`.
    pub fn patch_target(
        &self,
        space: &dyn CodeSpace,
        slot: usize,
        target: u64,
    ) -> Result<(), PatchError> {
        space.write_atomic(self.field(slot, true), &self.encode(target))
    }

    /// Record a newly observed class in the first empty slot. The target is
    /// published before the class so a hit never sees a stale target.
    /// Returns false when both slots are taken.
    pub fn populate(
        &self,
        space: &dyn CodeSpace,
        class: u64,
        target: u64,
    ) -> Result<bool, PatchError> {
        for slot in 0..SLOTS {
            let entry = self.entry(space, slot)?;
            if entry.class == class {
                return Ok(true);
            }
            if entry.class == 0 {
                space.write_atomic(self.field(slot, true), &self.encode(target))?;
                space.write_atomic(self.field(slot, false), &self.encode(class))?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::memory::{CodeMemory, Protection};

    fn block(mem: &CodeMemory, endian: Endian, entries: &[CacheEntry]) -> InlineCacheBlock {
        let mut buf = CodeBuffer::new(endian);
        InlineCacheBlock::emit(&mut buf, entries);
        assert_eq!(buf.len(), BLOCK_SIZE);
        let addr = mem.base() + 0x40;
        mem.write_racy(addr, buf.code()).unwrap();
        InlineCacheBlock::at(addr, endian)
    }

    #[test]
    fn test_ic_uninitialized() {
        let mem = CodeMemory::new(4096, Protection::ReadWrite).unwrap();
        let ic = block(&mem, Endian::Little, &[]);
        assert_eq!(ic.state(&mem).unwrap(), CacheState::Uninitialized);
        assert_eq!(ic.lookup(&mem, 1).unwrap(), None);
    }

    #[test]
    fn test_ic_monomorphic_then_polymorphic() {
        let mem = CodeMemory::new(4096, Protection::ReadWrite).unwrap();
        let ic = block(&mem, Endian::Little, &[]);
        assert!(ic.populate(&mem, 42, 0x1000).unwrap());
        assert_eq!(ic.state(&mem).unwrap(), CacheState::Monomorphic);
        assert_eq!(ic.lookup(&mem, 42).unwrap(), Some(0x1000));
        assert_eq!(ic.lookup(&mem, 99).unwrap(), None);

        assert!(ic.populate(&mem, 99, 0x2000).unwrap());
        assert_eq!(ic.state(&mem).unwrap(), CacheState::Polymorphic);
        assert!(!ic.populate(&mem, 7, 0x3000).unwrap());
    }

    #[test]
    fn test_find_slot_by_class_and_target() {
        let mem = CodeMemory::new(4096, Protection::ReadWrite).unwrap();
        let entries = [
            CacheEntry { class: 1, target: 0xA000 },
            CacheEntry { class: 2, target: 0xB000 },
        ];
        let ic = block(&mem, Endian::Big, &entries);
        assert_eq!(ic.find_slot(&mem, Some(2), 0).unwrap(), Some(1));
        assert_eq!(ic.find_slot(&mem, None, 0xA000).unwrap(), Some(0));
        assert_eq!(ic.find_slot(&mem, Some(3), 0xA000).unwrap(), None);

        ic.patch_target(&mem, 1, 0xC000).unwrap();
        assert_eq!(ic.lookup(&mem, 2).unwrap(), Some(0xC000));
        assert_eq!(ic.lookup(&mem, 1).unwrap(), Some(0xA000));
    }
}
