//! Code caches.
//!
//! A code cache is one mmap'd segment laid out as:
//!
//! ```text
//! base                                                              end
//! | helper trampolines | bodies ->      free      <- trampolines | temps |
//! ```
//!
//! Bodies are bump-allocated upward, permanent trampolines downward; the
//! cache is full for either once the two would collide. Several caches are
//! grouped under a [`CodeCacheManager`], which also presents them as a
//! single [`CodeSpace`] so that branch chains can be followed across caches.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::codebuf::Endian;
use super::encoder::{Arch, InstructionEncoder, follow_jumps};
use super::helper_table::HelperTable;
use super::memory::{CodeMemory, MemoryError, Protection};
use super::patch::{CodeSpace, PatchError};
use super::trampoline::{TrampolinePool, TrampolineSlot};
use crate::config::RuntimeConfig;
use crate::recomp::MethodId;

const REGION_ALIGN: u64 = 16;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to map code cache: {0}")]
    Memory(#[from] MemoryError),

    #[error("no code cache can hold another {size} bytes")]
    Full { size: usize },

    #[error("a {size}-byte code cache cannot hold its helper and temporary trampolines")]
    TooSmall { size: usize },
}

/// A region of a code cache reserved for one body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRegion {
    pub cache: usize,
    pub start: u64,
    pub size: usize,
}

impl CodeRegion {
    pub fn end(&self) -> u64 {
        self.start + self.size as u64
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }
}

#[derive(Debug)]
struct Layout {
    code_top: u64,
    trampoline_floor: u64,
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

pub struct CodeCache {
    index: usize,
    memory: CodeMemory,
    encoder: &'static dyn InstructionEncoder,
    helper_base: u64,
    helper_count: usize,
    code_base: u64,
    layout: Mutex<Layout>,
    trampolines: TrampolinePool,
}

impl CodeCache {
    pub fn new(
        index: usize,
        arch: Arch,
        size: usize,
        protection: Protection,
        helpers: &HelperTable,
    ) -> Result<Self, CacheError> {
        let encoder = arch.encoder();
        let memory = CodeMemory::new(size, protection)?;
        let base = memory.base();
        let end = base + memory.size() as u64;

        let helper_count = helpers.count();
        let helper_area = (helper_count * encoder.helper_trampoline_size()) as u64;
        let code_base = align_up(base + helper_area, REGION_ALIGN);

        let temporary_slots = TrampolinePool::configure(encoder, memory.size());
        let temporary_base = end - (temporary_slots * encoder.trampoline_size()) as u64;
        if code_base >= temporary_base {
            return Err(CacheError::TooSmall { size: memory.size() });
        }

        if helper_count > 0 {
            TrampolinePool::create_helper_trampolines(encoder, &memory, base, helpers)
                .map_err(|_| CacheError::TooSmall { size: memory.size() })?;
        }

        tracing::debug!(
            index,
            %arch,
            base,
            size = memory.size(),
            temporary_slots,
            "mapped code cache"
        );

        Ok(Self {
            index,
            memory,
            encoder,
            helper_base: base,
            helper_count,
            code_base,
            layout: Mutex::new(Layout {
                code_top: code_base,
                trampoline_floor: temporary_base,
            }),
            trampolines: TrampolinePool::new(
                index,
                temporary_base,
                temporary_slots,
                encoder.trampoline_size(),
            ),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn encoder(&self) -> &'static dyn InstructionEncoder {
        self.encoder
    }

    pub fn base(&self) -> u64 {
        self.memory.base()
    }

    pub fn size(&self) -> usize {
        self.memory.size()
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.memory.contains_range(addr, 1)
    }

    pub fn trampolines(&self) -> &TrampolinePool {
        &self.trampolines
    }

    /// Bytes left between body code and the trampoline area.
    pub fn free_bytes(&self) -> usize {
        let layout = self.layout.lock();
        (layout.trampoline_floor - layout.code_top) as usize
    }

    /// Start of the area bodies are allocated from.
    pub fn code_base(&self) -> u64 {
        self.code_base
    }

    /// Bump-allocate `size` bytes of body code.
    pub fn reserve(&self, size: usize) -> Option<CodeRegion> {
        let size = align_up(size as u64, REGION_ALIGN);
        let mut layout = self.layout.lock();
        let end = layout.code_top.checked_add(size)?;
        if end > layout.trampoline_floor {
            return None;
        }
        let start = layout.code_top;
        layout.code_top = end;
        Some(CodeRegion {
            cache: self.index,
            start,
            size: size as usize,
        })
    }

    /// Carve one permanent trampoline slot off the top of the free space.
    pub(crate) fn carve_trampoline(&self) -> Option<u64> {
        let size = self.encoder.trampoline_size() as u64;
        let mut layout = self.layout.lock();
        let floor = layout.trampoline_floor.checked_sub(size)?;
        if floor < layout.code_top {
            return None;
        }
        layout.trampoline_floor = floor;
        Some(floor)
    }

    /// Address of the helper trampoline for `index` (1-based).
    pub fn helper_trampoline(&self, index: usize) -> Option<u64> {
        (index >= 1 && index <= self.helper_count)
            .then(|| {
                self.helper_base + ((index - 1) * self.encoder.helper_trampoline_size()) as u64
            })
    }

    pub fn find_or_create_for_target(
        &self,
        callee: MethodId,
        target: u64,
    ) -> Result<TrampolineSlot, PatchError> {
        self.trampolines.find_or_create_for_target(self, callee, target)
    }
}

impl CodeSpace for CodeCache {
    fn contains(&self, addr: u64, len: usize) -> bool {
        self.memory.contains_range(addr, len)
    }

    fn read(&self, addr: u64, out: &mut [u8]) -> Result<(), PatchError> {
        self.memory.read(addr, out)
    }

    fn write_atomic(&self, addr: u64, bytes: &[u8]) -> Result<(), PatchError> {
        self.memory.write_atomic(addr, bytes)
    }

    fn write_racy(&self, addr: u64, bytes: &[u8]) -> Result<(), PatchError> {
        self.memory.write_racy(addr, bytes)
    }

    fn sync_icache(&self, addr: u64, len: usize) {
        self.memory.sync_icache(addr, len);
    }
}

/// All code caches of one runtime.
pub struct CodeCacheManager {
    arch: Arch,
    cache_size: usize,
    max_caches: usize,
    protection: Protection,
    helpers: Arc<HelperTable>,
    caches: RwLock<Vec<Arc<CodeCache>>>,
}

impl CodeCacheManager {
    /// Create a manager with its first cache mapped.
    pub fn new(
        arch: Arch,
        cache_size: usize,
        max_caches: usize,
        helpers: Arc<HelperTable>,
    ) -> Result<Self, CacheError> {
        let first = CodeCache::new(0, arch, cache_size, Protection::ReadWrite, &helpers)?;
        Ok(Self {
            arch,
            cache_size,
            max_caches: max_caches.max(1),
            protection: Protection::ReadWrite,
            helpers,
            caches: RwLock::new(vec![Arc::new(first)]),
        })
    }

    pub fn from_config(
        config: &RuntimeConfig,
        arch: Arch,
        helpers: Arc<HelperTable>,
    ) -> Result<Self, CacheError> {
        Self::new(arch, config.code_cache_size, config.max_code_caches, helpers)
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn encoder(&self) -> &'static dyn InstructionEncoder {
        self.arch.encoder()
    }

    pub fn endian(&self) -> Endian {
        self.arch.endian()
    }

    pub fn helpers(&self) -> &HelperTable {
        &self.helpers
    }

    pub fn caches(&self) -> Vec<Arc<CodeCache>> {
        self.caches.read().clone()
    }

    pub fn cache(&self, index: usize) -> Option<Arc<CodeCache>> {
        self.caches.read().get(index).cloned()
    }

    /// The cache holding `addr`.
    pub fn cache_for(&self, addr: u64) -> Option<Arc<CodeCache>> {
        self.caches.read().iter().find(|c| c.contains(addr)).cloned()
    }

    /// Reserve `size` bytes for a body, mapping a new cache when every
    /// existing one is full.
    pub fn reserve(&self, size: usize) -> Result<CodeRegion, CacheError> {
        if let Some(region) = self.caches.read().iter().rev().find_map(|c| c.reserve(size)) {
            return Ok(region);
        }

        let mut caches = self.caches.write();
        // Another thread may have added a cache while we waited.
        if let Some(region) = caches.last().and_then(|c| c.reserve(size)) {
            return Ok(region);
        }
        if caches.len() >= self.max_caches {
            tracing::warn!(size, caches = caches.len(), "code caches exhausted");
            return Err(CacheError::Full { size });
        }
        let cache = CodeCache::new(
            caches.len(),
            self.arch,
            self.cache_size,
            self.protection,
            &self.helpers,
        )?;
        let region = cache.reserve(size).ok_or(CacheError::Full { size })?;
        caches.push(Arc::new(cache));
        Ok(region)
    }

    /// Helper trampoline for `helper_index` in the cache holding
    /// `near_address`, or in the first cache when the address is elsewhere.
    pub fn find_helper_trampoline_area(
        &self,
        helper_index: usize,
        near_address: u64,
    ) -> Option<u64> {
        let cache = self.cache_for(near_address).or_else(|| self.cache(0))?;
        cache.helper_trampoline(helper_index)
    }

    /// Follow trampolines and redirected entries from `addr` to where
    /// control finally lands.
    pub fn resolve(&self, addr: u64) -> Result<u64, PatchError> {
        follow_jumps(self.encoder(), self, addr, |index| self.helpers.get(index))
    }

    fn with_cache<T>(
        &self,
        addr: u64,
        len: usize,
        f: impl FnOnce(&CodeCache) -> Result<T, PatchError>,
    ) -> Result<T, PatchError> {
        let cache = self
            .cache_for(addr)
            .ok_or(PatchError::OutOfBounds { addr, len })?;
        f(&cache)
    }
}

impl CodeSpace for CodeCacheManager {
    fn contains(&self, addr: u64, len: usize) -> bool {
        self.caches
            .read()
            .iter()
            .any(|c| CodeSpace::contains(&**c, addr, len))
    }

    fn read(&self, addr: u64, out: &mut [u8]) -> Result<(), PatchError> {
        self.with_cache(addr, out.len(), |c| c.read(addr, out))
    }

    fn write_atomic(&self, addr: u64, bytes: &[u8]) -> Result<(), PatchError> {
        self.with_cache(addr, bytes.len(), |c| c.write_atomic(addr, bytes))
    }

    fn write_racy(&self, addr: u64, bytes: &[u8]) -> Result<(), PatchError> {
        self.with_cache(addr, bytes.len(), |c| c.write_racy(addr, bytes))
    }

    fn sync_icache(&self, addr: u64, len: usize) {
        if let Some(cache) = self.cache_for(addr) {
            cache.sync_icache(addr, len);
        }
    }
}
