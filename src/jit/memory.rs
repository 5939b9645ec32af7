//! Code memory management using mmap.
//!
//! Code caches are long-lived mappings that stay writable for their whole
//! lifetime: call sites and trampolines are patched while other threads may
//! run the code, so W^X page flipping is not an option here.

use std::ptr::NonNull;

/// Error type for memory operations.
#[derive(Debug)]
pub enum MemoryError {
    AllocationFailed,
    InvalidSize,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "code memory allocation failed"),
            MemoryError::InvalidSize => write!(f, "invalid code memory size"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// Page protection requested for a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Readable and writable. Enough when code is only encoded and decoded.
    ReadWrite,
    /// Readable, writable and executable.
    ReadWriteExecute,
}

/// A block of code memory allocated via mmap.
pub struct CodeMemory {
    ptr: NonNull<u8>,
    size: usize,
    protection: Protection,
}

impl CodeMemory {
    /// Map a new block of at least `size` bytes, rounded up to page size.
    pub fn new(size: usize, protection: Protection) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        let page_size = Self::page_size();
        let aligned_size = (size + page_size - 1) & !(page_size - 1);

        let ptr = Self::mmap_alloc(aligned_size, protection)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            protection,
        })
    }

    /// Get the page size for the current system.
    pub fn page_size() -> usize {
        #[cfg(unix)]
        {
            // SAFETY: sysconf is safe to call with _SC_PAGESIZE
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    }

    #[cfg(unix)]
    fn mmap_alloc(size: usize, protection: Protection) -> Result<NonNull<u8>, MemoryError> {
        use std::ptr;

        let prot = match protection {
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        };

        // SAFETY: anonymous private mapping with no address hint
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn mmap_alloc(size: usize, _protection: Protection) -> Result<NonNull<u8>, MemoryError> {
        // Not executable on most systems, but enough for encoding and patching.
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| MemoryError::InvalidSize)?;
        // SAFETY: layout has a non-zero size
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    /// Base address of the mapping.
    pub fn base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Raw pointer to the mapping. Only `jit::patch` writes through it.
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Get the size of the mapping.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Check whether `[addr, addr + len)` lies inside the mapping.
    pub fn contains_range(&self, addr: u64, len: usize) -> bool {
        let base = self.base();
        addr >= base
            && addr
                .checked_add(len as u64)
                .is_some_and(|end| end <= base + self.size as u64)
    }
}

impl Drop for CodeMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            // SAFETY: ptr/size came from a successful mmap
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            }
        }
        #[cfg(not(unix))]
        {
            if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, Self::page_size()) {
                // SAFETY: allocated with the same layout in mmap_alloc
                unsafe {
                    std::alloc::dealloc(self.ptr.as_ptr(), layout);
                }
            }
        }
    }
}

// CodeMemory owns its mapping; concurrent access goes through the atomic
// primitives in `jit::patch`.
unsafe impl Send for CodeMemory {}
unsafe impl Sync for CodeMemory {}
