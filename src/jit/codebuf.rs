//! Code buffer for synthesizing machine-code sequences.
//!
//! Trampolines, entry slots and test bodies are built here first and then
//! copied into a code cache. The buffer has a byte order so that big-endian
//! targets (s390x) share the same emit operations as little-endian ones.

/// Byte order of the instruction stream being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// A buffer for building machine code.
#[derive(Debug, Clone)]
pub struct CodeBuffer {
    code: Vec<u8>,
    endian: Endian,
}

impl CodeBuffer {
    /// Create a new empty code buffer.
    pub fn new(endian: Endian) -> Self {
        Self {
            code: Vec::new(),
            endian,
        }
    }

    /// Create a new code buffer with pre-allocated capacity.
    pub fn with_capacity(endian: Endian, capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            endian,
        }
    }

    /// Get the current size of the code.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Get the current offset (cursor position).
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Emit a single byte. No alignment requirement.
    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 16-bit value in buffer byte order.
    ///
    /// s390x halfword instructions must start on an even offset; the caller
    /// is responsible for that.
    pub fn emit_u16(&mut self, value: u16) {
        match self.endian {
            Endian::Little => self.code.extend_from_slice(&value.to_le_bytes()),
            Endian::Big => self.code.extend_from_slice(&value.to_be_bytes()),
        }
    }

    /// Emit a 32-bit value in buffer byte order.
    ///
    /// Fixed-width ISAs (AArch64, Power) require a 4-byte aligned cursor for
    /// every instruction word.
    pub fn emit_u32(&mut self, value: u32) {
        match self.endian {
            Endian::Little => self.code.extend_from_slice(&value.to_le_bytes()),
            Endian::Big => self.code.extend_from_slice(&value.to_be_bytes()),
        }
    }

    /// Emit a 64-bit value in buffer byte order.
    ///
    /// Literal words that are later repointed must land on an 8-byte aligned
    /// address so the repoint is a single atomic store.
    pub fn emit_u64(&mut self, value: u64) {
        match self.endian {
            Endian::Little => self.code.extend_from_slice(&value.to_le_bytes()),
            Endian::Big => self.code.extend_from_slice(&value.to_be_bytes()),
        }
    }

    /// Emit multiple bytes verbatim.
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Pad with `fill` until the cursor is a multiple of `alignment`.
    pub fn align_with(&mut self, alignment: usize, fill: u8) {
        let current = self.code.len();
        let aligned = (current + alignment - 1) & !(alignment - 1);
        self.code.resize(aligned, fill);
    }

    /// Pad with zero bytes up to `len` (no-op when already longer).
    pub fn pad_to(&mut self, len: usize, fill: u8) {
        if self.code.len() < len {
            self.code.resize(len, fill);
        }
    }

    /// Get the code bytes (for inspection).
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Consume the buffer and return the raw code bytes.
    pub fn into_code(self) -> Vec<u8> {
        self.code
    }
}
