//! Per-architecture instruction encoders.
//!
//! An [`InstructionEncoder`] knows the handful of fixed code shapes the
//! patching subsystem deals with: direct calls, register-dispatched calls,
//! patchable entry slots, method trampolines and helper trampolines. It can
//! emit them into a [`CodeBuffer`], recognise them in code memory and patch
//! them in place without tearing.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use super::aarch64::AArch64Encoder;
use super::codebuf::{CodeBuffer, Endian};
use super::patch::{CodeSpace, PatchError};
use super::power::Power64Encoder;
use super::s390x::S390xEncoder;
use super::x86_64::X86_64Encoder;

/// Architecture families with an encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64")]
    AArch64,
    /// Little-endian 64-bit Power (ppc64le).
    #[serde(rename = "power64")]
    Power64,
    /// 64-bit z/Architecture on Linux (big-endian).
    #[serde(rename = "s390x")]
    S390x,
}

impl Arch {
    pub const ALL: [Arch; 4] = [Arch::X86_64, Arch::AArch64, Arch::Power64, Arch::S390x];

    /// The architecture this process runs on, if it has an encoder.
    pub fn host() -> Option<Arch> {
        if cfg!(target_arch = "x86_64") {
            Some(Arch::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Arch::AArch64)
        } else if cfg!(all(target_arch = "powerpc64", target_endian = "little")) {
            Some(Arch::Power64)
        } else if cfg!(target_arch = "s390x") {
            Some(Arch::S390x)
        } else {
            None
        }
    }

    pub fn is_host(self) -> bool {
        Arch::host() == Some(self)
    }

    pub fn endian(self) -> Endian {
        match self {
            Arch::S390x => Endian::Big,
            _ => Endian::Little,
        }
    }

    pub fn encoder(self) -> &'static dyn InstructionEncoder {
        match self {
            Arch::X86_64 => &X86_64Encoder,
            Arch::AArch64 => &AArch64Encoder,
            Arch::Power64 => &Power64Encoder,
            Arch::S390x => &S390xEncoder,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::AArch64 => "aarch64",
            Arch::Power64 => "power64",
            Arch::S390x => "s390x",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x86_64" | "x86-64" | "amd64" => Ok(Arch::X86_64),
            "aarch64" | "arm64" => Ok(Arch::AArch64),
            "power64" | "ppc64le" | "power" => Ok(Arch::Power64),
            "s390x" | "zlinux" | "z" => Ok(Arch::S390x),
            other => Err(format!("unknown architecture '{other}'")),
        }
    }
}

static PROCESS_ARCH: OnceLock<Arch> = OnceLock::new();

/// Select the encoder family for this process. The first selection wins;
/// later calls return the architecture already in effect.
pub fn select_process_arch(arch: Arch) -> Arch {
    *PROCESS_ARCH.get_or_init(|| arch)
}

/// The architecture selected for this process, defaulting to the host.
pub fn process_arch() -> Arch {
    *PROCESS_ARCH.get_or_init(|| Arch::host().unwrap_or(Arch::X86_64))
}

/// What a call-site instruction turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedCall {
    /// A relative call whose displacement currently resolves to `target`.
    Direct { target: u64 },
    /// A call through a register loaded from a dispatch table.
    Virtual,
    /// A call through an inline-cache block.
    Interface,
}

/// What a recognised trampoline jumps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrampolineTarget {
    Address(u64),
    /// A helper trampoline that loads its target from the helper table.
    HelperSlot(usize),
}

/// How a live trampoline is pointed somewhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepointMode {
    /// The target field is rewritten in place.
    InPlace,
    /// A temporary trampoline is programmed and the permanent one is
    /// turned into a branch to it.
    Chained,
}

/// Options that change how call sites are recognised.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    /// Power interface sites may carry an inline last-itable check.
    pub inline_last_itable: bool,
}

pub trait InstructionEncoder: Send + Sync {
    fn arch(&self) -> Arch;

    fn endian(&self) -> Endian {
        self.arch().endian()
    }

    fn direct_call_size(&self) -> usize;

    fn trampoline_size(&self) -> usize;

    fn helper_trampoline_size(&self) -> usize;

    /// Call sites are placed at `offset` modulo `modulus` so that their
    /// displacement field can be rewritten with one atomic store.
    fn call_site_alignment(&self) -> (u64, u64) {
        (4, 0)
    }

    fn repoint_mode(&self) -> RepointMode {
        RepointMode::InPlace
    }

    /// Number of temporary trampoline slots for a cache of `cache_size` bytes.
    fn configure(&self, cache_size: usize) -> usize {
        let _ = cache_size;
        0
    }

    fn needs_icache_sync(&self) -> bool;

    /// Whether a relative branch at `from` can encode a jump to `to`.
    fn is_branch_reachable(&self, from: u64, to: u64) -> bool;

    fn emit_padding(&self, buf: &mut CodeBuffer, bytes: usize);

    /// Emit a relative call at `at`. Fails when `target` is out of the
    /// branch's reach; callers route such calls through a trampoline.
    fn emit_direct_call(
        &self,
        buf: &mut CodeBuffer,
        at: u64,
        target: u64,
    ) -> Result<(), PatchError>;

    /// Emit a table-dispatched call and return the offset of the call site.
    fn emit_virtual_call(&self, buf: &mut CodeBuffer) -> usize;

    /// Emit an interface dispatch sequence and return the buffer offset of
    /// the instruction that counts as the call site.
    fn emit_interface_call(
        &self,
        buf: &mut CodeBuffer,
        at: u64,
        miss_handler: u64,
        opts: DecodeOptions,
    ) -> Result<usize, PatchError>;

    fn emit_return(&self, buf: &mut CodeBuffer);

    /// Emit the nop-sized slot at a body's entry that can later become a jump.
    fn emit_entry_slot(&self, buf: &mut CodeBuffer);

    fn emit_method_trampoline(&self, buf: &mut CodeBuffer, target: u64);

    /// Emit a trampoline that jumps to whatever helper-table slot `index`
    /// holds when it runs. `table_base` is the address of the table.
    fn emit_helper_trampoline(&self, buf: &mut CodeBuffer, index: usize, table_base: u64);

    fn decode_call(
        &self,
        space: &dyn CodeSpace,
        site: u64,
        opts: DecodeOptions,
    ) -> Result<DecodedCall, PatchError>;

    fn decode_trampoline(
        &self,
        space: &dyn CodeSpace,
        addr: u64,
    ) -> Result<Option<TrampolineTarget>, PatchError>;

    /// `Some(target)` once the entry slot at `slot` has become a jump.
    fn decode_entry_jump(
        &self,
        space: &dyn CodeSpace,
        slot: u64,
    ) -> Result<Option<u64>, PatchError>;

    fn patch_direct_call(
        &self,
        space: &dyn CodeSpace,
        site: u64,
        target: u64,
    ) -> Result<(), PatchError>;

    fn patch_entry_jump(
        &self,
        space: &dyn CodeSpace,
        slot: u64,
        target: u64,
    ) -> Result<(), PatchError>;

    fn repoint_trampoline(
        &self,
        space: &dyn CodeSpace,
        trampoline: u64,
        target: u64,
    ) -> Result<(), PatchError>;

    /// Turn the permanent trampoline's first word into a branch to `temporary`.
    fn chain_trampoline(
        &self,
        space: &dyn CodeSpace,
        permanent: u64,
        temporary: u64,
    ) -> Result<(), PatchError> {
        let _ = (space, temporary);
        Err(PatchError::UnpatchableAlignment { addr: permanent })
    }

    /// Instruction-cache maintenance after a write, only when the encoded
    /// code can actually be fetched by this host.
    fn sync(&self, space: &dyn CodeSpace, addr: u64, len: usize) {
        if self.needs_icache_sync() && self.arch().is_host() {
            space.sync_icache(addr, len);
        }
    }
}

/// Sign-extend the low `bits` bits of `value`.
pub(crate) fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// Displacement from `from` to `to`, when it fits a signed field of
/// `bits` bits after scaling by `scale`.
pub(crate) fn scaled_displacement(from: u64, to: u64, scale: i64, bits: u32) -> Option<i64> {
    let disp = (to as i64).wrapping_sub(from as i64);
    if disp % scale != 0 {
        return None;
    }
    let units = disp / scale;
    let limit = 1i64 << (bits - 1);
    (units >= -limit && units < limit).then_some(units)
}

/// Maximum number of hops followed when resolving a branch chain.
const MAX_HOPS: usize = 8;

/// Follow a chain of trampolines and redirected entry slots starting at
/// `addr` until it leaves code memory or lands on something that does not
/// jump on. `helper` resolves helper-table slots.
pub fn follow_jumps(
    encoder: &dyn InstructionEncoder,
    space: &dyn CodeSpace,
    mut addr: u64,
    helper: impl Fn(usize) -> u64,
) -> Result<u64, PatchError> {
    for _ in 0..MAX_HOPS {
        if !space.contains(addr, 4) {
            return Ok(addr);
        }
        match encoder.decode_trampoline(space, addr) {
            Ok(Some(TrampolineTarget::Address(next))) => {
                addr = next;
                continue;
            }
            Ok(Some(TrampolineTarget::HelperSlot(index))) => {
                addr = helper(index);
                continue;
            }
            Ok(None) | Err(PatchError::OutOfBounds { .. }) => {}
            Err(e) => return Err(e),
        }
        match encoder.decode_entry_jump(space, addr) {
            Ok(Some(next)) => addr = next,
            Ok(None) | Err(PatchError::OutOfBounds { .. }) => return Ok(addr),
            Err(e) => return Err(e),
        }
    }
    Ok(addr)
}
