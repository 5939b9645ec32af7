//! z/Architecture (64-bit Linux, big-endian) instruction encoding for
//! call-site patching.
//!
//! Direct calls are `BRASL r14` with a 32-bit halfword displacement taken
//! from the start of the instruction. Call sites are laid out so that the
//! displacement field lands on a 4-byte boundary inside one aligned word.
//! Trampolines find their own address with `BASR`, load an 8-byte target
//! stored 16 bytes in, and branch through the register. Helper trampolines
//! store the helper table's address there instead and load the helper's
//! slot from it before branching.

use super::codebuf::CodeBuffer;
use super::encoder::{
    Arch, DecodeOptions, DecodedCall, InstructionEncoder, TrampolineTarget, scaled_displacement,
};
use super::patch::{CodeSpace, PatchError};

/// General-purpose registers used by the patchable sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    R0 = 0,
    R1 = 1,  // Virtual dispatch target, C-linkage helper scratch
    R3 = 3,  // Interface dispatch target
    R4 = 4,  // Trampoline scratch
    R14 = 14, // Return address
}

impl Reg {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// z/Architecture assembler.
pub struct S390Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> S390Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    /// BASR r1, r2 (branch and save register)
    pub fn basr(&mut self, r1: Reg, r2: Reg) {
        self.buf.emit_u8(0x0D);
        self.buf.emit_u8((r1.code() << 4) | r2.code());
    }

    /// BCR mask, r2 (branch on condition register)
    pub fn bcr(&mut self, mask: u8, r2: Reg) {
        self.buf.emit_u8(0x07);
        self.buf.emit_u8((mask << 4) | r2.code());
    }

    /// LG r1, d2(, b2) (load 64-bit, 20-bit displacement form)
    pub fn lg(&mut self, r1: Reg, b2: Reg, disp: u16) {
        self.buf.emit_u8(0xE3);
        self.buf.emit_u8(r1.code() << 4);
        self.buf.emit_u16(((b2.code() as u16) << 12) | (disp & 0x0FFF));
        self.buf.emit_u8(0x00);
        self.buf.emit_u8(0x04);
    }

    /// BRASL r1, label (offset in halfwords)
    pub fn brasl(&mut self, r1: Reg, halfwords: i32) {
        self.buf.emit_u8(0xC0);
        self.buf.emit_u8((r1.code() << 4) | 0x5);
        self.buf.emit_u32(halfwords as u32);
    }

    /// BRCL mask, label (offset in halfwords)
    pub fn brcl(&mut self, mask: u8, halfwords: i32) {
        self.buf.emit_u8(0xC0);
        self.buf.emit_u8((mask << 4) | 0x4);
        self.buf.emit_u32(halfwords as u32);
    }

    /// BCR 0, 0 (2-byte nop)
    pub fn nopr(&mut self) {
        self.bcr(0, Reg::R0);
    }
}

const BRASL_R14: [u8; 2] = [0xC0, 0xE5];
const BRCL_ALWAYS: [u8; 2] = [0xC0, 0xF4];
const BASR_R14_R1: [u8; 2] = [0x0D, 0xE1];
const BASR_R14_R3: [u8; 2] = [0x0D, 0xE3];
const METHOD_TRAMPOLINE_HEAD: [u8; 10] =
    [0x0D, 0x40, 0xE3, 0x40, 0x40, 0x0E, 0x00, 0x04, 0x07, 0xF4];
const HELPER_TRAMPOLINE_HEAD: [u8; 8] = [0x0D, 0x10, 0xE3, 0x10, 0x10, 0x0E, 0x00, 0x04];
const LG_R1_R1: [u8; 2] = [0xE3, 0x10];
const BCR_ALWAYS_R1: [u8; 2] = [0x07, 0xF1];

const TRAMPOLINE_SIZE: usize = 24;
const TARGET_OFFSET: u64 = 16;

fn halfwords(from: u64, to: u64) -> Option<i32> {
    scaled_displacement(from, to, 2, 32).map(|h| h as i32)
}

fn relative_target(at: u64, bytes: &[u8; 6]) -> u64 {
    let imm = i32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    at.wrapping_add_signed(imm as i64 * 2)
}

pub struct S390xEncoder;

impl S390xEncoder {
    /// Trampoline that loads the 8-byte literal at `TARGET_OFFSET` into
    /// `scratch`, optionally loads again from `slot` bytes past it, and
    /// branches through `scratch`.
    fn emit_trampoline(&self, buf: &mut CodeBuffer, scratch: Reg, literal: u64, slot: Option<u16>) {
        let start = buf.len();
        let mut asm = S390Assembler::new(buf);
        asm.basr(scratch, Reg::R0);
        asm.lg(scratch, scratch, (TARGET_OFFSET - 2) as u16);
        if let Some(slot) = slot {
            asm.lg(scratch, scratch, slot);
        }
        asm.bcr(0xF, scratch);
        buf.pad_to(start + TARGET_OFFSET as usize, 0);
        buf.emit_u64(literal);
    }
}

impl InstructionEncoder for S390xEncoder {
    fn arch(&self) -> Arch {
        Arch::S390x
    }

    fn direct_call_size(&self) -> usize {
        6
    }

    fn trampoline_size(&self) -> usize {
        TRAMPOLINE_SIZE
    }

    fn helper_trampoline_size(&self) -> usize {
        TRAMPOLINE_SIZE
    }

    fn call_site_alignment(&self) -> (u64, u64) {
        (8, 2)
    }

    fn needs_icache_sync(&self) -> bool {
        false
    }

    fn is_branch_reachable(&self, from: u64, to: u64) -> bool {
        halfwords(from, to).is_some()
    }

    fn emit_padding(&self, buf: &mut CodeBuffer, bytes: usize) {
        let mut asm = S390Assembler::new(buf);
        for _ in 0..bytes / 2 {
            asm.nopr();
        }
    }

    fn emit_direct_call(
        &self,
        buf: &mut CodeBuffer,
        at: u64,
        target: u64,
    ) -> Result<(), PatchError> {
        let disp = halfwords(at, target).ok_or(PatchError::Unreachable { site: at, target })?;
        S390Assembler::new(buf).brasl(Reg::R14, disp);
        Ok(())
    }

    fn emit_virtual_call(&self, buf: &mut CodeBuffer) -> usize {
        let site = buf.offset();
        S390Assembler::new(buf).basr(Reg::R14, Reg::R1);
        site
    }

    fn emit_interface_call(
        &self,
        buf: &mut CodeBuffer,
        _at: u64,
        _miss_handler: u64,
        _opts: DecodeOptions,
    ) -> Result<usize, PatchError> {
        let site = buf.offset();
        S390Assembler::new(buf).basr(Reg::R14, Reg::R3);
        Ok(site)
    }

    fn emit_return(&self, buf: &mut CodeBuffer) {
        S390Assembler::new(buf).bcr(0xF, Reg::R14);
    }

    fn emit_entry_slot(&self, buf: &mut CodeBuffer) {
        S390Assembler::new(buf).brcl(0, 0);
    }

    fn emit_method_trampoline(&self, buf: &mut CodeBuffer, target: u64) {
        self.emit_trampoline(buf, Reg::R4, target, None);
    }

    fn emit_helper_trampoline(&self, buf: &mut CodeBuffer, index: usize, table_base: u64) {
        self.emit_trampoline(buf, Reg::R1, table_base, Some(((index - 1) * 8) as u16));
    }

    fn decode_call(
        &self,
        space: &dyn CodeSpace,
        site: u64,
        _opts: DecodeOptions,
    ) -> Result<DecodedCall, PatchError> {
        let mut head = [0u8; 2];
        space.read(site, &mut head)?;
        match head {
            BASR_R14_R1 => Ok(DecodedCall::Virtual),
            BASR_R14_R3 => Ok(DecodedCall::Interface),
            BRASL_R14 => {
                let mut insn = [0u8; 6];
                space.read(site, &mut insn)?;
                Ok(DecodedCall::Direct {
                    target: relative_target(site, &insn),
                })
            }
            _ => Err(PatchError::UnrecognizedCallSite { addr: site }),
        }
    }

    fn decode_trampoline(
        &self,
        space: &dyn CodeSpace,
        addr: u64,
    ) -> Result<Option<TrampolineTarget>, PatchError> {
        let mut head = [0u8; 16];
        space.read(addr, &mut head)?;
        if head[..10] == METHOD_TRAMPOLINE_HEAD {
            let target = space.read_u64(addr + TARGET_OFFSET, true)?;
            return Ok(Some(TrampolineTarget::Address(target)));
        }
        if head[..8] == HELPER_TRAMPOLINE_HEAD
            && head[8..10] == LG_R1_R1
            && head[14..16] == BCR_ALWAYS_R1
        {
            let field = u16::from_be_bytes([head[10], head[11]]);
            if field >> 12 != Reg::R1.code() as u16 {
                return Ok(None);
            }
            let index = (field & 0x0FFF) as usize / 8 + 1;
            return Ok(Some(TrampolineTarget::HelperSlot(index)));
        }
        Ok(None)
    }

    fn decode_entry_jump(
        &self,
        space: &dyn CodeSpace,
        slot: u64,
    ) -> Result<Option<u64>, PatchError> {
        let mut insn = [0u8; 6];
        space.read(slot, &mut insn)?;
        Ok((insn[..2] == BRCL_ALWAYS).then(|| relative_target(slot, &insn)))
    }

    fn patch_direct_call(
        &self,
        space: &dyn CodeSpace,
        site: u64,
        target: u64,
    ) -> Result<(), PatchError> {
        let disp = halfwords(site, target).ok_or(PatchError::Unreachable { site, target })?;
        let field = site + 2;
        if field % 4 != 0 {
            return Err(PatchError::UnpatchableAlignment { addr: site });
        }
        space.write_atomic(field, &disp.to_be_bytes())
    }

    fn patch_entry_jump(
        &self,
        space: &dyn CodeSpace,
        slot: u64,
        target: u64,
    ) -> Result<(), PatchError> {
        let disp = halfwords(slot, target).ok_or(PatchError::Unreachable { site: slot, target })?;
        let mut buf = CodeBuffer::new(self.endian());
        S390Assembler::new(&mut buf).brcl(0xF, disp);
        space
            .write_atomic(slot, buf.code())
            .map_err(|e| match e {
                PatchError::StraddlesWord { .. } => PatchError::UnpatchableAlignment { addr: slot },
                other => other,
            })
    }

    fn repoint_trampoline(
        &self,
        space: &dyn CodeSpace,
        trampoline: u64,
        target: u64,
    ) -> Result<(), PatchError> {
        space.write_atomic(trampoline + TARGET_OFFSET, &target.to_be_bytes())
    }
}
