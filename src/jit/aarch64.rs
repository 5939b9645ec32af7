//! AArch64 instruction encoding for call-site patching.
//!
//! Every instruction is one aligned 32-bit word, so call sites and entry
//! slots are rewritten with a single atomic store. Trampolines load their
//! target from an 8-byte literal placed right after the branch, which is
//! repointed with one 64-bit store. Helper trampolines load the helper
//! table's address from their literal and then the helper's slot.

use super::codebuf::CodeBuffer;
use super::encoder::{
    Arch, DecodeOptions, DecodedCall, InstructionEncoder, TrampolineTarget, scaled_displacement,
    sign_extend,
};
use super::patch::{CodeSpace, PatchError};

/// AArch64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0 = 0, X1 = 1, X2 = 2, X3 = 3,
    X4 = 4, X5 = 5, X6 = 6, X7 = 7,
    X8 = 8,
    X9 = 9,   // Virtual dispatch target
    X10 = 10, // Interface dispatch target
    X11 = 11,
    X12 = 12, X13 = 13, X14 = 14, X15 = 15,
    X16 = 16, // IP0, trampoline scratch
    X17 = 17,
    Lr = 30,  // Link register
}

impl Reg {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// AArch64 assembler.
pub struct AArch64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> AArch64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    /// Emit a raw 32-bit instruction.
    pub fn emit_raw(&mut self, inst: u32) {
        self.buf.emit_u32(inst);
    }

    /// LDR Xt, label (load 64-bit literal, PC-relative)
    pub fn ldr_literal(&mut self, rt: Reg, offset: i32) {
        // 0101 1000 iiii iiii iiii iiii iiit tttt
        let inst = 0x58000000 | (((offset as u32 / 4) & 0x7FFFF) << 5) | (rt.code() as u32);
        self.emit_raw(inst);
    }

    /// LDR Xt, [Xn, #offset] (unsigned offset, multiple of 8)
    pub fn ldr_unsigned(&mut self, rt: Reg, rn: Reg, offset: u32) {
        // 1111 1001 01ii iiii iiii iinn nnnt tttt
        let inst = LDR_UNSIGNED
            | (((offset / 8) & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (rt.code() as u32);
        self.emit_raw(inst);
    }

    /// B label (unconditional branch)
    pub fn b(&mut self, offset: i32) {
        // 0001 01ii iiii iiii iiii iiii iiii iiii
        self.emit_raw(encode_b(offset as i64 / 4));
    }

    /// BL label (branch and link)
    pub fn bl(&mut self, offset: i32) {
        // 1001 01ii iiii iiii iiii iiii iiii iiii
        self.emit_raw(encode_bl(offset as i64 / 4));
    }

    /// RET (return to link register)
    pub fn ret(&mut self) {
        self.emit_raw(0xD65F03C0);
    }

    /// BR Xn (branch to register)
    pub fn br(&mut self, rn: Reg) {
        // 1101 0110 0001 1111 0000 00nn nnn0 0000
        self.emit_raw(0xD61F0000 | ((rn.code() as u32) << 5));
    }

    /// BLR Xn (branch and link to register)
    pub fn blr(&mut self, rn: Reg) {
        // 1101 0110 0011 1111 0000 00nn nnn0 0000
        self.emit_raw(0xD63F0000 | ((rn.code() as u32) << 5));
    }

    /// NOP (no operation)
    pub fn nop(&mut self) {
        self.emit_raw(NOP);
    }
}

const NOP: u32 = 0xD503201F;
const BL_MASK: u32 = 0xFC000000;
const BL: u32 = 0x94000000;
const B: u32 = 0x14000000;
const LDR_X16_PC8: u32 = 0x58000050;
const LDR_X16_PC16: u32 = 0x58000090;
const LDR_UNSIGNED: u32 = 0xF9400000;
const LDR_X16_X16_MASK: u32 = 0xFFC003FF;
const LDR_X16_X16: u32 = 0xF9400210;
const BR_X16: u32 = 0xD61F0200;
const BLR_X9: u32 = 0xD63F0120;
const BLR_X10: u32 = 0xD63F0140;

const TRAMPOLINE_SIZE: usize = 16;
const LITERAL_OFFSET: u64 = 8;
const HELPER_TRAMPOLINE_SIZE: usize = 24;
const HELPER_LITERAL_OFFSET: u64 = 16;

fn encode_b(units: i64) -> u32 {
    B | ((units as u32) & 0x03FFFFFF)
}

fn encode_bl(units: i64) -> u32 {
    BL | ((units as u32) & 0x03FFFFFF)
}

fn branch_units(from: u64, to: u64) -> Option<i64> {
    scaled_displacement(from, to, 4, 26)
}

fn branch_target(at: u64, inst: u32) -> u64 {
    at.wrapping_add_signed(sign_extend((inst & 0x03FFFFFF) as u64, 26) * 4)
}

pub struct AArch64Encoder;

impl AArch64Encoder {
    fn write_word(&self, space: &dyn CodeSpace, addr: u64, inst: u32) -> Result<(), PatchError> {
        space.write_atomic(addr, &inst.to_le_bytes())?;
        self.sync(space, addr, 4);
        Ok(())
    }
}

impl InstructionEncoder for AArch64Encoder {
    fn arch(&self) -> Arch {
        Arch::AArch64
    }

    fn direct_call_size(&self) -> usize {
        4
    }

    fn trampoline_size(&self) -> usize {
        TRAMPOLINE_SIZE
    }

    fn helper_trampoline_size(&self) -> usize {
        HELPER_TRAMPOLINE_SIZE
    }

    fn needs_icache_sync(&self) -> bool {
        true
    }

    fn is_branch_reachable(&self, from: u64, to: u64) -> bool {
        branch_units(from, to).is_some()
    }

    fn emit_padding(&self, buf: &mut CodeBuffer, bytes: usize) {
        let mut asm = AArch64Assembler::new(buf);
        for _ in 0..bytes / 4 {
            asm.nop();
        }
    }

    fn emit_direct_call(
        &self,
        buf: &mut CodeBuffer,
        at: u64,
        target: u64,
    ) -> Result<(), PatchError> {
        let units = branch_units(at, target).ok_or(PatchError::Unreachable { site: at, target })?;
        AArch64Assembler::new(buf).emit_raw(encode_bl(units));
        Ok(())
    }

    fn emit_virtual_call(&self, buf: &mut CodeBuffer) -> usize {
        let site = buf.offset();
        AArch64Assembler::new(buf).blr(Reg::X9);
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
        AArch64Assembler::new(buf).blr(Reg::X10);
        Ok(site)
    }

    fn emit_return(&self, buf: &mut CodeBuffer) {
        AArch64Assembler::new(buf).ret();
    }

    fn emit_entry_slot(&self, buf: &mut CodeBuffer) {
        AArch64Assembler::new(buf).nop();
    }

    fn emit_method_trampoline(&self, buf: &mut CodeBuffer, target: u64) {
        let mut asm = AArch64Assembler::new(buf);
        asm.ldr_literal(Reg::X16, LITERAL_OFFSET as i32);
        asm.br(Reg::X16);
        buf.emit_u64(target);
    }

    fn emit_helper_trampoline(&self, buf: &mut CodeBuffer, index: usize, table_base: u64) {
        let mut asm = AArch64Assembler::new(buf);
        asm.ldr_literal(Reg::X16, HELPER_LITERAL_OFFSET as i32);
        asm.ldr_unsigned(Reg::X16, Reg::X16, ((index - 1) * 8) as u32);
        asm.br(Reg::X16);
        asm.nop();
        buf.emit_u64(table_base);
    }

    fn decode_call(
        &self,
        space: &dyn CodeSpace,
        site: u64,
        _opts: DecodeOptions,
    ) -> Result<DecodedCall, PatchError> {
        let inst = space.read_u32(site, false)?;
        match inst {
            BLR_X9 => Ok(DecodedCall::Virtual),
            BLR_X10 => Ok(DecodedCall::Interface),
            _ if inst & BL_MASK == BL => Ok(DecodedCall::Direct {
                target: branch_target(site, inst),
            }),
            _ => Err(PatchError::UnrecognizedCallSite { addr: site }),
        }
    }

    fn decode_trampoline(
        &self,
        space: &dyn CodeSpace,
        addr: u64,
    ) -> Result<Option<TrampolineTarget>, PatchError> {
        match space.read_u32(addr, false)? {
            LDR_X16_PC8 => {
                if space.read_u32(addr + 4, false)? != BR_X16 {
                    return Ok(None);
                }
                let target = space.read_u64(addr + LITERAL_OFFSET, false)?;
                Ok(Some(TrampolineTarget::Address(target)))
            }
            LDR_X16_PC16 => {
                let load = space.read_u32(addr + 4, false)?;
                if load & LDR_X16_X16_MASK != LDR_X16_X16
                    || space.read_u32(addr + 8, false)? != BR_X16
                {
                    return Ok(None);
                }
                let index = ((load >> 10) & 0xFFF) as usize + 1;
                Ok(Some(TrampolineTarget::HelperSlot(index)))
            }
            _ => Ok(None),
        }
    }

    fn decode_entry_jump(
        &self,
        space: &dyn CodeSpace,
        slot: u64,
    ) -> Result<Option<u64>, PatchError> {
        let inst = space.read_u32(slot, false)?;
        Ok((inst & BL_MASK == B).then(|| branch_target(slot, inst)))
    }

    fn patch_direct_call(
        &self,
        space: &dyn CodeSpace,
        site: u64,
        target: u64,
    ) -> Result<(), PatchError> {
        let units = branch_units(site, target).ok_or(PatchError::Unreachable { site, target })?;
        self.write_word(space, site, encode_bl(units))
    }

    fn patch_entry_jump(
        &self,
        space: &dyn CodeSpace,
        slot: u64,
        target: u64,
    ) -> Result<(), PatchError> {
        let units =
            branch_units(slot, target).ok_or(PatchError::Unreachable { site: slot, target })?;
        self.write_word(space, slot, encode_b(units))
    }

    fn repoint_trampoline(
        &self,
        space: &dyn CodeSpace,
        trampoline: u64,
        target: u64,
    ) -> Result<(), PatchError> {
        let literal = trampoline + LITERAL_OFFSET;
        space.write_atomic(literal, &target.to_le_bytes())?;
        self.sync(space, literal, 8);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::codebuf::Endian;
    use crate::jit::memory::{CodeMemory, Protection};

    fn words(f: impl FnOnce(&mut AArch64Assembler)) -> Vec<u32> {
        let mut buf = CodeBuffer::new(Endian::Little);
        f(&mut AArch64Assembler::new(&mut buf));
        buf.code()
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_branch_encodings() {
        assert_eq!(words(|asm| asm.bl(8)), [0x94000002]);
        assert_eq!(words(|asm| asm.b(-4)), [0x17FFFFFF]);
        assert_eq!(words(|asm| asm.blr(Reg::X9)), [BLR_X9]);
        assert_eq!(words(|asm| asm.br(Reg::X16)), [BR_X16]);
    }

    #[test]
    fn test_ldr_literal() {
        assert_eq!(words(|asm| asm.ldr_literal(Reg::X16, 8)), [LDR_X16_PC8]);
    }

    #[test]
    fn test_helper_trampoline_loads_table_slot() {
        let mem = CodeMemory::new(4096, Protection::ReadWrite).unwrap();
        let tramp = mem.base() + 0x40;
        let mut buf = CodeBuffer::new(Endian::Little);
        AArch64Encoder.emit_helper_trampoline(&mut buf, 2, 0x5555_0000_2000);
        assert_eq!(buf.len(), HELPER_TRAMPOLINE_SIZE);
        mem.write_racy(tramp, buf.code()).unwrap();

        assert_eq!(mem.read_u32(tramp + 4, false).unwrap(), 0xF9400610);
        assert_eq!(mem.read_u64(tramp + HELPER_LITERAL_OFFSET, false).unwrap(), 0x5555_0000_2000);
        assert_eq!(
            AArch64Encoder.decode_trampoline(&mem, tramp).unwrap(),
            Some(TrampolineTarget::HelperSlot(2))
        );
    }

    #[test]
    fn test_ret() {
        let mut buf = CodeBuffer::new(Endian::Little);
        AArch64Assembler::new(&mut buf).ret();
        assert_eq!(buf.code(), &[0xC0, 0x03, 0x5F, 0xD6]);
    }

    #[test]
    fn test_reach_is_128mb() {
        let site = 0x1000_0000u64;
        assert!(AArch64Encoder.is_branch_reachable(site, site + (128 << 20) - 4));
        assert!(!AArch64Encoder.is_branch_reachable(site, site + (128 << 20)));
        assert!(AArch64Encoder.is_branch_reachable(site, site - (128 << 20)));
    }

    #[test]
    fn test_patch_and_decode() {
        let mem = CodeMemory::new(4096, Protection::ReadWrite).unwrap();
        let site = mem.base() + 0x20;
        let mut buf = CodeBuffer::new(Endian::Little);
        AArch64Encoder.emit_direct_call(&mut buf, site, site + 0x40).unwrap();
        mem.write_racy(site, buf.code()).unwrap();

        let opts = DecodeOptions::default();
        assert_eq!(
            AArch64Encoder.decode_call(&mem, site, opts).unwrap(),
            DecodedCall::Direct { target: site + 0x40 }
        );
        AArch64Encoder.patch_direct_call(&mem, site, site - 0x10).unwrap();
        assert_eq!(
            AArch64Encoder.decode_call(&mem, site, opts).unwrap(),
            DecodedCall::Direct { target: site - 0x10 }
        );
    }

    #[test]
    fn test_trampoline_repoint() {
        let mem = CodeMemory::new(4096, Protection::ReadWrite).unwrap();
        let tramp = mem.base() + 0x100;
        let mut buf = CodeBuffer::new(Endian::Little);
        AArch64Encoder.emit_method_trampoline(&mut buf, 0xDEAD_0000);
        assert_eq!(buf.len(), TRAMPOLINE_SIZE);
        mem.write_racy(tramp, buf.code()).unwrap();

        AArch64Encoder.repoint_trampoline(&mem, tramp, 0x7F00_0000_1000).unwrap();
        assert_eq!(
            AArch64Encoder.decode_trampoline(&mem, tramp).unwrap(),
            Some(TrampolineTarget::Address(0x7F00_0000_1000))
        );
    }

    #[test]
    fn test_entry_slot() {
        let mem = CodeMemory::new(4096, Protection::ReadWrite).unwrap();
        let slot = mem.base() + 0x8;
        let mut buf = CodeBuffer::new(Endian::Little);
        AArch64Encoder.emit_entry_slot(&mut buf);
        mem.write_racy(slot, buf.code()).unwrap();

        assert_eq!(AArch64Encoder.decode_entry_jump(&mem, slot).unwrap(), None);
        AArch64Encoder.patch_entry_jump(&mem, slot, slot + 0x200).unwrap();
        assert_eq!(AArch64Encoder.decode_entry_jump(&mem, slot).unwrap(), Some(slot + 0x200));
    }
}
