//! x86-64 instruction encoding for call-site patching.
//!
//! Call sites are `call rel32` (E8). Displacements that do not sit inside a
//! single aligned word are rewritten with the self-loop protocol: the first
//! two bytes become `jmp $` (EB FE) so arriving threads spin, the remaining
//! bytes are written, and the real opcode is restored last.

use super::codebuf::{CodeBuffer, Endian};
use super::encoder::{
    Arch, DecodeOptions, DecodedCall, InstructionEncoder, TrampolineTarget, scaled_displacement,
};
use super::patch::{CodeSpace, PatchError, patching_fence, within_word};

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10, // Virtual dispatch target
    R11 = 11, // Interface dispatch target
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Get the register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Check if this register requires REX.B or REX.R extension.
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    /// Get the REX.B bit for this register (when used as base/rm).
    pub fn rex_b(self) -> u8 {
        if self.needs_rex_ext() { 0x01 } else { 0x00 }
    }
}

/// x86-64 assembler.
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        (mode << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// MOV r64, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: u64) {
        self.buf.emit_u8(0x48 | dst.rex_b()); // REX.W
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm);
    }

    /// CALL rel32
    pub fn call_rel32(&mut self, offset: i32) {
        self.buf.emit_u8(0xE8);
        self.buf.emit_u32(offset as u32);
    }

    /// JMP rel32
    pub fn jmp_rel32(&mut self, offset: i32) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_u32(offset as u32);
    }

    /// CALL r64 (indirect call through register)
    pub fn call_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0xFF); // CALL r/m64
        self.buf.emit_u8(Self::modrm(0b11, 2, reg.code()));
    }

    /// JMP r64 (indirect jump through register)
    pub fn jmp_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0xFF); // JMP r/m64
        self.buf.emit_u8(Self::modrm(0b11, 4, reg.code()));
    }

    /// JMP [base + disp32]
    pub fn jmp_m64(&mut self, base: Reg, disp: i32) {
        if base.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0xFF); // JMP r/m64
        self.buf.emit_u8(Self::modrm(0b10, 4, base.code()));
        self.buf.emit_u32(disp as u32);
    }

    /// RET (return)
    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    /// NOP (no operation)
    pub fn nop(&mut self) {
        self.buf.emit_u8(0x90);
    }

    /// 5-byte NOP (nop dword [rax + rax*1 + 0])
    pub fn nop5(&mut self) {
        self.buf.emit_bytes(&NOP5);
    }
}

const CALL_REL32: u8 = 0xE8;
const JMP_REL32: u8 = 0xE9;
const SELF_LOOP: [u8; 2] = [0xEB, 0xFE];
const NOP5: [u8; 5] = [0x0F, 0x1F, 0x44, 0x00, 0x00];
const CALL_R10: [u8; 3] = [0x41, 0xFF, 0xD2];
const CALL_R11: [u8; 3] = [0x41, 0xFF, 0xD3];
const MOV_RDI_IMM64: [u8; 2] = [0x48, 0xBF];
const JMP_RDI: [u8; 2] = [0xFF, 0xE7];
const MOV_RAX_IMM64: [u8; 2] = [0x48, 0xB8];
const JMP_RAX_DISP32: [u8; 2] = [0xFF, 0xA0];

const TRAMPOLINE_SIZE: usize = 16;

fn rel32_from(end_of_insn: u64, target: u64) -> Option<i32> {
    scaled_displacement(end_of_insn, target, 1, 32).map(|d| d as i32)
}

/// Rewrite the rel32 field of a 5-byte `opcode rel32` instruction at `insn`.
fn patch_rel32(space: &dyn CodeSpace, insn: u64, opcode: u8, disp: i32) -> Result<(), PatchError> {
    let bytes = disp.to_le_bytes();
    if within_word(insn + 1, 4) {
        return space.write_atomic(insn + 1, &bytes);
    }
    if !within_word(insn, 2) {
        return Err(PatchError::UnpatchableAlignment { addr: insn });
    }
    space.write_atomic(insn, &SELF_LOOP)?;
    patching_fence();
    space.write_racy(insn + 2, &bytes[1..])?;
    patching_fence();
    space.write_atomic(insn, &[opcode, bytes[0]])
}

pub struct X86_64Encoder;

impl InstructionEncoder for X86_64Encoder {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }

    fn direct_call_size(&self) -> usize {
        5
    }

    fn trampoline_size(&self) -> usize {
        TRAMPOLINE_SIZE
    }

    fn helper_trampoline_size(&self) -> usize {
        TRAMPOLINE_SIZE
    }

    fn call_site_alignment(&self) -> (u64, u64) {
        (1, 0)
    }

    fn needs_icache_sync(&self) -> bool {
        false
    }

    fn is_branch_reachable(&self, from: u64, to: u64) -> bool {
        rel32_from(from + 5, to).is_some()
    }

    fn emit_padding(&self, buf: &mut CodeBuffer, bytes: usize) {
        let mut asm = X86_64Assembler::new(buf);
        for _ in 0..bytes {
            asm.nop();
        }
    }

    fn emit_direct_call(
        &self,
        buf: &mut CodeBuffer,
        at: u64,
        target: u64,
    ) -> Result<(), PatchError> {
        let disp = rel32_from(at + 5, target).ok_or(PatchError::Unreachable { site: at, target })?;
        X86_64Assembler::new(buf).call_rel32(disp);
        Ok(())
    }

    fn emit_virtual_call(&self, buf: &mut CodeBuffer) -> usize {
        let site = buf.offset();
        X86_64Assembler::new(buf).call_r(Reg::R10);
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
        X86_64Assembler::new(buf).call_r(Reg::R11);
        Ok(site)
    }

    fn emit_return(&self, buf: &mut CodeBuffer) {
        X86_64Assembler::new(buf).ret();
    }

    fn emit_entry_slot(&self, buf: &mut CodeBuffer) {
        X86_64Assembler::new(buf).nop5();
    }

    fn emit_method_trampoline(&self, buf: &mut CodeBuffer, target: u64) {
        let start = buf.len();
        let mut asm = X86_64Assembler::new(buf);
        asm.mov_ri64(Reg::Rdi, target);
        asm.jmp_r(Reg::Rdi);
        buf.pad_to(start + TRAMPOLINE_SIZE, 0x90);
    }

    fn emit_helper_trampoline(&self, buf: &mut CodeBuffer, index: usize, table_base: u64) {
        let mut asm = X86_64Assembler::new(buf);
        asm.mov_ri64(Reg::Rax, table_base);
        asm.jmp_m64(Reg::Rax, ((index - 1) * 8) as i32);
    }

    fn decode_call(
        &self,
        space: &dyn CodeSpace,
        site: u64,
        _opts: DecodeOptions,
    ) -> Result<DecodedCall, PatchError> {
        let mut bytes = [0u8; 5];
        space.read(site, &mut bytes[..3])?;
        if bytes[..3] == CALL_R10 {
            return Ok(DecodedCall::Virtual);
        }
        if bytes[..3] == CALL_R11 {
            return Ok(DecodedCall::Interface);
        }
        if bytes[0] == CALL_REL32 {
            space.read(site, &mut bytes)?;
            let disp = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
            let target = (site + 5).wrapping_add_signed(disp as i64);
            return Ok(DecodedCall::Direct { target });
        }
        Err(PatchError::UnrecognizedCallSite { addr: site })
    }

    fn decode_trampoline(
        &self,
        space: &dyn CodeSpace,
        addr: u64,
    ) -> Result<Option<TrampolineTarget>, PatchError> {
        let mut bytes = [0u8; TRAMPOLINE_SIZE];
        space.read(addr, &mut bytes)?;
        let imm = |at: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(word)
        };
        if bytes[..2] == MOV_RDI_IMM64 && bytes[10..12] == JMP_RDI {
            return Ok(Some(TrampolineTarget::Address(imm(2))));
        }
        if bytes[..2] == MOV_RAX_IMM64 && bytes[10..12] == JMP_RAX_DISP32 {
            let disp = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
            return Ok(Some(TrampolineTarget::HelperSlot(disp as usize / 8 + 1)));
        }
        Ok(None)
    }

    fn decode_entry_jump(
        &self,
        space: &dyn CodeSpace,
        slot: u64,
    ) -> Result<Option<u64>, PatchError> {
        let mut bytes = [0u8; 5];
        space.read(slot, &mut bytes)?;
        if bytes[0] != JMP_REL32 {
            return Ok(None);
        }
        let disp = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        Ok(Some((slot + 5).wrapping_add_signed(disp as i64)))
    }

    fn patch_direct_call(
        &self,
        space: &dyn CodeSpace,
        site: u64,
        target: u64,
    ) -> Result<(), PatchError> {
        let disp = rel32_from(site + 5, target).ok_or(PatchError::Unreachable { site, target })?;
        patch_rel32(space, site, CALL_REL32, disp)
    }

    fn patch_entry_jump(
        &self,
        space: &dyn CodeSpace,
        slot: u64,
        target: u64,
    ) -> Result<(), PatchError> {
        let disp =
            rel32_from(slot + 5, target).ok_or(PatchError::Unreachable { site: slot, target })?;
        if !within_word(slot, 5) {
            return Err(PatchError::UnpatchableAlignment { addr: slot });
        }
        let mut buf = CodeBuffer::new(Endian::Little);
        X86_64Assembler::new(&mut buf).jmp_rel32(disp);
        space.write_atomic(slot, buf.code())
    }

    fn repoint_trampoline(
        &self,
        space: &dyn CodeSpace,
        trampoline: u64,
        target: u64,
    ) -> Result<(), PatchError> {
        if !within_word(trampoline, 2) {
            return Err(PatchError::UnpatchableAlignment { addr: trampoline });
        }
        space.write_atomic(trampoline, &SELF_LOOP)?;
        patching_fence();
        space.write_racy(trampoline + 2, &target.to_le_bytes())?;
        patching_fence();
        space.write_atomic(trampoline, &MOV_RDI_IMM64)
    }
}
