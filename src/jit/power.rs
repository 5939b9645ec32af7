//! 64-bit Power (little-endian) instruction encoding for call-site patching.
//!
//! Direct calls are `bl` with a 24-bit word displacement (+/-32MB). Method
//! trampolines materialise a 64-bit address in five instructions and branch
//! through CTR; being several words long they are never rewritten while
//! live. Instead a temporary trampoline is programmed off to the side and
//! the permanent trampoline's first word becomes a `b` to it.
//!
//! Interface dispatch goes through an out-of-line snippet:
//!
//! ```text
//!         bne   snippet          ; or `b` when out of bne range
//!         ld    r11, slot
//!         mtctr r11
//!         bctrl                  ; actual call site
//! after:  ...
//! snippet:
//!         bl    miss_handler     ; link-stack preserving call site
//!         b     after
//! ```

use super::codebuf::CodeBuffer;
use super::encoder::{
    Arch, DecodeOptions, DecodedCall, InstructionEncoder, RepointMode, TrampolineTarget,
    scaled_displacement, sign_extend,
};
use super::patch::{CodeSpace, PatchError};

/// Power general-purpose registers used by the patchable sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    R0 = 0,
    R11 = 11, // Interface dispatch target, trampoline scratch
    R12 = 12, // Virtual dispatch target
    R16 = 16, // Helper table base
}

impl Reg {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Power assembler.
pub struct PowerAssembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> PowerAssembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    /// Emit a raw 32-bit instruction.
    pub fn emit_raw(&mut self, inst: u32) {
        self.buf.emit_u32(inst);
    }

    /// lis rD, imm (addis rD, 0, imm)
    pub fn lis(&mut self, rd: Reg, imm: u16) {
        self.emit_raw(0x3C000000 | (rd.code() << 21) | imm as u32);
    }

    /// ori rA, rS, imm
    pub fn ori(&mut self, ra: Reg, rs: Reg, imm: u16) {
        self.emit_raw(0x60000000 | (rs.code() << 21) | (ra.code() << 16) | imm as u32);
    }

    /// rldimi r11, r0, 32, 0
    pub fn rldimi_r11_r0_32(&mut self) {
        self.emit_raw(RLDIMI_R11_R0);
    }

    /// ld rD, ds(rA)
    pub fn ld(&mut self, rd: Reg, ra: Reg, ds: i16) {
        self.emit_raw(0xE8000000 | (rd.code() << 21) | (ra.code() << 16) | ((ds as u32) & 0xFFFC));
    }

    /// mtctr rS
    pub fn mtctr(&mut self, rs: Reg) {
        self.emit_raw(0x7C0903A6 | (rs.code() << 21));
    }

    pub fn bctr(&mut self) {
        self.emit_raw(BCTR);
    }

    pub fn bctrl(&mut self) {
        self.emit_raw(BCTRL);
    }

    /// b label
    pub fn b(&mut self, offset: i32) {
        self.emit_raw(encode_i_form(B, offset as i64));
    }

    /// bl label
    pub fn bl(&mut self, offset: i32) {
        self.emit_raw(encode_i_form(BL, offset as i64));
    }

    /// bne cr0, label
    pub fn bne(&mut self, offset: i16) {
        self.emit_raw(BNE | ((offset as u32) & 0xFFFC));
    }

    /// blr (return)
    pub fn blr(&mut self) {
        self.emit_raw(0x4E800020);
    }

    /// nop (ori 0, 0, 0)
    pub fn nop(&mut self) {
        self.emit_raw(NOP);
    }
}

const NOP: u32 = 0x60000000;
const I_FORM_MASK: u32 = 0xFC000003;
const B: u32 = 0x48000000;
const BL: u32 = 0x48000001;
const BNE: u32 = 0x40820000;
const BCTR: u32 = 0x4E800420;
const BCTRL: u32 = 0x4E800421;
const MTCTR_R11: u32 = 0x7D6903A6;
const MTCTR_R12: u32 = 0x7D8903A6;
const RLDIMI_R11_R0: u32 = 0x780B000E;
const LIS_R0: u32 = 0x3C000000;
const LIS_R11: u32 = 0x3D600000;
const ORI_R0: u32 = 0x60000000;
const ORI_R11: u32 = 0x616B0000;
const LD_R11_R16: u32 = 0xE9700000;
const HI_MASK: u32 = 0xFFFF0000;

const INSN: u64 = 4;
const TRAMPOLINE_SIZE: usize = 32;
const HELPER_TRAMPOLINE_SIZE: usize = 16;

fn encode_i_form(base: u32, disp: i64) -> u32 {
    base | ((disp as u32) & 0x03FFFFFC)
}

fn i_form_disp(inst: u32) -> i64 {
    sign_extend((inst & 0x03FFFFFC) as u64, 26)
}

fn branch_disp(from: u64, to: u64) -> Option<i64> {
    scaled_displacement(from, to, 4, 24).map(|units| units * 4)
}

fn read_word(space: &dyn CodeSpace, addr: u64) -> Result<u32, PatchError> {
    space.read_u32(addr, false)
}

/// Recognise the link-stack preserving interface snippet whose `bl` is at
/// `bl_addr`, returning the address of the `bctrl` it belongs to.
fn interface_snippet_site(
    space: &dyn CodeSpace,
    bl_addr: u64,
    opts: DecodeOptions,
) -> Result<Option<u64>, PatchError> {
    if !space.contains(bl_addr + INSN, 4) {
        return Ok(None);
    }
    let back = read_word(space, bl_addr + INSN)?;
    if back & I_FORM_MASK != B {
        return Ok(None);
    }
    let actual = bl_addr.wrapping_add_signed(i_form_disp(back));
    if !space.contains(actual - INSN, 8) {
        return Ok(None);
    }
    if read_word(space, actual)? != BCTRL || read_word(space, actual - INSN)? != MTCTR_R11 {
        return Ok(None);
    }

    let mut branch = actual - 3 * INSN;
    if opts.inline_last_itable && space.contains(branch - 4 * INSN, 4) {
        let inst = read_word(space, branch)?;
        if inst & I_FORM_MASK == B
            && i_form_disp(inst) == 2 * INSN as i64
            && read_word(space, branch + 2 * INSN)? == MTCTR_R11
        {
            branch -= 4 * INSN;
        }
    }

    if !space.contains(branch, 4) {
        return Ok(None);
    }
    let inst = read_word(space, branch)?;
    let disp = if inst & HI_MASK == BNE {
        sign_extend((inst & 0xFFFC) as u64, 16)
    } else if inst & I_FORM_MASK == B {
        i_form_disp(inst)
    } else {
        return Ok(None);
    };
    Ok((branch.wrapping_add_signed(disp) == bl_addr).then_some(actual))
}

pub struct Power64Encoder;

impl Power64Encoder {
    fn write_word(&self, space: &dyn CodeSpace, addr: u64, inst: u32) -> Result<(), PatchError> {
        space.write_atomic(addr, &inst.to_le_bytes())?;
        self.sync(space, addr, 4);
        Ok(())
    }
}

impl InstructionEncoder for Power64Encoder {
    fn arch(&self) -> Arch {
        Arch::Power64
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

    fn repoint_mode(&self) -> RepointMode {
        RepointMode::Chained
    }

    /// One temporary trampoline per 4KB of cache.
    fn configure(&self, cache_size: usize) -> usize {
        cache_size >> 12
    }

    fn needs_icache_sync(&self) -> bool {
        true
    }

    fn is_branch_reachable(&self, from: u64, to: u64) -> bool {
        branch_disp(from, to).is_some()
    }

    fn emit_padding(&self, buf: &mut CodeBuffer, bytes: usize) {
        let mut asm = PowerAssembler::new(buf);
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
        let disp = branch_disp(at, target).ok_or(PatchError::Unreachable { site: at, target })?;
        PowerAssembler::new(buf).bl(disp as i32);
        Ok(())
    }

    fn emit_virtual_call(&self, buf: &mut CodeBuffer) -> usize {
        let mut asm = PowerAssembler::new(buf);
        asm.mtctr(Reg::R12);
        let site = asm.buf.offset();
        asm.bctrl();
        site
    }

    fn emit_interface_call(
        &self,
        buf: &mut CodeBuffer,
        at: u64,
        miss_handler: u64,
        opts: DecodeOptions,
    ) -> Result<usize, PatchError> {
        let start = buf.offset();
        let mut asm = PowerAssembler::new(buf);
        let (snippet, site) = if opts.inline_last_itable {
            asm.bne(36);
            asm.nop();
            asm.nop();
            asm.nop();
            asm.b(8);
            asm.nop();
            (36, 28)
        } else {
            asm.bne(20);
            asm.nop();
            (20, 12)
        };
        asm.mtctr(Reg::R11);
        asm.bctrl();
        asm.b(12);
        let bl_at = at + snippet as u64;
        let miss = branch_disp(bl_at, miss_handler).ok_or(PatchError::Unreachable {
            site: bl_at,
            target: miss_handler,
        })?;
        asm.bl(miss as i32);
        asm.b(-8);
        Ok(start + site)
    }

    fn emit_return(&self, buf: &mut CodeBuffer) {
        PowerAssembler::new(buf).blr();
    }

    fn emit_entry_slot(&self, buf: &mut CodeBuffer) {
        PowerAssembler::new(buf).nop();
    }

    fn emit_method_trampoline(&self, buf: &mut CodeBuffer, target: u64) {
        let mut asm = PowerAssembler::new(buf);
        asm.lis(Reg::R0, (target >> 48) as u16);
        asm.lis(Reg::R11, (target >> 16) as u16);
        asm.ori(Reg::R0, Reg::R0, (target >> 32) as u16);
        asm.ori(Reg::R11, Reg::R11, target as u16);
        asm.rldimi_r11_r0_32();
        asm.mtctr(Reg::R11);
        asm.bctr();
        asm.nop();
    }

    fn emit_helper_trampoline(&self, buf: &mut CodeBuffer, index: usize, _table_base: u64) {
        let mut asm = PowerAssembler::new(buf);
        asm.ld(Reg::R11, Reg::R16, ((index - 1) * 8) as i16);
        asm.mtctr(Reg::R11);
        asm.bctr();
        asm.nop();
    }

    fn decode_call(
        &self,
        space: &dyn CodeSpace,
        site: u64,
        opts: DecodeOptions,
    ) -> Result<DecodedCall, PatchError> {
        let inst = read_word(space, site)?;
        if inst & I_FORM_MASK == BL {
            if interface_snippet_site(space, site, opts)?.is_some() {
                return Ok(DecodedCall::Interface);
            }
            return Ok(DecodedCall::Direct {
                target: site.wrapping_add_signed(i_form_disp(inst)),
            });
        }
        if inst == BCTRL {
            match read_word(space, site - INSN)? {
                MTCTR_R11 => return Ok(DecodedCall::Interface),
                MTCTR_R12 => return Ok(DecodedCall::Virtual),
                _ => {}
            }
        }
        Err(PatchError::UnrecognizedCallSite { addr: site })
    }

    fn decode_trampoline(
        &self,
        space: &dyn CodeSpace,
        addr: u64,
    ) -> Result<Option<TrampolineTarget>, PatchError> {
        let first = read_word(space, addr)?;
        if first & HI_MASK == LD_R11_R16 {
            if read_word(space, addr + INSN)? == MTCTR_R11
                && read_word(space, addr + 2 * INSN)? == BCTR
            {
                let index = (first & 0xFFFC) as usize / 8 + 1;
                return Ok(Some(TrampolineTarget::HelperSlot(index)));
            }
            return Ok(None);
        }
        if first & HI_MASK != LIS_R0 {
            return Ok(None);
        }
        let mut words = [0u32; 7];
        for (i, word) in words.iter_mut().enumerate() {
            *word = read_word(space, addr + i as u64 * INSN)?;
        }
        let shape = words[1] & HI_MASK == LIS_R11
            && words[2] & HI_MASK == ORI_R0
            && words[3] & HI_MASK == ORI_R11
            && words[4] == RLDIMI_R11_R0
            && words[5] == MTCTR_R11
            && words[6] == BCTR;
        if !shape {
            return Ok(None);
        }
        let field = |i: usize| (words[i] & 0xFFFF) as u64;
        let target = (field(0) << 48) | (field(2) << 32) | (field(1) << 16) | field(3);
        Ok(Some(TrampolineTarget::Address(target)))
    }

    fn decode_entry_jump(
        &self,
        space: &dyn CodeSpace,
        slot: u64,
    ) -> Result<Option<u64>, PatchError> {
        let inst = read_word(space, slot)?;
        Ok((inst & I_FORM_MASK == B).then(|| slot.wrapping_add_signed(i_form_disp(inst))))
    }

    fn patch_direct_call(
        &self,
        space: &dyn CodeSpace,
        site: u64,
        target: u64,
    ) -> Result<(), PatchError> {
        let disp = branch_disp(site, target).ok_or(PatchError::Unreachable { site, target })?;
        self.write_word(space, site, encode_i_form(BL, disp))
    }

    fn patch_entry_jump(
        &self,
        space: &dyn CodeSpace,
        slot: u64,
        target: u64,
    ) -> Result<(), PatchError> {
        let disp = branch_disp(slot, target).ok_or(PatchError::Unreachable { site: slot, target })?;
        self.write_word(space, slot, encode_i_form(B, disp))
    }

    /// Multi-word trampolines cannot be rewritten in place; see
    /// [`InstructionEncoder::chain_trampoline`].
    fn repoint_trampoline(
        &self,
        _space: &dyn CodeSpace,
        trampoline: u64,
        _target: u64,
    ) -> Result<(), PatchError> {
        Err(PatchError::UnpatchableAlignment { addr: trampoline })
    }

    fn chain_trampoline(
        &self,
        space: &dyn CodeSpace,
        permanent: u64,
        temporary: u64,
    ) -> Result<(), PatchError> {
        let disp = branch_disp(permanent, temporary).ok_or(PatchError::Unreachable {
            site: permanent,
            target: temporary,
        })?;
        self.write_word(space, permanent, encode_i_form(B, disp))
    }
}
