//! The x86-64 instruction encoder.
//!
//! A pure translation from operation + operands to machine bytes: operand
//! size prefix, REX, opcode, ModR/M, SIB, displacement, immediate. The
//! emitter is stateless apart from borrowing the code buffer; every
//! operation reserves a worst-case instruction length up front and then
//! returns the number of bytes actually written.
//!
//! Operand conventions follow the Intel SDM encodings: `MR` forms place the
//! register operand in ModRM.reg and the register-or-memory operand in
//! ModRM.rm; `RM` forms are the reverse.

use crate::bits::{fits_i16, fits_i32, fits_i8};
use crate::buffer::CodeBuffer;
use crate::error::{Error, Result};
use crate::label::{Fixup, FixupWidth};
use crate::reg::{Gpr, RegMem, Size};
use crate::rex::{encode_modrm, encode_sib, Disp, RexFlags};

/// Worst-case encoded instruction length reserved before each operation.
const MAX_INST: usize = 16;

/// x86 condition codes, by hardware encoding. `Z`/`Nz` double as the
/// equal/not-equal conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    O,
    No,
    B,
    Ae,
    Z,
    Nz,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl Cond {
    pub(crate) fn enc(self) -> u8 {
        match self {
            Cond::O => 0x0,
            Cond::No => 0x1,
            Cond::B => 0x2,
            Cond::Ae => 0x3,
            Cond::Z => 0x4,
            Cond::Nz => 0x5,
            Cond::Be => 0x6,
            Cond::A => 0x7,
            Cond::S => 0x8,
            Cond::Ns => 0x9,
            Cond::P => 0xa,
            Cond::Np => 0xb,
            Cond::L => 0xc,
            Cond::Ge => 0xd,
            Cond::Le => 0xe,
            Cond::G => 0xf,
        }
    }
}

/// The two-operand ALU family. The discriminant is the opcode base; the
/// immediate-form ModRM digit is `base >> 3`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    fn base(self) -> u8 {
        match self {
            AluOp::Add => 0x00,
            AluOp::Or => 0x08,
            AluOp::Adc => 0x10,
            AluOp::Sbb => 0x18,
            AluOp::And => 0x20,
            AluOp::Sub => 0x28,
            AluOp::Xor => 0x30,
            AluOp::Cmp => 0x38,
        }
    }

    fn ext(self) -> u8 {
        self.base() >> 3
    }
}

/// Shift and rotate operations, by ModRM digit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShiftOp {
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    Sar,
}

impl ShiftOp {
    fn ext(self) -> u8 {
        match self {
            ShiftOp::Rol => 0,
            ShiftOp::Ror => 1,
            ShiftOp::Rcl => 2,
            ShiftOp::Rcr => 3,
            ShiftOp::Shl => 4,
            ShiftOp::Shr => 5,
            ShiftOp::Sar => 7,
        }
    }
}

/// The bit-test family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitOp {
    Bt,
    Bts,
    Btr,
    Btc,
}

impl BitOp {
    fn opcode(self) -> u8 {
        match self {
            BitOp::Bt => 0xa3,
            BitOp::Bts => 0xab,
            BitOp::Btr => 0xb3,
            BitOp::Btc => 0xbb,
        }
    }

    fn ext(self) -> u8 {
        match self {
            BitOp::Bt => 4,
            BitOp::Bts => 5,
            BitOp::Btr => 6,
            BitOp::Btc => 7,
        }
    }
}

/// Emits instructions into a borrowed [`CodeBuffer`].
pub struct Emitter<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> Emitter<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Emitter<'a> {
        Emitter { buf }
    }

    pub fn cursor(&self) -> usize {
        self.buf.cursor()
    }

    /// Absolute host address of the current cursor; used to decide whether
    /// a call target is within `rel32` range.
    pub fn abs_cursor(&self) -> u64 {
        self.buf.addr_at(self.buf.cursor()) as u64
    }

    fn start(&mut self) -> Result<usize> {
        self.buf.require(MAX_INST)?;
        Ok(self.buf.cursor())
    }

    fn done(&self, start: usize) -> Result<usize> {
        Ok(self.buf.cursor() - start)
    }

    fn prefix_66(&mut self, size: Size) {
        if size == Size::Word {
            self.buf.put1(0x66);
        }
    }

    /// Emit the REX prefix (if required) for a `reg, r/m` operand pair.
    /// `g_is_reg` distinguishes a real register in ModRM.reg from an opcode
    /// extension digit, which must not trigger byte-register forcing.
    fn put_rex(&mut self, size: Size, enc_g: u8, g_is_reg: bool, rm: &RegMem) {
        let mut rex = RexFlags::for_size(size);
        if size.is_byte() {
            if g_is_reg {
                rex.always_emit_if_8bit_needed(enc_g);
            }
            if let RegMem::Reg(r) = rm {
                rex.always_emit_if_8bit_needed(r.enc());
            }
        }
        if let Some(b) = rex.byte(enc_g, 0, rm.enc_e()) {
            self.buf.put1(b);
        }
    }

    /// Emit ModR/M, SIB and displacement for `enc_g` against `rm`.
    fn modrm_sib_disp(&mut self, enc_g: u8, rm: &RegMem) {
        match *rm {
            RegMem::Reg(r) => {
                self.buf.put1(encode_modrm(0b11, enc_g & 7, r.enc() & 7));
            }
            RegMem::Mem { base, disp } => {
                let enc_e = base.enc();
                let mut d = Disp::new(disp);
                // rbp/r13 as a bare base collides with the rip-relative
                // encoding; an explicit zero byte is required.
                if enc_e & 7 == 0b101 {
                    d.force_d8();
                }
                if enc_e & 7 == 0b100 {
                    // rsp/r12 bases require a SIB byte with index = none.
                    self.buf.put1(encode_modrm(d.m0d(), enc_g & 7, 0b100));
                    self.buf.put1(encode_sib(0, 0b100, enc_e & 7));
                } else {
                    self.buf.put1(encode_modrm(d.m0d(), enc_g & 7, enc_e & 7));
                }
                match d {
                    Disp::None => {}
                    Disp::D8(v) => self.buf.put1(v as u8),
                    Disp::D32(v) => self.buf.put4(v as u32),
                }
            }
        }
    }

    // --- stack, return, padding ---

    pub fn ret(&mut self) -> Result<usize> {
        let start = self.start()?;
        self.buf.put1(0xc3);
        self.done(start)
    }

    pub fn nop(&mut self) -> Result<usize> {
        let start = self.start()?;
        self.buf.put1(0x90);
        self.done(start)
    }

    pub fn push(&mut self, src: Gpr) -> Result<usize> {
        let start = self.start()?;
        if let Some(b) = RexFlags::clear_w().byte(0, 0, src.enc()) {
            self.buf.put1(b);
        }
        self.buf.put1(0x50 | (src.enc() & 7));
        self.done(start)
    }

    pub fn pop(&mut self, dst: Gpr) -> Result<usize> {
        let start = self.start()?;
        if let Some(b) = RexFlags::clear_w().byte(0, 0, dst.enc()) {
            self.buf.put1(b);
        }
        self.buf.put1(0x58 | (dst.enc() & 7));
        self.done(start)
    }

    // --- moves ---

    /// `mov r/m, r` or `mov r, r/m`.
    pub fn movr(&mut self, size: Size, dst: RegMem, src: RegMem) -> Result<usize> {
        let start = self.start()?;
        match (dst, src) {
            (_, RegMem::Reg(s)) => {
                self.prefix_66(size);
                self.put_rex(size, s.enc(), true, &dst);
                self.buf.put1(if size.is_byte() { 0x88 } else { 0x89 });
                self.modrm_sib_disp(s.enc(), &dst);
            }
            (RegMem::Reg(d), src @ RegMem::Mem { .. }) => {
                self.prefix_66(size);
                self.put_rex(size, d.enc(), true, &src);
                self.buf.put1(if size.is_byte() { 0x8a } else { 0x8b });
                self.modrm_sib_disp(d.enc(), &src);
            }
            _ => return Err(Error::InvalidOperand("memory-to-memory move")),
        }
        self.done(start)
    }

    /// `mov r/m, imm`. Register destinations use the `B8+r` forms (with the
    /// `C7 /0` compression for 64-bit immediates that sign-extend from 32
    /// bits); memory destinations take at most a 32-bit immediate.
    pub fn movi(&mut self, size: Size, dst: RegMem, imm: i64) -> Result<usize> {
        let start = self.start()?;
        match dst {
            RegMem::Reg(r) => {
                let enc = r.enc();
                match size {
                    Size::Byte => {
                        let mut rex = RexFlags::clear_w();
                        rex.always_emit_if_8bit_needed(enc);
                        if let Some(b) = rex.byte(0, 0, enc) {
                            self.buf.put1(b);
                        }
                        self.buf.put1(0xb0 | (enc & 7));
                        self.buf.put1(imm as u8);
                    }
                    Size::Word => {
                        self.buf.put1(0x66);
                        if let Some(b) = RexFlags::clear_w().byte(0, 0, enc) {
                            self.buf.put1(b);
                        }
                        self.buf.put1(0xb8 | (enc & 7));
                        self.buf.put2(imm as u16);
                    }
                    Size::Dword => {
                        if let Some(b) = RexFlags::clear_w().byte(0, 0, enc) {
                            self.buf.put1(b);
                        }
                        self.buf.put1(0xb8 | (enc & 7));
                        self.buf.put4(imm as u32);
                    }
                    Size::Qword => {
                        if fits_i32(imm) {
                            self.put_rex(size, 0, false, &dst);
                            self.buf.put1(0xc7);
                            self.modrm_sib_disp(0, &dst);
                            self.buf.put4(imm as u32);
                        } else {
                            // movabs
                            if let Some(b) = RexFlags::set_w().byte(0, 0, enc) {
                                self.buf.put1(b);
                            }
                            self.buf.put1(0xb8 | (enc & 7));
                            self.buf.put8(imm as u64);
                        }
                    }
                }
            }
            RegMem::Mem { .. } => {
                match size {
                    Size::Byte => {
                        if !fits_i8(imm) {
                            return Err(Error::InvalidOperand("immediate exceeds 8-bit operand"));
                        }
                    }
                    Size::Word => {
                        if !fits_i16(imm) {
                            return Err(Error::InvalidOperand("immediate exceeds 16-bit operand"));
                        }
                    }
                    _ => {
                        if !fits_i32(imm) {
                            return Err(Error::InvalidOperand(
                                "64-bit immediate store needs a register",
                            ));
                        }
                    }
                }
                self.prefix_66(size);
                self.put_rex(size, 0, false, &dst);
                self.buf.put1(if size.is_byte() { 0xc6 } else { 0xc7 });
                self.modrm_sib_disp(0, &dst);
                match size {
                    Size::Byte => self.buf.put1(imm as u8),
                    Size::Word => self.buf.put2(imm as u16),
                    _ => self.buf.put4(imm as u32),
                }
            }
        }
        self.done(start)
    }

    // --- two-operand ALU ---

    /// `op r/m, r` or `op r, r/m` for the add/or/adc/sbb/and/sub/xor/cmp
    /// family.
    pub fn alur(&mut self, op: AluOp, size: Size, dst: RegMem, src: RegMem) -> Result<usize> {
        let start = self.start()?;
        match (dst, src) {
            (_, RegMem::Reg(s)) => {
                self.prefix_66(size);
                self.put_rex(size, s.enc(), true, &dst);
                self.buf.put1(op.base() + if size.is_byte() { 0 } else { 1 });
                self.modrm_sib_disp(s.enc(), &dst);
            }
            (RegMem::Reg(d), src @ RegMem::Mem { .. }) => {
                self.prefix_66(size);
                self.put_rex(size, d.enc(), true, &src);
                self.buf.put1(op.base() + if size.is_byte() { 2 } else { 3 });
                self.modrm_sib_disp(d.enc(), &src);
            }
            _ => return Err(Error::InvalidOperand("memory-to-memory ALU operation")),
        }
        self.done(start)
    }

    /// `op r/m, imm` for the ALU family, using the sign-extended 8-bit form
    /// when the immediate allows it.
    pub fn alui(&mut self, op: AluOp, size: Size, dst: RegMem, imm: i32) -> Result<usize> {
        let imm64 = i64::from(imm);
        match size {
            Size::Byte if !fits_i8(imm64) => {
                return Err(Error::InvalidOperand("immediate exceeds 8-bit operand"));
            }
            Size::Word if !fits_i16(imm64) => {
                return Err(Error::InvalidOperand("immediate exceeds 16-bit operand"));
            }
            _ => {}
        }
        let start = self.start()?;
        self.prefix_66(size);
        self.put_rex(size, op.ext(), false, &dst);
        if size.is_byte() {
            self.buf.put1(0x80);
            self.modrm_sib_disp(op.ext(), &dst);
            self.buf.put1(imm as u8);
        } else if fits_i8(imm64) {
            self.buf.put1(0x83);
            self.modrm_sib_disp(op.ext(), &dst);
            self.buf.put1(imm as u8);
        } else {
            self.buf.put1(0x81);
            self.modrm_sib_disp(op.ext(), &dst);
            if size == Size::Word {
                self.buf.put2(imm as u16);
            } else {
                self.buf.put4(imm as u32);
            }
        }
        self.done(start)
    }

    /// `test r/m, r`.
    pub fn tstr(&mut self, size: Size, dst: RegMem, src: Gpr) -> Result<usize> {
        let start = self.start()?;
        self.prefix_66(size);
        self.put_rex(size, src.enc(), true, &dst);
        self.buf.put1(if size.is_byte() { 0x84 } else { 0x85 });
        self.modrm_sib_disp(src.enc(), &dst);
        self.done(start)
    }

    /// `test r/m, imm`.
    pub fn tsti(&mut self, size: Size, dst: RegMem, imm: i32) -> Result<usize> {
        let imm64 = i64::from(imm);
        match size {
            Size::Byte if !fits_i8(imm64) => {
                return Err(Error::InvalidOperand("immediate exceeds 8-bit operand"));
            }
            Size::Word if !fits_i16(imm64) => {
                return Err(Error::InvalidOperand("immediate exceeds 16-bit operand"));
            }
            _ => {}
        }
        let start = self.start()?;
        self.prefix_66(size);
        self.put_rex(size, 0, false, &dst);
        self.buf.put1(if size.is_byte() { 0xf6 } else { 0xf7 });
        self.modrm_sib_disp(0, &dst);
        match size {
            Size::Byte => self.buf.put1(imm as u8),
            Size::Word => self.buf.put2(imm as u16),
            _ => self.buf.put4(imm as u32),
        }
        self.done(start)
    }

    // --- one-operand groups ---

    fn group_f7(&mut self, ext: u8, size: Size, rm: RegMem) -> Result<usize> {
        let start = self.start()?;
        self.prefix_66(size);
        self.put_rex(size, 0, false, &rm);
        self.buf.put1(if size.is_byte() { 0xf6 } else { 0xf7 });
        self.modrm_sib_disp(ext, &rm);
        self.done(start)
    }

    /// `not r/m`.
    pub fn notr(&mut self, size: Size, rm: RegMem) -> Result<usize> {
        self.group_f7(2, size, rm)
    }

    /// `neg r/m`.
    pub fn negr(&mut self, size: Size, rm: RegMem) -> Result<usize> {
        self.group_f7(3, size, rm)
    }

    /// Unsigned `mul r/m`: RDX:RAX := RAX * r/m.
    pub fn mulr(&mut self, size: Size, rm: RegMem) -> Result<usize> {
        self.group_f7(4, size, rm)
    }

    /// Signed `imul r/m`: RDX:RAX := RAX * r/m.
    pub fn imul(&mut self, size: Size, rm: RegMem) -> Result<usize> {
        self.group_f7(5, size, rm)
    }

    /// Unsigned `div r/m`: RAX := RDX:RAX / r/m, RDX := remainder.
    pub fn divr(&mut self, size: Size, rm: RegMem) -> Result<usize> {
        self.group_f7(6, size, rm)
    }

    /// Signed `idiv r/m`: RAX := RDX:RAX / r/m, RDX := remainder.
    pub fn idiv(&mut self, size: Size, rm: RegMem) -> Result<usize> {
        self.group_f7(7, size, rm)
    }

    pub fn incr(&mut self, size: Size, rm: RegMem) -> Result<usize> {
        let start = self.start()?;
        self.prefix_66(size);
        self.put_rex(size, 0, false, &rm);
        self.buf.put1(if size.is_byte() { 0xfe } else { 0xff });
        self.modrm_sib_disp(0, &rm);
        self.done(start)
    }

    pub fn decr(&mut self, size: Size, rm: RegMem) -> Result<usize> {
        let start = self.start()?;
        self.prefix_66(size);
        self.put_rex(size, 0, false, &rm);
        self.buf.put1(if size.is_byte() { 0xfe } else { 0xff });
        self.modrm_sib_disp(1, &rm);
        self.done(start)
    }

    // --- wide multiply ---

    /// Two-operand `imul r, r/m` (0F AF). Widths 16/32/64.
    pub fn imulr(&mut self, size: Size, dst: Gpr, src: RegMem) -> Result<usize> {
        if size.is_byte() {
            return Err(Error::InvalidOperand("byte-width two-operand imul"));
        }
        let start = self.start()?;
        self.prefix_66(size);
        self.put_rex(size, dst.enc(), true, &src);
        self.buf.put1(0x0f);
        self.buf.put1(0xaf);
        self.modrm_sib_disp(dst.enc(), &src);
        self.done(start)
    }

    /// Three-operand `imul r, r/m, imm` (69/6B). Widths 16/32/64.
    pub fn imuli(&mut self, size: Size, dst: Gpr, src: RegMem, imm: i32) -> Result<usize> {
        if size.is_byte() {
            return Err(Error::InvalidOperand("byte-width three-operand imul"));
        }
        if size == Size::Word && !fits_i16(i64::from(imm)) {
            return Err(Error::InvalidOperand("immediate exceeds 16-bit operand"));
        }
        let start = self.start()?;
        self.prefix_66(size);
        self.put_rex(size, dst.enc(), true, &src);
        if fits_i8(i64::from(imm)) {
            self.buf.put1(0x6b);
            self.modrm_sib_disp(dst.enc(), &src);
            self.buf.put1(imm as u8);
        } else {
            self.buf.put1(0x69);
            self.modrm_sib_disp(dst.enc(), &src);
            if size == Size::Word {
                self.buf.put2(imm as u16);
            } else {
                self.buf.put4(imm as u32);
            }
        }
        self.done(start)
    }

    /// Sign-extend RAX into RDX:RAX at the given width (`cwd`/`cdq`/`cqo`).
    pub fn cdq(&mut self, size: Size) -> Result<usize> {
        if size.is_byte() {
            return Err(Error::InvalidOperand("byte-width sign extension into rdx"));
        }
        let start = self.start()?;
        self.prefix_66(size);
        if size == Size::Qword {
            self.buf.put1(0x48);
        }
        self.buf.put1(0x99);
        self.done(start)
    }

    // --- shifts and rotates ---

    /// Shift/rotate by an immediate count; the count is masked to the
    /// operand width per ISA semantics.
    pub fn shifti(&mut self, op: ShiftOp, size: Size, rm: RegMem, imm: u8) -> Result<usize> {
        let imm = imm & if size == Size::Qword { 63 } else { 31 };
        let start = self.start()?;
        self.prefix_66(size);
        self.put_rex(size, 0, false, &rm);
        self.buf.put1(if size.is_byte() { 0xc0 } else { 0xc1 });
        self.modrm_sib_disp(op.ext(), &rm);
        self.buf.put1(imm);
        self.done(start)
    }

    /// Shift/rotate by the count in CL.
    pub fn shiftc(&mut self, op: ShiftOp, size: Size, rm: RegMem) -> Result<usize> {
        let start = self.start()?;
        self.prefix_66(size);
        self.put_rex(size, 0, false, &rm);
        self.buf.put1(if size.is_byte() { 0xd2 } else { 0xd3 });
        self.modrm_sib_disp(op.ext(), &rm);
        self.done(start)
    }

    // --- address arithmetic, exchange ---

    /// `lea r, m`. Widths 16/32/64; the operand must be a memory form.
    pub fn lea(&mut self, size: Size, dst: Gpr, src: RegMem) -> Result<usize> {
        if size.is_byte() {
            return Err(Error::InvalidOperand("byte-width lea"));
        }
        if src.is_reg() {
            return Err(Error::InvalidOperand("lea requires a memory operand"));
        }
        let start = self.start()?;
        self.prefix_66(size);
        self.put_rex(size, dst.enc(), true, &src);
        self.buf.put1(0x8d);
        self.modrm_sib_disp(dst.enc(), &src);
        self.done(start)
    }

    /// `xchg r/m, r`.
    pub fn xchg(&mut self, size: Size, dst: RegMem, src: Gpr) -> Result<usize> {
        let start = self.start()?;
        self.prefix_66(size);
        self.put_rex(size, src.enc(), true, &dst);
        self.buf.put1(if size.is_byte() { 0x86 } else { 0x87 });
        self.modrm_sib_disp(src.enc(), &dst);
        self.done(start)
    }

    // --- widening moves ---

    /// `movzx r, r/m` zero-extending from `ssize` (8 or 16 bits) to `dsize`.
    pub fn movzx(&mut self, dsize: Size, ssize: Size, dst: Gpr, src: RegMem) -> Result<usize> {
        let opcode = match ssize {
            Size::Byte => 0xb6,
            Size::Word => 0xb7,
            _ => return Err(Error::InvalidOperand("movzx source must be 8 or 16 bits")),
        };
        if dsize.bits() <= ssize.bits() {
            return Err(Error::InvalidOperand("movzx must widen"));
        }
        let start = self.start()?;
        self.prefix_66(dsize);
        let mut rex = RexFlags::for_size(dsize);
        if ssize.is_byte() {
            if let RegMem::Reg(r) = &src {
                rex.always_emit_if_8bit_needed(r.enc());
            }
        }
        if let Some(b) = rex.byte(dst.enc(), 0, src.enc_e()) {
            self.buf.put1(b);
        }
        self.buf.put1(0x0f);
        self.buf.put1(opcode);
        self.modrm_sib_disp(dst.enc(), &src);
        self.done(start)
    }

    /// `movsx`/`movsxd r, r/m` sign-extending from `ssize` to `dsize`.
    pub fn movsx(&mut self, dsize: Size, ssize: Size, dst: Gpr, src: RegMem) -> Result<usize> {
        if dsize.bits() <= ssize.bits() {
            return Err(Error::InvalidOperand("movsx must widen"));
        }
        let start = self.start()?;
        self.prefix_66(dsize);
        let mut rex = RexFlags::for_size(dsize);
        if ssize.is_byte() {
            if let RegMem::Reg(r) = &src {
                rex.always_emit_if_8bit_needed(r.enc());
            }
        }
        if let Some(b) = rex.byte(dst.enc(), 0, src.enc_e()) {
            self.buf.put1(b);
        }
        match ssize {
            Size::Byte => {
                self.buf.put1(0x0f);
                self.buf.put1(0xbe);
            }
            Size::Word => {
                self.buf.put1(0x0f);
                self.buf.put1(0xbf);
            }
            Size::Dword => self.buf.put1(0x63),
            Size::Qword => return Err(Error::InvalidOperand("movsx source must be under 64 bits")),
        }
        self.modrm_sib_disp(dst.enc(), &src);
        self.done(start)
    }

    // --- conditional data ---

    /// `setcc r/m8`.
    pub fn setcc(&mut self, cc: Cond, dst: RegMem) -> Result<usize> {
        let start = self.start()?;
        let mut rex = RexFlags::clear_w();
        if let RegMem::Reg(r) = &dst {
            rex.always_emit_if_8bit_needed(r.enc());
        }
        if let Some(b) = rex.byte(0, 0, dst.enc_e()) {
            self.buf.put1(b);
        }
        self.buf.put1(0x0f);
        self.buf.put1(0x90 | cc.enc());
        self.modrm_sib_disp(0, &dst);
        self.done(start)
    }

    /// `cmovcc r, r/m`. Widths 16/32/64.
    pub fn cmovcc(&mut self, cc: Cond, size: Size, dst: Gpr, src: RegMem) -> Result<usize> {
        if size.is_byte() {
            return Err(Error::InvalidOperand("byte-width cmov"));
        }
        let start = self.start()?;
        self.prefix_66(size);
        self.put_rex(size, dst.enc(), true, &src);
        self.buf.put1(0x0f);
        self.buf.put1(0x40 | cc.enc());
        self.modrm_sib_disp(dst.enc(), &src);
        self.done(start)
    }

    // --- bit tests ---

    /// `bt/bts/btr/btc r/m, r`. Widths 16/32/64.
    pub fn bitop(&mut self, op: BitOp, size: Size, dst: RegMem, src: Gpr) -> Result<usize> {
        if size.is_byte() {
            return Err(Error::InvalidOperand("byte-width bit test"));
        }
        let start = self.start()?;
        self.prefix_66(size);
        self.put_rex(size, src.enc(), true, &dst);
        self.buf.put1(0x0f);
        self.buf.put1(op.opcode());
        self.modrm_sib_disp(src.enc(), &dst);
        self.done(start)
    }

    /// `bt/bts/btr/btc r/m, imm8`. Widths 16/32/64.
    pub fn bitopi(&mut self, op: BitOp, size: Size, dst: RegMem, idx: u8) -> Result<usize> {
        if size.is_byte() {
            return Err(Error::InvalidOperand("byte-width bit test"));
        }
        let start = self.start()?;
        self.prefix_66(size);
        self.put_rex(size, 0, false, &dst);
        self.buf.put1(0x0f);
        self.buf.put1(0xba);
        self.modrm_sib_disp(op.ext(), &dst);
        self.buf.put1(idx & if size == Size::Qword { 63 } else { 31 });
        self.done(start)
    }

    // --- atomics, fences ---

    /// `cmpxchg r/m, r` (compare against RAX).
    pub fn cmpxchg(&mut self, size: Size, dst: RegMem, src: Gpr) -> Result<usize> {
        let start = self.start()?;
        self.prefix_66(size);
        self.put_rex(size, src.enc(), true, &dst);
        self.buf.put1(0x0f);
        self.buf.put1(if size.is_byte() { 0xb0 } else { 0xb1 });
        self.modrm_sib_disp(src.enc(), &dst);
        self.done(start)
    }

    /// Memory fence: `mfence`, `lfence` or `sfence` depending on which
    /// orderings are requested; a plain `nop` when neither is.
    pub fn fence(&mut self, sync_loads: bool, sync_stores: bool) -> Result<usize> {
        let start = self.start()?;
        match (sync_loads, sync_stores) {
            (true, true) => self.buf.put(&[0x0f, 0xae, 0xf0]),
            (true, false) => self.buf.put(&[0x0f, 0xae, 0xe8]),
            (false, true) => self.buf.put(&[0x0f, 0xae, 0xf8]),
            (false, false) => self.buf.put1(0x90),
        }
        self.done(start)
    }

    // --- branches and calls ---
    //
    // `disp` is the target offset relative to the *start* of the
    // instruction; the emitter subtracts its own length. A `Some` fixup
    // means the target is unknown: a zero placeholder is written, the fixup
    // records the patch site and PC-relative base, and the `far` flag
    // selects rel8 vs rel32. Without a fixup the short form is used
    // whenever the displacement fits and `far` is not requested.

    /// `jmp rel8/rel32`.
    pub fn jmpi(&mut self, disp: i64, far: bool, fix: Option<&mut Fixup>) -> Result<usize> {
        let start = self.start()?;
        let short = !far && (fix.is_some() || fits_i8(disp - 2));
        if short {
            self.buf.put1(0xeb);
            let patch = self.buf.cursor();
            self.buf.put1(if fix.is_some() { 0 } else { (disp - 2) as i8 as u8 });
            if let Some(f) = fix {
                *f = Fixup {
                    patch,
                    base: self.buf.cursor(),
                    width: FixupWidth::Rel8,
                };
            }
        } else {
            if fix.is_none() && !fits_i32(disp - 5) {
                return Err(Error::DisplacementTooLarge);
            }
            self.buf.put1(0xe9);
            let patch = self.buf.cursor();
            self.buf
                .put4(if fix.is_some() { 0 } else { (disp - 5) as i32 as u32 });
            if let Some(f) = fix {
                *f = Fixup {
                    patch,
                    base: self.buf.cursor(),
                    width: FixupWidth::Rel32,
                };
            }
        }
        self.done(start)
    }

    /// `jcc rel8/rel32`.
    pub fn jcc(&mut self, cc: Cond, disp: i64, far: bool, fix: Option<&mut Fixup>) -> Result<usize> {
        let start = self.start()?;
        let short = !far && (fix.is_some() || fits_i8(disp - 2));
        if short {
            self.buf.put1(0x70 | cc.enc());
            let patch = self.buf.cursor();
            self.buf.put1(if fix.is_some() { 0 } else { (disp - 2) as i8 as u8 });
            if let Some(f) = fix {
                *f = Fixup {
                    patch,
                    base: self.buf.cursor(),
                    width: FixupWidth::Rel8,
                };
            }
        } else {
            if fix.is_none() && !fits_i32(disp - 6) {
                return Err(Error::DisplacementTooLarge);
            }
            self.buf.put1(0x0f);
            self.buf.put1(0x80 | cc.enc());
            let patch = self.buf.cursor();
            self.buf
                .put4(if fix.is_some() { 0 } else { (disp - 6) as i32 as u32 });
            if let Some(f) = fix {
                *f = Fixup {
                    patch,
                    base: self.buf.cursor(),
                    width: FixupWidth::Rel32,
                };
            }
        }
        self.done(start)
    }

    /// `jmp r/m64`.
    pub fn jmpr(&mut self, rm: RegMem) -> Result<usize> {
        let start = self.start()?;
        if let Some(b) = RexFlags::clear_w().byte(0, 0, rm.enc_e()) {
            self.buf.put1(b);
        }
        self.buf.put1(0xff);
        self.modrm_sib_disp(4, &rm);
        self.done(start)
    }

    /// `call rel32`.
    pub fn call(&mut self, disp: i64, fix: Option<&mut Fixup>) -> Result<usize> {
        let start = self.start()?;
        if fix.is_none() && !fits_i32(disp - 5) {
            return Err(Error::DisplacementTooLarge);
        }
        self.buf.put1(0xe8);
        let patch = self.buf.cursor();
        self.buf
            .put4(if fix.is_some() { 0 } else { (disp - 5) as i32 as u32 });
        if let Some(f) = fix {
            *f = Fixup {
                patch,
                base: self.buf.cursor(),
                width: FixupWidth::Rel32,
            };
        }
        self.done(start)
    }

    /// `call r/m64`.
    pub fn callr(&mut self, rm: RegMem) -> Result<usize> {
        let start = self.start()?;
        if let Some(b) = RexFlags::clear_w().byte(0, 0, rm.enc_e()) {
            self.buf.put1(b);
        }
        self.buf.put1(0xff);
        self.modrm_sib_disp(2, &rm);
        self.done(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::Gpr::*;

    fn emit(f: impl FnOnce(&mut Emitter) -> Result<usize>) -> Vec<u8> {
        let mut buf = CodeBuffer::new(256).unwrap();
        let mut e = Emitter::new(&mut buf);
        let n = f(&mut e).unwrap();
        assert_eq!(n, buf.cursor(), "returned byte count must match emission");
        buf.bytes().to_vec()
    }

    #[test]
    fn mov_reg_reg() {
        assert_eq!(
            emit(|e| e.movr(Size::Qword, RegMem::reg(Rax), RegMem::reg(Rcx))),
            [0x48, 0x89, 0xc8]
        );
        assert_eq!(
            emit(|e| e.movr(Size::Dword, RegMem::reg(Rax), RegMem::reg(Rcx))),
            [0x89, 0xc8]
        );
        assert_eq!(
            emit(|e| e.movr(Size::Word, RegMem::reg(Rax), RegMem::reg(Rcx))),
            [0x66, 0x89, 0xc8]
        );
        assert_eq!(
            emit(|e| e.movr(Size::Byte, RegMem::reg(Rax), RegMem::reg(Rcx))),
            [0x88, 0xc8]
        );
        // extended registers set REX.B / REX.R
        assert_eq!(
            emit(|e| e.movr(Size::Qword, RegMem::reg(R9), RegMem::reg(Rcx))),
            [0x49, 0x89, 0xc9]
        );
        assert_eq!(
            emit(|e| e.movr(Size::Dword, RegMem::reg(Rcx), RegMem::reg(R9))),
            [0x44, 0x89, 0xc9]
        );
    }

    #[test]
    fn byte_access_to_high_encodings_forces_rex() {
        // mov sil, al would be "mov dh, al" without REX
        assert_eq!(
            emit(|e| e.movr(Size::Byte, RegMem::reg(Rsi), RegMem::reg(Rax))),
            [0x40, 0x88, 0xc6]
        );
        assert_eq!(
            emit(|e| e.movr(Size::Byte, RegMem::reg(Rbx), RegMem::reg(Rax))),
            [0x88, 0xc3]
        );
    }

    #[test]
    fn mov_mem_forms() {
        assert_eq!(
            emit(|e| e.movr(Size::Qword, RegMem::reg(Rax), RegMem::mem(Rbx, 0))),
            [0x48, 0x8b, 0x03]
        );
        assert_eq!(
            emit(|e| e.movr(Size::Qword, RegMem::reg(Rax), RegMem::mem(Rbx, 0x10))),
            [0x48, 0x8b, 0x43, 0x10]
        );
        assert_eq!(
            emit(|e| e.movr(Size::Qword, RegMem::reg(Rax), RegMem::mem(Rbx, 0x12345678))),
            [0x48, 0x8b, 0x83, 0x78, 0x56, 0x34, 0x12]
        );
        // rbp base with zero displacement still emits disp8 = 0
        assert_eq!(
            emit(|e| e.movr(Size::Qword, RegMem::reg(R8), RegMem::mem(Rbp, 0))),
            [0x4c, 0x8b, 0x45, 0x00]
        );
        // rsp base always takes a SIB byte
        assert_eq!(
            emit(|e| e.movr(Size::Qword, RegMem::reg(R8), RegMem::mem(Rsp, 0))),
            [0x4c, 0x8b, 0x04, 0x24]
        );
        assert_eq!(
            emit(|e| e.movr(Size::Qword, RegMem::reg(R8), RegMem::mem(Rsp, -0x10))),
            [0x4c, 0x8b, 0x44, 0x24, 0xf0]
        );
        // r12/r13 share the rsp/rbp special cases
        assert_eq!(
            emit(|e| e.movr(Size::Dword, RegMem::mem(R12, 0), RegMem::reg(Rax))),
            [0x41, 0x89, 0x04, 0x24]
        );
        assert_eq!(
            emit(|e| e.movr(Size::Dword, RegMem::mem(R13, 0), RegMem::reg(Rax))),
            [0x41, 0x89, 0x45, 0x00]
        );
    }

    #[test]
    fn mov_imm_forms() {
        assert_eq!(
            emit(|e| e.movi(Size::Qword, RegMem::reg(Rax), 0x1234567890abcdefu64 as i64)),
            [0x48, 0xb8, 0xef, 0xcd, 0xab, 0x90, 0x78, 0x56, 0x34, 0x12]
        );
        assert_eq!(
            emit(|e| e.movi(Size::Dword, RegMem::reg(Rax), 0x90abcdefu32 as i64)),
            [0xb8, 0xef, 0xcd, 0xab, 0x90]
        );
        assert_eq!(
            emit(|e| e.movi(Size::Qword, RegMem::reg(R10), 0x1234567890abcdefu64 as i64)),
            [0x49, 0xba, 0xef, 0xcd, 0xab, 0x90, 0x78, 0x56, 0x34, 0x12]
        );
        // 64-bit immediates that sign-extend from 32 bits compress to C7 /0
        assert_eq!(
            emit(|e| e.movi(Size::Qword, RegMem::reg(Rax), 42)),
            [0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            emit(|e| e.movi(Size::Byte, RegMem::reg(Rax), 0xef_u8 as i64)),
            [0xb0, 0xef]
        );
        assert_eq!(
            emit(|e| e.movi(Size::Byte, RegMem::reg(R10), 0xef_u8 as i64)),
            [0x41, 0xb2, 0xef]
        );
        assert_eq!(
            emit(|e| e.movi(Size::Dword, RegMem::mem(Rax, 0), 0x90abcdefu32 as i64)),
            [0xc7, 0x00, 0xef, 0xcd, 0xab, 0x90]
        );
    }

    #[test]
    fn alu_forms() {
        assert_eq!(
            emit(|e| e.alur(AluOp::Add, Size::Qword, RegMem::reg(Rax), RegMem::reg(Rcx))),
            [0x48, 0x01, 0xc8]
        );
        assert_eq!(
            emit(|e| e.alur(AluOp::Sub, Size::Dword, RegMem::reg(Rdx), RegMem::mem(Rbx, 8))),
            [0x2b, 0x53, 0x08]
        );
        assert_eq!(
            emit(|e| e.alur(AluOp::Cmp, Size::Dword, RegMem::reg(Rcx), RegMem::reg(Rax))),
            [0x39, 0xc1]
        );
        assert_eq!(
            emit(|e| e.alur(AluOp::Xor, Size::Dword, RegMem::reg(Rdx), RegMem::reg(Rdx))),
            [0x31, 0xd2]
        );
    }

    #[test]
    fn alu_imm_width_boundary() {
        // 127 takes the sign-extended 8-bit form, 128 the 32-bit form
        assert_eq!(
            emit(|e| e.alui(AluOp::Add, Size::Dword, RegMem::reg(Rax), 127)),
            [0x83, 0xc0, 0x7f]
        );
        assert_eq!(
            emit(|e| e.alui(AluOp::Add, Size::Dword, RegMem::reg(Rax), 128)),
            [0x81, 0xc0, 0x80, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            emit(|e| e.alui(AluOp::Sub, Size::Qword, RegMem::reg(Rsp), 8)),
            [0x48, 0x83, 0xec, 0x08]
        );
        assert_eq!(
            emit(|e| e.alui(AluOp::Cmp, Size::Byte, RegMem::reg(Rcx), -1)),
            [0x80, 0xf9, 0xff]
        );
    }

    #[test]
    fn push_pop() {
        assert_eq!(emit(|e| e.push(Rbx)), [0x53]);
        assert_eq!(emit(|e| e.push(R12)), [0x41, 0x54]);
        assert_eq!(emit(|e| e.pop(R15)), [0x41, 0x5f]);
        assert_eq!(emit(|e| e.pop(Rbp)), [0x5d]);
    }

    #[test]
    fn muldiv_group() {
        assert_eq!(
            emit(|e| e.imulr(Size::Dword, Rax, RegMem::reg(Rsi))),
            [0x0f, 0xaf, 0xc6]
        );
        assert_eq!(
            emit(|e| e.imuli(Size::Dword, Rax, RegMem::reg(Rax), -5)),
            [0x6b, 0xc0, 0xfb]
        );
        assert_eq!(
            emit(|e| e.imuli(Size::Dword, Rcx, RegMem::reg(Rcx), 1000)),
            [0x69, 0xc9, 0xe8, 0x03, 0x00, 0x00]
        );
        assert_eq!(emit(|e| e.idiv(Size::Dword, RegMem::reg(Rsi))), [0xf7, 0xfe]);
        assert_eq!(
            emit(|e| e.divr(Size::Qword, RegMem::reg(Rcx))),
            [0x48, 0xf7, 0xf1]
        );
        assert_eq!(emit(|e| e.cdq(Size::Dword)), [0x99]);
        assert_eq!(emit(|e| e.cdq(Size::Qword)), [0x48, 0x99]);
        assert_eq!(emit(|e| e.cdq(Size::Word)), [0x66, 0x99]);
    }

    #[test]
    fn unary_group() {
        assert_eq!(
            emit(|e| e.notr(Size::Qword, RegMem::reg(Rax))),
            [0x48, 0xf7, 0xd0]
        );
        assert_eq!(emit(|e| e.negr(Size::Dword, RegMem::reg(Rcx))), [0xf7, 0xd9]);
        assert_eq!(
            emit(|e| e.incr(Size::Qword, RegMem::reg(Rax))),
            [0x48, 0xff, 0xc0]
        );
        assert_eq!(emit(|e| e.decr(Size::Byte, RegMem::reg(Rcx))), [0xfe, 0xc9]);
    }

    #[test]
    fn shift_forms() {
        assert_eq!(
            emit(|e| e.shifti(ShiftOp::Shl, Size::Dword, RegMem::reg(Rax), 3)),
            [0xc1, 0xe0, 0x03]
        );
        assert_eq!(
            emit(|e| e.shifti(ShiftOp::Sar, Size::Qword, RegMem::reg(Rax), 63)),
            [0x48, 0xc1, 0xf8, 0x3f]
        );
        // counts are masked to the operand width
        assert_eq!(
            emit(|e| e.shifti(ShiftOp::Shr, Size::Dword, RegMem::reg(Rax), 33)),
            [0xc1, 0xe8, 0x01]
        );
        assert_eq!(
            emit(|e| e.shiftc(ShiftOp::Shl, Size::Dword, RegMem::reg(Rax))),
            [0xd3, 0xe0]
        );
    }

    #[test]
    fn widening_moves() {
        assert_eq!(
            emit(|e| e.movzx(Size::Dword, Size::Byte, Rax, RegMem::reg(Rcx))),
            [0x0f, 0xb6, 0xc1]
        );
        assert_eq!(
            emit(|e| e.movzx(Size::Qword, Size::Word, Rax, RegMem::reg(Rcx))),
            [0x48, 0x0f, 0xb7, 0xc1]
        );
        assert_eq!(
            emit(|e| e.movzx(Size::Dword, Size::Byte, Rax, RegMem::reg(Rsi))),
            [0x40, 0x0f, 0xb6, 0xc6]
        );
        assert_eq!(
            emit(|e| e.movsx(Size::Qword, Size::Dword, Rax, RegMem::reg(Rcx))),
            [0x48, 0x63, 0xc1]
        );
        assert_eq!(
            emit(|e| e.movsx(Size::Dword, Size::Byte, Rax, RegMem::reg(Rcx))),
            [0x0f, 0xbe, 0xc1]
        );
    }

    #[test]
    fn conditional_data() {
        assert_eq!(emit(|e| e.setcc(Cond::L, RegMem::reg(Rax))), [0x0f, 0x9c, 0xc0]);
        assert_eq!(
            emit(|e| e.setcc(Cond::Z, RegMem::reg(Rsi))),
            [0x40, 0x0f, 0x94, 0xc6]
        );
        assert_eq!(
            emit(|e| e.cmovcc(Cond::L, Size::Dword, Rax, RegMem::reg(Rcx))),
            [0x0f, 0x4c, 0xc1]
        );
    }

    #[test]
    fn bit_tests() {
        assert_eq!(
            emit(|e| e.bitop(BitOp::Bt, Size::Dword, RegMem::reg(Rax), Rcx)),
            [0x0f, 0xa3, 0xc8]
        );
        assert_eq!(
            emit(|e| e.bitopi(BitOp::Bts, Size::Qword, RegMem::reg(Rax), 5)),
            [0x48, 0x0f, 0xba, 0xe8, 0x05]
        );
    }

    #[test]
    fn xchg_cmpxchg_fence() {
        assert_eq!(
            emit(|e| e.xchg(Size::Dword, RegMem::reg(Rax), Rcx)),
            [0x87, 0xc8]
        );
        assert_eq!(
            emit(|e| e.cmpxchg(Size::Dword, RegMem::mem(Rbx, 0), Rcx)),
            [0x0f, 0xb1, 0x0b]
        );
        assert_eq!(emit(|e| e.fence(true, true)), [0x0f, 0xae, 0xf0]);
        assert_eq!(emit(|e| e.fence(true, false)), [0x0f, 0xae, 0xe8]);
        assert_eq!(emit(|e| e.fence(false, true)), [0x0f, 0xae, 0xf8]);
    }

    #[test]
    fn lea_forms() {
        assert_eq!(
            emit(|e| e.lea(Size::Qword, Rax, RegMem::mem(Rbp, 0x10))),
            [0x48, 0x8d, 0x45, 0x10]
        );
        assert_eq!(
            emit(|e| e.lea(Size::Qword, Rax, RegMem::mem(Rsp, 0))),
            [0x48, 0x8d, 0x04, 0x24]
        );
        assert!(matches!(
            Emitter::new(&mut CodeBuffer::new(64).unwrap()).lea(
                Size::Qword,
                Rax,
                RegMem::reg(Rcx)
            ),
            Err(Error::InvalidOperand(_))
        ));
    }

    #[test]
    fn branch_backward_short_and_near() {
        let mut buf = CodeBuffer::new(64).unwrap();
        let mut e = Emitter::new(&mut buf);
        e.nop().unwrap();
        // jump back to offset 0 from cursor 1: encoded rel8 = -3
        e.jcc(Cond::Z, 0 - 1, false, None).unwrap();
        // same target, forced near: encoded rel32 = -9
        e.jmpi(0 - 3, true, None).unwrap();
        assert_eq!(
            buf.bytes(),
            [0x90, 0x74, 0xfd, 0xe9, 0xf8, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn branch_forward_records_fixup() {
        let mut buf = CodeBuffer::new(64).unwrap();
        let mut e = Emitter::new(&mut buf);
        let mut fix = Fixup::default();
        e.jmpi(0, false, Some(&mut fix)).unwrap();
        assert_eq!(fix.patch, 1);
        assert_eq!(fix.base, 2);
        assert_eq!(fix.width, FixupWidth::Rel8);

        let mut fix = Fixup::default();
        e.jcc(Cond::Nz, 0, true, Some(&mut fix)).unwrap();
        assert_eq!(fix.patch, 4);
        assert_eq!(fix.base, 8);
        assert_eq!(fix.width, FixupWidth::Rel32);
        assert_eq!(buf.bytes(), [0xeb, 0x00, 0x0f, 0x85, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn call_forms() {
        assert_eq!(
            emit(|e| e.call(0x100, None)),
            [0xe8, 0xfb, 0x00, 0x00, 0x00]
        );
        assert_eq!(emit(|e| e.callr(RegMem::reg(R11))), [0x41, 0xff, 0xd3]);
        assert_eq!(emit(|e| e.jmpr(RegMem::reg(Rax))), [0xff, 0xe0]);
    }

    #[test]
    fn test_forms() {
        assert_eq!(
            emit(|e| e.tstr(Size::Dword, RegMem::reg(Rax), Rax)),
            [0x85, 0xc0]
        );
        assert_eq!(
            emit(|e| e.tsti(Size::Dword, RegMem::reg(Rax), 0x11)),
            [0xf7, 0xc0, 0x11, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn buffer_full_leaves_no_partial_instruction() {
        let mut buf = CodeBuffer::new(1).unwrap();
        let cap = buf.capacity();
        buf.write_bytes(&vec![0x90; cap - 4]).unwrap();
        let at = buf.cursor();
        let mut e = Emitter::new(&mut buf);
        assert!(matches!(
            e.movi(Size::Qword, RegMem::reg(Rax), 0x1234567890abcdef),
            Err(Error::BufferFull)
        ));
        assert_eq!(buf.cursor(), at);
    }
}
