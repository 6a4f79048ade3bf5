//! The code-generation façade.
//!
//! [`Function`] is the emission context: one code buffer, one allocator,
//! and the entry/exit labels of the function being built. It exists in two
//! flavors built from the same struct: a standalone function owning a
//! private buffer ([`Function::new`]), and functions carved out of a
//! long-lived [`Jit`] buffer ([`Jit::gen_function`]).
//!
//! Every generated function follows the System V AMD64 convention and is
//! callable as `i64 fn(void* data)`. The data pointer is kept in the base
//! register for the whole function; local values live in that region, and
//! the pointer is forwarded as the implicit first argument of every nested
//! call.
//!
//! Lifecycle: `Fresh` until the first emitting operation (which lays down
//! the prologue), then `Emitting` until [`Function::finish`] places the
//! epilogue and seals the function. `finish` is idempotent; emission after
//! it fails with [`Error::FunctionSealed`].

use std::ffi::c_void;

use log::debug;
use smallvec::SmallVec;

use crate::alloc::RegAlloc;
use crate::bits::fits_i32;
use crate::buffer::CodeBuffer;
use crate::emit::{AluOp, BitOp, Cond, Emitter, ShiftOp};
use crate::error::{Error, Result};
use crate::label::{Fixup, Label};
use crate::reg::{Gpr, RegMem, Size, ARG_REGS, BASE_REG, SCRATCH_REG};
use crate::value::{Value, ValueKind};

/// Signature of generated code.
pub type JitFn = unsafe extern "C" fn(*mut c_void) -> i64;

/// Callee-saved registers pushed by the prologue, in push order.
const SAVED_REGS: [Gpr; 6] = [Gpr::Rbx, Gpr::Rbp, Gpr::R12, Gpr::R13, Gpr::R14, Gpr::R15];

/// Default size of the internally owned data region used by `exec()`.
const DEFAULT_DATA_BYTES: usize = 4096;

/// A heterogeneous call argument: a value, an immediate, or a raw register.
#[derive(Clone, Copy, Debug)]
pub enum CallArg<'a> {
    Val(&'a Value),
    Imm(i64),
    Reg(Gpr),
}

/// A long-lived code generator: one buffer, many functions.
pub struct Jit {
    buf: CodeBuffer,
}

impl Jit {
    /// Create a generator with (at least) `capacity` bytes of executable
    /// memory.
    pub fn new(capacity: usize) -> Result<Jit> {
        Ok(Jit {
            buf: CodeBuffer::new(capacity)?,
        })
    }

    /// Begin a new function at the current cursor. The previous function
    /// must be finished first; the borrow rules enforce one emitter per
    /// buffer.
    pub fn gen_function(&mut self, name: &str) -> Function<'_> {
        Function::make(name, Buf::Shared(&mut self.buf))
    }

    pub fn cursor(&self) -> usize {
        self.buf.cursor()
    }
}

enum Buf<'b> {
    Owned(CodeBuffer),
    Shared(&'b mut CodeBuffer),
}

impl Buf<'_> {
    fn get(&mut self) -> &mut CodeBuffer {
        match self {
            Buf::Owned(b) => b,
            Buf::Shared(b) => b,
        }
    }

    fn get_ref(&self) -> &CodeBuffer {
        match self {
            Buf::Owned(b) => b,
            Buf::Shared(b) => b,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Fresh,
    Emitting,
    Finished,
}

/// The emission context for one generated function.
pub struct Function<'b> {
    name: String,
    buf: Buf<'b>,
    alloc: RegAlloc,
    entry: Label,
    exit: Label,
    entry_off: usize,
    state: State,
    /// Outstanding forward references to unplaced labels.
    pending: usize,
    /// Internally owned data region for `exec()`.
    data: Vec<u8>,
}

macro_rules! jump_ops {
    ($($name:ident => $cc:expr;)*) => {
        $(pub fn $name(&mut self, label: &mut Label, far: bool) -> Result<()> {
            self.jump_cc(Some($cc), label, far)
        })*
    };
}

macro_rules! set_ops {
    ($($name:ident => $cc:expr;)*) => {
        $(pub fn $name(&mut self, dst: &Value) -> Result<()> {
            self.set_cc($cc, dst)
        })*
    };
}

macro_rules! cmov_ops {
    ($($name:ident => $cc:expr;)*) => {
        $(pub fn $name(&mut self, dst: &Value, src: &Value) -> Result<()> {
            self.cmov_cc($cc, dst, src)
        })*
    };
}

impl Function<'static> {
    /// A standalone function with its own buffer of `capacity` bytes.
    pub fn new(name: &str, capacity: usize) -> Result<Function<'static>> {
        Ok(Function::make(name, Buf::Owned(CodeBuffer::new(capacity)?)))
    }
}

impl<'b> Function<'b> {
    fn make(name: &str, buf: Buf<'b>) -> Function<'b> {
        let entry_off = buf.get_ref().cursor();
        Function {
            name: name.to_owned(),
            buf,
            alloc: RegAlloc::new(),
            entry: Label::new("entry"),
            exit: Label::new("exit"),
            entry_off,
            state: State::Fresh,
            pending: 0,
            data: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// Bytes of data-region space consumed by local slots.
    pub fn local_bytes(&self) -> usize {
        self.alloc.local_bytes()
    }

    fn ensure_emitting(&mut self) -> Result<()> {
        match self.state {
            State::Finished => Err(Error::FunctionSealed),
            State::Emitting => Ok(()),
            State::Fresh => {
                self.state = State::Emitting;
                self.gen_prologue()
            }
        }
    }

    fn gen_prologue(&mut self) -> Result<()> {
        let buf = self.buf.get();
        let off = buf.cursor();
        self.entry_off = off;
        self.entry.place_at(buf, off)?;
        let mut e = Emitter::new(buf);
        for &r in &SAVED_REGS {
            e.push(r)?;
        }
        // data pointer argument into the base register
        e.movr(Size::Qword, RegMem::reg(BASE_REG), RegMem::reg(Gpr::Rdi))?;
        // six pushes leave rsp 8 off a 16-byte boundary at call sites
        e.alui(AluOp::Sub, Size::Qword, RegMem::reg(Gpr::Rsp), 8)?;
        debug!("function '{}': prologue at offset {off:#x}", self.name);
        Ok(())
    }

    /// Place the epilogue and seal the function. Idempotent after the
    /// first call.
    pub fn finish(&mut self) -> Result<()> {
        if self.state == State::Finished {
            return Ok(());
        }
        self.ensure_emitting()?;
        let buf = self.buf.get();
        let off = buf.cursor();
        let resolved = self.exit.place_at(buf, off)?;
        self.pending -= resolved;
        let mut e = Emitter::new(buf);
        e.alui(AluOp::Add, Size::Qword, RegMem::reg(Gpr::Rsp), 8)?;
        for &r in SAVED_REGS.iter().rev() {
            e.pop(r)?;
        }
        e.ret()?;
        if self.pending > 0 {
            return Err(Error::UnplacedLabel(self.pending));
        }
        self.state = State::Finished;
        debug!(
            "function '{}' finished, {} bytes",
            self.name,
            self.buf.get_ref().cursor() - self.entry_off
        );
        Ok(())
    }

    /// Entry pointer of the generated code; finishes the function if
    /// needed.
    pub fn entry(&mut self) -> Result<*const u8> {
        self.finish()?;
        Ok(self.buf.get_ref().addr_at(self.entry_off))
    }

    /// Run the generated function with the internally owned data region.
    pub fn exec(&mut self) -> Result<i64> {
        self.finish()?;
        let need = self.alloc.local_bytes().max(DEFAULT_DATA_BYTES);
        if self.data.len() < need {
            self.data.resize(need, 0);
        }
        let data = self.data.as_mut_ptr().cast::<c_void>();
        self.invoke(data)
    }

    /// Run the generated function with a caller-provided data region. The
    /// region must be writable and cover at least
    /// [`local_bytes`](Self::local_bytes) bytes.
    pub fn exec_with(&mut self, data: *mut c_void) -> Result<i64> {
        self.finish()?;
        self.invoke(data)
    }

    fn invoke(&mut self, data: *mut c_void) -> Result<i64> {
        let entry = self.buf.get_ref().addr_at(self.entry_off);
        let f: JitFn = unsafe { std::mem::transmute(entry) };
        Ok(unsafe { f(data) })
    }

    // --- labels and branches ---

    pub fn gen_label(&self, name: &str) -> Label {
        Label::new(name)
    }

    /// Bind `label` to the current cursor and resolve its pending fixups.
    pub fn place(&mut self, label: &mut Label) -> Result<()> {
        self.ensure_emitting()?;
        let buf = self.buf.get();
        let off = buf.cursor();
        let resolved = label.place_at(buf, off)?;
        self.pending -= resolved;
        Ok(())
    }

    fn jump_cc(&mut self, cc: Option<Cond>, label: &mut Label, far: bool) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        if let Some(target) = label.offset() {
            let disp = target as i64 - e.cursor() as i64;
            match cc {
                Some(cc) => e.jcc(cc, disp, far, None)?,
                None => e.jmpi(disp, far, None)?,
            };
        } else {
            let mut fix = Fixup::default();
            match cc {
                Some(cc) => e.jcc(cc, 0, far, Some(&mut fix))?,
                None => e.jmpi(0, far, Some(&mut fix))?,
            };
            label.attach(fix);
            self.pending += 1;
        }
        Ok(())
    }

    pub fn gen_jmp(&mut self, label: &mut Label, far: bool) -> Result<()> {
        self.jump_cc(None, label, far)
    }

    jump_ops! {
        gen_jo => Cond::O;
        gen_jno => Cond::No;
        gen_jb => Cond::B;
        gen_jae => Cond::Ae;
        gen_jz => Cond::Z;
        gen_jnz => Cond::Nz;
        gen_je => Cond::Z;
        gen_jne => Cond::Nz;
        gen_jbe => Cond::Be;
        gen_ja => Cond::A;
        gen_js => Cond::S;
        gen_jns => Cond::Ns;
        gen_jp => Cond::P;
        gen_jnp => Cond::Np;
        gen_jl => Cond::L;
        gen_jge => Cond::Ge;
        gen_jle => Cond::Le;
        gen_jg => Cond::G;
    }

    // --- values ---

    /// An uninitialized local of the given width.
    pub fn gen_local(&mut self, name: &str, bits: u32) -> Result<Value> {
        self.ensure_emitting()?;
        let size = Size::from_bits(bits).ok_or(Error::InvalidOperand("width must be 8/16/32/64"))?;
        Ok(self.alloc.new_local(name, size))
    }

    fn local_init(&mut self, name: &str, size: Size, init: i64) -> Result<Value> {
        self.ensure_emitting()?;
        let val = self.alloc.new_local(name, size);
        let mut e = Emitter::new(self.buf.get());
        let r = self.alloc.fetch_write(&mut e, &val, None)?;
        e.movi(size, RegMem::reg(r), init)?;
        self.alloc.mark_dirty(&val);
        Ok(val)
    }

    pub fn gen_local_i8(&mut self, name: &str, init: i8) -> Result<Value> {
        self.local_init(name, Size::Byte, i64::from(init))
    }

    pub fn gen_local_i16(&mut self, name: &str, init: i16) -> Result<Value> {
        self.local_init(name, Size::Word, i64::from(init))
    }

    pub fn gen_local_i32(&mut self, name: &str, init: i32) -> Result<Value> {
        self.local_init(name, Size::Dword, i64::from(init))
    }

    pub fn gen_local_i64(&mut self, name: &str, init: i64) -> Result<Value> {
        self.local_init(name, Size::Qword, init)
    }

    /// A global backed by a fixed absolute address.
    pub fn gen_global(&mut self, name: &str, bits: u32, addr: u64) -> Result<Value> {
        self.ensure_emitting()?;
        let size = Size::from_bits(bits).ok_or(Error::InvalidOperand("width must be 8/16/32/64"))?;
        Ok(self.alloc.new_global(name, size, addr))
    }

    pub fn gen_global_i8(&mut self, name: &str, addr: *mut i8) -> Result<Value> {
        self.gen_global(name, 8, addr as u64)
    }

    pub fn gen_global_i16(&mut self, name: &str, addr: *mut i16) -> Result<Value> {
        self.gen_global(name, 16, addr as u64)
    }

    pub fn gen_global_i32(&mut self, name: &str, addr: *mut i32) -> Result<Value> {
        self.gen_global(name, 32, addr as u64)
    }

    pub fn gen_global_i64(&mut self, name: &str, addr: *mut i64) -> Result<Value> {
        self.gen_global(name, 64, addr as u64)
    }

    /// A register-only scratch value of the given width.
    pub fn gen_scratch(&mut self, name: &str, bits: u32) -> Result<Value> {
        self.ensure_emitting()?;
        let size = Size::from_bits(bits).ok_or(Error::InvalidOperand("width must be 8/16/32/64"))?;
        Ok(self.alloc.new_scratch(name, size))
    }

    pub fn gen_scratch_i8(&mut self, name: &str) -> Result<Value> {
        self.gen_scratch(name, 8)
    }

    pub fn gen_scratch_i16(&mut self, name: &str) -> Result<Value> {
        self.gen_scratch(name, 16)
    }

    pub fn gen_scratch_i32(&mut self, name: &str) -> Result<Value> {
        self.gen_scratch(name, 32)
    }

    pub fn gen_scratch_i64(&mut self, name: &str) -> Result<Value> {
        self.gen_scratch(name, 64)
    }

    /// Width of a value in bits.
    pub fn bits_of(&self, val: &Value) -> u32 {
        self.alloc.size_of(val).bits()
    }

    pub fn kind_of(&self, val: &Value) -> ValueKind {
        self.alloc.kind_of(val)
    }

    /// The register currently holding the value, if any.
    pub fn reg_of(&self, val: &Value) -> Option<Gpr> {
        self.alloc.reg_of(val)
    }

    /// Whether the value's register copy differs from its home.
    pub fn is_dirty(&self, val: &Value) -> bool {
        self.alloc.is_dirty(val)
    }

    /// Write a dirty register-resident value back to its home.
    pub fn sync_value(&mut self, val: &Value) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        self.alloc.store(&mut e, val)
    }

    /// Flush (if dirty and homed), release the register, and consume the
    /// handle.
    pub fn free_value(&mut self, val: Value) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        self.alloc.free_value(&mut e, &val)
    }

    // --- moves ---

    pub fn gen_mov(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let mut pins: SmallVec<[Gpr; 2]> = SmallVec::new();
        let res: Result<()> = (|| {
            let src_rm = self.alloc.operand_rm(&mut e, src)?;
            if let RegMem::Reg(r) = src_rm {
                self.alloc.pin(r);
                pins.push(r);
            }
            let size = self.alloc.size_of(dst);
            let d = self.alloc.fetch_write(&mut e, dst, None)?;
            e.movr(size, RegMem::reg(d), src_rm)?;
            self.alloc.mark_dirty(dst);
            Ok(())
        })();
        for r in pins {
            self.alloc.unpin(r);
        }
        res
    }

    pub fn gen_movi(&mut self, dst: &Value, imm: i64) -> Result<()> {
        self.ensure_emitting()?;
        let size = self.alloc.size_of(dst);
        if !imm_fits(imm, size) {
            return Err(Error::InvalidOperand("immediate exceeds value width"));
        }
        let mut e = Emitter::new(self.buf.get());
        let d = self.alloc.fetch_write(&mut e, dst, None)?;
        e.movi(size, RegMem::reg(d), imm)?;
        self.alloc.mark_dirty(dst);
        Ok(())
    }

    // --- two-operand ALU ---

    fn alu_rr(&mut self, op: AluOp, dst: &Value, src: &Value, dirties: bool) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let mut pins: SmallVec<[Gpr; 2]> = SmallVec::new();
        let res: Result<()> = (|| {
            let src_rm = self.alloc.operand_rm(&mut e, src)?;
            if let RegMem::Reg(r) = src_rm {
                self.alloc.pin(r);
                pins.push(r);
            }
            let size = self.alloc.size_of(dst);
            let d = self.alloc.fetch(&mut e, dst, None)?;
            e.alur(op, size, RegMem::reg(d), src_rm)?;
            if dirties {
                self.alloc.mark_dirty(dst);
            }
            Ok(())
        })();
        for r in pins {
            self.alloc.unpin(r);
        }
        res
    }

    fn alu_ri(&mut self, op: AluOp, dst: &Value, imm: i32, dirties: bool) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let rm = self.alloc.operand_rm(&mut e, dst)?;
        e.alui(op, self.alloc.size_of(dst), rm, imm)?;
        if dirties && rm.is_reg() {
            self.alloc.mark_dirty(dst);
        }
        Ok(())
    }

    pub fn gen_add(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.alu_rr(AluOp::Add, dst, src, true)
    }

    pub fn gen_or(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.alu_rr(AluOp::Or, dst, src, true)
    }

    pub fn gen_adc(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.alu_rr(AluOp::Adc, dst, src, true)
    }

    pub fn gen_sbb(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.alu_rr(AluOp::Sbb, dst, src, true)
    }

    pub fn gen_and(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.alu_rr(AluOp::And, dst, src, true)
    }

    pub fn gen_sub(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.alu_rr(AluOp::Sub, dst, src, true)
    }

    pub fn gen_xor(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.alu_rr(AluOp::Xor, dst, src, true)
    }

    pub fn gen_cmp(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.alu_rr(AluOp::Cmp, dst, src, false)
    }

    pub fn gen_addi(&mut self, dst: &Value, imm: i32) -> Result<()> {
        self.alu_ri(AluOp::Add, dst, imm, true)
    }

    pub fn gen_ori(&mut self, dst: &Value, imm: i32) -> Result<()> {
        self.alu_ri(AluOp::Or, dst, imm, true)
    }

    pub fn gen_adci(&mut self, dst: &Value, imm: i32) -> Result<()> {
        self.alu_ri(AluOp::Adc, dst, imm, true)
    }

    pub fn gen_sbbi(&mut self, dst: &Value, imm: i32) -> Result<()> {
        self.alu_ri(AluOp::Sbb, dst, imm, true)
    }

    pub fn gen_andi(&mut self, dst: &Value, imm: i32) -> Result<()> {
        self.alu_ri(AluOp::And, dst, imm, true)
    }

    pub fn gen_subi(&mut self, dst: &Value, imm: i32) -> Result<()> {
        self.alu_ri(AluOp::Sub, dst, imm, true)
    }

    pub fn gen_xori(&mut self, dst: &Value, imm: i32) -> Result<()> {
        self.alu_ri(AluOp::Xor, dst, imm, true)
    }

    pub fn gen_cmpi(&mut self, dst: &Value, imm: i32) -> Result<()> {
        self.alu_ri(AluOp::Cmp, dst, imm, false)
    }

    pub fn gen_tst(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let mut pins: SmallVec<[Gpr; 2]> = SmallVec::new();
        let res: Result<()> = (|| {
            let s = self.alloc.fetch(&mut e, src, None)?;
            self.alloc.pin(s);
            pins.push(s);
            let rm = self.alloc.operand_rm(&mut e, dst)?;
            e.tstr(self.alloc.size_of(dst), rm, s)?;
            Ok(())
        })();
        for r in pins {
            self.alloc.unpin(r);
        }
        res
    }

    pub fn gen_tsti(&mut self, dst: &Value, imm: i32) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let rm = self.alloc.operand_rm(&mut e, dst)?;
        e.tsti(self.alloc.size_of(dst), rm, imm)?;
        Ok(())
    }

    // --- unary ---

    pub fn gen_not(&mut self, dst: &Value) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let rm = self.alloc.operand_rm(&mut e, dst)?;
        e.notr(self.alloc.size_of(dst), rm)?;
        if rm.is_reg() {
            self.alloc.mark_dirty(dst);
        }
        Ok(())
    }

    pub fn gen_neg(&mut self, dst: &Value) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let rm = self.alloc.operand_rm(&mut e, dst)?;
        e.negr(self.alloc.size_of(dst), rm)?;
        if rm.is_reg() {
            self.alloc.mark_dirty(dst);
        }
        Ok(())
    }

    pub fn gen_inc(&mut self, dst: &Value) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let rm = self.alloc.operand_rm(&mut e, dst)?;
        e.incr(self.alloc.size_of(dst), rm)?;
        if rm.is_reg() {
            self.alloc.mark_dirty(dst);
        }
        Ok(())
    }

    pub fn gen_dec(&mut self, dst: &Value) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let rm = self.alloc.operand_rm(&mut e, dst)?;
        e.decr(self.alloc.size_of(dst), rm)?;
        if rm.is_reg() {
            self.alloc.mark_dirty(dst);
        }
        Ok(())
    }

    // --- shifts and rotates ---

    fn shift_ri(&mut self, op: ShiftOp, dst: &Value, amount: u8) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let rm = self.alloc.operand_rm(&mut e, dst)?;
        e.shifti(op, self.alloc.size_of(dst), rm, amount)?;
        if rm.is_reg() {
            self.alloc.mark_dirty(dst);
        }
        Ok(())
    }

    fn shift_rc(&mut self, op: ShiftOp, dst: &Value, count: &Value) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let mut pins: SmallVec<[Gpr; 2]> = SmallVec::new();
        let res: Result<()> = (|| {
            self.alloc.fetch(&mut e, count, Some(Gpr::Rcx))?;
            self.alloc.pin(Gpr::Rcx);
            pins.push(Gpr::Rcx);
            let rm = self.alloc.operand_rm(&mut e, dst)?;
            e.shiftc(op, self.alloc.size_of(dst), rm)?;
            if rm.is_reg() {
                self.alloc.mark_dirty(dst);
            }
            Ok(())
        })();
        for r in pins {
            self.alloc.unpin(r);
        }
        res
    }

    pub fn gen_shli(&mut self, dst: &Value, amount: u8) -> Result<()> {
        self.shift_ri(ShiftOp::Shl, dst, amount)
    }

    pub fn gen_shri(&mut self, dst: &Value, amount: u8) -> Result<()> {
        self.shift_ri(ShiftOp::Shr, dst, amount)
    }

    /// Arithmetic (sign-preserving) right shift.
    pub fn gen_shai(&mut self, dst: &Value, amount: u8) -> Result<()> {
        self.shift_ri(ShiftOp::Sar, dst, amount)
    }

    pub fn gen_roli(&mut self, dst: &Value, amount: u8) -> Result<()> {
        self.shift_ri(ShiftOp::Rol, dst, amount)
    }

    pub fn gen_rori(&mut self, dst: &Value, amount: u8) -> Result<()> {
        self.shift_ri(ShiftOp::Ror, dst, amount)
    }

    pub fn gen_rcli(&mut self, dst: &Value, amount: u8) -> Result<()> {
        self.shift_ri(ShiftOp::Rcl, dst, amount)
    }

    pub fn gen_rcri(&mut self, dst: &Value, amount: u8) -> Result<()> {
        self.shift_ri(ShiftOp::Rcr, dst, amount)
    }

    pub fn gen_shl(&mut self, dst: &Value, count: &Value) -> Result<()> {
        self.shift_rc(ShiftOp::Shl, dst, count)
    }

    pub fn gen_shr(&mut self, dst: &Value, count: &Value) -> Result<()> {
        self.shift_rc(ShiftOp::Shr, dst, count)
    }

    pub fn gen_sha(&mut self, dst: &Value, count: &Value) -> Result<()> {
        self.shift_rc(ShiftOp::Sar, dst, count)
    }

    pub fn gen_rol(&mut self, dst: &Value, count: &Value) -> Result<()> {
        self.shift_rc(ShiftOp::Rol, dst, count)
    }

    pub fn gen_ror(&mut self, dst: &Value, count: &Value) -> Result<()> {
        self.shift_rc(ShiftOp::Ror, dst, count)
    }

    // --- multiply and divide ---

    /// Truncating signed multiply: `dst *= src`. Widths 16/32/64.
    pub fn gen_imul(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let mut pins: SmallVec<[Gpr; 2]> = SmallVec::new();
        let res: Result<()> = (|| {
            let src_rm = self.alloc.operand_rm(&mut e, src)?;
            if let RegMem::Reg(r) = src_rm {
                self.alloc.pin(r);
                pins.push(r);
            }
            let size = self.alloc.size_of(dst);
            let d = self.alloc.fetch(&mut e, dst, None)?;
            e.imulr(size, d, src_rm)?;
            self.alloc.mark_dirty(dst);
            Ok(())
        })();
        for r in pins {
            self.alloc.unpin(r);
        }
        res
    }

    /// Truncating unsigned multiply through RDX:RAX: `dst *= src`.
    pub fn gen_umul(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.ensure_emitting()?;
        let size = self.alloc.size_of(dst);
        if size == Size::Byte {
            return Err(Error::InvalidOperand("byte-width multiply"));
        }
        let mut e = Emitter::new(self.buf.get());
        let mut pins: SmallVec<[Gpr; 2]> = SmallVec::new();
        let res: Result<()> = (|| {
            self.alloc.fetch(&mut e, dst, Some(Gpr::Rax))?;
            self.alloc.pin(Gpr::Rax);
            pins.push(Gpr::Rax);
            self.alloc.evict(&mut e, Gpr::Rdx)?;
            self.alloc.pin(Gpr::Rdx);
            pins.push(Gpr::Rdx);
            let src_rm = self.alloc.operand_rm(&mut e, src)?;
            e.mulr(size, src_rm)?;
            self.alloc.mark_dirty(dst);
            Ok(())
        })();
        for r in pins {
            self.alloc.unpin(r);
        }
        res
    }

    fn div_rr(&mut self, signed: bool, remainder: bool, dst: &Value, src: &Value) -> Result<()> {
        self.ensure_emitting()?;
        let size = self.alloc.size_of(dst);
        if size == Size::Byte {
            return Err(Error::InvalidOperand("byte-width division"));
        }
        let mut e = Emitter::new(self.buf.get());
        let mut pins: SmallVec<[Gpr; 2]> = SmallVec::new();
        let res: Result<()> = (|| {
            self.alloc.fetch(&mut e, dst, Some(Gpr::Rax))?;
            self.alloc.pin(Gpr::Rax);
            pins.push(Gpr::Rax);
            self.alloc.evict(&mut e, Gpr::Rdx)?;
            self.alloc.pin(Gpr::Rdx);
            pins.push(Gpr::Rdx);
            let src_rm = self.alloc.operand_rm(&mut e, src)?;
            if signed {
                e.cdq(size)?;
                e.idiv(size, src_rm)?;
            } else {
                e.alur(AluOp::Xor, Size::Dword, RegMem::reg(Gpr::Rdx), RegMem::reg(Gpr::Rdx))?;
                e.divr(size, src_rm)?;
            }
            if remainder {
                e.movr(size, RegMem::reg(Gpr::Rax), RegMem::reg(Gpr::Rdx))?;
            }
            self.alloc.mark_dirty(dst);
            Ok(())
        })();
        for r in pins {
            self.alloc.unpin(r);
        }
        res
    }

    /// Signed division, truncating toward zero: `dst /= src`.
    pub fn gen_idiv(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.div_rr(true, false, dst, src)
    }

    /// Signed remainder: `dst %= src`.
    pub fn gen_imod(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.div_rr(true, true, dst, src)
    }

    /// Unsigned division: `dst /= src`.
    pub fn gen_udiv(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.div_rr(false, false, dst, src)
    }

    /// Unsigned remainder: `dst %= src`.
    pub fn gen_umod(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.div_rr(false, true, dst, src)
    }

    /// Signed multiply by an immediate.
    pub fn gen_imuli(&mut self, dst: &Value, imm: i64) -> Result<()> {
        self.ensure_emitting()?;
        let size = self.alloc.size_of(dst);
        let mut e = Emitter::new(self.buf.get());
        let d = self.alloc.fetch(&mut e, dst, None)?;
        match i32::try_from(imm) {
            Ok(imm32) if size != Size::Word || i16::try_from(imm).is_ok() => {
                e.imuli(size, d, RegMem::reg(d), imm32)?;
            }
            _ => {
                e.movi(Size::Qword, RegMem::reg(SCRATCH_REG), imm)?;
                e.imulr(size, d, RegMem::reg(SCRATCH_REG))?;
            }
        }
        self.alloc.mark_dirty(dst);
        Ok(())
    }

    fn div_ri(&mut self, signed: bool, remainder: bool, dst: &Value, imm: i64) -> Result<()> {
        self.ensure_emitting()?;
        let size = self.alloc.size_of(dst);
        if size == Size::Byte {
            return Err(Error::InvalidOperand("byte-width division"));
        }
        let mut e = Emitter::new(self.buf.get());
        let mut pins: SmallVec<[Gpr; 2]> = SmallVec::new();
        let res: Result<()> = (|| {
            self.alloc.fetch(&mut e, dst, Some(Gpr::Rax))?;
            self.alloc.pin(Gpr::Rax);
            pins.push(Gpr::Rax);
            self.alloc.evict(&mut e, Gpr::Rdx)?;
            self.alloc.pin(Gpr::Rdx);
            pins.push(Gpr::Rdx);
            e.movi(Size::Qword, RegMem::reg(SCRATCH_REG), imm)?;
            if signed {
                e.cdq(size)?;
                e.idiv(size, RegMem::reg(SCRATCH_REG))?;
            } else {
                e.alur(AluOp::Xor, Size::Dword, RegMem::reg(Gpr::Rdx), RegMem::reg(Gpr::Rdx))?;
                e.divr(size, RegMem::reg(SCRATCH_REG))?;
            }
            if remainder {
                e.movr(size, RegMem::reg(Gpr::Rax), RegMem::reg(Gpr::Rdx))?;
            }
            self.alloc.mark_dirty(dst);
            Ok(())
        })();
        for r in pins {
            self.alloc.unpin(r);
        }
        res
    }

    pub fn gen_idivi(&mut self, dst: &Value, imm: i64) -> Result<()> {
        self.div_ri(true, false, dst, imm)
    }

    pub fn gen_imodi(&mut self, dst: &Value, imm: i64) -> Result<()> {
        self.div_ri(true, true, dst, imm)
    }

    /// Unsigned multiply by an immediate.
    pub fn gen_umuli(&mut self, dst: &Value, imm: u64) -> Result<()> {
        self.ensure_emitting()?;
        let size = self.alloc.size_of(dst);
        if size == Size::Byte {
            return Err(Error::InvalidOperand("byte-width multiply"));
        }
        let mut e = Emitter::new(self.buf.get());
        let mut pins: SmallVec<[Gpr; 2]> = SmallVec::new();
        let res: Result<()> = (|| {
            self.alloc.fetch(&mut e, dst, Some(Gpr::Rax))?;
            self.alloc.pin(Gpr::Rax);
            pins.push(Gpr::Rax);
            self.alloc.evict(&mut e, Gpr::Rdx)?;
            self.alloc.pin(Gpr::Rdx);
            pins.push(Gpr::Rdx);
            e.movi(Size::Qword, RegMem::reg(SCRATCH_REG), imm as i64)?;
            e.mulr(size, RegMem::reg(SCRATCH_REG))?;
            self.alloc.mark_dirty(dst);
            Ok(())
        })();
        for r in pins {
            self.alloc.unpin(r);
        }
        res
    }

    pub fn gen_udivi(&mut self, dst: &Value, imm: u64) -> Result<()> {
        self.div_ri(false, false, dst, imm as i64)
    }

    pub fn gen_umodi(&mut self, dst: &Value, imm: u64) -> Result<()> {
        self.div_ri(false, true, dst, imm as i64)
    }

    // --- conditional data ---

    fn set_cc(&mut self, cc: Cond, dst: &Value) -> Result<()> {
        self.ensure_emitting()?;
        let size = self.alloc.size_of(dst);
        let mut e = Emitter::new(self.buf.get());
        let d = self.alloc.fetch_write(&mut e, dst, None)?;
        e.setcc(cc, RegMem::reg(d))?;
        if size != Size::Byte {
            e.movzx(size, Size::Byte, d, RegMem::reg(d))?;
        }
        self.alloc.mark_dirty(dst);
        Ok(())
    }

    set_ops! {
        gen_seto => Cond::O;
        gen_setno => Cond::No;
        gen_setb => Cond::B;
        gen_setae => Cond::Ae;
        gen_setz => Cond::Z;
        gen_setnz => Cond::Nz;
        gen_sete => Cond::Z;
        gen_setne => Cond::Nz;
        gen_setbe => Cond::Be;
        gen_seta => Cond::A;
        gen_sets => Cond::S;
        gen_setns => Cond::Ns;
        gen_setp => Cond::P;
        gen_setnp => Cond::Np;
        gen_setl => Cond::L;
        gen_setge => Cond::Ge;
        gen_setle => Cond::Le;
        gen_setg => Cond::G;
    }

    fn cmov_cc(&mut self, cc: Cond, dst: &Value, src: &Value) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let mut pins: SmallVec<[Gpr; 2]> = SmallVec::new();
        let res: Result<()> = (|| {
            let src_rm = self.alloc.operand_rm(&mut e, src)?;
            if let RegMem::Reg(r) = src_rm {
                self.alloc.pin(r);
                pins.push(r);
            }
            let size = self.alloc.size_of(dst);
            let d = self.alloc.fetch(&mut e, dst, None)?;
            e.cmovcc(cc, size, d, src_rm)?;
            self.alloc.mark_dirty(dst);
            Ok(())
        })();
        for r in pins {
            self.alloc.unpin(r);
        }
        res
    }

    cmov_ops! {
        gen_cmovo => Cond::O;
        gen_cmovno => Cond::No;
        gen_cmovb => Cond::B;
        gen_cmovae => Cond::Ae;
        gen_cmovz => Cond::Z;
        gen_cmovnz => Cond::Nz;
        gen_cmove => Cond::Z;
        gen_cmovne => Cond::Nz;
        gen_cmovbe => Cond::Be;
        gen_cmova => Cond::A;
        gen_cmovs => Cond::S;
        gen_cmovns => Cond::Ns;
        gen_cmovp => Cond::P;
        gen_cmovnp => Cond::Np;
        gen_cmovl => Cond::L;
        gen_cmovge => Cond::Ge;
        gen_cmovle => Cond::Le;
        gen_cmovg => Cond::G;
    }

    // --- bit tests ---

    fn bit_rr(&mut self, op: BitOp, dst: &Value, src: &Value, dirties: bool) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let mut pins: SmallVec<[Gpr; 2]> = SmallVec::new();
        let res: Result<()> = (|| {
            let s = self.alloc.fetch(&mut e, src, None)?;
            self.alloc.pin(s);
            pins.push(s);
            let rm = self.alloc.operand_rm(&mut e, dst)?;
            e.bitop(op, self.alloc.size_of(dst), rm, s)?;
            if dirties && rm.is_reg() {
                self.alloc.mark_dirty(dst);
            }
            Ok(())
        })();
        for r in pins {
            self.alloc.unpin(r);
        }
        res
    }

    fn bit_ri(&mut self, op: BitOp, dst: &Value, idx: u8, dirties: bool) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let rm = self.alloc.operand_rm(&mut e, dst)?;
        e.bitopi(op, self.alloc.size_of(dst), rm, idx)?;
        if dirties && rm.is_reg() {
            self.alloc.mark_dirty(dst);
        }
        Ok(())
    }

    /// Bit test; the result lands in the carry flag.
    pub fn gen_bt(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.bit_rr(BitOp::Bt, dst, src, false)
    }

    pub fn gen_bts(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.bit_rr(BitOp::Bts, dst, src, true)
    }

    pub fn gen_btr(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.bit_rr(BitOp::Btr, dst, src, true)
    }

    pub fn gen_btc(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.bit_rr(BitOp::Btc, dst, src, true)
    }

    pub fn gen_bti(&mut self, dst: &Value, idx: u8) -> Result<()> {
        self.bit_ri(BitOp::Bt, dst, idx, false)
    }

    pub fn gen_btsi(&mut self, dst: &Value, idx: u8) -> Result<()> {
        self.bit_ri(BitOp::Bts, dst, idx, true)
    }

    pub fn gen_btri(&mut self, dst: &Value, idx: u8) -> Result<()> {
        self.bit_ri(BitOp::Btr, dst, idx, true)
    }

    pub fn gen_btci(&mut self, dst: &Value, idx: u8) -> Result<()> {
        self.bit_ri(BitOp::Btc, dst, idx, true)
    }

    // --- width conversions ---

    /// `dst := zero_extend(src)` across the two declared widths.
    pub fn gen_zxt(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let mut pins: SmallVec<[Gpr; 2]> = SmallVec::new();
        let res: Result<()> = (|| {
            let src_rm = self.alloc.operand_rm(&mut e, src)?;
            if let RegMem::Reg(r) = src_rm {
                self.alloc.pin(r);
                pins.push(r);
            }
            let dsize = self.alloc.size_of(dst);
            let ssize = self.alloc.size_of(src);
            let d = self.alloc.fetch_write(&mut e, dst, None)?;
            if dsize.bits() <= ssize.bits() || ssize == Size::Dword {
                // same-width/truncating moves, and 32-bit moves, already
                // zero the upper bits
                let size = if dsize.bits() <= ssize.bits() { dsize } else { ssize };
                e.movr(size, RegMem::reg(d), src_rm)?;
            } else {
                e.movzx(dsize, ssize, d, src_rm)?;
            }
            self.alloc.mark_dirty(dst);
            Ok(())
        })();
        for r in pins {
            self.alloc.unpin(r);
        }
        res
    }

    /// `dst := sign_extend(src)` across the two declared widths.
    pub fn gen_sxt(&mut self, dst: &Value, src: &Value) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let mut pins: SmallVec<[Gpr; 2]> = SmallVec::new();
        let res: Result<()> = (|| {
            let src_rm = self.alloc.operand_rm(&mut e, src)?;
            if let RegMem::Reg(r) = src_rm {
                self.alloc.pin(r);
                pins.push(r);
            }
            let dsize = self.alloc.size_of(dst);
            let ssize = self.alloc.size_of(src);
            let d = self.alloc.fetch_write(&mut e, dst, None)?;
            if dsize.bits() <= ssize.bits() {
                e.movr(dsize, RegMem::reg(d), src_rm)?;
            } else {
                e.movsx(dsize, ssize, d, src_rm)?;
            }
            self.alloc.mark_dirty(dst);
            Ok(())
        })();
        for r in pins {
            self.alloc.unpin(r);
        }
        res
    }

    // --- exchange, address arithmetic, atomics ---

    pub fn gen_xchg(&mut self, a: &Value, b: &Value) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let mut pins: SmallVec<[Gpr; 2]> = SmallVec::new();
        let res: Result<()> = (|| {
            let rb = self.alloc.fetch(&mut e, b, None)?;
            self.alloc.pin(rb);
            pins.push(rb);
            let ra = self.alloc.fetch(&mut e, a, None)?;
            e.xchg(self.alloc.size_of(a), RegMem::reg(ra), rb)?;
            self.alloc.mark_dirty(a);
            self.alloc.mark_dirty(b);
            Ok(())
        })();
        for r in pins {
            self.alloc.unpin(r);
        }
        res
    }

    /// `dst := src + disp` (address arithmetic via `lea`).
    pub fn gen_lea(&mut self, dst: &Value, src: &Value, disp: i32) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let mut pins: SmallVec<[Gpr; 2]> = SmallVec::new();
        let res: Result<()> = (|| {
            let s = self.alloc.fetch(&mut e, src, None)?;
            self.alloc.pin(s);
            pins.push(s);
            let d = self.alloc.fetch_write(&mut e, dst, None)?;
            e.lea(self.alloc.size_of(dst), d, RegMem::mem(s, disp))?;
            self.alloc.mark_dirty(dst);
            Ok(())
        })();
        for r in pins {
            self.alloc.unpin(r);
        }
        res
    }

    /// Compare-and-exchange: if `dst == cmpv` then `dst := src`, else
    /// `cmpv := dst`.
    pub fn gen_cmpxchg(&mut self, dst: &Value, src: &Value, cmpv: &Value) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        let mut pins: SmallVec<[Gpr; 2]> = SmallVec::new();
        let res: Result<()> = (|| {
            self.alloc.fetch(&mut e, cmpv, Some(Gpr::Rax))?;
            self.alloc.pin(Gpr::Rax);
            pins.push(Gpr::Rax);
            let s = self.alloc.fetch(&mut e, src, None)?;
            self.alloc.pin(s);
            pins.push(s);
            let rm = self.alloc.operand_rm(&mut e, dst)?;
            e.cmpxchg(self.alloc.size_of(dst), rm, s)?;
            if rm.is_reg() {
                self.alloc.mark_dirty(dst);
            }
            self.alloc.mark_dirty(cmpv);
            Ok(())
        })();
        for r in pins {
            self.alloc.unpin(r);
        }
        res
    }

    /// Memory ordering fence.
    pub fn gen_fence(&mut self, sync_loads: bool, sync_stores: bool) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        e.fence(sync_loads, sync_stores)?;
        Ok(())
    }

    // --- calls and returns ---

    /// Call a host function. Arguments are placed right to left into the
    /// System V registers starting at position 1; position 0 always
    /// receives the data pointer. Returns a scratch value owning RAX.
    pub fn gen_call(&mut self, target: *const u8, args: &[CallArg<'_>]) -> Result<Value> {
        self.ensure_emitting()?;
        if args.len() + 1 > ARG_REGS.len() {
            return Err(Error::InvalidOperand("too many call arguments"));
        }
        let mut e = Emitter::new(self.buf.get());
        let mut pins: SmallVec<[Gpr; 5]> = SmallVec::new();
        let res: Result<()> = (|| {
            for (i, arg) in args.iter().enumerate().rev() {
                let dest = ARG_REGS[i + 1];
                match *arg {
                    CallArg::Val(v) => {
                        self.alloc.fetch(&mut e, v, Some(dest))?;
                    }
                    CallArg::Imm(imm) => {
                        self.alloc.evict(&mut e, dest)?;
                        e.movi(Size::Qword, RegMem::reg(dest), imm)?;
                    }
                    CallArg::Reg(r) => {
                        self.alloc.evict(&mut e, dest)?;
                        if r != dest {
                            e.movr(Size::Qword, RegMem::reg(dest), RegMem::reg(r))?;
                        }
                    }
                }
                self.alloc.pin(dest);
                pins.push(dest);
            }
            self.alloc.flush_volatile_regs(&mut e)?;
            self.alloc.store_all_regs(&mut e)?;
            self.alloc.evict(&mut e, Gpr::Rdi)?;
            e.movr(Size::Qword, RegMem::reg(Gpr::Rdi), RegMem::reg(BASE_REG))?;
            let rel = (target as i64).wrapping_sub(e.abs_cursor() as i64);
            if fits_i32(rel.wrapping_sub(5)) {
                e.call(rel, None)?;
            } else {
                e.movi(Size::Qword, RegMem::reg(SCRATCH_REG), target as i64)?;
                e.callr(RegMem::reg(SCRATCH_REG))?;
            }
            Ok(())
        })();
        for r in pins {
            self.alloc.unpin(r);
        }
        res?;
        self.alloc.invalidate_volatile();
        let ret = self.alloc.new_scratch("retval", Size::Qword);
        self.alloc.assign(&ret, Gpr::Rax);
        self.alloc.mark_dirty_reg(Gpr::Rax);
        debug!("call {target:p} with {} explicit arg(s)", args.len());
        Ok(ret)
    }

    /// Return with whatever RAX holds.
    pub fn gen_ret(&mut self) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        self.alloc.store_all_regs(&mut e)?;
        let mut fix = Fixup::default();
        e.jmpi(0, true, Some(&mut fix))?;
        self.exit.attach(fix);
        self.pending += 1;
        Ok(())
    }

    /// Return the value: fetched into RAX, all dirty state flushed, then a
    /// jump to the shared epilogue.
    pub fn gen_ret_val(&mut self, val: &Value) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        self.alloc.fetch(&mut e, val, Some(Gpr::Rax))?;
        self.alloc.store_all_regs(&mut e)?;
        let mut fix = Fixup::default();
        e.jmpi(0, true, Some(&mut fix))?;
        self.exit.attach(fix);
        self.pending += 1;
        Ok(())
    }

    /// Return a constant.
    pub fn gen_ret_imm(&mut self, imm: i64) -> Result<()> {
        self.ensure_emitting()?;
        let mut e = Emitter::new(self.buf.get());
        self.alloc.store_all_regs(&mut e)?;
        self.alloc.evict(&mut e, Gpr::Rax)?;
        e.movi(Size::Qword, RegMem::reg(Gpr::Rax), imm)?;
        let mut fix = Fixup::default();
        e.jmpi(0, true, Some(&mut fix))?;
        self.exit.attach(fix);
        self.pending += 1;
        Ok(())
    }
}

fn imm_fits(imm: i64, size: Size) -> bool {
    match size {
        Size::Qword => true,
        Size::Dword => i32::try_from(imm).is_ok() || u32::try_from(imm).is_ok(),
        Size::Word => i16::try_from(imm).is_ok() || u16::try_from(imm).is_ok(),
        Size::Byte => i8::try_from(imm).is_ok() || u8::try_from(imm).is_ok(),
    }
}
