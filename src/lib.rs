//! A fast, lightweight JIT code generator for x86-64.
//!
//! `featherjit` synthesizes short native functions at runtime without the
//! weight of a full compiler backend: no IR, no optimizer, just a direct
//! path from abstract operations to machine bytes in an executable buffer.
//! It targets emulators, DSL interpreters, and runtime specializers.
//!
//! Three tightly coupled pieces do the real work:
//!
//! - the **instruction encoder** ([`Emitter`]), which produces x86-64
//!   opcodes with correct REX/ModRM/SIB/displacement/immediate layout;
//! - the **register allocator**, which maps named [`Value`]s onto the
//!   general-purpose registers on demand, spilling and reloading against
//!   each value's home location while honoring the System V AMD64 calling
//!   convention;
//! - the **label/fixup machinery** ([`Label`], [`Fixup`]), which lets
//!   forward branches be emitted before their targets exist and patches
//!   them on placement.
//!
//! The user-facing surface is [`Jit`] (a long-lived buffer producing many
//! functions) and [`Function`] (one emission context). Generated functions
//! are called as `i64 fn(void* data)`; the data pointer doubles as the
//! backing region for local values and is forwarded to every nested call.
//!
//! ```no_run
//! use featherjit::Function;
//!
//! let mut f = Function::new("add2", 4096)?;
//! let a = f.gen_local_i32("a", 40)?;
//! let b = f.gen_local_i32("b", 2)?;
//! f.gen_add(&a, &b)?;
//! f.gen_ret_val(&a)?;
//! assert_eq!(f.exec()?, 42);
//! # featherjit::Result::Ok(())
//! ```

mod alloc;
mod bits;
mod buffer;
mod emit;
mod error;
mod func;
mod label;
mod reg;
mod rex;
mod value;

pub use bits::{encode_size, encode_size_unsigned, fits_i16, fits_i32, fits_i8, is_pow2, log2i};
pub use buffer::CodeBuffer;
pub use emit::{AluOp, BitOp, Cond, Emitter, ShiftOp};
pub use error::{Error, Result};
pub use func::{CallArg, Function, Jit, JitFn};
pub use label::{Fixup, FixupWidth, Label};
pub use reg::{
    arg_reg, Gpr, RegMem, Size, ALLOCATABLE, ARG_REGS, BASE_REG, CALLEE_SAVED, CALLER_SAVED,
    RETURN_REG, SCRATCH_REG,
};
pub use value::{Value, ValueKind};
