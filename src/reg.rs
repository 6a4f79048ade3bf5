//! Register identities, operand sizes, and the register-or-memory operand.

use std::fmt;

/// A general purpose x86-64 register with its hardware encoding (0..15).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
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
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

/// Register receiving the return value of generated code (System V).
pub const RETURN_REG: Gpr = Gpr::Rax;

/// Register holding the runtime data pointer inside generated code; local
/// values are addressed as displacements off this register. Never
/// allocatable.
pub const BASE_REG: Gpr = Gpr::Rbp;

/// Register reserved for encoder-internal absolute addressing (global
/// loads/stores, out-of-range call targets). Never allocatable.
pub const SCRATCH_REG: Gpr = Gpr::R11;

/// System V AMD64 integer argument registers, in order.
pub const ARG_REGS: [Gpr; 6] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];

/// Registers a called function may clobber.
pub const CALLER_SAVED: [Gpr; 9] = [
    Gpr::Rax,
    Gpr::Rcx,
    Gpr::Rdx,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::R11,
];

/// Registers a called function must preserve.
pub const CALLEE_SAVED: [Gpr; 5] = [Gpr::Rbx, Gpr::R12, Gpr::R13, Gpr::R14, Gpr::R15];

/// Registers the allocator may hand out, caller-saved first so leaf code
/// avoids the prologue save cost. Excludes RSP, the base register, and the
/// encoder scratch.
pub const ALLOCATABLE: [Gpr; 13] = [
    Gpr::Rax,
    Gpr::Rcx,
    Gpr::Rdx,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::Rbx,
    Gpr::R12,
    Gpr::R13,
    Gpr::R14,
    Gpr::R15,
];

impl Gpr {
    pub const ALL: [Gpr; 16] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    /// The register's hardware encoding, 0..15.
    #[inline]
    pub fn enc(self) -> u8 {
        self as u8
    }

    /// Recover a register from its hardware encoding.
    ///
    /// # Panics
    ///
    /// Panics if `enc` is not a valid x86-64 register encoding.
    pub fn from_enc(enc: u8) -> Gpr {
        Self::ALL[usize::from(enc)]
    }

    pub fn is_caller_saved(self) -> bool {
        CALLER_SAVED.contains(&self)
    }

    pub fn is_callee_saved(self) -> bool {
        CALLEE_SAVED.contains(&self)
    }

    /// Return the register name at the given access `size`.
    pub fn name(self, size: Size) -> &'static str {
        use Size::{Byte, Dword, Qword, Word};
        match self {
            Gpr::Rax => match size {
                Byte => "al",
                Word => "ax",
                Dword => "eax",
                Qword => "rax",
            },
            Gpr::Rcx => match size {
                Byte => "cl",
                Word => "cx",
                Dword => "ecx",
                Qword => "rcx",
            },
            Gpr::Rdx => match size {
                Byte => "dl",
                Word => "dx",
                Dword => "edx",
                Qword => "rdx",
            },
            Gpr::Rbx => match size {
                Byte => "bl",
                Word => "bx",
                Dword => "ebx",
                Qword => "rbx",
            },
            Gpr::Rsp => match size {
                Byte => "spl",
                Word => "sp",
                Dword => "esp",
                Qword => "rsp",
            },
            Gpr::Rbp => match size {
                Byte => "bpl",
                Word => "bp",
                Dword => "ebp",
                Qword => "rbp",
            },
            Gpr::Rsi => match size {
                Byte => "sil",
                Word => "si",
                Dword => "esi",
                Qword => "rsi",
            },
            Gpr::Rdi => match size {
                Byte => "dil",
                Word => "di",
                Dword => "edi",
                Qword => "rdi",
            },
            Gpr::R8 => match size {
                Byte => "r8b",
                Word => "r8w",
                Dword => "r8d",
                Qword => "r8",
            },
            Gpr::R9 => match size {
                Byte => "r9b",
                Word => "r9w",
                Dword => "r9d",
                Qword => "r9",
            },
            Gpr::R10 => match size {
                Byte => "r10b",
                Word => "r10w",
                Dword => "r10d",
                Qword => "r10",
            },
            Gpr::R11 => match size {
                Byte => "r11b",
                Word => "r11w",
                Dword => "r11d",
                Qword => "r11",
            },
            Gpr::R12 => match size {
                Byte => "r12b",
                Word => "r12w",
                Dword => "r12d",
                Qword => "r12",
            },
            Gpr::R13 => match size {
                Byte => "r13b",
                Word => "r13w",
                Dword => "r13d",
                Qword => "r13",
            },
            Gpr::R14 => match size {
                Byte => "r14b",
                Word => "r14w",
                Dword => "r14d",
                Qword => "r14",
            },
            Gpr::R15 => match size {
                Byte => "r15b",
                Word => "r15w",
                Dword => "r15d",
                Qword => "r15",
            },
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name(Size::Qword))
    }
}

/// The System V argument register for position `argno` (0-based).
///
/// Returns `None` beyond the six register-passed arguments; this generator
/// does not spill arguments to the stack.
pub fn arg_reg(argno: usize) -> Option<Gpr> {
    ARG_REGS.get(argno).copied()
}

/// An operand access width.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Size {
    /// 8-bit access.
    Byte,
    /// 16-bit access.
    Word,
    /// 32-bit access.
    Dword,
    /// 64-bit access.
    Qword,
}

impl Size {
    pub fn bits(self) -> u32 {
        match self {
            Size::Byte => 8,
            Size::Word => 16,
            Size::Dword => 32,
            Size::Qword => 64,
        }
    }

    pub fn bytes(self) -> u32 {
        self.bits() / 8
    }

    pub fn from_bits(bits: u32) -> Option<Size> {
        match bits {
            8 => Some(Size::Byte),
            16 => Some(Size::Word),
            32 => Some(Size::Dword),
            64 => Some(Size::Qword),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn is_byte(self) -> bool {
        self == Size::Byte
    }
}

/// A register-or-memory operand.
///
/// The memory form is a base register plus a signed 32-bit displacement;
/// that is the only addressing shape the generator needs (locals off the
/// base pointer, globals off the encoder scratch).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegMem {
    Reg(Gpr),
    Mem { base: Gpr, disp: i32 },
}

impl RegMem {
    pub fn reg(r: Gpr) -> RegMem {
        RegMem::Reg(r)
    }

    pub fn mem(base: Gpr, disp: i32) -> RegMem {
        RegMem::Mem { base, disp }
    }

    pub fn is_reg(&self) -> bool {
        matches!(self, RegMem::Reg(_))
    }

    /// The encoding that lands in ModRM.rm (or SIB.base): the register
    /// itself, or the memory operand's base.
    #[inline]
    pub(crate) fn enc_e(&self) -> u8 {
        match *self {
            RegMem::Reg(r) => r.enc(),
            RegMem::Mem { base, .. } => base.enc(),
        }
    }
}

impl fmt::Display for RegMem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RegMem::Reg(r) => write!(f, "{r}"),
            RegMem::Mem { base, disp } if disp == 0 => write!(f, "[{base}]"),
            RegMem::Mem { base, disp } if disp < 0 => write!(f, "[{base} - {:#x}]", -i64::from(disp)),
            RegMem::Mem { base, disp } => write!(f, "[{base} + {disp:#x}]"),
        }
    }
}
