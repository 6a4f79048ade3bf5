//! Errors reported during code generation.

use thiserror::Error;

/// Everything that can go wrong while emitting or finalizing a function.
///
/// None of these are recoverable: emission already performed stays in the
/// buffer, and callers are expected to discard the whole function.
#[derive(Debug, Error)]
pub enum Error {
    /// The code buffer has no room left for the next instruction.
    #[error("code buffer capacity exhausted")]
    BufferFull,

    /// An operand kind or width is incompatible with the requested
    /// instruction, or a value was used after it was freed or clobbered.
    #[error("invalid operand: {0}")]
    InvalidOperand(&'static str),

    /// A register demand could not be satisfied because every candidate is
    /// pinned or is a scratch without a home to spill to.
    #[error("no spillable register available")]
    OutOfRegisters,

    /// A near (8-bit) branch was chosen but the resolved displacement does
    /// not fit; re-emit with `far = true`.
    #[error("branch displacement does not fit in 8 bits")]
    DisplacementTooLarge,

    /// `finish()` was called while forward references to unplaced labels
    /// remain in the buffer.
    #[error("{0} forward reference(s) to unplaced labels at finish")]
    UnplacedLabel(usize),

    /// A label was placed twice.
    #[error("label '{0}' placed twice")]
    LabelRebound(String),

    /// An emitting operation was attempted on a finished function.
    #[error("function is finished, no further emission is allowed")]
    FunctionSealed,

    /// The executable mapping for the code buffer could not be created.
    #[error("executable mapping failed (errno {0})")]
    MapFailed(i32),
}

pub type Result<T> = std::result::Result<T, Error>;
