//! Encoding primitives for the REX prefix, ModR/M, SIB, and displacements.

use crate::reg::Size;

/// Encode the ModR/M byte.
#[inline]
pub(crate) fn encode_modrm(m0d: u8, reg_g: u8, rm_e: u8) -> u8 {
    debug_assert!(m0d < 4);
    debug_assert!(reg_g < 8);
    debug_assert!(rm_e < 8);
    (m0d << 6) | (reg_g << 3) | rm_e
}

/// Encode the SIB byte (scale-index-base).
#[inline]
pub(crate) fn encode_sib(scale: u8, enc_index: u8, enc_base: u8) -> u8 {
    debug_assert!(scale < 4);
    debug_assert!(enc_index < 8);
    debug_assert!(enc_base < 8);
    (scale << 6) | (enc_index << 3) | enc_base
}

/// A small bit field recording a REX prefix specification:
/// - bit 0 set means REX.W must be 0 (cleared);
/// - bit 1 set means the prefix must be emitted even if otherwise empty.
#[derive(Clone, Copy)]
pub(crate) struct RexFlags(u8);

impl RexFlags {
    /// Set the W field (64-bit operand size).
    #[inline]
    pub fn set_w() -> Self {
        Self(0)
    }

    /// Clear the W field.
    #[inline]
    pub fn clear_w() -> Self {
        Self(1)
    }

    /// W per the operand size: set only for quadword.
    #[inline]
    pub fn for_size(size: Size) -> Self {
        if size == Size::Qword {
            Self::set_w()
        } else {
            Self::clear_w()
        }
    }

    #[inline]
    fn must_clear_w(self) -> bool {
        (self.0 & 1) != 0
    }

    /// Require that the prefix is emitted.
    #[inline]
    pub fn always_emit(&mut self) -> &mut Self {
        self.0 |= 2;
        self
    }

    #[inline]
    fn must_always_emit(self) -> bool {
        (self.0 & 2) != 0
    }

    /// Force emission if a byte access names `rsp`, `rbp`, `rsi` or `rdi`;
    /// without REX those encodings select `ah`..`bh` instead of
    /// `spl`..`dil`.
    pub fn always_emit_if_8bit_needed(&mut self, enc: u8) {
        if (4..=7).contains(&enc) {
            self.always_emit();
        }
    }

    /// Compute the prefix byte for (reg, index, base) encodings, or `None`
    /// when no prefix is needed.
    #[inline]
    pub fn byte(self, enc_g: u8, enc_index: u8, enc_e: u8) -> Option<u8> {
        let w: u8 = if self.must_clear_w() { 0 } else { 1 };
        let r = (enc_g >> 3) & 1;
        let x = (enc_index >> 3) & 1;
        let b = (enc_e >> 3) & 1;
        let rex = 0x40 | (w << 3) | (r << 2) | (x << 1) | b;
        if rex != 0x40 || self.must_always_emit() {
            Some(rex)
        } else {
            None
        }
    }
}

/// Classification of a memory displacement into the three ModRM forms.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Disp {
    None,
    D8(i8),
    D32(i32),
}

impl Disp {
    pub fn new(disp: i32) -> Disp {
        if disp == 0 {
            return Disp::None;
        }
        match i8::try_from(disp) {
            Ok(v) => Disp::D8(v),
            Err(_) => Disp::D32(disp),
        }
    }

    /// Force `None` to `D8(0)`; bases whose low bits collide with the
    /// RIP-relative encoding (`rbp`, `r13`) require an explicit byte.
    pub fn force_d8(&mut self) {
        if let Disp::None = self {
            *self = Disp::D8(0);
        }
    }

    /// The two mod bits this displacement selects.
    pub fn m0d(self) -> u8 {
        match self {
            Disp::None => 0b00,
            Disp::D8(_) => 0b01,
            Disp::D32(_) => 0b10,
        }
    }
}
