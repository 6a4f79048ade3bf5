//! Labels and forward-reference fixups.
//!
//! A branch to a not-yet-placed label emits a zero placeholder and records a
//! [`Fixup`]; placing the label patches every pending site with the
//! PC-relative displacement. Branches to already-placed labels resolve at
//! emission time and never create a fixup.

use smallvec::SmallVec;

use crate::bits::{fits_i32, fits_i8};
use crate::buffer::CodeBuffer;
use crate::error::{Error, Result};

/// Width of the displacement field a fixup patches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixupWidth {
    Rel8,
    Rel32,
}

/// A deferred displacement write: when the target offset becomes known,
/// `target - base` is written at `patch`.
#[derive(Clone, Copy, Debug)]
pub struct Fixup {
    /// Buffer offset of the displacement field.
    pub(crate) patch: usize,
    /// PC-relative base: the offset just past the whole instruction.
    pub(crate) base: usize,
    pub(crate) width: FixupWidth,
}

impl Default for Fixup {
    fn default() -> Fixup {
        Fixup {
            patch: 0,
            base: 0,
            width: FixupWidth::Rel32,
        }
    }
}

/// A branch target: an optional placed offset plus pending fixups.
#[derive(Debug)]
pub struct Label {
    name: String,
    placed: Option<usize>,
    fixups: SmallVec<[Fixup; 4]>,
}

impl Label {
    pub(crate) fn new(name: impl Into<String>) -> Label {
        Label {
            name: name.into(),
            placed: None,
            fixups: SmallVec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_placed(&self) -> bool {
        self.placed.is_some()
    }

    /// The bound buffer offset, once placed.
    pub fn offset(&self) -> Option<usize> {
        self.placed
    }

    pub(crate) fn attach(&mut self, fix: Fixup) {
        debug_assert!(self.placed.is_none(), "fixup attached to a placed label");
        self.fixups.push(fix);
    }

    /// Bind the label to `off` and resolve every pending fixup. Returns how
    /// many fixups were resolved.
    pub(crate) fn place_at(&mut self, buf: &mut CodeBuffer, off: usize) -> Result<usize> {
        if self.placed.is_some() {
            return Err(Error::LabelRebound(self.name.clone()));
        }
        self.placed = Some(off);
        let count = self.fixups.len();
        for fix in self.fixups.drain(..) {
            resolve_fixup(buf, fix, off)?;
        }
        Ok(count)
    }
}

/// Write the displacement `target - base` at the fixup's patch site.
pub(crate) fn resolve_fixup(buf: &mut CodeBuffer, fix: Fixup, target: usize) -> Result<()> {
    let delta = target as i64 - fix.base as i64;
    match fix.width {
        FixupWidth::Rel8 => {
            if !fits_i8(delta) {
                return Err(Error::DisplacementTooLarge);
            }
            buf.patch(fix.patch, &[(delta as i8) as u8]);
        }
        FixupWidth::Rel32 => {
            if !fits_i32(delta) {
                return Err(Error::DisplacementTooLarge);
            }
            buf.patch(fix.patch, &(delta as i32).to_le_bytes());
        }
    }
    Ok(())
}
