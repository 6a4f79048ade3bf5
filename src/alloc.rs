//! The demand-driven register allocator.
//!
//! Values live in registers while they can; when the file runs dry the
//! least-recently-used unpinned register is spilled to its owner's home.
//! Registers are handed out caller-saved first so short functions avoid
//! touching the callee-saved set. Between operations the allocator
//! invariant holds: every register has at most one owner, and every
//! register-resident value is the owner of its register.

use log::trace;

use crate::emit::Emitter;
use crate::error::{Error, Result};
use crate::reg::{Gpr, RegMem, Size, ALLOCATABLE, BASE_REG, CALLER_SAVED, SCRATCH_REG};
use crate::value::{Home, Value, ValueKind, ValueSlot};

pub(crate) struct RegAlloc {
    owner: [Option<u32>; 16],
    stamp: [u64; 16],
    pins: [u32; 16],
    clock: u64,
    values: Vec<ValueSlot>,
    /// Bump pointer for local slots in the data region.
    slot_top: i32,
}

impl RegAlloc {
    pub fn new() -> RegAlloc {
        RegAlloc {
            owner: [None; 16],
            stamp: [0; 16],
            pins: [0; 16],
            clock: 0,
            values: Vec::new(),
            slot_top: 0,
        }
    }

    // --- value registration ---

    fn register(&mut self, name: &str, size: Size, kind: ValueKind, home: Home) -> Value {
        let id = self.values.len() as u32;
        self.values.push(ValueSlot {
            name: name.to_owned(),
            size,
            kind,
            home,
            reg: None,
            dirty: false,
            dead: false,
        });
        Value::new(id)
    }

    /// Register a local value and assign it a slot in the data region.
    /// Slots are 8 bytes regardless of width.
    pub fn new_local(&mut self, name: &str, size: Size) -> Value {
        let slot = self.slot_top;
        self.slot_top += 8;
        self.register(name, size, ValueKind::Local, Home::Slot(slot))
    }

    /// Register a global value backed by a fixed address.
    pub fn new_global(&mut self, name: &str, size: Size, addr: u64) -> Value {
        self.register(name, size, ValueKind::Global, Home::Addr(addr))
    }

    /// Register a register-only scratch value.
    pub fn new_scratch(&mut self, name: &str, size: Size) -> Value {
        self.register(name, size, ValueKind::Scratch, Home::None)
    }

    /// Bytes of the data region consumed by local slots so far.
    pub fn local_bytes(&self) -> usize {
        self.slot_top as usize
    }

    // --- accessors ---

    fn slot(&self, val: &Value) -> &ValueSlot {
        &self.values[val.id as usize]
    }

    fn slot_mut(&mut self, val: &Value) -> &mut ValueSlot {
        &mut self.values[val.id as usize]
    }

    pub fn size_of(&self, val: &Value) -> Size {
        self.slot(val).size
    }

    pub fn kind_of(&self, val: &Value) -> ValueKind {
        self.slot(val).kind
    }

    pub fn name_of<'s>(&'s self, val: &Value) -> &'s str {
        &self.slot(val).name
    }

    pub fn reg_of(&self, val: &Value) -> Option<Gpr> {
        self.slot(val).reg
    }

    pub fn is_dirty(&self, val: &Value) -> bool {
        self.slot(val).dirty
    }

    fn check_alive(&self, val: &Value) -> Result<()> {
        if self.slot(val).dead {
            return Err(Error::InvalidOperand("value used after free or call clobber"));
        }
        Ok(())
    }

    // --- pinning ---

    pub fn pin(&mut self, r: Gpr) {
        self.pins[r.enc() as usize] += 1;
    }

    pub fn unpin(&mut self, r: Gpr) {
        debug_assert!(self.pins[r.enc() as usize] > 0);
        self.pins[r.enc() as usize] -= 1;
    }

    fn is_pinned(&self, r: Gpr) -> bool {
        self.pins[r.enc() as usize] > 0
    }

    fn touch(&mut self, r: Gpr) {
        self.clock += 1;
        self.stamp[r.enc() as usize] = self.clock;
    }

    // --- core operations ---

    /// An operand addressing the value's current location: its register if
    /// resident, the base-pointer slot for locals, otherwise the value is
    /// fetched (globals have no cheap memory operand under absolute
    /// addressing, and scratches have no home at all).
    pub fn operand_rm(&mut self, e: &mut Emitter<'_>, val: &Value) -> Result<RegMem> {
        self.check_alive(val)?;
        if let Some(r) = self.slot(val).reg {
            self.touch(r);
            return Ok(RegMem::reg(r));
        }
        match self.slot(val).home {
            Home::Slot(off) => Ok(RegMem::mem(BASE_REG, off)),
            _ => Ok(RegMem::reg(self.fetch(e, val, None)?)),
        }
    }

    /// Ensure the value is in a register and return it, honoring a
    /// preferred register if one is given.
    pub fn fetch(&mut self, e: &mut Emitter<'_>, val: &Value, pref: Option<Gpr>) -> Result<Gpr> {
        self.fetch_inner(e, val, pref, true)
    }

    /// Like [`fetch`](Self::fetch) but skips populating the register; for
    /// destinations that are fully overwritten.
    pub fn fetch_write(
        &mut self,
        e: &mut Emitter<'_>,
        val: &Value,
        pref: Option<Gpr>,
    ) -> Result<Gpr> {
        self.fetch_inner(e, val, pref, false)
    }

    fn fetch_inner(
        &mut self,
        e: &mut Emitter<'_>,
        val: &Value,
        pref: Option<Gpr>,
        load: bool,
    ) -> Result<Gpr> {
        self.check_alive(val)?;
        if let Some(p) = pref {
            if !ALLOCATABLE.contains(&p) {
                return Err(Error::InvalidOperand("reserved register requested"));
            }
        }
        let cur = self.slot(val).reg;
        match (cur, pref) {
            (Some(r), None) => {
                self.touch(r);
                Ok(r)
            }
            (Some(r), Some(p)) if r == p => {
                self.touch(r);
                Ok(r)
            }
            (Some(r), Some(p)) => {
                self.evict(e, p)?;
                e.movr(self.slot(val).size, RegMem::reg(p), RegMem::reg(r))?;
                self.owner[r.enc() as usize] = None;
                self.owner[p.enc() as usize] = Some(val.id);
                self.slot_mut(val).reg = Some(p);
                self.touch(p);
                trace!("move '{}' {} -> {}", self.name_of(val), r, p);
                Ok(p)
            }
            (None, pref) => {
                let r = match pref {
                    Some(p) => {
                        self.evict(e, p)?;
                        p
                    }
                    None => self.pick(e)?,
                };
                self.owner[r.enc() as usize] = Some(val.id);
                self.slot_mut(val).reg = Some(r);
                self.touch(r);
                if load {
                    self.populate(e, val, r)?;
                }
                Ok(r)
            }
        }
    }

    /// Load a value's home contents into `r`.
    fn populate(&mut self, e: &mut Emitter<'_>, val: &Value, r: Gpr) -> Result<()> {
        let size = self.slot(val).size;
        match self.slot(val).home {
            Home::Slot(off) => {
                e.movr(size, RegMem::reg(r), RegMem::mem(BASE_REG, off))?;
                trace!("reload '{}' from [{BASE_REG}+{off}] into {r}", self.name_of(val));
            }
            Home::Addr(addr) => {
                e.movi(Size::Qword, RegMem::reg(SCRATCH_REG), addr as i64)?;
                e.movr(size, RegMem::reg(r), RegMem::mem(SCRATCH_REG, 0))?;
                trace!("reload '{}' from {addr:#x} into {r}", self.name_of(val));
            }
            Home::None => {}
        }
        Ok(())
    }

    /// Write a resident value back to its home and clear the dirty flag.
    fn write_back(&mut self, e: &mut Emitter<'_>, id: u32) -> Result<()> {
        let size = self.values[id as usize].size;
        let reg = self.values[id as usize]
            .reg
            .expect("write-back of a value without a register");
        match self.values[id as usize].home {
            Home::Slot(off) => {
                e.movr(size, RegMem::mem(BASE_REG, off), RegMem::reg(reg))?;
            }
            Home::Addr(addr) => {
                e.movi(Size::Qword, RegMem::reg(SCRATCH_REG), addr as i64)?;
                e.movr(size, RegMem::mem(SCRATCH_REG, 0), RegMem::reg(reg))?;
            }
            Home::None => {
                return Err(Error::InvalidOperand("scratch value has no home to store to"));
            }
        }
        self.values[id as usize].dirty = false;
        Ok(())
    }

    /// Pick a register for a new resident, spilling if necessary.
    fn pick(&mut self, e: &mut Emitter<'_>) -> Result<Gpr> {
        // Free register first; ALLOCATABLE is ordered caller-saved before
        // callee-saved, so scan in blocks and take the least recently used
        // free one of the best block.
        let mut best: Option<Gpr> = None;
        let mut best_caller = false;
        for &r in &ALLOCATABLE {
            if self.owner[r.enc() as usize].is_some() || self.is_pinned(r) {
                continue;
            }
            let caller = r.is_caller_saved();
            let better = match best {
                None => true,
                Some(b) => {
                    (caller && !best_caller)
                        || (caller == best_caller
                            && self.stamp[r.enc() as usize] < self.stamp[b.enc() as usize])
                }
            };
            if better {
                best = Some(r);
                best_caller = caller;
            }
        }
        if let Some(r) = best {
            return Ok(r);
        }

        // Spill the least-recently-used unpinned victim that has a home.
        let mut victim: Option<Gpr> = None;
        for &r in &ALLOCATABLE {
            if self.is_pinned(r) {
                continue;
            }
            let Some(id) = self.owner[r.enc() as usize] else {
                continue;
            };
            if self.values[id as usize].home == Home::None {
                continue;
            }
            let better = match victim {
                None => true,
                Some(v) => self.stamp[r.enc() as usize] < self.stamp[v.enc() as usize],
            };
            if better {
                victim = Some(r);
            }
        }
        let r = victim.ok_or(Error::OutOfRegisters)?;
        self.spill(e, r)?;
        Ok(r)
    }

    /// Release `r` from its owner, writing the value back first if dirty.
    fn spill(&mut self, e: &mut Emitter<'_>, r: Gpr) -> Result<()> {
        if let Some(id) = self.owner[r.enc() as usize] {
            if self.values[id as usize].dirty {
                self.write_back(e, id)?;
            }
            trace!("spill '{}' out of {r}", self.values[id as usize].name);
            self.values[id as usize].reg = None;
            self.owner[r.enc() as usize] = None;
        }
        Ok(())
    }

    /// Forcibly free a specific register for ABI use. Fails if it is
    /// pinned or holds a register-only scratch.
    pub fn evict(&mut self, e: &mut Emitter<'_>, r: Gpr) -> Result<()> {
        if self.is_pinned(r) {
            return Err(Error::OutOfRegisters);
        }
        if let Some(id) = self.owner[r.enc() as usize] {
            if self.values[id as usize].home == Home::None {
                return Err(Error::OutOfRegisters);
            }
        }
        self.spill(e, r)
    }

    /// Give `val` ownership of `r` without loading anything; `r` must be
    /// free.
    pub fn assign(&mut self, val: &Value, r: Gpr) {
        debug_assert!(self.owner[r.enc() as usize].is_none(), "assign to owned register");
        self.owner[r.enc() as usize] = Some(val.id);
        self.slot_mut(val).reg = Some(r);
        self.touch(r);
    }

    /// Write a dirty resident value back to its home and clear the dirty
    /// flag; a no-op for clean or homeless values.
    pub fn store(&mut self, e: &mut Emitter<'_>, val: &Value) -> Result<()> {
        self.check_alive(val)?;
        if self.slot(val).dirty && self.slot(val).reg.is_some() && self.slot(val).home != Home::None
        {
            self.write_back(e, val.id)?;
        }
        Ok(())
    }

    /// Flush if needed, release the register, and kill the slot.
    pub fn free_value(&mut self, e: &mut Emitter<'_>, val: &Value) -> Result<()> {
        self.check_alive(val)?;
        if self.slot(val).dirty && self.slot(val).home != Home::None {
            self.write_back(e, val.id)?;
        }
        if let Some(r) = self.slot(val).reg {
            self.owner[r.enc() as usize] = None;
            self.slot_mut(val).reg = None;
        }
        self.slot_mut(val).dead = true;
        trace!("free '{}'", self.name_of(val));
        Ok(())
    }

    pub fn mark_dirty(&mut self, val: &Value) {
        self.slot_mut(val).dirty = true;
    }

    /// Mark the value owning `r` dirty, if any.
    pub fn mark_dirty_reg(&mut self, r: Gpr) {
        if let Some(id) = self.owner[r.enc() as usize] {
            self.values[id as usize].dirty = true;
        }
    }

    /// Store every dirty caller-saved-resident value to its home, keeping
    /// ownership; the registers themselves are invalidated after the call
    /// via [`invalidate_volatile`](Self::invalidate_volatile).
    pub fn flush_volatile_regs(&mut self, e: &mut Emitter<'_>) -> Result<()> {
        for &r in &CALLER_SAVED {
            if let Some(id) = self.owner[r.enc() as usize] {
                if self.values[id as usize].dirty && self.values[id as usize].home != Home::None {
                    self.write_back(e, id)?;
                }
            }
        }
        Ok(())
    }

    /// Store every dirty value that has a home.
    pub fn store_all_regs(&mut self, e: &mut Emitter<'_>) -> Result<()> {
        for id in 0..self.values.len() as u32 {
            let v = &self.values[id as usize];
            if !v.dead && v.reg.is_some() && v.dirty && v.home != Home::None {
                self.write_back(e, id)?;
            }
        }
        Ok(())
    }

    /// After a call: caller-saved register contents are gone. Owners lose
    /// residency and reload from home on the next fetch; homeless scratches
    /// are dead.
    pub fn invalidate_volatile(&mut self) {
        for &r in &CALLER_SAVED {
            if let Some(id) = self.owner[r.enc() as usize].take() {
                let v = &mut self.values[id as usize];
                v.reg = None;
                if v.home == Home::None {
                    v.dead = true;
                    trace!("scratch '{}' clobbered by call", v.name);
                }
            }
        }
    }

    /// Debug check of the allocator invariant.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        for (enc, owner) in self.owner.iter().enumerate() {
            if let Some(id) = owner {
                let v = &self.values[*id as usize];
                assert_eq!(v.reg.map(Gpr::enc), Some(enc as u8));
                assert!(!v.dead);
            }
        }
        for (id, v) in self.values.iter().enumerate() {
            if let Some(r) = v.reg {
                assert_eq!(self.owner[r.enc() as usize], Some(id as u32));
            }
            if v.dirty {
                assert!(v.reg.is_some());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::CodeBuffer;

    fn setup() -> (CodeBuffer, RegAlloc) {
        (CodeBuffer::new(4096).unwrap(), RegAlloc::new())
    }

    #[test]
    fn fetch_prefers_free_caller_saved() {
        let (mut buf, mut alloc) = setup();
        let mut e = Emitter::new(&mut buf);
        let a = alloc.new_local("a", Size::Qword);
        let r = alloc.fetch(&mut e, &a, None).unwrap();
        assert!(r.is_caller_saved());
        assert_eq!(alloc.reg_of(&a), Some(r));
        alloc.check_invariants();
    }

    #[test]
    fn register_file_exhaustion_spills_lru() {
        let (mut buf, mut alloc) = setup();
        let mut e = Emitter::new(&mut buf);
        let vals: Vec<_> = (0..ALLOCATABLE.len() + 1)
            .map(|i| alloc.new_local(&format!("v{i}"), Size::Qword))
            .collect();
        for v in &vals {
            let r = alloc.fetch(&mut e, v, None).unwrap();
            alloc.mark_dirty_reg(r);
        }
        // the first-fetched value was least recently used and lost its seat
        assert_eq!(alloc.reg_of(&vals[0]), None);
        assert!(!alloc.is_dirty(&vals[0]));
        alloc.check_invariants();
    }

    #[test]
    fn pinned_scratches_exhaust_the_file() {
        let (mut buf, mut alloc) = setup();
        let mut e = Emitter::new(&mut buf);
        for i in 0..ALLOCATABLE.len() {
            let v = alloc.new_scratch(&format!("s{i}"), Size::Qword);
            let r = alloc.fetch(&mut e, &v, None).unwrap();
            alloc.pin(r);
            std::mem::forget(v);
        }
        let extra = alloc.new_local("x", Size::Qword);
        assert!(matches!(
            alloc.fetch(&mut e, &extra, None),
            Err(Error::OutOfRegisters)
        ));
    }

    #[test]
    fn preference_moves_the_value() {
        let (mut buf, mut alloc) = setup();
        let mut e = Emitter::new(&mut buf);
        let a = alloc.new_local("a", Size::Dword);
        let first = alloc.fetch(&mut e, &a, None).unwrap();
        assert_ne!(first, Gpr::R10);
        let moved = alloc.fetch(&mut e, &a, Some(Gpr::R10)).unwrap();
        assert_eq!(moved, Gpr::R10);
        assert_eq!(alloc.reg_of(&a), Some(Gpr::R10));
        alloc.check_invariants();
    }

    #[test]
    fn free_value_kills_the_handle() {
        let (mut buf, mut alloc) = setup();
        let mut e = Emitter::new(&mut buf);
        let a = alloc.new_local("a", Size::Dword);
        alloc.fetch(&mut e, &a, None).unwrap();
        alloc.free_value(&mut e, &a).unwrap();
        assert!(matches!(
            alloc.fetch(&mut e, &a, None),
            Err(Error::InvalidOperand(_))
        ));
        alloc.check_invariants();
    }

    #[test]
    fn call_clobber_kills_homeless_scratches() {
        let (mut buf, mut alloc) = setup();
        let mut e = Emitter::new(&mut buf);
        let s = alloc.new_scratch("s", Size::Qword);
        let r = alloc.fetch(&mut e, &s, None).unwrap();
        assert!(r.is_caller_saved());
        alloc.invalidate_volatile();
        assert!(matches!(
            alloc.fetch(&mut e, &s, None),
            Err(Error::InvalidOperand(_))
        ));
    }

    #[test]
    fn store_is_idempotent_for_state() {
        let (mut buf, mut alloc) = setup();
        let mut e = Emitter::new(&mut buf);
        let a = alloc.new_local("a", Size::Dword);
        alloc.fetch(&mut e, &a, None).unwrap();
        alloc.mark_dirty(&a);
        alloc.store(&mut e, &a).unwrap();
        assert!(!alloc.is_dirty(&a));
        let cursor = e.cursor();
        alloc.store(&mut e, &a).unwrap();
        // the value is clean now, so the second store emits nothing
        assert_eq!(e.cursor(), cursor);
        assert!(!alloc.is_dirty(&a));
        alloc.check_invariants();
    }
}
