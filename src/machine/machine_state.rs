use crate::atom_table::*;
use crate::codegen::MAX_REGS;
use crate::machine::heap::*;
use crate::machine::machine_indices::*;
use crate::machine::stack::*;
use crate::types::*;

use crate::forms::RegType;

use std::ops::{Index, IndexMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MachineMode {
    Read,
    Write,
}

/// The register machine proper: heap, frame stack, trail, and the
/// machine registers. Compiler and dispatcher both go through this
/// struct; there is no ambient machine state anywhere.
#[derive(Debug)]
pub struct MachineState {
    pub atom_tbl: AtomTable,
    pub heap: Heap,
    pub(crate) stack: Stack,
    pub(crate) registers: Vec<HeapCellValue>,
    pub(crate) trail: Vec<Ref>,
    pub(crate) tr: usize,
    pub(crate) hb: usize,
    /// Structure argument pointer for read mode.
    pub(crate) s: usize,
    pub(crate) mode: MachineMode,
    pub(crate) fail: bool,
    pub(crate) top_fail: bool,
    pub(crate) p: CodePtr,
    pub(crate) cp: CodePtr,
    pub(crate) b: usize,
    pub(crate) b0: usize,
    pub(crate) e: usize,
    pub(crate) num_of_args: usize,
    /// The query's base choice point; `b > top_b` iff alternatives
    /// remain.
    pub(crate) top_b: usize,
    pub(crate) cost: u64,
    pub(crate) cost_budget: Option<u64>,
    pub(crate) heap_limit: Option<usize>,
}

impl Index<RegType> for MachineState {
    type Output = HeapCellValue;

    fn index(&self, reg: RegType) -> &Self::Output {
        match reg {
            RegType::Temp(temp) => &self.registers[temp],
            RegType::Perm(perm) => {
                let e = self.e;
                self.stack.index_and_frame(e).cell_ref(perm)
            }
        }
    }
}

impl IndexMut<RegType> for MachineState {
    fn index_mut(&mut self, reg: RegType) -> &mut Self::Output {
        match reg {
            RegType::Temp(temp) => &mut self.registers[temp],
            RegType::Perm(perm) => {
                let e = self.e;
                self.stack.index_and_frame_mut(e).cell_mut(perm)
            }
        }
    }
}

impl MachineState {
    pub(crate) fn new() -> Self {
        MachineState {
            atom_tbl: AtomTable::new(),
            heap: Heap::new(),
            stack: Stack::new(),
            registers: vec![HeapCellValue::Fixnum(0); MAX_REGS],
            trail: vec![],
            tr: 0,
            hb: 0,
            s: 0,
            mode: MachineMode::Write,
            fail: false,
            top_fail: false,
            p: CodePtr::halt(),
            cp: CodePtr::halt(),
            b: 0,
            b0: 0,
            e: 0,
            num_of_args: 0,
            top_b: 0,
            cost: 0,
            cost_budget: None,
            heap_limit: None,
        }
    }

    /// The value stored at an address cell; non-address cells are their
    /// own value.
    #[inline]
    pub fn store(&self, value: HeapCellValue) -> HeapCellValue {
        match value {
            HeapCellValue::Var(h) => self.heap[h],
            HeapCellValue::StackVar(fr, sc) => self.stack.index_and_frame(fr).cell(sc),
            _ => value,
        }
    }

    /// Follows the reference chain from `addr` until a cell whose stored
    /// value is not a further reference, returning the final *address*.
    pub fn deref(&self, mut addr: HeapCellValue) -> HeapCellValue {
        loop {
            let value = self.store(addr);

            if value.is_var() && value != addr {
                addr = value;
                continue;
            }

            return addr;
        }
    }

    fn write_ref(&mut self, r: Ref, value: HeapCellValue) {
        match r {
            Ref::HeapCell(h) => self.heap[h] = value,
            Ref::StackCell(fr, sc) => *self.stack.index_and_frame_mut(fr).cell_mut(sc) = value,
        }
    }

    /// Records a binding for undo iff the bound cell predates the
    /// current choice point's watermark; younger cells vanish by heap or
    /// stack truncation on backtracking and need no trail entry.
    pub(crate) fn trail(&mut self, r: Ref) {
        match r {
            Ref::HeapCell(h) => {
                if h < self.hb {
                    self.trail.push(r);
                    self.tr += 1;
                }
            }
            Ref::StackCell(fr, _) => {
                if fr < self.b {
                    self.trail.push(r);
                    self.tr += 1;
                }
            }
        }
    }

    /// Binds the unbound cell at `r`. When both sides are unbound the
    /// younger is pointed at the older, stack cells counting as younger
    /// than all heap cells, so no heap cell ever references the stack.
    pub fn bind(&mut self, r: Ref, value: HeapCellValue) {
        let t2 = self.store(value);

        match t2.as_var() {
            Some(r2) => {
                if r == r2 {
                    return;
                }

                if r2 < r {
                    self.write_ref(r, r2.as_heap_cell_value());
                    self.trail(r);
                } else {
                    self.write_ref(r2, r.as_heap_cell_value());
                    self.trail(r2);
                }
            }
            None => {
                self.write_ref(r, t2);
                self.trail(r);
            }
        }
    }

    /// Unifies two terms. On failure every binding made during the
    /// attempt is unwound before returning, so a failed unification of a
    /// structure's later arguments leaves no earlier-argument bindings
    /// live. Cost is metered per visited pair, big integers per limb.
    pub fn unify(&mut self, a1: HeapCellValue, a2: HeapCellValue) -> bool {
        let old_tr = self.tr;
        let mut pdl = vec![a1, a2];

        while let Some(d1) = pdl.pop() {
            let d2 = pdl.pop().unwrap();

            let d1 = self.deref(d1);
            let d2 = self.deref(d2);

            if d1 == d2 {
                continue;
            }

            self.cost += 1;

            let v1 = self.store(d1);
            let v2 = self.store(d2);

            if let Some(r1) = v1.as_var() {
                self.bind(r1, d2);
                continue;
            }

            if let Some(r2) = v2.as_var() {
                self.bind(r2, d1);
                continue;
            }

            let matched = match (v1, v2) {
                (HeapCellValue::Atom(n1, a1), HeapCellValue::Atom(n2, a2)) => {
                    n1 == n2 && a1 == a2
                }
                (HeapCellValue::Fixnum(n1), HeapCellValue::Fixnum(n2)) => n1 == n2,
                (HeapCellValue::Big(h1), HeapCellValue::Big(h2)) => {
                    self.heap.compare_bigs(h1, h2, &mut self.cost)
                }
                (HeapCellValue::CutPoint(c1), HeapCellValue::CutPoint(c2)) => c1 == c2,
                (HeapCellValue::Lis(l1), HeapCellValue::Lis(l2)) => {
                    pdl.push(HeapCellValue::Var(l1));
                    pdl.push(HeapCellValue::Var(l2));
                    pdl.push(HeapCellValue::Var(l1 + 1));
                    pdl.push(HeapCellValue::Var(l2 + 1));
                    true
                }
                (HeapCellValue::Str(s1), HeapCellValue::Str(s2)) => {
                    match (self.heap[s1], self.heap[s2]) {
                        (HeapCellValue::Atom(n1, a1), HeapCellValue::Atom(n2, a2))
                            if n1 == n2 && a1 == a2 =>
                        {
                            for i in 1..=a1 {
                                pdl.push(HeapCellValue::Var(s1 + i));
                                pdl.push(HeapCellValue::Var(s2 + i));
                            }

                            true
                        }
                        _ => false,
                    }
                }
                _ => false,
            };

            if !matched {
                self.unwind_trail(old_tr);
                return false;
            }
        }

        true
    }

    /// Resets every trailed cell bound since `old_tr` and truncates the
    /// trail back to it.
    pub(crate) fn unwind_trail(&mut self, old_tr: usize) {
        for i in old_tr..self.tr {
            let r = self.trail[i];
            self.write_ref(r, r.as_heap_cell_value());
        }

        self.trail.truncate(old_tr);
        self.tr = old_tr;
    }

    /// Restores registers, frames, trail and heap from the current
    /// choice point, leaving `bp` untouched for the caller to act on.
    pub(crate) fn restore_from_or_frame(&mut self) {
        let b = self.b;

        let (e, cp, tr, h, b0, args) = {
            let or_frame = self.stack.index_or_frame(b);
            (
                or_frame.e,
                or_frame.cp,
                or_frame.tr,
                or_frame.h,
                or_frame.b0,
                or_frame.args.clone(),
            )
        };

        self.num_of_args = args.len();

        for (i, arg) in args.into_iter().enumerate() {
            self.registers[i + 1] = arg;
        }

        self.e = e;
        self.cp = cp;
        self.b0 = b0;

        self.unwind_trail(tr);
        self.heap.truncate(h);
        self.hb = h;
    }

    /// Pops the current choice point after a final (`trust`) retry.
    pub(crate) fn pop_or_frame(&mut self) {
        let b = self.b;
        self.b = self.stack.index_or_frame(b).b;
        self.stack.truncate(b - 1);
    }

    /// On failure: resume at the newest choice point's alternative, or
    /// report top-level failure if none remains.
    pub(crate) fn backtrack(&mut self) {
        self.fail = false;

        if self.b <= self.top_b {
            self.top_fail = true;
            return;
        }

        self.p = self.stack.index_or_frame(self.b).bp;
    }

    pub(crate) fn allocate_or_frame(&mut self, bp: CodePtr) {
        let args = self.registers[1..=self.num_of_args].to_vec();

        let b = self.stack.allocate_or_frame(
            self.e,
            self.cp,
            self.b,
            bp,
            self.tr,
            self.heap.h(),
            self.b0,
            args,
        );

        self.b = b;
        self.hb = self.heap.h();
    }

    pub(crate) fn allocate_and_frame(&mut self, num_cells: usize) {
        let e = self
            .stack
            .allocate_and_frame(num_cells, self.e, self.cp, self.b);
        self.e = e;
    }

    pub(crate) fn deallocate_and_frame(&mut self) {
        let (e, cp) = {
            let and_frame = self.stack.index_and_frame(self.e);
            (and_frame.e, and_frame.cp)
        };

        self.cp = cp;
        self.e = e;
    }

    /// Discards choice points down to `target` and drops the trail
    /// entries that only existed to protect them: a stale entry would
    /// later reset a cell someone else has legitimately reused.
    pub(crate) fn cut_to(&mut self, target: usize) {
        if self.b > target {
            self.b = target;
            self.tidy_trail();
        }
    }

    fn tidy_trail(&mut self) {
        if self.b == 0 {
            return;
        }

        let (tr0, h0) = {
            let or_frame = self.stack.index_or_frame(self.b);
            (or_frame.tr, or_frame.h)
        };

        let b = self.b;
        let mut j = tr0;

        for i in tr0..self.tr {
            let keep = match self.trail[i] {
                Ref::HeapCell(h) => h < h0,
                Ref::StackCell(fr, _) => fr < b,
            };

            if keep {
                self.trail[j] = self.trail[i];
                j += 1;
            }
        }

        self.trail.truncate(j);
        self.tr = j;
    }

    /// Full reset between queries; the database lives elsewhere and is
    /// untouched.
    pub(crate) fn reset(&mut self) {
        self.heap.clear();
        self.stack.clear();
        self.trail.clear();
        self.tr = 0;
        self.hb = 0;
        self.s = 0;
        self.mode = MachineMode::Write;
        self.fail = false;
        self.top_fail = false;
        self.p = CodePtr::halt();
        self.cp = CodePtr::halt();
        self.b = 0;
        self.b0 = 0;
        self.e = 0;
        self.num_of_args = 0;
        self.top_b = 0;
        self.cost = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_vars(machine_st: &mut MachineState) -> (HeapCellValue, HeapCellValue) {
        let v1 = machine_st.heap.new_var();
        let v2 = machine_st.heap.new_var();
        (v1, v2)
    }

    #[test]
    fn unify_binds_and_derefs() {
        let mut machine_st = MachineState::new();
        let (v1, v2) = two_vars(&mut machine_st);

        assert!(machine_st.unify(v1, v2));
        assert!(machine_st.unify(v2, HeapCellValue::Fixnum(7)));

        assert_eq!(
            machine_st.store(machine_st.deref(v1)),
            HeapCellValue::Fixnum(7)
        );
    }

    #[test]
    fn failed_unification_unwinds_partial_bindings() {
        let mut machine_st = MachineState::new();

        // f(X, a) vs f(b, b): X = b succeeds, a vs b fails; X must be
        // unbound again afterwards.
        let x = machine_st.heap.new_var();
        let a = HeapCellValue::Atom(atom!("atom"), 0);
        let b = HeapCellValue::Atom(atom!("atomic"), 0);

        let t1 = machine_st.heap.put_structure(atom!("functor"), &[x, a]);
        let t2 = machine_st.heap.put_structure(atom!("functor"), &[b, b]);

        // all cells predate `hb`, so every binding is trailed.
        machine_st.hb = machine_st.heap.h();

        assert!(!machine_st.unify(t1, t2));

        let x_value = machine_st.store(machine_st.deref(x));
        assert!(x_value.is_var());
    }

    #[test]
    fn self_unification_makes_no_bindings() {
        let mut machine_st = MachineState::new();
        let (v1, _) = two_vars(&mut machine_st);

        machine_st.hb = machine_st.heap.h();

        assert!(machine_st.unify(v1, v1));
        assert_eq!(machine_st.tr, 0);
    }
}
