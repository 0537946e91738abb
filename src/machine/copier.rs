use crate::machine::heap::*;
use crate::machine::stack::*;
use crate::types::*;

use fxhash::FxHashMap;

/// The copier's view of source and destination. Cycles and sharing are
/// preserved through an address map, so traversal terminates on any
/// term graph, cyclic ones included.
pub(crate) trait CopierTarget {
    /// Resolve one step: the value stored at an address cell.
    fn source_store(&self, value: HeapCellValue) -> HeapCellValue;
    /// Read a source heap cell directly.
    fn source_read(&self, index: usize) -> HeapCellValue;

    fn dst_len(&self) -> usize;
    fn dst_push(&mut self, cell: HeapCellValue);
    fn dst_write(&mut self, index: usize, cell: HeapCellValue);
    fn dst_read(&self, index: usize) -> HeapCellValue;

    fn source_deref(&self, mut addr: HeapCellValue) -> HeapCellValue {
        loop {
            let value = self.source_store(addr);

            if value.is_var() && value != addr {
                addr = value;
                continue;
            }

            return addr;
        }
    }
}

/// Copying within the machine's own heap (`copy_term/2`, findall
/// templates): reads may pass through stack cells, writes go to the top
/// of the same heap.
pub(crate) struct OwnHeapCopier<'a> {
    pub heap: &'a mut Heap,
    pub stack: &'a Stack,
}

impl<'a> CopierTarget for OwnHeapCopier<'a> {
    fn source_store(&self, value: HeapCellValue) -> HeapCellValue {
        match value {
            HeapCellValue::Var(h) => self.heap[h],
            HeapCellValue::StackVar(fr, sc) => self.stack.index_and_frame(fr).cell(sc),
            _ => value,
        }
    }

    fn source_read(&self, index: usize) -> HeapCellValue {
        self.heap[index]
    }

    fn dst_len(&self) -> usize {
        self.heap.h()
    }

    fn dst_push(&mut self, cell: HeapCellValue) {
        self.heap.push(cell);
    }

    fn dst_write(&mut self, index: usize, cell: HeapCellValue) {
        self.heap[index] = cell;
    }

    fn dst_read(&self, index: usize) -> HeapCellValue {
        self.heap[index]
    }
}

/// Copying between distinct heaps: clause store to machine heap on
/// clause activation, machine heap to clause store on assertion.
pub(crate) struct CrossHeapCopier<'a> {
    pub src: &'a Heap,
    pub src_stack: Option<&'a Stack>,
    pub dst: &'a mut Heap,
}

impl<'a> CopierTarget for CrossHeapCopier<'a> {
    fn source_store(&self, value: HeapCellValue) -> HeapCellValue {
        match value {
            HeapCellValue::Var(h) => self.src[h],
            HeapCellValue::StackVar(fr, sc) => match self.src_stack {
                Some(stack) => stack.index_and_frame(fr).cell(sc),
                None => unreachable!("stack variable in a stackless heap"),
            },
            _ => value,
        }
    }

    fn source_read(&self, index: usize) -> HeapCellValue {
        self.src[index]
    }

    fn dst_len(&self) -> usize {
        self.dst.h()
    }

    fn dst_push(&mut self, cell: HeapCellValue) {
        self.dst.push(cell);
    }

    fn dst_write(&mut self, index: usize, cell: HeapCellValue) {
        self.dst[index] = cell;
    }

    fn dst_read(&self, index: usize) -> HeapCellValue {
        self.dst[index]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum SourceAddr {
    Var(Ref),
    Heap(usize),
}

/// Copies the term rooted at `root`, producing an isomorphic term with
/// fresh variables at the destination. Worklist-driven: no recursion, so
/// list length and term depth are bounded by the heap alone.
pub(crate) fn copy_term<T: CopierTarget>(target: &mut T, root: HeapCellValue) -> HeapCellValue {
    let mut seen = FxHashMap::default();
    copy_term_with(&mut seen, target, root)
}

/// As `copy_term`, but sharing the address map across calls, so several
/// roots (a clause head and its body) keep their common variables.
pub(crate) fn copy_term_with<T: CopierTarget>(
    seen: &mut FxHashMap<SourceAddr, usize>,
    target: &mut T,
    root: HeapCellValue,
) -> HeapCellValue {

    let root_dst = target.dst_len();
    target.dst_push(HeapCellValue::Fixnum(0));

    let mut worklist: Vec<(HeapCellValue, usize)> = vec![(root, root_dst)];

    while let Some((src_cell, dst)) = worklist.pop() {
        let addr = target.source_deref(src_cell);
        let value = target.source_store(addr);

        if let Some(r) = value.as_var() {
            // an unbound variable: all occurrences map to one fresh var.
            let key = SourceAddr::Var(r);

            match seen.get(&key) {
                Some(&new_h) => target.dst_write(dst, HeapCellValue::Var(new_h)),
                None => {
                    seen.insert(key, dst);
                    target.dst_write(dst, HeapCellValue::Var(dst));
                }
            }

            continue;
        }

        match value {
            HeapCellValue::Atom(..) | HeapCellValue::Fixnum(_) | HeapCellValue::CutPoint(_) => {
                target.dst_write(dst, value);
            }
            HeapCellValue::Big(h) => {
                let key = SourceAddr::Heap(h);

                if let Some(&new_h) = seen.get(&key) {
                    target.dst_write(dst, HeapCellValue::Big(new_h));
                    continue;
                }

                let new_h = target.dst_len();
                let (limbs, sign) = match target.source_read(h) {
                    HeapCellValue::BigHeader(limbs, sign) => (limbs, sign),
                    cell => unreachable!("big cell points at {:?}", cell),
                };

                target.dst_push(HeapCellValue::BigHeader(limbs, sign));

                for i in 0..limbs {
                    let limb = target.source_read(h + 1 + i);
                    target.dst_push(limb);
                }

                seen.insert(key, new_h);
                target.dst_write(dst, HeapCellValue::Big(new_h));
            }
            HeapCellValue::Lis(l) => {
                let key = SourceAddr::Heap(l);

                if let Some(&new_l) = seen.get(&key) {
                    target.dst_write(dst, HeapCellValue::Lis(new_l));
                    continue;
                }

                let new_l = target.dst_len();
                target.dst_push(HeapCellValue::Fixnum(0));
                target.dst_push(HeapCellValue::Fixnum(0));

                seen.insert(key, new_l);
                target.dst_write(dst, HeapCellValue::Lis(new_l));

                worklist.push((HeapCellValue::Var(l), new_l));
                worklist.push((HeapCellValue::Var(l + 1), new_l + 1));
            }
            HeapCellValue::Str(s) => {
                let key = SourceAddr::Heap(s);

                if let Some(&new_s) = seen.get(&key) {
                    target.dst_write(dst, HeapCellValue::Str(new_s));
                    continue;
                }

                let (name, arity) = match target.source_read(s) {
                    HeapCellValue::Atom(name, arity) => (name, arity),
                    cell => unreachable!("structure points at {:?}", cell),
                };

                let new_s = target.dst_len();
                target.dst_push(HeapCellValue::Atom(name, arity));

                for _ in 0..arity {
                    target.dst_push(HeapCellValue::Fixnum(0));
                }

                seen.insert(key, new_s);
                target.dst_write(dst, HeapCellValue::Str(new_s));

                for i in 1..=arity {
                    worklist.push((HeapCellValue::Var(s + i), new_s + i));
                }
            }
            cell => unreachable!("copy of a non-term cell: {:?}", cell),
        }
    }

    target.dst_read(root_dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom_table::*;

    #[test]
    fn copies_preserve_sharing() {
        let mut heap = Heap::new();
        let stack = Stack::new();

        let v = heap.new_var();
        let shared = heap.put_structure(atom!("+"), &[v, v]);
        let root = heap.put_structure(atom!("-"), &[shared, shared]);

        let copy = {
            let mut copier = OwnHeapCopier {
                heap: &mut heap,
                stack: &stack,
            };
            copy_term(&mut copier, root)
        };

        match copy {
            HeapCellValue::Str(s) => {
                // both arguments point at one copied structure.
                assert_eq!(heap[s + 1], heap[s + 2]);
                assert_ne!(heap[s + 1], shared);
            }
            cell => panic!("expected a structure copy, got {:?}", cell),
        }
    }

    #[test]
    fn copies_terminate_on_cyclic_terms() {
        let mut heap = Heap::new();
        let stack = Stack::new();

        // X = f(X) by direct self-reference.
        let s = heap.h();
        heap.push(HeapCellValue::Atom(atom!("functor"), 1));
        heap.push(HeapCellValue::Str(s));
        let root = HeapCellValue::Str(s);

        let copy = {
            let mut copier = OwnHeapCopier {
                heap: &mut heap,
                stack: &stack,
            };
            copy_term(&mut copier, root)
        };

        match copy {
            HeapCellValue::Str(new_s) => {
                assert_eq!(heap[new_s + 1], HeapCellValue::Str(new_s));
            }
            cell => panic!("expected a structure copy, got {:?}", cell),
        }
    }
}
