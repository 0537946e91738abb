use crate::atom_table::*;
use crate::types::*;

use dashu::integer::{IBig, UBig};

use std::ops::{Index, IndexMut};

/// The term heap: a growable arena of tagged cells addressed by logical
/// index. Reallocation moves the backing storage, never the indices, so
/// no component ever holds a raw pointer across growth.
#[derive(Debug, Default)]
pub struct Heap {
    cells: Vec<HeapCellValue>,
}

impl Index<usize> for Heap {
    type Output = HeapCellValue;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.cells[index]
    }
}

impl IndexMut<usize> for Heap {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.cells[index]
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap { cells: Vec::with_capacity(256) }
    }

    #[inline]
    pub fn h(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn push(&mut self, cell: HeapCellValue) {
        self.cells.push(cell);
    }

    #[inline]
    pub fn truncate(&mut self, h: usize) {
        self.cells.truncate(h);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.cells.clear();
    }

    /// Allocates a fresh unbound variable and returns its cell.
    pub fn new_var(&mut self) -> HeapCellValue {
        let h = self.h();
        self.push(HeapCellValue::Var(h));
        HeapCellValue::Var(h)
    }

    /// Allocates a structure with the given functor and already-built
    /// argument cells. `'.'/2` is the list constructor and normalizes to
    /// a list pair, so exactly one representation reaches the unifier.
    pub fn put_structure(&mut self, name: Atom, args: &[HeapCellValue]) -> HeapCellValue {
        if args.is_empty() {
            return HeapCellValue::Atom(name, 0);
        }

        if name == atom!(".") && args.len() == 2 {
            return self.put_list(args[0], args[1]);
        }

        let h = self.h();
        self.push(HeapCellValue::Atom(name, args.len()));

        for arg in args {
            self.push(*arg);
        }

        HeapCellValue::Str(h)
    }

    /// Allocates a structure whose arguments are fresh unbound variables,
    /// returning the structure cell. Arguments are at `s + 1 ..= s + arity`
    /// for the returned `Str(s)`.
    pub fn put_open_structure(&mut self, name: Atom, arity: usize) -> HeapCellValue {
        if arity == 0 {
            return HeapCellValue::Atom(name, 0);
        }

        let h = self.h();
        self.push(HeapCellValue::Atom(name, arity));

        for i in 0..arity {
            self.push(HeapCellValue::Var(h + 1 + i));
        }

        HeapCellValue::Str(h)
    }

    pub fn put_list(&mut self, head: HeapCellValue, tail: HeapCellValue) -> HeapCellValue {
        let h = self.h();
        self.push(head);
        self.push(tail);
        HeapCellValue::Lis(h)
    }

    /// Builds a proper list from the iterator, ending in `[]`.
    pub fn to_list<I>(&mut self, values: I) -> HeapCellValue
    where
        I: IntoIterator<Item = HeapCellValue>,
    {
        let values: Vec<_> = values.into_iter().collect();
        let mut tail = HeapCellValue::Atom(atom!("[]"), 0);

        for value in values.into_iter().rev() {
            tail = self.put_list(value, tail);
        }

        tail
    }

    /// Writes a big integer as a header cell followed by its limbs, per
    /// the opaque-span contract: the limbs are only ever reached through
    /// the header. Integers that fit a fixnum are stored as one.
    pub fn put_integer(&mut self, n: &IBig) -> HeapCellValue {
        if let Ok(n) = i64::try_from(n) {
            return HeapCellValue::Fixnum(n);
        }

        let (sign, magnitude) = n.clone().into_parts();
        let bytes = magnitude.to_le_bytes();

        let h = self.h();
        let limbs = bytes.chunks(8).count();

        self.push(HeapCellValue::BigHeader(limbs, sign));

        for chunk in bytes.chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            self.push(HeapCellValue::Dat(u64::from_le_bytes(word)));
        }

        HeapCellValue::Big(h)
    }

    /// Reads the big integer whose header is at `h`. The span invariant
    /// guarantees `limbs` `Dat` cells follow the header.
    pub fn read_big(&self, h: usize) -> IBig {
        let (limbs, sign) = match self.cells[h] {
            HeapCellValue::BigHeader(limbs, sign) => (limbs, sign),
            cell => unreachable!("read_big on a non-header cell: {:?}", cell),
        };

        let mut bytes = Vec::with_capacity(limbs * 8);

        for i in 0..limbs {
            match self.cells[h + 1 + i] {
                HeapCellValue::Dat(word) => bytes.extend_from_slice(&word.to_le_bytes()),
                cell => unreachable!("big integer span interrupted by {:?}", cell),
            }
        }

        let magnitude = UBig::from_le_bytes(&bytes);
        IBig::from_parts(sign, magnitude)
    }

    /// Metered comparison of two heap big integers: the cost is the limb
    /// count examined, since arbitrary-precision comparison is the one
    /// structural check that is not O(1).
    pub fn compare_bigs(&self, h1: usize, h2: usize, cost: &mut u64) -> bool {
        let (l1, s1) = match self.cells[h1] {
            HeapCellValue::BigHeader(l, s) => (l, s),
            _ => return false,
        };
        let (l2, s2) = match self.cells[h2] {
            HeapCellValue::BigHeader(l, s) => (l, s),
            _ => return false,
        };

        *cost += l1.min(l2) as u64;

        if l1 != l2 || s1 != s2 {
            return false;
        }

        (0..l1).all(|i| self.cells[h1 + 1 + i] == self.cells[h2 + 1 + i])
    }

    /// Dereference restricted to heap cells, for contexts without access
    /// to the frame stack.
    pub fn bound_deref(&self, mut value: HeapCellValue) -> HeapCellValue {
        loop {
            match value {
                HeapCellValue::Var(h) if self.cells[h] != value => {
                    value = self.cells[h];
                }
                _ => return value,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::str::FromStr;

    #[test]
    fn fixnum_sized_integers_stay_inline() {
        let mut heap = Heap::new();

        let cell = heap.put_integer(&IBig::from(42));
        assert_eq!(cell, HeapCellValue::Fixnum(42));
        assert_eq!(heap.h(), 0);
    }

    #[test]
    fn big_integers_round_trip_through_limb_cells() {
        let mut heap = Heap::new();
        let n = IBig::from_str("-123456789012345678901234567890123456789").unwrap();

        let cell = heap.put_integer(&n);

        match cell {
            HeapCellValue::Big(h) => assert_eq!(heap.read_big(h), n),
            cell => panic!("expected a big cell, got {:?}", cell),
        }
    }

    #[test]
    fn big_comparison_meters_limbs() {
        let mut heap = Heap::new();
        let n = IBig::from_str("340282366920938463463374607431768211456").unwrap();

        let c1 = heap.put_integer(&n);
        let c2 = heap.put_integer(&n);

        let (h1, h2) = match (c1, c2) {
            (HeapCellValue::Big(h1), HeapCellValue::Big(h2)) => (h1, h2),
            _ => unreachable!(),
        };

        let mut cost = 0;
        assert!(heap.compare_bigs(h1, h2, &mut cost));
        assert!(cost > 0);
    }

    #[test]
    fn lists_build_back_to_front() {
        let mut heap = Heap::new();

        let list = heap.to_list(vec![
            HeapCellValue::Fixnum(1),
            HeapCellValue::Fixnum(2),
        ]);

        match list {
            HeapCellValue::Lis(l) => {
                assert_eq!(heap[l], HeapCellValue::Fixnum(1));
                match heap[l + 1] {
                    HeapCellValue::Lis(l2) => {
                        assert_eq!(heap[l2], HeapCellValue::Fixnum(2));
                        assert_eq!(heap[l2 + 1], HeapCellValue::Atom(atom!("[]"), 0));
                    }
                    cell => panic!("expected list tail, got {:?}", cell),
                }
            }
            cell => panic!("expected a list, got {:?}", cell),
        }
    }
}
