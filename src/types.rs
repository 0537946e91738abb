use crate::atom_table::*;

use dashu::base::Sign;

use std::cmp::Ordering;

/// One heap word. The tag is carried by the variant rather than packed
/// bits, so every consumer matches exhaustively and relocation is a
/// matter of moving indices, never rewriting pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapCellValue {
    /// A functor cell: name and arity. Arity 0 is a constant atom.
    Atom(Atom, usize),
    /// A machine-word integer.
    Fixnum(i64),
    /// Pointer to a `BigHeader` cell.
    Big(usize),
    /// Header of a big integer: limb count and sign. Exactly that many
    /// `Dat` cells follow contiguously.
    BigHeader(usize, Sign),
    /// An untagged payload word. Only ever addressed through the header
    /// preceding it.
    Dat(u64),
    /// Pointer to a functor cell followed by its argument cells.
    Str(usize),
    /// Pointer to a list pair: heap[l] is the head, heap[l + 1] the tail.
    Lis(usize),
    /// A heap variable. Unbound iff it points at itself.
    Var(usize),
    /// A variable living in slot `.1` of the and-frame at `.0`.
    StackVar(usize, usize),
    /// A saved choice point level, stored by get_level/get_cut_point.
    CutPoint(usize),
}

impl HeapCellValue {
    #[inline]
    pub fn is_var(self) -> bool {
        matches!(
            self,
            HeapCellValue::Var(_) | HeapCellValue::StackVar(..)
        )
    }

    #[inline]
    pub fn is_constant(self) -> bool {
        match self {
            HeapCellValue::Atom(_, arity) => arity == 0,
            HeapCellValue::Fixnum(_) | HeapCellValue::Big(_) => true,
            _ => false,
        }
    }

    #[inline]
    pub fn is_compound(self) -> bool {
        matches!(self, HeapCellValue::Str(_) | HeapCellValue::Lis(_))
    }

    #[inline]
    pub(crate) fn as_var(self) -> Option<Ref> {
        match self {
            HeapCellValue::Var(h) => Some(Ref::HeapCell(h)),
            HeapCellValue::StackVar(fr, sc) => Some(Ref::StackCell(fr, sc)),
            _ => None,
        }
    }

    pub(crate) fn order_category(self) -> Option<TermOrderCategory> {
        match self {
            HeapCellValue::Var(_) | HeapCellValue::StackVar(..) => {
                Some(TermOrderCategory::Variable)
            }
            HeapCellValue::Fixnum(_) | HeapCellValue::Big(_) => Some(TermOrderCategory::Integer),
            HeapCellValue::Atom(_, 0) => Some(TermOrderCategory::Atom),
            HeapCellValue::Atom(..) | HeapCellValue::Str(_) | HeapCellValue::Lis(_) => {
                Some(TermOrderCategory::Compound)
            }
            _ => None,
        }
    }
}

/// The address of a bindable cell.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Ref {
    HeapCell(usize),
    StackCell(usize, usize),
}

impl Ref {
    #[inline]
    pub(crate) fn as_heap_cell_value(self) -> HeapCellValue {
        match self {
            Ref::HeapCell(h) => HeapCellValue::Var(h),
            Ref::StackCell(fr, sc) => HeapCellValue::StackVar(fr, sc),
        }
    }
}

impl Ord for Ref {
    fn cmp(&self, other: &Ref) -> Ordering {
        // stack cells are uniformly younger than heap cells, matching the
        // WAM convention addr(stack) > addr(heap).
        match (self, other) {
            (Ref::HeapCell(h1), Ref::HeapCell(h2)) => h1.cmp(h2),
            (Ref::HeapCell(_), Ref::StackCell(..)) => Ordering::Less,
            (Ref::StackCell(..), Ref::HeapCell(_)) => Ordering::Greater,
            (Ref::StackCell(fr1, sc1), Ref::StackCell(fr2, sc2)) => {
                fr1.cmp(fr2).then_with(|| sc1.cmp(sc2))
            }
        }
    }
}

impl PartialOrd for Ref {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Standard order categories, least first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TermOrderCategory {
    Variable,
    Integer,
    Atom,
    Compound,
}
