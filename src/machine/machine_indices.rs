use crate::atom_table::*;
use crate::machine::heap::*;
use crate::machine::machine_errors::*;
use crate::machine::Machine;
use crate::types::*;

use dashu::integer::IBig;
use fxhash::FxHashMap;
use indexmap::IndexMap;

use std::cell::Cell;
use std::rc::Rc;

/// (module, name, arity). The module defaults to `user` for everything
/// loaded through the public API.
pub type PredicateKey = (Atom, Atom, usize);

/// An instruction address inside the code area, possibly positioned
/// within an indexing block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalCodePtr {
    DirEntry(usize),
    /// Block start, outer line offset, inner choice offset.
    IndexingBuf(usize, usize, usize),
    Halt,
}

/// Where execution continues: bytecode, an interpreted goal term, or a
/// clause-selection position of the interpreted path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodePtr {
    Local(LocalCodePtr),
    /// An interpreted goal living on the heap.
    Term(HeapCellValue),
    /// A backtracking target: restore the choice point, discard it, and
    /// continue at the stored alternative goal.
    RetryTerm(HeapCellValue),
    /// Resume clause selection in snapshot `snapshot` at entry `next`.
    Interpreted { snapshot: usize, next: usize },
}

impl CodePtr {
    #[inline]
    pub(crate) fn halt() -> Self {
        CodePtr::Local(LocalCodePtr::Halt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexPtr {
    /// Compiled; entry point into the code area.
    Index(usize),
    /// Not compiled (yet). The dispatcher falls back to clause
    /// interpretation or triggers compilation.
    Undefined,
    /// Compilation was attempted and declined; always interpret.
    Interpreted,
}

/// A shared, updatable pointer from call sites to a predicate's code.
/// Recompiling a predicate updates every holder at once; stale code stays
/// in the (append-only) code area so outstanding continuations survive.
#[derive(Debug, Clone)]
pub(crate) struct CodeIndex(Rc<Cell<IndexPtr>>);

impl CodeIndex {
    #[inline]
    pub(crate) fn new(ptr: IndexPtr) -> Self {
        CodeIndex(Rc::new(Cell::new(ptr)))
    }

    #[inline]
    pub(crate) fn get(&self) -> IndexPtr {
        self.0.get()
    }

    #[inline]
    pub(crate) fn set(&self, ptr: IndexPtr) {
        self.0.set(ptr);
    }
}

impl Default for CodeIndex {
    fn default() -> Self {
        CodeIndex::new(IndexPtr::Undefined)
    }
}

/// One stored clause. `head` and `body` point into the clause store heap,
/// which only ever grows, so the cells stay valid for the lifetime of the
/// database. Retraction tombstones in place; indices held by snapshots or
/// choice points are never shifted.
#[derive(Debug, Clone)]
pub(crate) struct ClauseRecord {
    pub(crate) head: HeapCellValue,
    pub(crate) body: HeapCellValue,
    pub(crate) cost: u64,
    pub(crate) erased: bool,
}

#[derive(Debug, Default)]
pub(crate) struct PredicateSkeleton {
    pub(crate) clauses: Vec<ClauseRecord>,
}

impl PredicateSkeleton {
    pub(crate) fn live_clauses(&self) -> impl Iterator<Item = (usize, &ClauseRecord)> {
        self.clauses
            .iter()
            .enumerate()
            .filter(|(_, clause)| !clause.erased)
    }
}

/// The shape of a first argument, used to partition a predicate's clauses
/// for dispatch. `None` at lookup time (unbound first argument) selects
/// every live clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum IndexKey {
    Atom(Atom),
    Fixnum(i64),
    Integer(IBig),
    List,
    Structure(Atom, usize),
}

/// A frozen subsequence of a predicate's clauses matched against one
/// first-argument key. Choice points index into these, so they stay alive
/// for the duration of the query even if the predicate is modified.
#[derive(Debug)]
pub(crate) struct ClauseSnapshot {
    pub(crate) clauses: Vec<ClauseRecord>,
}

pub type BuiltinFn =
    fn(&mut Machine, usize, &[HeapCellValue]) -> Result<bool, MachineError>;

#[derive(Clone, Copy)]
pub struct BuiltinRecord {
    pub module: Atom,
    pub f: BuiltinFn,
    /// Recursive builtins re-enter the machine (e.g. findall/3); calling
    /// one counts as a call boundary for register allocation.
    pub recursive: bool,
}

impl std::fmt::Debug for BuiltinRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BuiltinRecord")
            .field("module", &self.module)
            .field("recursive", &self.recursive)
            .finish()
    }
}

/// The clause database and everything that indexes into it.
#[derive(Debug)]
pub struct IndexStore {
    pub(crate) code_dir: FxHashMap<PredicateKey, CodeIndex>,
    pub(crate) predicates: IndexMap<PredicateKey, PredicateSkeleton>,
    pub(crate) builtins: FxHashMap<(Atom, usize), BuiltinRecord>,
    /// Program terms live here, below and apart from the query heap, so
    /// backtracking can never truncate a clause away.
    pub(crate) clause_store: Heap,
    pub(crate) snapshots: Vec<ClauseSnapshot>,
    snapshot_cache: FxHashMap<(PredicateKey, Option<IndexKey>), usize>,
}

impl IndexStore {
    pub(crate) fn new() -> Self {
        IndexStore {
            code_dir: FxHashMap::default(),
            predicates: IndexMap::new(),
            builtins: FxHashMap::default(),
            clause_store: Heap::new(),
            snapshots: vec![],
            snapshot_cache: FxHashMap::default(),
        }
    }

    pub(crate) fn get_builtin(&self, name: Atom, arity: usize) -> Option<BuiltinRecord> {
        self.builtins.get(&(name, arity)).copied()
    }

    pub(crate) fn register_builtin(
        &mut self,
        module: Atom,
        name: Atom,
        arity: usize,
        f: BuiltinFn,
        recursive: bool,
    ) {
        self.builtins.insert(
            (name, arity),
            BuiltinRecord {
                module,
                f,
                recursive,
            },
        );
    }

    pub(crate) fn get_code_index(&mut self, key: PredicateKey) -> CodeIndex {
        self.code_dir.entry(key).or_default().clone()
    }

    /// Appends or prepends a clause and invalidates everything derived
    /// from the predicate: compiled code and cached partitions.
    pub(crate) fn add_clause(
        &mut self,
        key: PredicateKey,
        head: HeapCellValue,
        body: HeapCellValue,
        cost: u64,
        append: bool,
    ) {
        let skeleton = self.predicates.entry(key).or_default();
        let record = ClauseRecord {
            head,
            body,
            cost,
            erased: false,
        };

        if append {
            skeleton.clauses.push(record);
        } else {
            skeleton.clauses.insert(0, record);
        }

        self.invalidate(key);
    }

    pub(crate) fn erase_clause(&mut self, key: PredicateKey, index: usize) {
        if let Some(skeleton) = self.predicates.get_mut(&key) {
            if let Some(clause) = skeleton.clauses.get_mut(index) {
                clause.erased = true;
            }
        }

        self.invalidate(key);
    }

    fn invalidate(&mut self, key: PredicateKey) {
        if let Some(code_index) = self.code_dir.get(&key) {
            code_index.set(IndexPtr::Undefined);
        }

        self.snapshot_cache.retain(|(k, _), _| *k != key);
    }

    /// Drops every cached partition and snapshot. Called at the start of
    /// a top-level query, when no choice point can be holding one.
    pub(crate) fn reset_snapshots(&mut self) {
        self.snapshots.clear();
        self.snapshot_cache.clear();
    }

    /// The key a (dereferenced) first-argument cell indexes under, or
    /// `None` if it is unbound.
    pub(crate) fn first_arg_index_key(heap: &Heap, arg: HeapCellValue) -> Option<IndexKey> {
        match heap.bound_deref(arg) {
            HeapCellValue::Var(_) | HeapCellValue::StackVar(..) => None,
            HeapCellValue::Atom(name, 0) => Some(IndexKey::Atom(name)),
            HeapCellValue::Fixnum(n) => Some(IndexKey::Fixnum(n)),
            HeapCellValue::Big(h) => Some(IndexKey::Integer(heap.read_big(h))),
            HeapCellValue::Lis(_) => Some(IndexKey::List),
            HeapCellValue::Str(s) => match heap[s] {
                HeapCellValue::Atom(name, arity) => Some(IndexKey::Structure(name, arity)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Returns the snapshot id of the clause subsequence matching `key`
    /// for this predicate, building and caching it on demand. A clause
    /// participates if its first argument is unbound (always tried, in
    /// source order) or has the same index key.
    pub(crate) fn matched_snapshot(
        &mut self,
        pred: PredicateKey,
        key: Option<IndexKey>,
    ) -> Option<usize> {
        if let Some(&id) = self.snapshot_cache.get(&(pred, key.clone())) {
            return Some(id);
        }

        let skeleton = self.predicates.get(&pred)?;
        let mut clauses = vec![];

        for (_, clause) in skeleton.live_clauses() {
            let clause_key = match clause.head {
                HeapCellValue::Str(s) => {
                    Self::first_arg_index_key(&self.clause_store, self.clause_store[s + 1])
                }
                // zero-arity predicates have no first argument.
                _ => None,
            };

            let matches = match (&clause_key, &key) {
                (None, _) | (_, None) => true,
                (Some(ck), Some(k)) => ck == k,
            };

            if matches {
                clauses.push(clause.clone());
            }
        }

        let id = self.snapshots.len();
        self.snapshots.push(ClauseSnapshot { clauses });
        self.snapshot_cache.insert((pred, key), id);

        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_arg_keys_partition_by_shape() {
        let mut heap = Heap::new();
        let nil = HeapCellValue::Atom(atom!("[]"), 0);
        let var = heap.new_var();
        let lis = heap.put_list(HeapCellValue::Fixnum(1), nil);

        assert_eq!(
            IndexStore::first_arg_index_key(&heap, nil),
            Some(IndexKey::Atom(atom!("[]")))
        );
        assert_eq!(IndexStore::first_arg_index_key(&heap, var), None);
        assert_eq!(
            IndexStore::first_arg_index_key(&heap, lis),
            Some(IndexKey::List)
        );
        assert_eq!(
            IndexStore::first_arg_index_key(&heap, HeapCellValue::Fixnum(7)),
            Some(IndexKey::Fixnum(7))
        );
    }
}
