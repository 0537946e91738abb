use crate::atom_table::*;
use crate::forms::*;
use crate::instructions::*;

use indexmap::IndexMap;

/// Collects, per first-argument shape, the clause entry points of one
/// indexable span, then lays them out as a switch_on_term block: hashed
/// dispatch into a bucket, sequential try/retry/trust only within a
/// bucket that still holds more than one clause.
#[derive(Debug)]
pub(crate) struct CodeOffsets {
    constants: IndexMap<Literal, Vec<IndexedChoiceInstruction>>,
    lists: Vec<IndexedChoiceInstruction>,
    structures: IndexMap<(Atom, usize), Vec<IndexedChoiceInstruction>>,
}

fn compute_index(is_initial_index: bool, offset: usize) -> IndexedChoiceInstruction {
    if is_initial_index {
        IndexedChoiceInstruction::Try(offset)
    } else {
        IndexedChoiceInstruction::Retry(offset)
    }
}

fn cap_choice_seq_with_trust(code: &mut [IndexedChoiceInstruction]) {
    if let Some(instr) = code.last_mut() {
        if let IndexedChoiceInstruction::Retry(o) = *instr {
            *instr = IndexedChoiceInstruction::Trust(o);
        }
    }
}

impl CodeOffsets {
    pub(crate) fn new() -> Self {
        CodeOffsets {
            constants: IndexMap::new(),
            lists: vec![],
            structures: IndexMap::new(),
        }
    }

    fn index_constant(&mut self, constant: &Literal, offset: usize) {
        let code = self.constants.entry(constant.clone()).or_default();
        let is_initial_index = code.is_empty();
        code.push(compute_index(is_initial_index, offset));
    }

    fn index_list(&mut self, offset: usize) {
        let is_initial_index = self.lists.is_empty();
        self.lists.push(compute_index(is_initial_index, offset));
    }

    fn index_structure(&mut self, name: Atom, arity: usize, offset: usize) {
        let code = self.structures.entry((name, arity)).or_default();
        let is_initial_index = code.is_empty();
        code.push(compute_index(is_initial_index, offset));
    }

    /// Registers one clause of the span; `offset` is its entry point
    /// relative to the span start, accounting for the indexing block
    /// that will be prepended.
    pub(crate) fn index_term(&mut self, first_arg: &Term, offset: usize) {
        match first_arg {
            Term::Literal(_, literal) => self.index_constant(literal, offset),
            Term::Cons(..) => self.index_list(offset),
            Term::Clause(_, name, args) => self.index_structure(*name, args.len(), offset),
            Term::AnonVar | Term::Var(..) => {}
        }
    }

    pub(crate) fn no_indices(&self) -> bool {
        self.constants.is_empty() && self.lists.is_empty() && self.structures.is_empty()
    }

    fn bucket_ptr(
        lines: &mut Vec<IndexingLine>,
        mut bucket: Vec<IndexedChoiceInstruction>,
    ) -> IndexingCodePtr {
        if bucket.len() > 1 {
            cap_choice_seq_with_trust(&mut bucket);
            lines.push(IndexingLine::IndexedChoice(bucket));
            IndexingCodePtr::Internal(lines.len() - 1)
        } else {
            bucket
                .first()
                .map(|i| IndexingCodePtr::External(i.offset()))
                .unwrap_or(IndexingCodePtr::Fail)
        }
    }

    fn switch_on<K: std::hash::Hash + Eq>(
        lines: &mut Vec<IndexingLine>,
        index: IndexMap<K, Vec<IndexedChoiceInstruction>>,
        instr_fn: impl FnOnce(IndexMap<K, IndexingCodePtr>) -> IndexingInstruction,
    ) -> IndexingCodePtr {
        if index.is_empty() {
            return IndexingCodePtr::Fail;
        }

        if index.len() == 1 {
            let (_, bucket) = index.into_iter().next().unwrap();
            return Self::bucket_ptr(lines, bucket);
        }

        // reserve the switch line ahead of its buckets so dispatch
        // reads top-down. Internal offsets are absolute line indices
        // within the block.
        let switch_pos = lines.len();
        lines.push(IndexingLine::IndexedChoice(vec![]));

        let mut ptr_map = IndexMap::new();

        for (key, bucket) in index {
            let ptr = Self::bucket_ptr(lines, bucket);
            ptr_map.insert(key, ptr);
        }

        lines[switch_pos] = IndexingLine::Indexing(instr_fn(ptr_map));
        IndexingCodePtr::Internal(switch_pos)
    }

    /// Lays the collected buckets out as indexing lines. The variable
    /// target is the first instruction after the block: the span's
    /// ordinary try_me_else chain, which preserves source order.
    pub(crate) fn compute_indices(self) -> Vec<IndexingLine> {
        if self.no_indices() {
            return vec![];
        }

        let mut lines = vec![];

        // line 0 is the switch_on_term itself.
        lines.push(IndexingLine::IndexedChoice(vec![]));

        let lst_loc = Self::bucket_ptr(&mut lines, self.lists);
        let con_loc = Self::switch_on(&mut lines, self.constants, IndexingInstruction::SwitchOnConstant);
        let str_loc = Self::switch_on(&mut lines, self.structures, IndexingInstruction::SwitchOnStructure);

        lines[0] = IndexingLine::Indexing(IndexingInstruction::SwitchOnTerm(
            IndexingCodePtr::External(1),
            con_loc,
            lst_loc,
            str_loc,
        ));

        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::Cell;

    fn atom_arg(name: Atom) -> Term {
        Term::Literal(Cell::default(), Literal::Atom(name))
    }

    #[test]
    fn single_bucket_dispatches_externally() {
        let mut offsets = CodeOffsets::new();

        offsets.index_term(&atom_arg(atom!("[]")), 1);

        let lines = offsets.compute_indices();

        match &lines[0] {
            IndexingLine::Indexing(IndexingInstruction::SwitchOnTerm(var, con, lst, str_loc)) => {
                assert_eq!(*var, IndexingCodePtr::External(1));
                assert_eq!(*con, IndexingCodePtr::External(1));
                assert_eq!(*lst, IndexingCodePtr::Fail);
                assert_eq!(*str_loc, IndexingCodePtr::Fail);
            }
            line => panic!("expected switch_on_term, got {:?}", line),
        }
    }

    #[test]
    fn clashing_constants_share_a_capped_bucket() {
        let mut offsets = CodeOffsets::new();

        offsets.index_term(&atom_arg(atom!("true")), 1);
        offsets.index_term(&atom_arg(atom!("true")), 5);

        let lines = offsets.compute_indices();

        match &lines[1] {
            IndexingLine::IndexedChoice(bucket) => {
                assert_eq!(
                    bucket.as_slice(),
                    &[
                        IndexedChoiceInstruction::Try(1),
                        IndexedChoiceInstruction::Trust(5),
                    ]
                );
            }
            line => panic!("expected an indexed choice bucket, got {:?}", line),
        }
    }
}
