use crate::forms::*;
use crate::instructions::*;
use crate::iterators::*;

use indexmap::{IndexMap, IndexSet};

use std::cell::Cell;
use std::collections::BTreeSet;
use std::mem::swap;

/// Occurrences of a variable in argument positions of the head or of a
/// chunk's terminating call, used to steer temporary allocation toward
/// registers it will be needed in anyway.
pub(crate) type OccurrenceSet = BTreeSet<(GenContext, usize)>;

#[derive(Debug)]
pub(crate) enum VarStatus {
    Perm(usize),
    Temp(usize, TempVarData), // chunk_num
}

#[derive(Debug)]
pub(crate) struct TempVarData {
    pub(crate) last_term_arity: usize,
    pub(crate) use_set: OccurrenceSet,
    pub(crate) no_use_set: BTreeSet<usize>,
    pub(crate) conflict_set: BTreeSet<usize>,
}

impl TempVarData {
    pub(crate) fn new(last_term_arity: usize) -> Self {
        TempVarData {
            last_term_arity,
            use_set: BTreeSet::new(),
            no_use_set: BTreeSet::new(),
            conflict_set: BTreeSet::new(),
        }
    }

    fn uses_reg(&self, reg: usize) -> bool {
        self.use_set.iter().any(|&(_, nreg)| reg == nreg)
    }

    fn populate_conflict_set(&mut self) {
        if self.last_term_arity > 0 {
            let mut conflict_set: BTreeSet<usize> = (1..self.last_term_arity + 1).collect();

            for &(_, reg) in self.use_set.iter() {
                conflict_set.remove(&reg);
            }

            self.conflict_set = conflict_set;
        }
    }
}

/// A variable's allocation as the code generator sees it.
/// Perm: 0 until processed, then its Y slot.
/// Temp: chunk number and X offset (0 while unassigned).
#[derive(Debug)]
pub(crate) enum VarData {
    Perm(usize),
    Temp(usize, usize, TempVarData),
}

impl VarData {
    pub(crate) fn as_reg_type(&self) -> RegType {
        match self {
            VarData::Temp(_, r, _) => RegType::Temp(*r),
            VarData::Perm(r) => RegType::Perm(*r),
        }
    }
}

pub(crate) type AllocVarDict = IndexMap<Var, VarData>;

type VariableFixture<'a> = (VarStatus, Vec<&'a Cell<VarReg>>);

/// Classifies every clause variable as temporary or permanent by the
/// chunks it occurs in: a variable confined to one chunk never has to
/// survive a call and stays in an X register; one that spans chunks is
/// promoted to a Y slot of the environment.
#[derive(Debug)]
pub(crate) struct VariableFixtures<'a> {
    vars: IndexMap<Var, VariableFixture<'a>>,
}

impl<'a> VariableFixtures<'a> {
    pub(crate) fn new() -> Self {
        VariableFixtures {
            vars: IndexMap::new(),
        }
    }

    pub(crate) fn mark_vars_in_chunk(&mut self, chunk: &Chunk<'a>) {
        let chunk_num = chunk.chunk_num;
        let last_index = chunk.terms.len() - 1;

        for (index, chunked_term) in chunk.terms.iter().enumerate() {
            let term_loc = match chunked_term {
                ChunkedTerm::HeadClause(_) => GenContext::Head,
                ChunkedTerm::BodyTerm(_) if index == last_index => GenContext::Last(chunk_num),
                ChunkedTerm::BodyTerm(_) => GenContext::Mid(chunk_num),
            };

            let mut arg_c = 1;

            for term_ref in chunked_term.term_refs() {
                if let TermRef::Var(lvl, cell, var) = &term_ref {
                    let mut status = self.vars.swap_remove(var).unwrap_or((
                        VarStatus::Temp(chunk_num, TempVarData::new(chunk.lt_arity)),
                        Vec::new(),
                    ));

                    status.1.push(*cell);

                    match status.0 {
                        VarStatus::Temp(cn, ref mut tvd) if cn == chunk_num => {
                            if let Level::Shallow = lvl {
                                if let GenContext::Head | GenContext::Last(_) = term_loc {
                                    tvd.use_set.insert((term_loc, arg_c));
                                }
                            }
                        }
                        _ => status.0 = VarStatus::Perm(chunk_num),
                    };

                    self.vars.insert(var.clone(), status);
                }

                if let Level::Shallow = term_ref.level() {
                    arg_c += 1;
                }
            }
        }
    }

    // computes no_use and conflict sets for all temp vars.
    pub(crate) fn populate_restricting_sets(&mut self) {
        // three stages:
        // 1. move the use sets of each variable to a local map.
        // 2. drain it; each use set of U feeds the no-use sets of
        //    chunk-mates T distinct from U.
        // 3. move the use sets back and compute conflict sets.
        let mut use_sets: IndexMap<Var, OccurrenceSet> = IndexMap::new();

        for (var, (var_status, _)) in self.vars.iter_mut() {
            if let VarStatus::Temp(_, ref mut var_data) = var_status {
                let mut use_set = OccurrenceSet::new();

                swap(&mut var_data.use_set, &mut use_set);
                use_sets.insert(var.clone(), use_set);
            }
        }

        for (u, use_set) in use_sets.drain(..) {
            for &(term_loc, reg) in use_set.iter() {
                if let GenContext::Last(cn_u) = term_loc {
                    for (t, (var_status, _)) in self.vars.iter_mut() {
                        if let VarStatus::Temp(cn_t, ref mut t_data) = var_status {
                            if cn_u == *cn_t && u != *t && !t_data.uses_reg(reg) {
                                t_data.no_use_set.insert(reg);
                            }
                        }
                    }
                }
            }

            if let Some((VarStatus::Temp(_, ref mut u_data), _)) = self.vars.get_mut(&u) {
                u_data.use_set = use_set;
                u_data.populate_conflict_set();
            }
        }
    }

    /// Assigns Y registers to the permanent variables and writes them
    /// through every recorded cell.
    pub(crate) fn set_perm_vals(&self) -> usize {
        let mut values_vec: Vec<_> = self
            .vars
            .values()
            .filter_map(|v| match v.0 {
                VarStatus::Perm(i) => Some((i, &v.1)),
                _ => None,
            })
            .collect();

        values_vec.sort_by_key(|v| v.0);
        let num_perm_vars = values_vec.len();

        for (i, (_, cells)) in values_vec.into_iter().rev().enumerate() {
            for cell in cells {
                cell.set(VarReg::Norm(RegType::Perm(i + 1)));
            }
        }

        num_perm_vars
    }

    /// Consumes the fixtures into the allocator's bindings. Permanent
    /// registers were already written through the AST cells by
    /// `set_perm_vals`; the allocator re-reads them lazily.
    pub(crate) fn into_bindings(self) -> AllocVarDict {
        self.vars
            .into_iter()
            .map(|(var, (status, _))| {
                let data = match status {
                    VarStatus::Perm(_) => VarData::Perm(0),
                    VarStatus::Temp(cn, tvd) => VarData::Temp(cn, 0, tvd),
                };

                (var, data)
            })
            .collect()
    }
}

/// Rewrites instructions that would expose a register holding a
/// reference into a frame about to be discarded, or a structure slot
/// never initialized on some path: `put_value` of such a permanent
/// becomes `put_unsafe_value` (fresh copy), `set_value` becomes
/// `set_local_value`. The pass is conservative; extra rewrites only cost
/// a copy, never correctness.
#[derive(Debug)]
pub(crate) struct UnsafeVarMarker {
    pub(crate) unsafe_perm_vars: IndexMap<usize, usize>,
    pub(crate) safe_perm_vars: IndexSet<usize>,
    pub(crate) safe_temp_vars: IndexSet<usize>,
    pub(crate) temp_vars_to_perm_vars: IndexMap<usize, usize>,
    pub(crate) perm_vars_to_temp_vars: IndexMap<usize, usize>,
}

impl UnsafeVarMarker {
    pub(crate) fn new() -> Self {
        UnsafeVarMarker {
            unsafe_perm_vars: IndexMap::new(),
            safe_perm_vars: IndexSet::new(),
            safe_temp_vars: IndexSet::new(),
            temp_vars_to_perm_vars: IndexMap::new(),
            perm_vars_to_temp_vars: IndexMap::new(),
        }
    }

    fn mark_var_as_safe(&mut self, r: RegType) {
        match r {
            RegType::Temp(t) => {
                self.safe_temp_vars.insert(t);
            }
            RegType::Perm(p) => {
                self.safe_perm_vars.insert(p);
            }
        }
    }

    fn mark_var_as_unsafe(&mut self, r: RegType, phase: usize) {
        if let RegType::Perm(p) = r {
            self.unsafe_perm_vars.insert(p, phase);
        }
    }

    // returns true iff the instruction can never be rewritten.
    fn mark_safe_vars(&mut self, instr: &Line) -> bool {
        match instr {
            &Line::Query(QueryInstruction::PutVariable(r @ RegType::Temp(_), _))
            | &Line::Query(QueryInstruction::SetVariable(r)) => {
                self.mark_var_as_safe(r);
                true
            }
            &Line::Query(QueryInstruction::PutVariable(RegType::Perm(p), t)) => {
                self.temp_vars_to_perm_vars.insert(t, p);
                true
            }
            &Line::Fact(FactInstruction::GetVariable(r, _))
            | &Line::Fact(FactInstruction::UnifyVariable(r))
            | &Line::Fact(FactInstruction::UnifyValue(r)) => {
                self.mark_var_as_safe(r);
                true
            }
            _ => false,
        }
    }

    fn mark_phase(&mut self, instr: &Line, phase: usize) {
        if let &Line::Query(QueryInstruction::PutValue(r @ RegType::Perm(_), _)) = instr {
            self.mark_var_as_unsafe(r, phase);
        }
    }

    fn mark_unsafe_perm_vars(&mut self, instr: &mut Line, phase: usize) {
        match instr {
            Line::Query(query_instr @ QueryInstruction::PutValue(RegType::Perm(_), _)) => {
                let (p, arg) = match *query_instr {
                    QueryInstruction::PutValue(RegType::Perm(p), arg) => (p, arg),
                    _ => unreachable!(),
                };

                if !self.safe_perm_vars.contains(&p) {
                    if let Some(ph) = self.unsafe_perm_vars.swap_remove(&p) {
                        if ph == phase {
                            *query_instr = QueryInstruction::PutUnsafeValue(p, arg);
                            self.perm_vars_to_temp_vars.insert(p, arg);
                        } else {
                            self.unsafe_perm_vars.insert(p, ph);
                        }
                    }
                }
            }
            Line::Query(query_instr @ QueryInstruction::SetValue(RegType::Perm(_))) => {
                let p = match *query_instr {
                    QueryInstruction::SetValue(RegType::Perm(p)) => p,
                    _ => unreachable!(),
                };

                if self.safe_perm_vars.contains(&p) {
                    return;
                }

                if let Some(t) = self.perm_vars_to_temp_vars.get(&p) {
                    *query_instr = QueryInstruction::SetValue(RegType::Temp(*t));
                } else {
                    *query_instr = QueryInstruction::SetLocalValue(RegType::Perm(p));
                }
            }
            _ => {}
        }
    }

    fn mark_unsafe_temp_vars(&mut self, instr: &mut Line) {
        if let Line::Query(query_instr @ QueryInstruction::SetValue(RegType::Temp(_))) = instr {
            let t = match *query_instr {
                QueryInstruction::SetValue(RegType::Temp(t)) => t,
                _ => unreachable!(),
            };

            if !self.safe_temp_vars.contains(&t) {
                *query_instr = QueryInstruction::SetLocalValue(RegType::Temp(t));
                self.safe_temp_vars.insert(t);
            }
        }
    }

    fn clear_temp_vars(&mut self) {
        self.safe_temp_vars.clear();
        self.temp_vars_to_perm_vars.clear();
    }

    fn is_phase_boundary(line: &Line) -> bool {
        matches!(
            line,
            Line::Control(ControlInstruction::CallClause { .. })
        )
    }

    /// Two linear sweeps over the emitted clause code. The first records
    /// which registers are certainly initialized within each phase (a
    /// phase ends at every call) and rewrites unsafe temporaries on the
    /// spot; the second rewrites a permanent's last-phase `put_value`s.
    pub(crate) fn mark_unsafe_instrs(&mut self, code: &mut Code) {
        if code.is_empty() {
            return;
        }

        let mut phase = 0;

        for line in code.iter_mut() {
            if Self::is_phase_boundary(line) {
                phase += 1;
                self.clear_temp_vars();
                continue;
            }

            if !self.mark_safe_vars(line) {
                self.mark_phase(line, phase);
                self.mark_unsafe_temp_vars(line);
            }
        }

        phase = 0;

        for line in code.iter_mut() {
            if Self::is_phase_boundary(line) {
                phase += 1;
                continue;
            }

            self.mark_unsafe_perm_vars(line, phase);
        }
    }
}
