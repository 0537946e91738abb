use crate::fixtures::*;
use crate::forms::*;
use crate::instructions::*;
use crate::targets::*;

use std::cell::Cell;

pub(crate) trait Allocator {
    fn new() -> Self;

    fn mark_anon_var<'a, Target: CompilationTarget<'a>>(
        &mut self,
        lvl: Level,
        context: GenContext,
        code: &mut CodeDeque,
    );

    fn mark_non_var<'a, Target: CompilationTarget<'a>>(
        &mut self,
        lvl: Level,
        context: GenContext,
        cell: &'a Cell<RegType>,
        code: &mut CodeDeque,
    );

    fn mark_var<'a, Target: CompilationTarget<'a>>(
        &mut self,
        var: Var,
        lvl: Level,
        cell: &'a Cell<VarReg>,
        context: GenContext,
        code: &mut CodeDeque,
    );

    /// Binding for a cut-barrier variable; never emits, only resolves
    /// the register the barrier was stored in.
    fn mark_cut_var(&mut self, var: &Var, cell: &Cell<VarReg>) -> RegType;

    fn reset(&mut self);
    fn reset_arg(&mut self, arg_num: usize);
    fn reset_at_head(&mut self, args: &[Term]);
    fn reset_contents(&mut self);

    fn advance_arg(&mut self);
    fn max_reg_allocated(&self) -> usize;

    fn bindings(&self) -> &AllocVarDict;
    fn bindings_mut(&mut self) -> &mut AllocVarDict;

    fn get(&self, var: &Var) -> RegType {
        self.bindings()
            .get(var)
            .map(|v| v.as_reg_type())
            .unwrap_or(RegType::Temp(0))
    }

    fn record_register(&mut self, var: Var, r: RegType) {
        match self.bindings_mut().get_mut(&var) {
            Some(VarData::Temp(_, ref mut s, _)) => *s = r.reg_num(),
            Some(VarData::Perm(ref mut s)) => *s = r.reg_num(),
            None => {}
        }
    }

    fn num_perm_vars(&self) -> usize {
        self.bindings()
            .values()
            .filter(|data| matches!(data, VarData::Perm(_)))
            .count()
    }
}
