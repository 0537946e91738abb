//! Lowers stored clause terms into the compiler's AST: flattens
//! conjunctions, turns `;/2`, `->/2` and `\+/1` into branch skeletons
//! with explicit cut barriers, numbers variables, and applies the
//! load-time syntax checks that keep malformed clauses out of the
//! database.

use crate::atom_table::*;
use crate::forms::*;
use crate::machine::heap::*;
use crate::machine::machine_errors::*;
use crate::types::*;

use fxhash::FxHashMap;

use std::cell::Cell;
use std::rc::Rc;

struct TermLowerer<'a> {
    heap: &'a Heap,
    var_names: FxHashMap<Ref, Var>,
    fresh_counter: usize,
}

impl<'a> TermLowerer<'a> {
    fn new(heap: &'a Heap) -> Self {
        TermLowerer {
            heap,
            var_names: FxHashMap::default(),
            fresh_counter: 0,
        }
    }

    fn var_for(&mut self, r: Ref) -> Var {
        if let Some(var) = self.var_names.get(&r) {
            return var.clone();
        }

        let var: Var = match r {
            Ref::HeapCell(h) => Rc::new(format!("_{}", h)),
            Ref::StackCell(fr, sc) => Rc::new(format!("_s{}_{}", fr, sc)),
        };

        self.var_names.insert(r, var.clone());
        var
    }

    fn fresh_var(&mut self, prefix: &str) -> Var {
        self.fresh_counter += 1;
        Rc::new(format!("{}{}", prefix, self.fresh_counter))
    }

    fn lower_term(&mut self, cell: HeapCellValue) -> Term {
        let addr = self.heap.bound_deref(cell);

        match self.heap.bound_deref(addr) {
            HeapCellValue::Var(h) => {
                let var = self.var_for(Ref::HeapCell(h));
                Term::Var(Cell::default(), var)
            }
            HeapCellValue::StackVar(fr, sc) => {
                let var = self.var_for(Ref::StackCell(fr, sc));
                Term::Var(Cell::default(), var)
            }
            HeapCellValue::Fixnum(n) => Term::Literal(Cell::default(), Literal::Fixnum(n)),
            HeapCellValue::Big(h) => Term::Literal(
                Cell::default(),
                Literal::Integer(Rc::new(self.heap.read_big(h))),
            ),
            HeapCellValue::Atom(name, 0) => Term::Literal(Cell::default(), Literal::Atom(name)),
            HeapCellValue::Lis(l) => {
                let head = self.lower_term(self.heap[l]);
                let tail = self.lower_term(self.heap[l + 1]);
                Term::Cons(Cell::default(), Box::new(head), Box::new(tail))
            }
            HeapCellValue::Str(s) => {
                let (name, arity) = match self.heap[s] {
                    HeapCellValue::Atom(name, arity) => (name, arity),
                    cell => unreachable!("structure points at {:?}", cell),
                };

                let args = (1..=arity)
                    .map(|i| self.lower_term(self.heap[s + i]))
                    .collect();

                Term::Clause(Cell::default(), name, args)
            }
            cell => unreachable!("clause term contains {:?}", cell),
        }
    }
}

fn functor_of(heap: &Heap, cell: HeapCellValue) -> Option<(Atom, usize, usize)> {
    match heap.bound_deref(cell) {
        HeapCellValue::Atom(name, 0) => Some((name, 0, 0)),
        HeapCellValue::Str(s) => match heap[s] {
            HeapCellValue::Atom(name, arity) => Some((name, arity, s)),
            _ => None,
        },
        _ => None,
    }
}

fn is_control_functor(name: Atom, arity: usize) -> bool {
    matches!(
        (name, arity),
        (a, 2) if a == atom!(":-") || a == atom!(";") || a == atom!(",") || a == atom!("->")
    ) || (name == atom!("\\+") && arity == 1)
}

/// Whether a goal sequence contains a `!` transparent at this level:
/// `->/2` conditions and `\+/1` arguments are opaque, disjunction arms
/// and then/else branches are not.
fn contains_transparent_cut(heap: &Heap, cell: HeapCellValue) -> bool {
    let addr = heap.bound_deref(cell);

    if addr == HeapCellValue::Atom(atom!("!"), 0) {
        return true;
    }

    match functor_of(heap, addr) {
        Some((name, 2, s)) if name == atom!(",") || name == atom!(";") => {
            contains_transparent_cut(heap, heap[s + 1])
                || contains_transparent_cut(heap, heap[s + 2])
        }
        Some((name, 2, s)) if name == atom!("->") => {
            // only the `then` side is transparent.
            contains_transparent_cut(heap, heap[s + 2])
        }
        _ => false,
    }
}

pub(crate) struct ClausePreprocessor<'a> {
    lowerer: TermLowerer<'a>,
}

impl<'a> ClausePreprocessor<'a> {
    pub(crate) fn new(heap: &'a Heap) -> Self {
        ClausePreprocessor {
            lowerer: TermLowerer::new(heap),
        }
    }

    /// Lowers one goal into the body under construction. `cut_var` is
    /// the barrier a transparent `!` prunes to.
    fn lower_goal(
        &mut self,
        cell: HeapCellValue,
        cut_var: &Var,
        body: &mut Vec<QueryTerm>,
    ) -> Result<(), MachineError> {
        let heap = self.lowerer.heap;
        let addr = heap.bound_deref(cell);

        if addr.is_var() {
            // a variable goal is a runtime meta-call.
            let arg = self.lowerer.lower_term(addr);
            body.push(QueryTerm::Clause(atom!("call"), vec![arg]));
            return Ok(());
        }

        if addr == HeapCellValue::Atom(atom!("!"), 0) {
            body.push(QueryTerm::GlobalCut {
                cell: Cell::default(),
                var: cut_var.clone(),
            });
            return Ok(());
        }

        if addr == HeapCellValue::Atom(atom!("true"), 0) {
            body.push(QueryTerm::Succeed);
            return Ok(());
        }

        if addr == HeapCellValue::Atom(atom!("fail"), 0)
            || addr == HeapCellValue::Atom(atom!("false"), 0)
        {
            body.push(QueryTerm::Fail);
            return Ok(());
        }

        match functor_of(heap, addr) {
            Some((name, 2, s)) if name == atom!(",") => {
                self.lower_goal(heap[s + 1], cut_var, body)?;
                self.lower_goal(heap[s + 2], cut_var, body)
            }
            Some((name, 2, s)) if name == atom!(";") => {
                let lhs = heap.bound_deref(heap[s + 1]);
                let rhs = heap[s + 2];

                if let Some((lhs_name, 2, ite_s)) = functor_of(heap, lhs) {
                    if lhs_name == atom!("->") {
                        let branch = self.lower_if_then_else(
                            heap[ite_s + 1],
                            heap[ite_s + 2],
                            Some(rhs),
                            cut_var,
                        )?;
                        body.extend(branch);
                        return Ok(());
                    }
                }

                let mut arms = vec![];

                for arm_goal in [lhs, rhs] {
                    let mut arm = vec![];
                    self.lower_goal(arm_goal, cut_var, &mut arm)?;
                    arms.push(arm);
                }

                body.push(QueryTerm::Branch(arms));
                Ok(())
            }
            Some((name, 2, s)) if name == atom!("->") => {
                let branch =
                    self.lower_if_then_else(heap[s + 1], heap[s + 2], None, cut_var)?;
                body.extend(branch);
                Ok(())
            }
            Some((name, 1, s)) if name == atom!("\\+") => {
                let branch = self.lower_negation(heap[s + 1], cut_var)?;
                body.extend(branch);
                Ok(())
            }
            Some((name, arity, _)) if is_control_functor(name, arity) => {
                Err(SyntaxError::BadGoal.into())
            }
            Some((name, arity, s)) => {
                let args = (1..=arity)
                    .map(|i| self.lowerer.lower_term(heap[s + i]))
                    .collect();

                body.push(QueryTerm::Clause(name, args));
                Ok(())
            }
            None => Err(SyntaxError::BadGoal.into()),
        }
    }

    fn lower_if_then_else(
        &mut self,
        cond: HeapCellValue,
        then: HeapCellValue,
        els: Option<HeapCellValue>,
        cut_var: &Var,
    ) -> Result<Vec<QueryTerm>, MachineError> {
        let heap = self.lowerer.heap;

        // barrier for the commit after the condition, captured before
        // the branch choice point exists.
        let commit_var = self.lowerer.fresh_var("$ite_");

        let mut then_arm = vec![];

        if contains_transparent_cut(heap, cond) {
            // cuts inside the condition are local to it.
            let local_var = self.lowerer.fresh_var("$cond_");
            then_arm.push(QueryTerm::GetCutPoint {
                cell: Cell::default(),
                var: local_var.clone(),
            });
            self.lower_goal(cond, &local_var, &mut then_arm)?;
        } else {
            self.lower_goal(cond, cut_var, &mut then_arm)?;
        }

        then_arm.push(QueryTerm::LocalCut {
            cell: Cell::default(),
            var: commit_var.clone(),
        });

        self.lower_goal(then, cut_var, &mut then_arm)?;

        let mut else_arm = vec![];

        match els {
            Some(els) => self.lower_goal(els, cut_var, &mut else_arm)?,
            None => else_arm.push(QueryTerm::Fail),
        }

        Ok(vec![
            QueryTerm::GetCutPoint {
                cell: Cell::default(),
                var: commit_var,
            },
            QueryTerm::Branch(vec![then_arm, else_arm]),
        ])
    }

    fn lower_negation(
        &mut self,
        goal: HeapCellValue,
        _cut_var: &Var,
    ) -> Result<Vec<QueryTerm>, MachineError> {
        let commit_var = self.lowerer.fresh_var("$naf_");
        let local_var = self.lowerer.fresh_var("$nafc_");

        let mut fail_arm = vec![QueryTerm::GetCutPoint {
            cell: Cell::default(),
            var: local_var.clone(),
        }];

        // `\+/1` is opaque to cut: cuts in the goal are local to it.
        self.lower_goal(goal, &local_var, &mut fail_arm)?;

        fail_arm.push(QueryTerm::LocalCut {
            cell: Cell::default(),
            var: commit_var.clone(),
        });
        fail_arm.push(QueryTerm::Fail);

        let succeed_arm = vec![QueryTerm::Succeed];

        Ok(vec![
            QueryTerm::GetCutPoint {
                cell: Cell::default(),
                var: commit_var,
            },
            QueryTerm::Branch(vec![fail_arm, succeed_arm]),
        ])
    }

    /// Replaces leading clause-level cuts with neck cuts and decides
    /// whether a get_level is needed for the later ones.
    fn resolve_clause_cuts(&mut self, body: &mut Vec<QueryTerm>, cut_var: &Var) {
        let mut prefix = true;
        let mut needs_level = false;

        fn scan(terms: &mut [QueryTerm], prefix: &mut bool, needs_level: &mut bool, cut_var: &Var) {
            for term in terms.iter_mut() {
                match term {
                    QueryTerm::Clause(..) => *prefix = false,
                    QueryTerm::Branch(arms) => {
                        *prefix = false;

                        for arm in arms.iter_mut() {
                            scan(arm, &mut false, needs_level, cut_var);
                        }
                    }
                    QueryTerm::GlobalCut { var, .. } if var == cut_var => {
                        if *prefix {
                            *term = QueryTerm::NeckCut;
                        } else {
                            *needs_level = true;
                        }
                    }
                    _ => {}
                }
            }
        }

        scan(body, &mut prefix, &mut needs_level, cut_var);

        if needs_level {
            body.insert(
                0,
                QueryTerm::GetLevel {
                    cell: Cell::default(),
                    var: cut_var.clone(),
                },
            );
        }
    }

    fn check_head(&self, name: Atom, arity: usize) -> Result<(), MachineError> {
        if is_control_functor(name, arity) || (name == atom!(":-") && arity <= 2) {
            return Err(MachineError::Syntax(SyntaxError::BadClauseHead(
                "the head of a clause may not be a control functor",
            )));
        }

        Ok(())
    }

    /// Lowers a stored clause term (`Head :- Body` or a bare head) into
    /// a compilable `PredicateClause` and its predicate key.
    pub(crate) fn lower_clause(
        &mut self,
        module: Atom,
        cell: HeapCellValue,
    ) -> Result<((Atom, Atom, usize), PredicateClause), MachineError> {
        let heap = self.lowerer.heap;
        let addr = heap.bound_deref(cell);

        let (head_cell, body_cell) = match functor_of(heap, addr) {
            Some((name, 2, s)) if name == atom!(":-") => {
                (heap.bound_deref(heap[s + 1]), Some(heap[s + 2]))
            }
            Some(_) => (addr, None),
            None => return Err(SyntaxError::NotAClause.into()),
        };

        self.lower_clause_parts(module, head_cell, body_cell)
    }

    /// As `lower_clause`, for a clause already split into its stored
    /// head and body halves.
    pub(crate) fn lower_stored_clause(
        &mut self,
        module: Atom,
        head_cell: HeapCellValue,
        body_cell: HeapCellValue,
    ) -> Result<((Atom, Atom, usize), PredicateClause), MachineError> {
        let heap = self.lowerer.heap;
        let head_cell = heap.bound_deref(head_cell);

        self.lower_clause_parts(module, head_cell, Some(body_cell))
    }

    fn lower_clause_parts(
        &mut self,
        module: Atom,
        head_cell: HeapCellValue,
        body_cell: Option<HeapCellValue>,
    ) -> Result<((Atom, Atom, usize), PredicateClause), MachineError> {
        let heap = self.lowerer.heap;

        let (name, arity, _) = match functor_of(heap, head_cell) {
            Some(f) => f,
            None => {
                return Err(MachineError::Syntax(SyntaxError::BadClauseHead(
                    "the head of a clause must be a callable term",
                )))
            }
        };

        self.check_head(name, arity)?;

        let head = self.lowerer.lower_term(head_cell);

        let body_cell = match body_cell {
            None => {
                return Ok(((module, name, arity), PredicateClause::Fact(Fact { head })));
            }
            Some(body_cell) => body_cell,
        };

        if heap.bound_deref(body_cell) == HeapCellValue::Atom(atom!("true"), 0) {
            return Ok(((module, name, arity), PredicateClause::Fact(Fact { head })));
        }

        let cut_var = self.lowerer.fresh_var("$lvl_");
        let mut body = vec![];

        self.lower_goal(body_cell, &cut_var, &mut body)?;
        self.resolve_clause_cuts(&mut body, &cut_var);

        let head_args = match head {
            Term::Clause(_, _, args) => args,
            Term::Literal(_, Literal::Atom(_)) => vec![],
            _ => unreachable!(),
        };

        Ok((
            (module, name, arity),
            PredicateClause::Rule(Rule {
                head: (name, head_args),
                body,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::machine_state::MachineState;
    use crate::parser::Parser;

    fn lower(src: &str) -> (Atom, Atom, usize, PredicateClause) {
        let mut machine_st = MachineState::new();
        let result = {
            let mut parser = Parser::new(&mut machine_st, src).unwrap();
            parser.read_term().unwrap()
        };

        let mut preprocessor = ClausePreprocessor::new(&machine_st.heap);
        let ((m, f, a), clause) = preprocessor
            .lower_clause(atom!("user"), result.term)
            .unwrap();

        (m, f, a, clause)
    }

    #[test]
    fn facts_and_rules_split_at_the_neck() {
        let (_, _, arity, clause) = lower("p(1).");
        assert_eq!(arity, 1);
        assert!(matches!(clause, PredicateClause::Fact(_)));

        let (_, _, _, clause) = lower("p(X) :- q(X).");
        match clause {
            PredicateClause::Rule(rule) => {
                assert_eq!(rule.body.len(), 1);
            }
            clause => panic!("expected a rule, got {:?}", clause),
        }
    }

    #[test]
    fn leading_cuts_become_neck_cuts() {
        let (_, _, _, clause) = lower("p(X) :- !, q(X).");

        match clause {
            PredicateClause::Rule(rule) => {
                assert!(matches!(rule.body[0], QueryTerm::NeckCut));
            }
            clause => panic!("expected a rule, got {:?}", clause),
        }
    }

    #[test]
    fn deep_cuts_get_a_level() {
        let (_, _, _, clause) = lower("p(X) :- q(X), !.");

        match clause {
            PredicateClause::Rule(rule) => {
                assert!(matches!(rule.body[0], QueryTerm::GetLevel { .. }));
                assert!(matches!(rule.body[2], QueryTerm::GlobalCut { .. }));
            }
            clause => panic!("expected a rule, got {:?}", clause),
        }
    }

    #[test]
    fn if_then_else_lowers_to_a_guarded_branch() {
        let (_, _, _, clause) = lower("p(X) :- (X = 1 -> q ; r).");

        match clause {
            PredicateClause::Rule(rule) => {
                assert!(matches!(rule.body[0], QueryTerm::GetCutPoint { .. }));
                match &rule.body[1] {
                    QueryTerm::Branch(arms) => {
                        assert_eq!(arms.len(), 2);
                        assert!(arms[0]
                            .iter()
                            .any(|t| matches!(t, QueryTerm::LocalCut { .. })));
                    }
                    term => panic!("expected a branch, got {:?}", term),
                }
            }
            clause => panic!("expected a rule, got {:?}", clause),
        }
    }

    #[test]
    fn control_functors_are_rejected_as_heads() {
        let mut machine_st = MachineState::new();
        let result = {
            let mut parser = Parser::new(&mut machine_st, "(a ; b) :- c.").unwrap();
            parser.read_term().unwrap()
        };

        let mut preprocessor = ClausePreprocessor::new(&machine_st.heap);
        assert!(preprocessor
            .lower_clause(atom!("user"), result.term)
            .is_err());
    }
}
