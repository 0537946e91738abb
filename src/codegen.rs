use crate::allocator::*;
use crate::atom_table::*;
use crate::debray_allocator::*;
use crate::fixtures::*;
use crate::forms::*;
use crate::indexing::*;
use crate::instructions::*;
use crate::iterators::*;
use crate::machine::machine_errors::*;
use crate::targets::*;

/// The register file is larger than the maximum arity so deep clauses
/// can spill into high temporaries without freeing.
pub const MAX_REGS: usize = 4096;

/// Tracks chunk numbers during emission with exactly the transitions of
/// `build_chunks`, so the allocator sees the same chunk for a variable
/// as the classification pass did.
#[derive(Debug, Clone, Copy)]
struct ChunkCursor {
    num: usize,
    open: bool,
}

impl ChunkCursor {
    fn start() -> Self {
        // the head opens chunk 0.
        ChunkCursor {
            num: 0,
            open: true,
        }
    }

    fn mark_content(&mut self) {
        self.open = true;
    }

    fn flush(&mut self) {
        if self.open {
            self.num += 1;
            self.open = false;
        }
    }
}

/// Compiles clauses to instruction sequences: the head through the fact
/// target, body goals through the query target, with Debray register
/// allocation, inline branch skeletons for disjunction, unsafe-variable
/// rewriting and the tail-call and void-coalescing peephole rules.
#[derive(Debug)]
pub(crate) struct CodeGenerator {
    marker: DebrayAllocator,
    in_tail_position: bool,
    allocates: bool,
}

impl CodeGenerator {
    pub(crate) fn new() -> Self {
        CodeGenerator {
            marker: DebrayAllocator::new(),
            in_tail_position: false,
            allocates: false,
        }
    }

    fn add_or_increment_void_instr<'a, Target>(target: &mut CodeDeque)
    where
        Target: CompilationTarget<'a>,
    {
        if let Some(instr) = target.back_mut() {
            if Target::is_void_instr(instr) {
                Target::incr_void_instr(instr);
                return;
            }
        }

        target.push_back(Target::to_void(1));
    }

    fn subterm_to_instr<'a, Target: CompilationTarget<'a>>(
        &mut self,
        subterm: &'a Term,
        context: GenContext,
        target: &mut CodeDeque,
    ) {
        match subterm {
            Term::AnonVar => {
                Self::add_or_increment_void_instr::<Target>(target);
            }
            Term::Var(cell, var) => {
                self.marker
                    .mark_var::<Target>(var.clone(), Level::Deep, cell, context, target);
            }
            Term::Literal(_, literal) => {
                target.push_back(Target::constant_subterm(literal.clone()));
            }
            Term::Clause(cell, ..) | Term::Cons(cell, ..) => {
                self.marker
                    .mark_non_var::<Target>(Level::Deep, context, cell, target);
                target.push_back(Target::clause_arg_to_instr(cell.get()));
            }
        }
    }

    fn compile_target<'a, Target: CompilationTarget<'a>>(
        &mut self,
        args: &'a [Term],
        context: GenContext,
    ) -> CodeDeque {
        let mut target = CodeDeque::new();

        for term in Target::iter(args) {
            match term {
                TermRef::AnonVar(lvl) => {
                    if let Level::Shallow = lvl {
                        if let GenContext::Head = context {
                            self.marker.advance_arg();
                        } else {
                            self.marker.mark_anon_var::<Target>(lvl, context, &mut target);
                        }
                    }
                }
                TermRef::Clause(lvl, cell, name, args) => {
                    self.marker
                        .mark_non_var::<Target>(lvl, context, cell, &mut target);
                    target.push_back(Target::to_structure(lvl, name, args.len(), cell.get()));

                    for arg in args {
                        self.subterm_to_instr::<Target>(arg, context, &mut target);
                    }
                }
                TermRef::Cons(lvl, cell, head, tail) => {
                    self.marker
                        .mark_non_var::<Target>(lvl, context, cell, &mut target);
                    target.push_back(Target::to_list(lvl, cell.get()));

                    self.subterm_to_instr::<Target>(head, context, &mut target);
                    self.subterm_to_instr::<Target>(tail, context, &mut target);
                }
                TermRef::Literal(lvl, cell, literal) => {
                    if let Level::Shallow = lvl {
                        self.marker
                            .mark_non_var::<Target>(lvl, context, cell, &mut target);
                        target.push_back(Target::to_constant(lvl, literal.clone(), cell.get()));
                    }
                }
                TermRef::Var(lvl, cell, var) => {
                    if let Level::Shallow = lvl {
                        self.marker
                            .mark_var::<Target>(var, lvl, cell, context, &mut target);
                    }
                }
            }
        }

        target
    }

    fn add_call(&mut self, code: &mut CodeDeque, name: Atom, arity: usize) {
        if self.in_tail_position {
            if self.allocates {
                code.push_back(instr!("deallocate"));
            }

            code.push_back(Line::Control(ControlInstruction::CallClause {
                name,
                arity,
                last_call: true,
            }));
        } else {
            code.push_back(Line::Control(ControlInstruction::CallClause {
                name,
                arity,
                last_call: false,
            }));
        }
    }

    /// deallocate + proceed for a clause whose final goal transfers no
    /// control itself (a cut, or `true`).
    fn add_epilogue(&mut self, code: &mut CodeDeque) {
        if self.allocates {
            code.push_back(instr!("deallocate"));
        }

        code.push_back(instr!("proceed"));
    }

    fn compile_branch(
        &mut self,
        arms: &[Vec<QueryTerm>],
        cursor: &mut ChunkCursor,
        code: &mut CodeDeque,
    ) -> Result<(), CompilationError> {
        let in_tail_position = self.in_tail_position;

        cursor.flush();

        let mut arm_codes = vec![];

        for arm in arms {
            let mut arm_code = CodeDeque::new();

            self.marker.reset_contents();
            self.in_tail_position = in_tail_position;
            self.compile_seq(arm, cursor, &mut arm_code)?;

            if in_tail_position {
                self.ensure_transfer(&mut arm_code);
            }

            cursor.flush();
            arm_codes.push(arm_code);
        }

        self.in_tail_position = in_tail_position;

        // arm block sizes, with a trailing jump for every arm but the
        // last when the branch is not in tail position.
        let num_arms = arm_codes.len();
        let block_size = |idx: usize, len: usize| {
            if !in_tail_position && idx + 1 < num_arms {
                len + 1
            } else {
                len
            }
        };

        let block_sizes: Vec<_> = arm_codes
            .iter()
            .enumerate()
            .map(|(idx, arm_code)| block_size(idx, arm_code.len()))
            .collect();

        for (idx, arm_code) in arm_codes.into_iter().enumerate() {
            let choice = if idx == 0 {
                instr!("try_me_else", block_sizes[idx] + 1)
            } else if idx + 1 == num_arms {
                instr!("trust_me")
            } else {
                instr!("retry_me_else", block_sizes[idx] + 1)
            };

            code.push_back(choice);
            let arm_len = arm_code.len();
            code.extend(arm_code);

            if !in_tail_position && idx + 1 < num_arms {
                // skip the remaining arm blocks and their choice
                // instructions.
                let distance = 1 + block_sizes[idx + 1..]
                    .iter()
                    .map(|size| size + 1)
                    .sum::<usize>();

                debug_assert_eq!(arm_len + 1, block_sizes[idx]);
                code.push_back(instr!("jmp_by", distance));
            }
        }

        Ok(())
    }

    // appends proceed to a tail branch arm that fell through, e.g. one
    // ending in a cut or `true`.
    fn ensure_transfer(&mut self, code: &mut CodeDeque) {
        let transfers = matches!(
            code.back(),
            Some(Line::Control(ControlInstruction::CallClause {
                last_call: true,
                ..
            })) | Some(Line::Control(ControlInstruction::Proceed))
                | Some(Line::Control(ControlInstruction::Fail))
        );

        if !transfers {
            self.add_epilogue(code);
        }
    }

    fn compile_seq(
        &mut self,
        body: &[QueryTerm],
        cursor: &mut ChunkCursor,
        code: &mut CodeDeque,
    ) -> Result<(), CompilationError> {
        let outer_tail_position = self.in_tail_position;

        for (idx, term) in body.iter().enumerate() {
            self.in_tail_position = outer_tail_position && idx + 1 == body.len();

            match term {
                QueryTerm::Clause(name, args) => {
                    cursor.mark_content();

                    self.marker.reset_arg(args.len());
                    let context = GenContext::Last(cursor.num);

                    let query_code =
                        self.compile_target::<QueryInstructionTarget>(args, context);
                    code.extend(query_code);

                    if self.marker.max_reg_allocated() > MAX_REGS {
                        return Err(CompilationError::ExceededMaxArity);
                    }

                    self.add_call(code, *name, args.len());

                    cursor.flush();
                    self.marker.reset_contents();
                }
                QueryTerm::Branch(arms) => {
                    self.compile_branch(arms, cursor, code)?;
                    self.marker.reset_contents();
                }
                QueryTerm::GetLevel { cell, var } => {
                    cursor.mark_content();
                    let r = self.marker.mark_cut_var(var, cell);
                    code.push_back(instr!("get_level", r));
                }
                QueryTerm::GetCutPoint { cell, var } => {
                    cursor.mark_content();
                    let r = self.marker.mark_cut_var(var, cell);
                    code.push_back(instr!("get_cut_point", r));
                }
                QueryTerm::NeckCut => {
                    cursor.mark_content();
                    code.push_back(instr!("neck_cut"));

                    if self.in_tail_position {
                        self.add_epilogue(code);
                    }
                }
                QueryTerm::GlobalCut { cell, var } | QueryTerm::LocalCut { cell, var } => {
                    cursor.mark_content();
                    let r = self.marker.mark_cut_var(var, cell);
                    code.push_back(instr!("cut", r));

                    if self.in_tail_position {
                        self.add_epilogue(code);
                    }
                }
                QueryTerm::Fail => {
                    cursor.mark_content();
                    code.push_back(instr!("$fail"));
                }
                QueryTerm::Succeed => {
                    cursor.mark_content();

                    if self.in_tail_position {
                        self.add_epilogue(code);
                    }
                }
            }
        }

        self.in_tail_position = outer_tail_position;
        Ok(())
    }

    fn classify_vars<'a>(
        &mut self,
        head: Option<&'a [Term]>,
        body: &'a [QueryTerm],
    ) -> usize {
        let chunks = build_chunks(head, body);
        let mut fixtures = VariableFixtures::new();

        for chunk in &chunks {
            fixtures.mark_vars_in_chunk(chunk);
        }

        fixtures.populate_restricting_sets();
        let num_perm_vars = fixtures.set_perm_vals();

        self.marker.reset();
        self.marker.set_bindings(fixtures.into_bindings());

        self.allocates = num_perm_vars > 0 || chunks.len() > 1;
        num_perm_vars
    }

    pub(crate) fn compile_fact(&mut self, fact: &Fact) -> Result<Code, CompilationError> {
        let args: &[Term] = match &fact.head {
            Term::Clause(_, _, args) => args,
            Term::Literal(_, Literal::Atom(_)) => &[],
            _ => return Err(CompilationError::InadmissibleFact),
        };

        if args.len() > MAX_ARITY {
            return Err(CompilationError::ExceededMaxArity);
        }

        self.classify_vars(Some(args), &[]);
        self.marker.reset_at_head(args);

        let mut code: Code =
            Vec::from(self.compile_target::<FactInstructionTarget>(args, GenContext::Head));

        if self.marker.max_reg_allocated() > MAX_REGS {
            return Err(CompilationError::ExceededMaxArity);
        }

        code.push(instr!("proceed"));
        Ok(code)
    }

    pub(crate) fn compile_rule(&mut self, rule: &Rule) -> Result<Code, CompilationError> {
        let (_, args) = &rule.head;

        if args.len() > MAX_ARITY {
            return Err(CompilationError::ExceededMaxArity);
        }

        let num_perm_vars = self.classify_vars(Some(args), &rule.body);

        self.marker.reset_at_head(args);

        let mut code = CodeDeque::new();
        let head_code = self.compile_target::<FactInstructionTarget>(args, GenContext::Head);
        code.extend(head_code);

        if self.marker.max_reg_allocated() > MAX_REGS {
            return Err(CompilationError::ExceededMaxArity);
        }

        let mut cursor = ChunkCursor::start();

        self.in_tail_position = true;
        self.compile_seq(&rule.body, &mut cursor, &mut code)?;
        self.in_tail_position = false;

        self.ensure_transfer(&mut code);

        if self.allocates {
            code.push_front(instr!("allocate", num_perm_vars));
        }

        let mut code = Vec::from(code);
        UnsafeVarMarker::new().mark_unsafe_instrs(&mut code);

        Ok(code)
    }

    fn compile_clause(&mut self, clause: &PredicateClause) -> Result<Code, CompilationError> {
        match clause {
            PredicateClause::Fact(fact) => self.compile_fact(fact),
            PredicateClause::Rule(rule) => self.compile_rule(rule),
        }
    }

    fn is_indexable(clause: &PredicateClause) -> bool {
        matches!(
            clause.first_arg(),
            Some(Term::Literal(..)) | Some(Term::Cons(..)) | Some(Term::Clause(..))
        )
    }

    /// Splits a predicate's clauses into maximal indexable runs. Clauses
    /// whose first head argument is a variable must be tried in source
    /// order relative to everything else, so each becomes its own
    /// sequential span.
    fn split_predicate(clauses: &[PredicateClause]) -> Vec<ClauseSpan> {
        let mut spans = vec![];
        let mut left = 0;

        for (right, clause) in clauses.iter().enumerate() {
            if !Self::is_indexable(clause) {
                if left < right {
                    spans.push(ClauseSpan { left, right });
                }

                spans.push(ClauseSpan {
                    left: right,
                    right: right + 1,
                });

                left = right + 1;
            }
        }

        if left < clauses.len() {
            spans.push(ClauseSpan {
                left,
                right: clauses.len(),
            });
        }

        spans
    }

    fn compile_pred_subseq(
        &mut self,
        clauses: &[PredicateClause],
    ) -> Result<Code, CompilationError> {
        let mut code = CodeDeque::new();
        let mut code_offsets = CodeOffsets::new();

        let multi_clause = clauses.len() > 1;

        for (i, clause) in clauses.iter().enumerate() {
            self.marker.reset();

            let clause_code = self.compile_clause(clause)?;

            if multi_clause {
                let choice = if i == 0 {
                    instr!("try_me_else", clause_code.len() + 1)
                } else if i + 1 == clauses.len() {
                    instr!("trust_me")
                } else {
                    instr!("retry_me_else", clause_code.len() + 1)
                };

                code.push_back(choice);

                if let Some(first_arg) = clause.first_arg() {
                    // + 1 for the indexing block prepended below.
                    code_offsets.index_term(first_arg, code.len() + 1);
                }
            }

            code.extend(clause_code);
        }

        if multi_clause {
            let index_code = code_offsets.compute_indices();

            if !index_code.is_empty() {
                code.push_front(Line::IndexingCode(index_code));
            }
        }

        Ok(Vec::from(code))
    }

    pub(crate) fn compile_predicate(
        &mut self,
        clauses: &[PredicateClause],
    ) -> Result<Code, CompilationError> {
        let mut code = Code::new();

        let spans = Self::split_predicate(clauses);
        let multi_span = spans.len() > 1;

        for span in spans {
            let code_segment = self.compile_pred_subseq(&clauses[span.left..span.right])?;

            if multi_span {
                let choice = if span.left == 0 {
                    instr!("try_me_else", code_segment.len() + 1)
                } else if span.right == clauses.len() {
                    instr!("trust_me")
                } else {
                    instr!("retry_me_else", code_segment.len() + 1)
                };

                code.push(choice);
            }

            code.extend(code_segment);
        }

        Ok(code)
    }
}
