pub mod builtins;
pub mod copier;
pub mod dispatch;
pub mod heap;
pub mod machine_errors;
pub mod machine_indices;
pub mod machine_state;
pub mod stack;

use crate::atom_table::*;
use crate::codegen::CodeGenerator;
use crate::heap_print::*;
use crate::instructions::*;
use crate::machine::copier::*;
use crate::machine::machine_errors::*;
use crate::machine::machine_indices::*;
use crate::machine::machine_state::*;
use crate::parser::{parse_program, Parser};
use crate::preprocessor::*;
use crate::types::*;

use dashu::integer::IBig;

use log::{debug, trace};

/// Machine-wide knobs. The WAM switch selects between the bytecode path
/// and the interpreted fallback; both must agree observably.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub wam_enabled: bool,
    pub cost_budget: Option<u64>,
    pub heap_limit: Option<usize>,
    pub stack_limit: Option<usize>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            wam_enabled: true,
            cost_budget: None,
            heap_limit: None,
            stack_limit: None,
        }
    }
}

/// The saved interpreter-wide registers of a suspended outer query.
/// Nesting is stack discipline: instances are released strictly in
/// reverse order of creation.
#[derive(Debug)]
struct MetaContext {
    p: CodePtr,
    cp: CodePtr,
    b: usize,
    b0: usize,
    e: usize,
    hb: usize,
    tr: usize,
    h: usize,
    stack_len: usize,
    top_b: usize,
    num_of_args: usize,
    fail: bool,
    top_fail: bool,
    query_vars: Vec<(String, HeapCellValue)>,
}

/// One logical interpreter instance: clause database, code area, and the
/// register machine. Strictly single-threaded; concurrent queries need
/// fully independent `Machine` values.
#[derive(Debug)]
pub struct Machine {
    pub machine_st: MachineState,
    pub indices: IndexStore,
    pub(crate) code: Code,
    pub(crate) config: MachineConfig,
    query_vars: Vec<(String, HeapCellValue)>,
    meta: Vec<MetaContext>,
}

impl Machine {
    pub fn new() -> Self {
        Machine::with_config(MachineConfig::default())
    }

    pub fn with_config(config: MachineConfig) -> Self {
        let mut machine = Machine {
            machine_st: MachineState::new(),
            indices: IndexStore::new(),
            code: Code::new(),
            config,
            query_vars: vec![],
            meta: vec![],
        };

        machine.machine_st.cost_budget = machine.config.cost_budget;
        machine.machine_st.heap_limit = machine.config.heap_limit;

        builtins::register_standard_builtins(&mut machine.indices);
        machine
    }

    /// Registers a builtin under `(module, name, arity)`. Recursive
    /// builtins re-enter the machine through a nested instance.
    pub fn register(
        &mut self,
        module: Atom,
        name: &str,
        arity: usize,
        f: BuiltinFn,
        recursive: bool,
    ) {
        let name = self.machine_st.atom_tbl.build_with(name);
        self.indices
            .register_builtin(module, name, arity, f, recursive);
    }

    // ---- term construction: collaborators build and inspect terms
    // exclusively through these, never by touching heap cells.

    pub fn new_var(&mut self) -> HeapCellValue {
        self.machine_st.heap.new_var()
    }

    pub fn atom(&mut self, name: &str) -> Atom {
        self.machine_st.atom_tbl.build_with(name)
    }

    pub fn atom_cell(&mut self, name: &str) -> HeapCellValue {
        let atom = self.atom(name);
        HeapCellValue::Atom(atom, 0)
    }

    pub fn integer_cell(&mut self, n: i64) -> HeapCellValue {
        HeapCellValue::Fixnum(n)
    }

    pub fn big_integer_cell(&mut self, n: &IBig) -> HeapCellValue {
        self.machine_st.heap.put_integer(n)
    }

    pub fn read_big_integer(&self, cell: HeapCellValue) -> Option<IBig> {
        match self.machine_st.store(self.machine_st.deref(cell)) {
            HeapCellValue::Fixnum(n) => Some(IBig::from(n)),
            HeapCellValue::Big(h) => Some(self.machine_st.heap.read_big(h)),
            _ => None,
        }
    }

    pub fn structure_cell(&mut self, name: &str, args: &[HeapCellValue]) -> HeapCellValue {
        let name = self.atom(name);
        self.machine_st.heap.put_structure(name, args)
    }

    pub fn list_cell(&mut self, items: Vec<HeapCellValue>) -> HeapCellValue {
        self.machine_st.heap.to_list(items)
    }

    pub fn unify_cells(&mut self, a1: HeapCellValue, a2: HeapCellValue) -> bool {
        self.machine_st.unify(a1, a2)
    }

    pub fn print_term(&self, cell: HeapCellValue) -> String {
        print_heap_term(&self.machine_st, cell)
    }

    // ---- clause loading.

    /// Stores one clause term. The term is snapshotted into the clause
    /// store; the syntax checks run against the snapshot, and a clause
    /// that fails them never becomes visible to the indexer.
    pub fn load_clause(&mut self, term: HeapCellValue, append: bool) -> Result<(), MachineError> {
        let mark = self.indices.clause_store.h();

        let stored = {
            let mut copier = CrossHeapCopier {
                src: &self.machine_st.heap,
                src_stack: Some(&self.machine_st.stack),
                dst: &mut self.indices.clause_store,
            };

            copy_term(&mut copier, term)
        };

        let lowered = {
            let mut preprocessor = ClausePreprocessor::new(&self.indices.clause_store);
            preprocessor.lower_clause(atom!("user"), stored)
        };

        let (key, _) = match lowered {
            Ok(lowered) => lowered,
            Err(err) => {
                self.indices.clause_store.truncate(mark);
                return Err(err);
            }
        };

        let (head, body) = self.split_stored_clause(stored);
        let cost = (self.indices.clause_store.h() - mark) as u64;

        trace!(
            "loading clause for {}/{} ({} cells)",
            self.machine_st.atom_tbl.as_str(key.1),
            key.2,
            cost
        );

        self.indices.add_clause(key, head, body, cost, append);
        Ok(())
    }

    fn split_stored_clause(&self, stored: HeapCellValue) -> (HeapCellValue, HeapCellValue) {
        let store = &self.indices.clause_store;
        let addr = store.bound_deref(stored);

        if let HeapCellValue::Str(s) = addr {
            if store[s] == HeapCellValue::Atom(atom!(":-"), 2) {
                return (store.bound_deref(store[s + 1]), store[s + 2]);
            }
        }

        (addr, HeapCellValue::Atom(atom!("true"), 0))
    }

    /// Loads a program given as a list term of clauses.
    pub fn load_program(&mut self, clauses: HeapCellValue) -> Result<(), MachineError> {
        let mut cell = self.machine_st.deref(clauses);

        loop {
            match self.machine_st.store(cell) {
                HeapCellValue::Atom(name, 0) if name == atom!("[]") => return Ok(()),
                HeapCellValue::Lis(l) => {
                    let head = self.machine_st.heap[l];
                    let tail = self.machine_st.heap[l + 1];

                    self.load_clause(head, true)?;
                    cell = self.machine_st.deref(tail);
                }
                _ => return Err(SyntaxError::ProgramIsNotAList.into()),
            }
        }
    }

    /// Parses and loads program text.
    pub fn consult(&mut self, src: &str) -> Result<(), MachineError> {
        let clauses = parse_program(&mut self.machine_st, src)?;

        for clause in clauses {
            self.load_clause(clause.term, true)?;
        }

        Ok(())
    }

    // ---- compilation.

    /// Compiles a predicate's live clauses to bytecode, returning the
    /// entry point, or `None` (and marking the predicate interpreted)
    /// when compilation is declined.
    pub(crate) fn compile_predicate(
        &mut self,
        key: PredicateKey,
    ) -> Result<Option<usize>, MachineError> {
        let clauses = {
            let skeleton = match self.indices.predicates.get(&key) {
                Some(skeleton) => skeleton,
                None => return Ok(None),
            };

            let mut preprocessor = ClausePreprocessor::new(&self.indices.clause_store);
            let mut clauses = vec![];
            let mut failed = false;

            for (_, record) in skeleton.live_clauses() {
                match preprocessor.lower_stored_clause(key.0, record.head, record.body) {
                    Ok((_, clause)) => clauses.push(clause),
                    Err(_) => {
                        failed = true;
                        break;
                    }
                }
            }

            if failed {
                None
            } else {
                Some(clauses)
            }
        };

        let clauses = match clauses {
            Some(clauses) if !clauses.is_empty() => clauses,
            _ => {
                self.indices.get_code_index(key).set(IndexPtr::Interpreted);
                return Ok(None);
            }
        };

        let mut generator = CodeGenerator::new();

        match generator.compile_predicate(&clauses) {
            Ok(code) => {
                let entry = self.code.len();
                self.code.extend(code);
                self.indices.get_code_index(key).set(IndexPtr::Index(entry));

                debug!(
                    "compiled {}/{} at {}",
                    self.machine_st.atom_tbl.as_str(key.1),
                    key.2,
                    entry
                );

                Ok(Some(entry))
            }
            Err(_) => {
                self.indices.get_code_index(key).set(IndexPtr::Interpreted);
                Ok(None)
            }
        }
    }

    /// Forces compilation of every predicate in the database.
    pub fn compile_all(&mut self) -> Result<(), MachineError> {
        let keys: Vec<_> = self.indices.predicates.keys().copied().collect();

        for key in keys {
            if let IndexPtr::Undefined = self.indices.get_code_index(key).get() {
                self.compile_predicate(key)?;
            }
        }

        Ok(())
    }

    // ---- the query protocol.

    /// Runs a goal term. `true` means a solution was found; further
    /// solutions are produced by `next()`.
    pub fn execute(&mut self, goal: HeapCellValue) -> Result<bool, MachineError> {
        if self.meta.is_empty() {
            let machine_st = &mut self.machine_st;

            machine_st.stack.clear();
            machine_st.trail.clear();
            machine_st.tr = 0;
            machine_st.b = 0;
            machine_st.b0 = 0;
            machine_st.e = 0;
            machine_st.top_b = 0;
            machine_st.num_of_args = 0;
            machine_st.fail = false;
            machine_st.top_fail = false;
            machine_st.cost = 0;

            self.indices.reset_snapshots();
        }

        self.machine_st.hb = self.machine_st.heap.h();
        self.machine_st.cp = CodePtr::halt();
        self.machine_st.p = CodePtr::Term(goal);

        match self.run() {
            Ok(solution) => Ok(solution),
            Err(err) => {
                self.recover_from_error();
                Err(err)
            }
        }
    }

    /// Redo: backtracks into the remaining alternatives.
    pub fn next(&mut self) -> Result<bool, MachineError> {
        if !self.has_more() {
            return Ok(false);
        }

        self.machine_st.fail = true;

        match self.run() {
            Ok(solution) => Ok(solution),
            Err(err) => {
                self.recover_from_error();
                Err(err)
            }
        }
    }

    /// Whether alternatives younger than the query's base survive.
    #[inline]
    pub fn has_more(&self) -> bool {
        self.machine_st.b > self.machine_st.top_b
    }

    /// The main loop: dispatch one step at a time, backtracking on
    /// failure, until a solution or terminal failure.
    pub(crate) fn run(&mut self) -> Result<bool, MachineError> {
        loop {
            if self.machine_st.fail {
                self.machine_st.backtrack();

                if self.machine_st.top_fail {
                    self.machine_st.top_fail = false;
                    return Ok(false);
                }

                continue;
            }

            if let Some(limit) = self.machine_st.heap_limit {
                if self.machine_st.heap.h() > limit {
                    return Err(ResourceError::HeapLimitExceeded(limit).into());
                }
            }

            if let Some(budget) = self.machine_st.cost_budget {
                if self.machine_st.cost > budget {
                    return Err(ResourceError::CostBudgetExhausted(budget).into());
                }
            }

            if let Some(limit) = self.config.stack_limit {
                if self.machine_st.stack.len() > limit {
                    return Err(ResourceError::StackLimitExceeded(limit).into());
                }
            }

            match self.machine_st.p {
                CodePtr::Local(LocalCodePtr::Halt) => return Ok(true),
                CodePtr::Local(LocalCodePtr::DirEntry(at)) => self.dispatch_instr(at)?,
                CodePtr::Local(LocalCodePtr::IndexingBuf(block, oip, iip)) => {
                    self.dispatch_indexing(block, oip, iip)?
                }
                CodePtr::Term(goal) => self.dispatch_term(goal)?,
                CodePtr::RetryTerm(goal) => self.retry_term(goal),
                CodePtr::Interpreted { snapshot, next } => {
                    self.retry_interpreted(snapshot, next)?
                }
            }
        }
    }

    /// Resource exhaustion and type errors unwind the query to its
    /// outermost choice point and clear all in-progress bindings; no
    /// dangling trail or choice point references survive.
    fn recover_from_error(&mut self) {
        let base_tr = self.meta.last().map(|ctx| ctx.tr).unwrap_or(0);
        let base_b = self.machine_st.top_b;

        self.machine_st.unwind_trail(base_tr);
        self.machine_st.b = base_b;
        self.machine_st.stack.truncate(base_b);
        self.machine_st.fail = false;
        self.machine_st.top_fail = false;
        self.machine_st.p = CodePtr::halt();
    }

    // ---- nested instances.

    /// Snapshots the interpreter-wide registers and opens a fresh query
    /// context on top of the current one. Execution stays serialized.
    pub fn new_instance(&mut self) {
        let machine_st = &self.machine_st;

        self.meta.push(MetaContext {
            p: machine_st.p,
            cp: machine_st.cp,
            b: machine_st.b,
            b0: machine_st.b0,
            e: machine_st.e,
            hb: machine_st.hb,
            tr: machine_st.tr,
            h: machine_st.heap.h(),
            stack_len: machine_st.stack.len(),
            top_b: machine_st.top_b,
            num_of_args: machine_st.num_of_args,
            fail: machine_st.fail,
            top_fail: machine_st.top_fail,
            query_vars: std::mem::take(&mut self.query_vars),
        });

        self.machine_st.top_b = self.machine_st.b;
        self.machine_st.fail = false;
        self.machine_st.top_fail = false;
    }

    /// Restores the snapshot taken by the matching `new_instance`,
    /// undoing every binding and allocation of the nested query.
    pub fn release_instance(&mut self) {
        let ctx = match self.meta.pop() {
            Some(ctx) => ctx,
            None => return,
        };

        let machine_st = &mut self.machine_st;

        machine_st.unwind_trail(ctx.tr);
        machine_st.heap.truncate(ctx.h);
        machine_st.stack.truncate(ctx.stack_len);

        machine_st.p = ctx.p;
        machine_st.cp = ctx.cp;
        machine_st.b = ctx.b;
        machine_st.b0 = ctx.b0;
        machine_st.e = ctx.e;
        machine_st.hb = ctx.hb;
        machine_st.top_b = ctx.top_b;
        machine_st.num_of_args = ctx.num_of_args;
        machine_st.fail = ctx.fail;
        machine_st.top_fail = ctx.top_fail;

        self.query_vars = ctx.query_vars;
    }

    #[inline]
    pub fn is_instance(&self) -> bool {
        !self.meta.is_empty()
    }

    /// Runs a goal as a nested sub-query (used by recursive builtins);
    /// the caller brackets this with `new_instance`/`release_instance`.
    pub(crate) fn execute_sub_goal(&mut self, goal: HeapCellValue) -> Result<bool, MachineError> {
        self.machine_st.hb = self.machine_st.heap.h();
        self.machine_st.cp = CodePtr::halt();
        self.machine_st.p = CodePtr::Term(goal);

        self.run()
    }

    // ---- text-level convenience API.

    /// Parses and runs a query. Returns whether the first solution was
    /// found; named query variables are retrievable afterwards.
    pub fn run_query(&mut self, src: &str) -> Result<bool, MachineError> {
        self.machine_st.reset();
        self.query_vars.clear();

        let result = {
            let mut parser = Parser::new(&mut self.machine_st, src)?;
            parser.read_term()?
        };

        let mut goal = result.term;

        // accept `?- G.` as well as a bare goal.
        if let HeapCellValue::Str(s) = self.machine_st.heap.bound_deref(goal) {
            if self.machine_st.heap[s] == HeapCellValue::Atom(atom!("?-"), 1) {
                goal = self.machine_st.heap[s + 1];
            }
        }

        self.query_vars = result
            .var_dict
            .into_iter()
            .map(|(name, cell)| (name, cell))
            .collect();

        self.execute(goal)
    }

    /// The bindings of the current solution, one `Name = Term` line per
    /// named query variable.
    pub fn get_result(&self) -> String {
        let mut lines = vec![];

        for (name, cell) in &self.query_vars {
            lines.push(format!(
                "{} = {}",
                name,
                print_heap_term(&self.machine_st, *cell)
            ));
        }

        if lines.is_empty() {
            "true".to_string()
        } else {
            lines.join(", ")
        }
    }

    /// The binding of one named query variable.
    pub fn get_result_term(&self, name: &str) -> Option<HeapCellValue> {
        self.query_vars
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, cell)| self.machine_st.deref(*cell))
    }

    pub fn query_vars(&self) -> &[(String, HeapCellValue)] {
        &self.query_vars
    }

    /// Collects every solution of a query as rendered bindings; drives
    /// `execute`/`next` to exhaustion. A test and diagnostics helper.
    pub fn all_solutions(&mut self, src: &str) -> Result<Vec<String>, MachineError> {
        let mut solutions = vec![];
        let mut found = self.run_query(src)?;

        while found {
            solutions.push(self.get_result());
            found = self.next()?;
        }

        Ok(solutions)
    }
}

impl Default for Machine {
    fn default() -> Self {
        Machine::new()
    }
}
