//! Instruction execution and the interpreted dispatcher. One `match` per
//! instruction family; every instruction either falls through, jumps, or
//! raises the failure flag, which drives backtracking in the main loop.

use crate::atom_table::*;
use crate::forms::{Literal, RegType};
use crate::heap_print::*;
use crate::instructions::*;
use crate::machine::copier::*;
use crate::machine::machine_errors::*;
use crate::machine::machine_indices::*;
use crate::machine::machine_state::*;
use crate::machine::Machine;
use crate::types::*;

impl MachineState {
    /// The value a compiled constant denotes, materializing big integers
    /// onto the heap on demand.
    pub(crate) fn literal_cell(&mut self, literal: &Literal) -> HeapCellValue {
        match literal {
            Literal::Atom(name) => HeapCellValue::Atom(*name, 0),
            Literal::Fixnum(n) => HeapCellValue::Fixnum(*n),
            Literal::Integer(n) => self.heap.put_integer(n),
        }
    }

    /// Matches a dereferenced, non-variable cell against a compiled
    /// constant; big integers go through the metered comparison.
    fn literal_matches(&mut self, value: HeapCellValue, literal: &Literal) -> bool {
        match (value, literal) {
            (HeapCellValue::Atom(n1, 0), Literal::Atom(n2)) => n1 == *n2,
            (HeapCellValue::Fixnum(n1), Literal::Fixnum(n2)) => n1 == *n2,
            (HeapCellValue::Big(h), Literal::Integer(n)) => {
                if let HeapCellValue::BigHeader(limbs, _) = self.heap[h] {
                    self.cost += limbs as u64;
                }

                self.heap.read_big(h) == **n
            }
            _ => false,
        }
    }

    fn unify_constant(&mut self, addr: HeapCellValue, literal: &Literal) {
        let value = self.store(addr);

        if let Some(r) = value.as_var() {
            let cell = self.literal_cell(literal);
            self.bind(r, cell);
        } else if !self.literal_matches(value, literal) {
            self.fail = true;
        }
    }

    /// The read/write duality of structure matching: an unbound argument
    /// switches to write mode, binding a freshly built structure; an
    /// existing structure switches to read mode at its argument offset.
    fn get_structure(&mut self, name: Atom, arity: usize, reg: RegType) {
        let addr = self.deref(self[reg]);
        let value = self.store(addr);

        match value.as_var() {
            Some(r) => {
                let h = self.heap.h();

                self.heap.push(HeapCellValue::Atom(name, arity));
                self.bind(r, HeapCellValue::Str(h));

                self.mode = MachineMode::Write;
            }
            None => match value {
                HeapCellValue::Str(s) => match self.heap[s] {
                    HeapCellValue::Atom(n, a) if n == name && a == arity => {
                        self.s = s + 1;
                        self.mode = MachineMode::Read;
                    }
                    _ => self.fail = true,
                },
                _ => self.fail = true,
            },
        }
    }

    fn get_list(&mut self, reg: RegType) {
        let addr = self.deref(self[reg]);
        let value = self.store(addr);

        match value.as_var() {
            Some(r) => {
                let h = self.heap.h();
                self.bind(r, HeapCellValue::Lis(h));
                self.mode = MachineMode::Write;
            }
            None => match value {
                HeapCellValue::Lis(l) => {
                    self.s = l;
                    self.mode = MachineMode::Read;
                }
                _ => self.fail = true,
            },
        }
    }

    fn execute_fact_instr(&mut self, instr: &FactInstruction) {
        match instr {
            FactInstruction::GetConstant(_, literal, reg) => {
                let addr = self.deref(self[*reg]);
                self.unify_constant(addr, literal);
            }
            FactInstruction::GetList(_, reg) => self.get_list(*reg),
            FactInstruction::GetStructure(name, arity, reg) => {
                self.get_structure(*name, *arity, *reg);
            }
            FactInstruction::GetValue(reg, arg) => {
                let a1 = self[*reg];
                let a2 = self.registers[*arg];

                if !self.unify(a1, a2) {
                    self.fail = true;
                }
            }
            FactInstruction::GetVariable(reg, arg) => {
                self[*reg] = self.registers[*arg];
            }
            FactInstruction::UnifyConstant(literal) => match self.mode {
                MachineMode::Read => {
                    let addr = self.deref(HeapCellValue::Var(self.s));
                    self.unify_constant(addr, literal);
                    self.s += 1;
                }
                MachineMode::Write => {
                    let cell = self.literal_cell(literal);
                    self.heap.push(cell);
                }
            },
            FactInstruction::UnifyVariable(reg) => match self.mode {
                MachineMode::Read => {
                    self[*reg] = self.heap[self.s];
                    self.s += 1;
                }
                MachineMode::Write => {
                    let cell = self.heap.new_var();
                    self[*reg] = cell;
                }
            },
            FactInstruction::UnifyValue(reg) => match self.mode {
                MachineMode::Read => {
                    let a1 = self[*reg];
                    let s = self.s;

                    if !self.unify(a1, HeapCellValue::Var(s)) {
                        self.fail = true;
                    }

                    self.s += 1;
                }
                MachineMode::Write => {
                    let cell = self[*reg];
                    self.heap.push(cell);
                }
            },
            FactInstruction::UnifyLocalValue(reg) => match self.mode {
                MachineMode::Read => {
                    let a1 = self[*reg];
                    let s = self.s;

                    if !self.unify(a1, HeapCellValue::Var(s)) {
                        self.fail = true;
                    }

                    self.s += 1;
                }
                MachineMode::Write => {
                    self.push_local_value(*reg);
                }
            },
            FactInstruction::UnifyVoid(n) => match self.mode {
                MachineMode::Read => {
                    self.s += n;
                }
                MachineMode::Write => {
                    for _ in 0..*n {
                        self.heap.new_var();
                    }
                }
            },
        }
    }

    /// Pushes the register's value, globalizing it first if it still
    /// dereferences into the frame stack.
    fn push_local_value(&mut self, reg: RegType) {
        let addr = self.deref(self[reg]);

        match addr {
            HeapCellValue::StackVar(..) => {
                let cell = self.heap.new_var();
                let r = addr.as_var().unwrap();
                self.bind(r, cell);
            }
            _ => {
                let value = self.store(addr);

                if value.is_var() {
                    self.heap.push(addr);
                } else {
                    self.heap.push(value);
                }
            }
        }
    }

    fn execute_query_instr(&mut self, instr: &QueryInstruction) {
        match instr {
            QueryInstruction::GetVariable(reg, arg) => {
                self[*reg] = self.registers[*arg];
            }
            QueryInstruction::PutConstant(_, literal, reg) => {
                let cell = self.literal_cell(literal);
                self[*reg] = cell;
            }
            QueryInstruction::PutList(_, reg) => {
                let h = self.heap.h();
                self[*reg] = HeapCellValue::Lis(h);
            }
            QueryInstruction::PutStructure(name, arity, reg) => {
                let h = self.heap.h();
                self.heap.push(HeapCellValue::Atom(*name, *arity));
                self[*reg] = HeapCellValue::Str(h);
            }
            QueryInstruction::PutUnsafeValue(n, arg) => {
                let addr = self.deref(self.stack.index_and_frame(self.e).cell(*n));

                match addr {
                    HeapCellValue::StackVar(..) => {
                        let cell = self.heap.new_var();
                        let r = addr.as_var().unwrap();
                        self.bind(r, cell);
                        self.registers[*arg] = cell;
                    }
                    _ => {
                        self.registers[*arg] = addr;
                    }
                }
            }
            QueryInstruction::PutValue(reg, arg) => {
                self.registers[*arg] = self[*reg];
            }
            QueryInstruction::PutVariable(reg, arg) => match reg {
                RegType::Temp(_) => {
                    let cell = self.heap.new_var();
                    self[*reg] = cell;
                    self.registers[*arg] = cell;
                }
                RegType::Perm(n) => {
                    let e = self.e;
                    let cell = HeapCellValue::StackVar(e, *n);
                    *self.stack.index_and_frame_mut(e).cell_mut(*n) = cell;
                    self.registers[*arg] = cell;
                }
            },
            QueryInstruction::SetConstant(literal) => {
                let cell = self.literal_cell(literal);
                self.heap.push(cell);
            }
            QueryInstruction::SetLocalValue(reg) => {
                self.push_local_value(*reg);
            }
            QueryInstruction::SetVariable(reg) => {
                let cell = self.heap.new_var();
                self[*reg] = cell;
            }
            QueryInstruction::SetValue(reg) => {
                let cell = self[*reg];
                self.heap.push(cell);
            }
            QueryInstruction::SetVoid(n) => {
                for _ in 0..*n {
                    self.heap.new_var();
                }
            }
        }
    }

    fn execute_cut_instr(&mut self, instr: &CutInstruction) {
        match instr {
            CutInstruction::NeckCut => {
                let b0 = self.b0;
                self.cut_to(b0);
            }
            CutInstruction::GetLevel(reg) => {
                let b0 = self.b0;
                self[*reg] = HeapCellValue::CutPoint(b0);
            }
            CutInstruction::GetCutPoint(reg) => {
                let b = self.b;
                self[*reg] = HeapCellValue::CutPoint(b);
            }
            CutInstruction::Cut(reg) => {
                let addr = self.store(self.deref(self[*reg]));

                match addr {
                    HeapCellValue::CutPoint(lvl) => self.cut_to(lvl),
                    _ => self.fail = true,
                }
            }
        }
    }

    fn execute_choice_instr(&mut self, at: usize, instr: ChoiceInstruction) {
        match instr {
            ChoiceInstruction::TryMeElse(offset) => {
                self.allocate_or_frame(CodePtr::Local(LocalCodePtr::DirEntry(at + offset)));
                self.p = CodePtr::Local(LocalCodePtr::DirEntry(at + 1));
            }
            ChoiceInstruction::RetryMeElse(offset) => {
                self.restore_from_or_frame();
                self.stack.index_or_frame_mut(self.b).bp =
                    CodePtr::Local(LocalCodePtr::DirEntry(at + offset));
                self.p = CodePtr::Local(LocalCodePtr::DirEntry(at + 1));
            }
            ChoiceInstruction::TrustMe => {
                self.restore_from_or_frame();
                self.pop_or_frame();
                self.p = CodePtr::Local(LocalCodePtr::DirEntry(at + 1));
            }
        }
    }
}

enum DispatchOutcome {
    Done,
    Call(Atom, usize, bool),
}

impl Machine {
    /// Executes the instruction at `at`, advancing or redirecting `p`.
    pub(crate) fn dispatch_instr(&mut self, at: usize) -> Result<(), MachineError> {
        let outcome = {
            let Machine {
                machine_st, code, ..
            } = self;

            match &code[at] {
                Line::Fact(instr) => {
                    machine_st.execute_fact_instr(instr);
                    machine_st.p = CodePtr::Local(LocalCodePtr::DirEntry(at + 1));
                    DispatchOutcome::Done
                }
                Line::Query(instr) => {
                    machine_st.execute_query_instr(instr);
                    machine_st.p = CodePtr::Local(LocalCodePtr::DirEntry(at + 1));
                    DispatchOutcome::Done
                }
                Line::Cut(instr) => {
                    machine_st.execute_cut_instr(instr);
                    machine_st.p = CodePtr::Local(LocalCodePtr::DirEntry(at + 1));
                    DispatchOutcome::Done
                }
                Line::IndexingCode(_) => {
                    machine_st.p = CodePtr::Local(LocalCodePtr::IndexingBuf(at, 0, 0));
                    DispatchOutcome::Done
                }
                Line::Choice(instr) => {
                    machine_st.execute_choice_instr(at, *instr);
                    DispatchOutcome::Done
                }
                Line::Control(ControlInstruction::Allocate(num_cells)) => {
                    machine_st.allocate_and_frame(*num_cells);
                    machine_st.p = CodePtr::Local(LocalCodePtr::DirEntry(at + 1));
                    DispatchOutcome::Done
                }
                Line::Control(ControlInstruction::Deallocate) => {
                    machine_st.deallocate_and_frame();
                    machine_st.p = CodePtr::Local(LocalCodePtr::DirEntry(at + 1));
                    DispatchOutcome::Done
                }
                Line::Control(ControlInstruction::Proceed) => {
                    machine_st.p = machine_st.cp;
                    DispatchOutcome::Done
                }
                Line::Control(ControlInstruction::JmpBy(offset)) => {
                    machine_st.p = CodePtr::Local(LocalCodePtr::DirEntry(at + offset));
                    DispatchOutcome::Done
                }
                Line::Control(ControlInstruction::Fail) => {
                    machine_st.fail = true;
                    DispatchOutcome::Done
                }
                Line::Control(ControlInstruction::CallClause {
                    name,
                    arity,
                    last_call,
                }) => DispatchOutcome::Call(*name, *arity, *last_call),
            }
        };

        match outcome {
            DispatchOutcome::Done => Ok(()),
            DispatchOutcome::Call(name, arity, last_call) => {
                self.call_clause(at, name, arity, last_call)
            }
        }
    }

    /// Walks an indexing block: the outer line offset `oip` selects the
    /// switch or bucket line, the inner offset `iip` a position within a
    /// try/retry/trust bucket.
    pub(crate) fn dispatch_indexing(
        &mut self,
        block: usize,
        oip: usize,
        iip: usize,
    ) -> Result<(), MachineError> {
        let Machine {
            machine_st, code, ..
        } = self;

        let lines = match &code[block] {
            Line::IndexingCode(lines) => lines,
            line => unreachable!("indexing buffer points at {:?}", line),
        };

        fn route(machine_st: &mut MachineState, block: usize, ptr: IndexingCodePtr) {
            match ptr {
                IndexingCodePtr::External(o) => {
                    machine_st.p = CodePtr::Local(LocalCodePtr::DirEntry(block + o));
                }
                IndexingCodePtr::Internal(l) => {
                    machine_st.p = CodePtr::Local(LocalCodePtr::IndexingBuf(block, l, 0));
                }
                IndexingCodePtr::Fail => {
                    machine_st.fail = true;
                }
            }
        }

        match &lines[oip] {
            IndexingLine::Indexing(IndexingInstruction::SwitchOnTerm(var, con, lst, st)) => {
                let addr = machine_st.deref(machine_st.registers[1]);
                let value = machine_st.store(addr);

                let ptr = match value {
                    HeapCellValue::Var(_) | HeapCellValue::StackVar(..) => *var,
                    HeapCellValue::Lis(_) => *lst,
                    HeapCellValue::Str(_) => *st,
                    _ => *con,
                };

                route(machine_st, block, ptr);
            }
            IndexingLine::Indexing(IndexingInstruction::SwitchOnConstant(constants)) => {
                let addr = machine_st.deref(machine_st.registers[1]);
                let value = machine_st.store(addr);

                let key = match value {
                    HeapCellValue::Atom(name, 0) => Some(Literal::Atom(name)),
                    HeapCellValue::Fixnum(n) => Some(Literal::Fixnum(n)),
                    HeapCellValue::Big(h) => {
                        if let HeapCellValue::BigHeader(limbs, _) = machine_st.heap[h] {
                            machine_st.cost += limbs as u64;
                        }

                        let n = machine_st.heap.read_big(h);
                        Some(Literal::Integer(std::rc::Rc::new(n)))
                    }
                    _ => None,
                };

                let ptr = key
                    .and_then(|key| constants.get(&key).copied())
                    .unwrap_or(IndexingCodePtr::Fail);

                route(machine_st, block, ptr);
            }
            IndexingLine::Indexing(IndexingInstruction::SwitchOnStructure(structures)) => {
                let addr = machine_st.deref(machine_st.registers[1]);
                let value = machine_st.store(addr);

                let key = match value {
                    HeapCellValue::Str(s) => match machine_st.heap[s] {
                        HeapCellValue::Atom(name, arity) => Some((name, arity)),
                        _ => None,
                    },
                    _ => None,
                };

                let ptr = key
                    .and_then(|key| structures.get(&key).copied())
                    .unwrap_or(IndexingCodePtr::Fail);

                route(machine_st, block, ptr);
            }
            IndexingLine::IndexedChoice(bucket) => match bucket[iip] {
                IndexedChoiceInstruction::Try(o) => {
                    machine_st.allocate_or_frame(CodePtr::Local(LocalCodePtr::IndexingBuf(
                        block,
                        oip,
                        iip + 1,
                    )));
                    machine_st.p = CodePtr::Local(LocalCodePtr::DirEntry(block + o));
                }
                IndexedChoiceInstruction::Retry(o) => {
                    machine_st.restore_from_or_frame();
                    machine_st.stack.index_or_frame_mut(machine_st.b).bp =
                        CodePtr::Local(LocalCodePtr::IndexingBuf(block, oip, iip + 1));
                    machine_st.p = CodePtr::Local(LocalCodePtr::DirEntry(block + o));
                }
                IndexedChoiceInstruction::Trust(o) => {
                    machine_st.restore_from_or_frame();
                    machine_st.pop_or_frame();
                    machine_st.p = CodePtr::Local(LocalCodePtr::DirEntry(block + o));
                }
            },
        }

        Ok(())
    }

    /// Call resolution, shared by compiled call sites: builtins first,
    /// then compiled code, then the interpreted path — switching
    /// execution mode never disturbs unification state.
    fn call_clause(
        &mut self,
        at: usize,
        name: Atom,
        arity: usize,
        last_call: bool,
    ) -> Result<(), MachineError> {
        if !last_call {
            self.machine_st.cp = CodePtr::Local(LocalCodePtr::DirEntry(at + 1));
        }

        if let Some(builtin) = self.indices.get_builtin(name, arity) {
            let args: Vec<_> = self.machine_st.registers[1..=arity].to_vec();
            let old_p = self.machine_st.p;

            match (builtin.f)(self, arity, &args)? {
                true => {
                    // a control builtin may have redirected `p` itself;
                    // its goal chain then returns through `cp`.
                    if self.machine_st.p == old_p {
                        self.machine_st.p = self.machine_st.cp;
                    }
                }
                false => self.machine_st.fail = true,
            }

            return Ok(());
        }

        let key = (atom!("user"), name, arity);

        self.machine_st.num_of_args = arity;
        self.machine_st.b0 = self.machine_st.b;
        self.call_predicate_by_key(key)
    }

    /// Enters a predicate whose arguments are in the argument registers.
    pub(crate) fn call_predicate_by_key(&mut self, key: PredicateKey) -> Result<(), MachineError> {
        if !self.indices.predicates.contains_key(&key) {
            return Err(MachineError::ExistenceError(key.1, key.2));
        }

        // every predicate activation is metered, on either path.
        self.machine_st.cost += 1;

        if self.config.wam_enabled {
            let code_index = self.indices.get_code_index(key);

            match code_index.get() {
                IndexPtr::Index(entry) => {
                    self.machine_st.p = CodePtr::Local(LocalCodePtr::DirEntry(entry));
                    return Ok(());
                }
                IndexPtr::Undefined => {
                    if let Some(entry) = self.compile_predicate(key)? {
                        self.machine_st.p = CodePtr::Local(LocalCodePtr::DirEntry(entry));
                        return Ok(());
                    }
                }
                IndexPtr::Interpreted => {}
            }
        }

        self.interpreted_call(key)
    }

    /// The interpreted path's first-argument dispatch: select the
    /// matched clause subsequence and try its clauses in order.
    fn interpreted_call(&mut self, key: PredicateKey) -> Result<(), MachineError> {
        let arg_key = if key.2 > 0 {
            let addr = self.machine_st.deref(self.machine_st.registers[1]);
            let value = self.machine_st.store(addr);

            IndexStore::first_arg_index_key(&self.machine_st.heap, value)
        } else {
            None
        };

        let snapshot = match self.indices.matched_snapshot(key, arg_key) {
            Some(snapshot) => snapshot,
            None => return Err(MachineError::ExistenceError(key.1, key.2)),
        };

        let num_clauses = self.indices.snapshots[snapshot].clauses.len();

        if num_clauses == 0 {
            self.machine_st.fail = true;
            return Ok(());
        }

        let barrier = self.machine_st.b;

        if num_clauses > 1 {
            self.machine_st
                .allocate_or_frame(CodePtr::Interpreted { snapshot, next: 1 });
        }

        self.try_interpreted_clause(snapshot, 0, barrier)
    }

    /// Backtracking re-entry for interpreted clause selection: restore
    /// the choice point, then retry or trust depending on what remains.
    pub(crate) fn retry_interpreted(
        &mut self,
        snapshot: usize,
        next: usize,
    ) -> Result<(), MachineError> {
        self.machine_st.restore_from_or_frame();

        let barrier = self.machine_st.stack.index_or_frame(self.machine_st.b).b;
        let num_clauses = self.indices.snapshots[snapshot].clauses.len();

        if next + 1 < num_clauses {
            self.machine_st
                .stack
                .index_or_frame_mut(self.machine_st.b)
                .bp = CodePtr::Interpreted {
                snapshot,
                next: next + 1,
            };
        } else {
            self.machine_st.pop_or_frame();
        }

        self.try_interpreted_clause(snapshot, next, barrier)
    }

    /// Renames the clause onto the heap, unifies its head arguments with
    /// the argument registers, and schedules the body.
    fn try_interpreted_clause(
        &mut self,
        snapshot: usize,
        index: usize,
        barrier: usize,
    ) -> Result<(), MachineError> {
        let (head, body, cost) = {
            let clause = &self.indices.snapshots[snapshot].clauses[index];
            (clause.head, clause.body, clause.cost)
        };

        self.machine_st.cost += cost;

        let mut seen = fxhash::FxHashMap::default();

        let (head, body) = {
            let mut copier = CrossHeapCopier {
                src: &self.indices.clause_store,
                src_stack: None,
                dst: &mut self.machine_st.heap,
            };

            let head = copy_term_with(&mut seen, &mut copier, head);
            let body = copy_term_with(&mut seen, &mut copier, body);

            (head, body)
        };

        let arity = self.machine_st.num_of_args;

        if arity > 0 {
            let s = match head {
                HeapCellValue::Str(s) => s,
                cell => unreachable!("clause head of arity {} is {:?}", arity, cell),
            };

            for i in 1..=arity {
                let arg = self.machine_st.registers[i];

                if !self.machine_st.unify(HeapCellValue::Var(s + i), arg) {
                    self.machine_st.fail = true;
                    return Ok(());
                }
            }
        }

        if body == HeapCellValue::Atom(atom!("true"), 0) {
            self.machine_st.p = self.machine_st.cp;
        } else {
            let body = self.replace_cuts(body, barrier);
            self.machine_st.p = CodePtr::Term(body);
        }

        Ok(())
    }

    /// Rewrites transparent `!` atoms of a goal into `'$cut'(Barrier)`,
    /// observing cut locality: the condition of `->/2` and the argument
    /// of `\+/1` keep their own barriers, bound when they are
    /// dispatched. Copy-on-write along the control spine: the original
    /// term is shared by choice points and must never be mutated.
    pub(crate) fn replace_cuts(&mut self, cell: HeapCellValue, barrier: usize) -> HeapCellValue {
        let addr = self.machine_st.heap.bound_deref(cell);

        if addr == HeapCellValue::Atom(atom!("!"), 0) {
            let level = HeapCellValue::CutPoint(barrier);
            return self.machine_st.heap.put_structure(atom!("$cut"), &[level]);
        }

        if let HeapCellValue::Str(s) = addr {
            let (name, arity) = match self.machine_st.heap[s] {
                HeapCellValue::Atom(name, arity) => (name, arity),
                _ => return addr,
            };

            let transparent_args: &[usize] = match (name, arity) {
                (n, 2) if n == atom!(",") || n == atom!(";") => &[1, 2],
                // only the `then` branch of an if-then(-else) pair.
                (n, 2) if n == atom!("->") => &[2],
                _ => &[],
            };

            if transparent_args.is_empty() {
                return addr;
            }

            let mut args = vec![self.machine_st.heap[s + 1], self.machine_st.heap[s + 2]];
            let mut changed = false;

            for &i in transparent_args {
                let arg = args[i - 1];
                let replaced = self.replace_cuts(arg, barrier);

                if replaced != self.machine_st.heap.bound_deref(arg) {
                    args[i - 1] = replaced;
                    changed = true;
                }
            }

            if changed {
                return self.machine_st.heap.put_structure(name, &args);
            }
        }

        addr
    }

    /// The interpreted dispatcher: executes one goal term. `p` holds the
    /// goal, `cp` the continuation to jump to on its success.
    pub(crate) fn dispatch_term(&mut self, goal: HeapCellValue) -> Result<(), MachineError> {
        let addr = self.machine_st.deref(goal);
        let value = self.machine_st.store(addr);

        if value.is_var() {
            return Err(MachineError::InstantiationError(atom!("call"), 1));
        }

        let (name, arity, s) = match value {
            HeapCellValue::Atom(name, 0) => (name, 0, 0),
            HeapCellValue::Str(s) => match self.machine_st.heap[s] {
                HeapCellValue::Atom(name, arity) => (name, arity, s),
                cell => unreachable!("goal structure points at {:?}", cell),
            },
            other => {
                return Err(MachineError::TypeError(
                    ValidType::Callable,
                    print_heap_term(&self.machine_st, other),
                ));
            }
        };

        match (name, arity) {
            (n, 0) if n == atom!("true") => {
                self.machine_st.p = self.machine_st.cp;
            }
            (n, 0) if n == atom!("$ret") => {
                self.machine_st.deallocate_and_frame();
                self.machine_st.p = self.machine_st.cp;
            }
            (n, 0) if n == atom!("fail") || n == atom!("false") => {
                self.machine_st.fail = true;
            }
            (n, 0) if n == atom!("!") => {
                let top_b = self.machine_st.top_b;
                self.machine_st.cut_to(top_b);
                self.machine_st.p = self.machine_st.cp;
            }
            (n, 1) if n == atom!("$cut") => {
                let arg = self
                    .machine_st
                    .store(self.machine_st.deref(self.machine_st.heap[s + 1]));

                match arg {
                    HeapCellValue::CutPoint(lvl) => {
                        self.machine_st.cut_to(lvl);
                        self.machine_st.p = self.machine_st.cp;
                    }
                    _ => self.machine_st.fail = true,
                }
            }
            (n, 2) if n == atom!(",") => {
                self.dispatch_conjunction(s);
            }
            (n, 2) if n == atom!(";") => {
                self.dispatch_disjunction(s)?;
            }
            (n, 2) if n == atom!("->") => {
                let cond = self.machine_st.heap[s + 1];
                let then = self.machine_st.heap[s + 2];
                let els = HeapCellValue::Atom(atom!("fail"), 0);

                self.dispatch_if_then_else(cond, then, els)?;
            }
            (n, 1) if n == atom!("\\+") => {
                let goal = self.machine_st.heap[s + 1];
                let then = HeapCellValue::Atom(atom!("fail"), 0);
                let els = HeapCellValue::Atom(atom!("true"), 0);

                self.dispatch_if_then_else(goal, then, els)?;
            }
            _ => {
                if let Some(builtin) = self.indices.get_builtin(name, arity) {
                    let args: Vec<_> =
                        (1..=arity).map(|i| self.machine_st.heap[s + i]).collect();
                    let old_p = self.machine_st.p;

                    match (builtin.f)(self, arity, &args)? {
                        true => {
                            if self.machine_st.p == old_p {
                                self.machine_st.p = self.machine_st.cp;
                            }
                        }
                        false => self.machine_st.fail = true,
                    }

                    return Ok(());
                }

                for i in 1..=arity {
                    self.machine_st.registers[i] = self.machine_st.heap[s + i];
                }

                self.machine_st.num_of_args = arity;
                self.machine_st.b0 = self.machine_st.b;

                self.call_predicate_by_key((atom!("user"), name, arity))?;
            }
        }

        Ok(())
    }

    /// `','(A, B)` with continuation K: run A with continuation (B, K).
    /// K is stowed in an environment unless the chain already carries a
    /// `$ret` terminator from an earlier wrapping.
    fn dispatch_conjunction(&mut self, s: usize) {
        let lhs = self.machine_st.heap[s + 1];
        let rhs = self.machine_st.heap[s + 2];

        if self.chain_is_wrapped(rhs) {
            self.machine_st.cp = CodePtr::Term(rhs);
            self.machine_st.p = CodePtr::Term(lhs);
            return;
        }

        self.machine_st.allocate_and_frame(0);

        let ret = HeapCellValue::Atom(atom!("$ret"), 0);
        let chain = self.machine_st.heap.put_structure(atom!(","), &[rhs, ret]);

        self.machine_st.cp = CodePtr::Term(chain);
        self.machine_st.p = CodePtr::Term(lhs);
    }

    // a goal chain is wrapped iff its comma spine ends in the `$ret`
    // environment marker.
    fn chain_is_wrapped(&self, mut cell: HeapCellValue) -> bool {
        loop {
            let addr = self.machine_st.heap.bound_deref(cell);

            if addr == HeapCellValue::Atom(atom!("$ret"), 0) {
                return true;
            }

            match addr {
                HeapCellValue::Str(s) => match self.machine_st.heap[s] {
                    HeapCellValue::Atom(name, 2) if name == atom!(",") => {
                        cell = self.machine_st.heap[s + 2];
                    }
                    _ => return false,
                },
                _ => return false,
            }
        }
    }

    fn dispatch_disjunction(&mut self, s: usize) -> Result<(), MachineError> {
        let lhs = self
            .machine_st
            .heap
            .bound_deref(self.machine_st.heap[s + 1]);
        let rhs = self.machine_st.heap[s + 2];

        if let HeapCellValue::Str(ite_s) = lhs {
            if self.machine_st.heap[ite_s] == HeapCellValue::Atom(atom!("->"), 2) {
                let cond = self.machine_st.heap[ite_s + 1];
                let then = self.machine_st.heap[ite_s + 2];

                return self.dispatch_if_then_else(cond, then, rhs);
            }
        }

        self.machine_st.allocate_or_frame(CodePtr::RetryTerm(rhs));
        self.machine_st.p = CodePtr::Term(lhs);

        Ok(())
    }

    /// `(C -> T ; E)`: a choice point guards E; C runs under a barrier
    /// cut committing to T, and cuts inside C are local to C.
    fn dispatch_if_then_else(
        &mut self,
        cond: HeapCellValue,
        then: HeapCellValue,
        els: HeapCellValue,
    ) -> Result<(), MachineError> {
        let commit_level = self.machine_st.b;

        self.machine_st.allocate_or_frame(CodePtr::RetryTerm(els));

        let local_level = self.machine_st.b;
        let cond = self.replace_cuts(cond, local_level);

        let machine_st = &mut self.machine_st;

        let commit = HeapCellValue::CutPoint(commit_level);
        let commit = machine_st.heap.put_structure(atom!("$cut"), &[commit]);
        let rest = machine_st.heap.put_structure(atom!(","), &[commit, then]);
        let chain = machine_st.heap.put_structure(atom!(","), &[cond, rest]);

        machine_st.p = CodePtr::Term(chain);

        Ok(())
    }

    /// Backtracking into an interpreted alternative: restore, discard
    /// the choice point (a term alternative is always final), resume at
    /// the stored goal.
    pub(crate) fn retry_term(&mut self, goal: HeapCellValue) {
        self.machine_st.restore_from_or_frame();
        self.machine_st.pop_or_frame();
        self.machine_st.p = CodePtr::Term(goal);
    }
}
