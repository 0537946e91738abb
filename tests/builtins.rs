//! Builtin library behavior, error taxonomy, and the external
//! interfaces: builtin registration, term construction, resource limits.

use kestrel_prolog::{
    HeapCellValue, Machine, MachineConfig, MachineError, ResourceError, ValidType,
};

fn solutions(program: &str, query: &str) -> Vec<String> {
    let mut m = Machine::new();
    m.consult(program).expect("program loads");
    m.all_solutions(query).expect("query runs")
}

fn truths(query: &str) -> bool {
    let mut m = Machine::new();
    m.run_query(query).expect("query runs")
}

#[test]
fn term_ordering_follows_the_standard_order() {
    assert_eq!(solutions("", "X = f(a), X == f(a)."), vec!["X = f(a)"]);
    assert!(truths("f(a) \\== f(b)."));
    assert_eq!(solutions("", "compare(O, 1, a)."), vec!["O = <"]);
    assert_eq!(solutions("", "compare(O, f(a), g(a))."), vec!["O = <"]);
    assert_eq!(solutions("", "compare(O, g(a), f(a, b))."), vec!["O = <"]);
    assert!(truths("1 @< a, a @< f(a), _ @< 1."));
}

#[test]
fn type_tests_discriminate_cell_kinds() {
    assert_eq!(solutions("", "var(X), X = 1, nonvar(X)."), vec!["X = 1"]);
    assert!(truths("atom(foo), \\+ atom(f(x))."));
    assert!(truths("integer(3), integer(123456789012345678901234567890)."));
    assert!(truths("compound(f(x)), compound([1])."));
    assert!(truths("atomic(foo), atomic(12), \\+ atomic(f(x))."));
    assert!(truths("ground(f(a, [1])), \\+ ground(f(a, _))."));
    assert!(truths("is_list([1,2,3]), \\+ is_list([1|_])."));
    assert!(truths("callable(foo), callable(f(x)), \\+ callable(3)."));
}

#[test]
fn functor_arg_univ_decompose_and_build() {
    assert_eq!(
        solutions("", "functor(f(a, b), N, A)."),
        vec!["N = f, A = 2"]
    );

    let mut m = Machine::new();
    assert!(m.run_query("functor(T, f, 2), functor(T, N, A).").unwrap());
    assert_eq!(
        m.get_result_term("N").map(|t| m.print_term(t)),
        Some("f".to_string())
    );
    assert_eq!(
        m.get_result_term("A").map(|t| m.print_term(t)),
        Some("2".to_string())
    );

    assert_eq!(solutions("", "arg(2, f(a, b, c), X)."), vec!["X = b"]);
    assert_eq!(solutions("", "f(a, b) =.. L."), vec!["L = [f,a,b]"]);
    assert_eq!(solutions("", "T =.. [g, 1, 2]."), vec!["T = g(1,2)"]);
    assert_eq!(solutions("", "T =.. ['.', h, []]."), vec!["T = [h]"]);
}

#[test]
fn copy_term_renames_variables_but_keeps_sharing() {
    let mut m = Machine::new();

    assert!(m.run_query("copy_term(f(X, X, a), C).").unwrap());

    let c = m.get_result_term("C").unwrap();
    let rendered = m.print_term(c);

    assert!(rendered.starts_with("f("));

    let inner: Vec<&str> = rendered[2..rendered.len() - 1].split(',').collect();
    assert_eq!(inner.len(), 3);
    assert_eq!(inner[0], inner[1]);
    assert!(inner[0].starts_with("_G"));
    assert_eq!(inner[2], "a");
}

#[test]
fn length_measures_and_builds() {
    assert_eq!(solutions("", "length([a, b, c], N)."), vec!["N = 3"]);
    assert_eq!(solutions("", "length(L, 2), L = [x, y]."), vec!["L = [x,y]"]);
}

#[test]
fn between_enumerates_and_checks() {
    assert_eq!(
        solutions("", "between(1, 4, X)."),
        vec!["X = 1", "X = 2", "X = 3", "X = 4"]
    );
    assert!(truths("between(1, 4, 3)."));
    assert_eq!(solutions("", "between(3, 1, _)."), Vec::<String>::new());
}

#[test]
fn arithmetic_comparisons_and_functions() {
    assert_eq!(
        solutions("", "X is 7 mod 3, Y is -7 mod 3."),
        vec!["X = 1, Y = 2"]
    );
    assert_eq!(solutions("", "X is 2 << 10."), vec!["X = 2048"]);
    assert_eq!(
        solutions("", "X is min(3, 5), Y is max(3, 5)."),
        vec!["X = 3, Y = 5"]
    );
    assert_eq!(solutions("", "X is gcd(12, 18)."), vec!["X = 6"]);
    assert_eq!(
        solutions("", "X is abs(-42), Y is sign(-42)."),
        vec!["X = 42, Y = -1"]
    );
    assert!(truths("4 =:= 2 + 2, 4 =\\= 5, 3 < 4, 4 >= 4."));
}

#[test]
fn division_by_zero_is_a_typed_error() {
    let mut m = Machine::new();

    match m.run_query("X is 1 // 0.") {
        Err(MachineError::EvaluationError("zero_divisor")) => {}
        result => panic!("expected a zero_divisor error, got {:?}", result),
    }
}

#[test]
fn unbound_arithmetic_is_an_instantiation_error() {
    let mut m = Machine::new();

    match m.run_query("X is Y + 1.") {
        Err(MachineError::InstantiationError(..)) => {}
        result => panic!("expected an instantiation error, got {:?}", result),
    }
}

#[test]
fn non_evaluable_terms_are_type_errors() {
    let mut m = Machine::new();

    match m.run_query("X is foo + 1.") {
        Err(MachineError::TypeError(ValidType::Evaluable, _)) => {}
        result => panic!("expected a type error, got {:?}", result),
    }
}

#[test]
fn undefined_predicates_are_existence_errors() {
    let mut m = Machine::new();

    match m.run_query("no_such_predicate(1).") {
        Err(MachineError::ExistenceError(..)) => {}
        result => panic!("expected an existence error, got {:?}", result),
    }
}

#[test]
fn malformed_clauses_are_rejected_at_load_time() {
    let mut m = Machine::new();

    // a control functor cannot head a clause ...
    assert!(matches!(
        m.consult("(a ; b) :- c."),
        Err(MachineError::Syntax(_))
    ));

    // ... and rejected clauses are invisible to the database.
    assert!(matches!(
        m.run_query("a."),
        Err(MachineError::ExistenceError(..))
    ));
}

#[test]
fn cost_budget_exhaustion_is_fatal_but_clean() {
    let mut m = Machine::with_config(MachineConfig {
        cost_budget: Some(2_000),
        ..MachineConfig::default()
    });

    m.consult("loop :- loop.").unwrap();

    match m.run_query("loop.") {
        Err(MachineError::ResourceError(ResourceError::CostBudgetExhausted(_))) => {}
        result => panic!("expected budget exhaustion, got {:?}", result),
    }

    // the machine is reusable afterwards.
    assert!(m.run_query("X = ok.").unwrap());
}

#[test]
fn heap_limit_exhaustion_is_fatal_but_clean() {
    let mut m = Machine::with_config(MachineConfig {
        heap_limit: Some(16_384),
        ..MachineConfig::default()
    });

    m.consult("grow(L) :- grow([x|L]).").unwrap();

    match m.run_query("grow([]).") {
        Err(MachineError::ResourceError(ResourceError::HeapLimitExceeded(_))) => {}
        result => panic!("expected heap exhaustion, got {:?}", result),
    }

    assert!(m.run_query("X = ok.").unwrap());
}

#[test]
fn registered_builtins_participate_in_resolution() {
    fn triple(
        m: &mut Machine,
        _arity: usize,
        args: &[HeapCellValue],
    ) -> Result<bool, MachineError> {
        let value = m.machine_st.store(m.machine_st.deref(args[0]));

        match value {
            HeapCellValue::Fixnum(n) => {
                let tripled = m.integer_cell(n * 3);
                Ok(m.unify_cells(args[1], tripled))
            }
            _ => Ok(false),
        }
    }

    let mut m = Machine::new();
    let module = m.atom("user");
    m.register(module, "triple", 2, triple, false);

    assert!(m.run_query("triple(14, X).").unwrap());
    assert_eq!(
        m.get_result_term("X").map(|t| m.print_term(t)),
        Some("42".to_string())
    );
}

#[test]
fn term_construction_api_round_trips() {
    let mut m = Machine::new();

    let one = m.integer_cell(1);
    let nil = m.atom_cell("[]");
    let list = m.structure_cell(".", &[one, nil]);
    let goal_arg = m.new_var();
    let goal = m.structure_cell("length", &[list, goal_arg]);

    assert!(m.execute(goal).unwrap());

    let len = m.machine_st.deref(goal_arg);
    assert_eq!(m.print_term(len), "1");
}

#[test]
fn nested_instances_snapshot_and_restore() {
    let mut m = Machine::new();
    m.consult("p(1). p(2).").unwrap();

    assert!(m.run_query("p(X).").unwrap());
    assert_eq!(m.get_result(), "X = 1");
    assert!(m.has_more());

    // run an unrelated nested query without disturbing the outer one.
    m.new_instance();
    let goal = {
        let two = m.integer_cell(2);
        m.structure_cell("p", &[two])
    };
    assert!(m.execute(goal).unwrap());
    m.release_instance();

    assert!(m.has_more());
    assert!(m.next().unwrap());
    assert_eq!(m.get_result(), "X = 2");
    assert!(!m.next().unwrap());
}
