//! End-to-end solution semantics, exercised through both execution
//! paths: the bytecode machine and the interpreted fallback must be
//! observably identical.

use kestrel_prolog::{Machine, MachineConfig};

fn machine(wam_enabled: bool, program: &str) -> Machine {
    let mut m = Machine::with_config(MachineConfig {
        wam_enabled,
        ..MachineConfig::default()
    });

    m.consult(program).expect("program loads");
    m
}

/// Runs the query on both paths and checks the solutions agree with the
/// expectation and with each other.
fn assert_solutions(program: &str, query: &str, expected: &[&str]) {
    for wam_enabled in [false, true] {
        let mut m = machine(wam_enabled, program);
        let solutions = m.all_solutions(query).expect("query runs");

        assert_eq!(
            solutions,
            expected.to_vec(),
            "path (wam_enabled = {}) diverged on {}",
            wam_enabled,
            query
        );
    }
}

#[test]
fn facts_enumerate_in_source_order() {
    assert_solutions(
        "p(1). p(2). p(3).",
        "p(X).",
        &["X = 1", "X = 2", "X = 3"],
    );
}

#[test]
fn backtracking_is_complete_regardless_of_indexing_shape() {
    // constants, a variable clause, lists and structures mixed: the
    // variable clause must be tried in source position.
    let program = "
        q(a).
        q(X) :- X = mid.
        q([1]).
        q(f(1)).
        q(b).
    ";

    assert_solutions(
        program,
        "q(X).",
        &["X = a", "X = mid", "X = [1]", "X = f(1)", "X = b"],
    );
}

#[test]
fn first_argument_indexing_is_transparent() {
    let program = "
        r(a, 1).
        r(b, 2).
        r(a, 3).
        r(c, 4).
    ";

    assert_solutions(program, "r(a, N).", &["N = 1", "N = 3"]);
    assert_solutions(program, "r(b, N).", &["N = 2"]);
    assert_solutions(
        program,
        "r(K, N).",
        &[
            "K = a, N = 1",
            "K = b, N = 2",
            "K = a, N = 3",
            "K = c, N = 4",
        ],
    );
}

#[test]
fn cut_discipline_removes_later_clauses() {
    // the cut removes the alternative p(2) clause; fail then sinks
    // the whole query.
    assert_solutions("p(X) :- X = 1, !, fail. p(2).", "p(Y).", &[]);
}

#[test]
fn cut_discipline_commits_inside_disjunction() {
    // the cut commits both the disjunction and the clause.
    assert_solutions("p(X) :- (X = 1, ! ; X = 2).", "p(Y).", &["Y = 1"]);
}

#[test]
fn neck_cut_commits_to_first_clause() {
    assert_solutions("s(1) :- !. s(2).", "s(X).", &["X = 1"]);
}

#[test]
fn deep_cut_prunes_to_the_clause_entry() {
    let program = "
        t(X) :- m(X), !.
        t(99).
        m(1).
        m(2).
    ";

    assert_solutions(program, "t(X).", &["X = 1"]);
}

#[test]
fn append_produces_the_concatenation() {
    // the classic register-allocation regression; identical under
    // both paths.
    let program = "
        app([], L, L).
        app([H|T], L, [H|R]) :- app(T, L, R).
    ";

    assert_solutions(program, "app([1,2], [3,4], X).", &["X = [1,2,3,4]"]);
    assert_solutions(
        program,
        "app(X, Y, [1,2]).",
        &[
            "X = [], Y = [1,2]",
            "X = [1], Y = [2]",
            "X = [1,2], Y = []",
        ],
    );
}

#[test]
fn if_then_else_selects_one_branch() {
    let program = "
        max(X, Y, Z) :- (X >= Y -> Z = X ; Z = Y).
    ";

    assert_solutions(program, "max(3, 7, Z).", &["Z = 7"]);
    assert_solutions(program, "max(9, 2, Z).", &["Z = 9"]);
}

#[test]
fn if_then_else_condition_is_committed() {
    let program = "
        c(1).
        c(2).
        pick(X) :- (c(X) -> true ; X = none).
    ";

    // the condition's first solution commits; no enumeration of c/1.
    assert_solutions(program, "pick(X).", &["X = 1"]);
}

#[test]
fn negation_as_failure() {
    let program = "
        n(1).
        odd_one_out(X) :- \\+ n(X).
    ";

    assert_solutions(program, "odd_one_out(1).", &[]);
    assert_solutions(program, "odd_one_out(2).", &["true"]);
}

#[test]
fn disjunction_enumerates_both_arms() {
    assert_solutions("d(X) :- (X = l ; X = r).", "d(X).", &["X = l", "X = r"]);
}

#[test]
fn last_call_optimization_survives_deep_recursion() {
    let program = "
        app([], L, L).
        app([H|T], L, [H|R]) :- app(T, L, R).
    ";

    for wam_enabled in [false, true] {
        let mut m = machine(wam_enabled, program);

        let found = m
            .run_query("length(L, 10000), app(L, [x], R), length(R, N).")
            .expect("deep recursion completes");

        assert!(found);
        assert_eq!(
            m.get_result_term("N").map(|t| m.print_term(t)),
            Some("10001".to_string())
        );
    }
}

#[test]
fn heap_growth_leaves_live_terms_intact() {
    for wam_enabled in [false, true] {
        let mut m = machine(wam_enabled, "");

        let found = m
            .run_query("X = f(a, b, [1, 2, 3]), findall(N, between(1, 20000, N), L), length(L, Len).")
            .expect("query completes");

        assert!(found);
        assert_eq!(
            m.get_result_term("X").map(|t| m.print_term(t)),
            Some("f(a,b,[1,2,3])".to_string())
        );
        assert_eq!(
            m.get_result_term("Len").map(|t| m.print_term(t)),
            Some("20000".to_string())
        );
    }
}

#[test]
fn assert_and_retract_update_solutions() {
    for wam_enabled in [false, true] {
        let mut m = machine(wam_enabled, "");

        assert!(m.run_query("assert(p(1)), assert(p(2)), assert(p(3)).").unwrap());
        assert_eq!(
            m.all_solutions("p(X).").unwrap(),
            vec!["X = 1", "X = 2", "X = 3"]
        );

        assert!(m.run_query("retract(p(2)).").unwrap());
        assert_eq!(m.all_solutions("p(X).").unwrap(), vec!["X = 1", "X = 3"]);

        // asserta prepends.
        assert!(m.run_query("asserta(p(0)).").unwrap());
        assert_eq!(
            m.all_solutions("p(X).").unwrap(),
            vec!["X = 0", "X = 1", "X = 3"]
        );
    }
}

#[test]
fn findall_collects_all_solutions_and_restores_state() {
    let program = "
        p(1).
        p(2).
        p(3).
    ";

    for wam_enabled in [false, true] {
        let mut m = machine(wam_enabled, program);

        assert!(m.run_query("findall(X, p(X), L).").unwrap());

        // the template variable is unbound again after collection.
        let x = m.get_result_term("X").unwrap();
        assert!(m.print_term(x).starts_with("_G"));

        assert_eq!(
            m.get_result_term("L").map(|t| m.print_term(t)),
            Some("[1,2,3]".to_string())
        );

        assert!(m.run_query("findall(Y, fail, L).").unwrap());
        assert_eq!(
            m.get_result_term("L").map(|t| m.print_term(t)),
            Some("[]".to_string())
        );
    }
}

#[test]
fn arithmetic_escapes_to_arbitrary_precision() {
    let program = "
        fact(0, 1).
        fact(N, F) :- N > 0, M is N - 1, fact(M, G), F is N * G.
    ";

    for wam_enabled in [false, true] {
        let mut m = machine(wam_enabled, program);

        assert!(m.run_query("fact(25, F).").unwrap());
        assert_eq!(
            m.get_result_term("F").map(|t| m.print_term(t)),
            Some("15511210043330985984000000".to_string())
        );
    }
}

#[test]
fn big_integers_index_and_unify_by_value() {
    let program = "
        big(123456789012345678901234567890, yes).
        big(2, no).
    ";

    assert_solutions(
        program,
        "big(123456789012345678901234567890, X).",
        &["X = yes"],
    );
    assert_solutions(program, "X = 123456789012345678901234567890, big(X, R).", &[
        "X = 123456789012345678901234567890, R = yes",
    ]);
}

#[test]
fn failed_head_unification_leaves_no_bindings() {
    let program = "
        same(X, X).
    ";

    // \+ brackets the attempt with a choice point, so the speculative
    // binding of X is rolled back before var/1 sees it.
    for wam_enabled in [false, true] {
        let mut m = machine(wam_enabled, program);

        assert!(m
            .run_query("\\+(same(f(X, a), f(b, b))), var(X).")
            .unwrap());

        let x = m.get_result_term("X").unwrap();
        assert!(m.print_term(x).starts_with("_G"));
    }
}

#[test]
fn variable_goals_are_metacalled() {
    let program = "
        p(1).
        q(G) :- G.
    ";

    assert_solutions(program, "q(p(X)).", &["X = 1"]);
    assert_solutions(program, "G = p(X), call(G).", &["G = p(1), X = 1"]);
}

#[test]
fn solutions_survive_database_mixing_paths() {
    // compiled on one machine, interpreted on the other, after dynamic
    // updates: the multisets must still agree.
    let program = "
        edge(a, b).
        edge(b, c).
        edge(c, d).
        path(X, X).
        path(X, Y) :- edge(X, Z), path(Z, Y).
    ";

    let query = "path(a, X).";

    let mut interpreted = machine(false, program);
    let mut compiled = machine(true, program);

    let s1 = interpreted.all_solutions(query).unwrap();
    let s2 = compiled.all_solutions(query).unwrap();

    assert_eq!(s1, s2);
    assert_eq!(s1, vec!["X = a", "X = b", "X = c", "X = d"]);
}
