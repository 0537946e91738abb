//! Builtin registration and the standard builtin library. A builtin may
//! read machine registers, build terms, trigger unification, and signal
//! failure by returning `false` or raising a typed error; control
//! builtins may redirect `p` to a goal chain instead.

use crate::arithmetic::{self, Number};
use crate::atom_table::*;
use crate::heap_print::*;
use crate::machine::copier::*;
use crate::machine::heap::*;
use crate::machine::machine_errors::*;
use crate::machine::machine_indices::*;
use crate::machine::machine_state::*;
use crate::machine::Machine;
use crate::types::*;

use fxhash::FxHashSet;

use std::cmp::Ordering;

pub(crate) fn register_standard_builtins(indices: &mut IndexStore) {
    let m = atom!("user");

    let mut reg = |name: Atom, arity: usize, f: BuiltinFn, recursive: bool| {
        indices.register_builtin(m, name, arity, f, recursive);
    };

    reg(atom!("="), 2, unify_2, false);
    reg(atom!("\\="), 2, not_unifiable_2, false);
    reg(atom!("=="), 2, equal_2, false);
    reg(atom!("\\=="), 2, not_equal_2, false);
    reg(atom!("@<"), 2, term_less_2, false);
    reg(atom!("@=<"), 2, term_less_eq_2, false);
    reg(atom!("@>"), 2, term_greater_2, false);
    reg(atom!("@>="), 2, term_greater_eq_2, false);
    reg(atom!("compare"), 3, compare_3, false);
    reg(atom!("var"), 1, var_1, false);
    reg(atom!("nonvar"), 1, nonvar_1, false);
    reg(atom!("atom"), 1, atom_1, false);
    reg(atom!("atomic"), 1, atomic_1, false);
    reg(atom!("number"), 1, number_1, false);
    reg(atom!("integer"), 1, integer_1, false);
    reg(atom!("compound"), 1, compound_1, false);
    reg(atom!("callable"), 1, callable_1, false);
    reg(atom!("ground"), 1, ground_1, false);
    reg(atom!("is_list"), 1, is_list_1, false);
    reg(atom!("is"), 2, is_2, false);
    reg(atom!("=:="), 2, arith_eq_2, false);
    reg(atom!("=\\="), 2, arith_neq_2, false);
    reg(atom!("<"), 2, arith_less_2, false);
    reg(atom!("=<"), 2, arith_less_eq_2, false);
    reg(atom!(">"), 2, arith_greater_2, false);
    reg(atom!(">="), 2, arith_greater_eq_2, false);
    reg(atom!("functor"), 3, functor_3, false);
    reg(atom!("arg"), 3, arg_3, false);
    reg(atom!("=.."), 2, univ_2, false);
    reg(atom!("copy_term"), 2, copy_term_2, false);
    reg(atom!("length"), 2, length_2, false);
    reg(atom!("between"), 3, between_3, false);
    reg(atom!("findall"), 3, findall_3, true);
    reg(atom!("assert"), 1, assertz_1, false);
    reg(atom!("assertz"), 1, assertz_1, false);
    reg(atom!("asserta"), 1, asserta_1, false);
    reg(atom!("retract"), 1, retract_1, false);
    reg(atom!("call"), 1, call_n, false);
    reg(atom!("call"), 2, call_n, false);
    reg(atom!("call"), 3, call_n, false);
    reg(atom!("call"), 4, call_n, false);
}

// ---- unification and comparison.

fn unify_2(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    Ok(m.machine_st.unify(args[0], args[1]))
}

/// `\=/2` reduces to `\+(A = B)`: the negation machinery's choice point
/// marks guarantee an exact undo of any speculative bindings.
fn not_unifiable_2(
    m: &mut Machine,
    _: usize,
    args: &[HeapCellValue],
) -> Result<bool, MachineError> {
    let eq = m
        .machine_st
        .heap
        .put_structure(atom!("="), &[args[0], args[1]]);
    let goal = m.machine_st.heap.put_structure(atom!("\\+"), &[eq]);

    m.machine_st.p = CodePtr::Term(goal);
    Ok(true)
}

/// The standard order, cycle-safe through a tabu set of visited pairs.
pub(crate) fn compare_term_test(
    machine_st: &MachineState,
    a1: HeapCellValue,
    a2: HeapCellValue,
) -> Ordering {
    let mut pdl = vec![a2, a1];
    let mut tabu: FxHashSet<(usize, usize)> = FxHashSet::default();

    while let Some(d1) = pdl.pop() {
        let d2 = pdl.pop().unwrap();

        let d1 = machine_st.deref(d1);
        let d2 = machine_st.deref(d2);

        if d1 == d2 {
            continue;
        }

        let v1 = machine_st.store(d1);
        let v2 = machine_st.store(d2);

        let cat1 = v1.order_category();
        let cat2 = v2.order_category();

        if cat1 != cat2 {
            return cat1.cmp(&cat2);
        }

        match cat1 {
            Some(TermOrderCategory::Variable) => {
                let r1 = d1.as_var().unwrap();
                let r2 = d2.as_var().unwrap();

                match r1.cmp(&r2) {
                    Ordering::Equal => continue,
                    ordering => return ordering,
                }
            }
            Some(TermOrderCategory::Integer) => {
                let n1 = read_number(machine_st, v1);
                let n2 = read_number(machine_st, v2);

                match n1.cmp(&n2) {
                    Ordering::Equal => continue,
                    ordering => return ordering,
                }
            }
            Some(TermOrderCategory::Atom) => {
                let (n1, n2) = match (v1, v2) {
                    (HeapCellValue::Atom(n1, 0), HeapCellValue::Atom(n2, 0)) => (n1, n2),
                    _ => unreachable!(),
                };

                match machine_st
                    .atom_tbl
                    .as_str(n1)
                    .cmp(machine_st.atom_tbl.as_str(n2))
                {
                    Ordering::Equal => continue,
                    ordering => return ordering,
                }
            }
            Some(TermOrderCategory::Compound) => {
                let (f1, args1) = functor_view(machine_st, v1);
                let (f2, args2) = functor_view(machine_st, v2);

                let key_ordering = args1
                    .len()
                    .cmp(&args2.len())
                    .then_with(|| {
                        machine_st
                            .atom_tbl
                            .as_str(f1)
                            .cmp(machine_st.atom_tbl.as_str(f2))
                    });

                match key_ordering {
                    Ordering::Equal => {
                        let pair = (args1[0], args2[0]);

                        if !tabu.insert(pair) {
                            continue;
                        }

                        for i in (0..args1.len()).rev() {
                            pdl.push(HeapCellValue::Var(args2[i]));
                            pdl.push(HeapCellValue::Var(args1[i]));
                        }
                    }
                    ordering => return ordering,
                }
            }
            None => unreachable!("ordering of a non-term cell"),
        }
    }

    Ordering::Equal
}

fn read_number(machine_st: &MachineState, value: HeapCellValue) -> Number {
    match value {
        HeapCellValue::Fixnum(n) => Number::Fixnum(n),
        HeapCellValue::Big(h) => Number::Big(machine_st.heap.read_big(h)),
        _ => unreachable!("numeric comparison of {:?}", value),
    }
}

// functor name and the heap addresses of the argument cells.
fn functor_view(machine_st: &MachineState, value: HeapCellValue) -> (Atom, Vec<usize>) {
    match value {
        HeapCellValue::Lis(l) => (atom!("."), vec![l, l + 1]),
        HeapCellValue::Str(s) => match machine_st.heap[s] {
            HeapCellValue::Atom(name, arity) => (name, (s + 1..=s + arity).collect()),
            _ => unreachable!(),
        },
        _ => unreachable!(),
    }
}

fn equal_2(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    Ok(compare_term_test(&m.machine_st, args[0], args[1]) == Ordering::Equal)
}

fn not_equal_2(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    Ok(compare_term_test(&m.machine_st, args[0], args[1]) != Ordering::Equal)
}

fn term_less_2(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    Ok(compare_term_test(&m.machine_st, args[0], args[1]) == Ordering::Less)
}

fn term_less_eq_2(
    m: &mut Machine,
    _: usize,
    args: &[HeapCellValue],
) -> Result<bool, MachineError> {
    Ok(compare_term_test(&m.machine_st, args[0], args[1]) != Ordering::Greater)
}

fn term_greater_2(
    m: &mut Machine,
    _: usize,
    args: &[HeapCellValue],
) -> Result<bool, MachineError> {
    Ok(compare_term_test(&m.machine_st, args[0], args[1]) == Ordering::Greater)
}

fn term_greater_eq_2(
    m: &mut Machine,
    _: usize,
    args: &[HeapCellValue],
) -> Result<bool, MachineError> {
    Ok(compare_term_test(&m.machine_st, args[0], args[1]) != Ordering::Less)
}

fn compare_3(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let order = match compare_term_test(&m.machine_st, args[1], args[2]) {
        Ordering::Less => atom!("<"),
        Ordering::Equal => atom!("="),
        Ordering::Greater => atom!(">"),
    };

    Ok(m.machine_st.unify(args[0], HeapCellValue::Atom(order, 0)))
}

// ---- type tests.

fn var_1(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let value = m.machine_st.store(m.machine_st.deref(args[0]));
    Ok(value.is_var())
}

fn nonvar_1(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let value = m.machine_st.store(m.machine_st.deref(args[0]));
    Ok(!value.is_var())
}

fn atom_1(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let value = m.machine_st.store(m.machine_st.deref(args[0]));
    Ok(matches!(value, HeapCellValue::Atom(_, 0)))
}

fn atomic_1(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let value = m.machine_st.store(m.machine_st.deref(args[0]));
    Ok(value.is_constant())
}

fn number_1(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let value = m.machine_st.store(m.machine_st.deref(args[0]));
    Ok(matches!(
        value,
        HeapCellValue::Fixnum(_) | HeapCellValue::Big(_)
    ))
}

fn integer_1(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    number_1(m, 1, args)
}

fn compound_1(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let value = m.machine_st.store(m.machine_st.deref(args[0]));
    Ok(value.is_compound())
}

fn callable_1(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let value = m.machine_st.store(m.machine_st.deref(args[0]));
    Ok(matches!(
        value,
        HeapCellValue::Atom(..) | HeapCellValue::Str(_) | HeapCellValue::Lis(_)
    ))
}

fn ground_1(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let machine_st = &m.machine_st;
    let mut worklist = vec![args[0]];
    let mut visited: FxHashSet<usize> = FxHashSet::default();

    while let Some(cell) = worklist.pop() {
        let value = machine_st.store(machine_st.deref(cell));

        match value {
            _ if value.is_var() => return Ok(false),
            HeapCellValue::Lis(l) => {
                if visited.insert(l) {
                    worklist.push(HeapCellValue::Var(l));
                    worklist.push(HeapCellValue::Var(l + 1));
                }
            }
            HeapCellValue::Str(s) => {
                if visited.insert(s) {
                    let arity = match machine_st.heap[s] {
                        HeapCellValue::Atom(_, arity) => arity,
                        _ => 0,
                    };

                    for i in 1..=arity {
                        worklist.push(HeapCellValue::Var(s + i));
                    }
                }
            }
            _ => {}
        }
    }

    Ok(true)
}

fn is_list_1(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let machine_st = &m.machine_st;
    let mut cell = args[0];
    let mut visited: FxHashSet<usize> = FxHashSet::default();

    loop {
        let value = machine_st.store(machine_st.deref(cell));

        match value {
            HeapCellValue::Atom(name, 0) if name == atom!("[]") => return Ok(true),
            HeapCellValue::Lis(l) => {
                if !visited.insert(l) {
                    // cyclic spine.
                    return Ok(false);
                }

                cell = HeapCellValue::Var(l + 1);
            }
            _ => return Ok(false),
        }
    }
}

// ---- arithmetic.

fn is_2(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let n = arithmetic::eval(&m.machine_st, args[1])?;
    let cell = n.to_cell(&mut m.machine_st.heap);

    Ok(m.machine_st.unify(args[0], cell))
}

fn arith_compare(
    m: &mut Machine,
    args: &[HeapCellValue],
) -> Result<Ordering, MachineError> {
    let n1 = arithmetic::eval(&m.machine_st, args[0])?;
    let n2 = arithmetic::eval(&m.machine_st, args[1])?;

    Ok(n1.cmp(&n2))
}

fn arith_eq_2(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    Ok(arith_compare(m, args)? == Ordering::Equal)
}

fn arith_neq_2(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    Ok(arith_compare(m, args)? != Ordering::Equal)
}

fn arith_less_2(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    Ok(arith_compare(m, args)? == Ordering::Less)
}

fn arith_less_eq_2(
    m: &mut Machine,
    _: usize,
    args: &[HeapCellValue],
) -> Result<bool, MachineError> {
    Ok(arith_compare(m, args)? != Ordering::Greater)
}

fn arith_greater_2(
    m: &mut Machine,
    _: usize,
    args: &[HeapCellValue],
) -> Result<bool, MachineError> {
    Ok(arith_compare(m, args)? == Ordering::Greater)
}

fn arith_greater_eq_2(
    m: &mut Machine,
    _: usize,
    args: &[HeapCellValue],
) -> Result<bool, MachineError> {
    Ok(arith_compare(m, args)? != Ordering::Less)
}

// ---- term inspection and construction.

fn functor_3(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let value = m.machine_st.store(m.machine_st.deref(args[0]));

    if !value.is_var() {
        let (name_cell, arity) = match value {
            HeapCellValue::Lis(_) => (HeapCellValue::Atom(atom!("."), 0), 2),
            HeapCellValue::Str(s) => match m.machine_st.heap[s] {
                HeapCellValue::Atom(name, arity) => (HeapCellValue::Atom(name, 0), arity),
                _ => unreachable!(),
            },
            constant => (constant, 0),
        };

        return Ok(m.machine_st.unify(args[1], name_cell)
            && m.machine_st.unify(args[2], HeapCellValue::Fixnum(arity as i64)));
    }

    let name = m.machine_st.store(m.machine_st.deref(args[1]));
    let arity = m.machine_st.store(m.machine_st.deref(args[2]));

    let arity = match arity {
        HeapCellValue::Fixnum(n) if n >= 0 && n <= crate::forms::MAX_ARITY as i64 => n as usize,
        HeapCellValue::Fixnum(_) => {
            return Err(MachineError::DomainError(
                "arity",
                print_heap_term(&m.machine_st, arity),
            ))
        }
        _ if arity.is_var() => return Err(MachineError::InstantiationError(atom!("functor"), 3)),
        _ => {
            return Err(MachineError::TypeError(
                ValidType::Integer,
                print_heap_term(&m.machine_st, arity),
            ))
        }
    };

    let built = match name {
        _ if name.is_var() => return Err(MachineError::InstantiationError(atom!("functor"), 3)),
        HeapCellValue::Atom(name, 0) if arity > 0 => {
            if name == atom!(".") && arity == 2 {
                let head = m.machine_st.heap.new_var();
                let tail = m.machine_st.heap.new_var();
                m.machine_st.heap.put_list(head, tail)
            } else {
                m.machine_st.heap.put_open_structure(name, arity)
            }
        }
        constant if arity == 0 && constant.is_constant() => constant,
        _ => {
            return Err(MachineError::TypeError(
                ValidType::Atom,
                print_heap_term(&m.machine_st, name),
            ))
        }
    };

    Ok(m.machine_st.unify(args[0], built))
}

fn arg_3(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let n = m.machine_st.store(m.machine_st.deref(args[0]));
    let term = m.machine_st.store(m.machine_st.deref(args[1]));

    let n = match n {
        HeapCellValue::Fixnum(n) => n,
        _ if n.is_var() => return Err(MachineError::InstantiationError(atom!("arg"), 3)),
        _ => {
            return Err(MachineError::TypeError(
                ValidType::Integer,
                print_heap_term(&m.machine_st, n),
            ))
        }
    };

    let arg_cell = match term {
        HeapCellValue::Lis(l) => match n {
            1 => Some(HeapCellValue::Var(l)),
            2 => Some(HeapCellValue::Var(l + 1)),
            _ => None,
        },
        HeapCellValue::Str(s) => match m.machine_st.heap[s] {
            HeapCellValue::Atom(_, arity) if n >= 1 && (n as usize) <= arity => {
                Some(HeapCellValue::Var(s + n as usize))
            }
            _ => None,
        },
        _ if term.is_var() => return Err(MachineError::InstantiationError(atom!("arg"), 3)),
        _ => {
            return Err(MachineError::TypeError(
                ValidType::Compound,
                print_heap_term(&m.machine_st, term),
            ))
        }
    };

    match arg_cell {
        Some(cell) => Ok(m.machine_st.unify(args[2], cell)),
        None => Ok(false),
    }
}

fn univ_2(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let value = m.machine_st.store(m.machine_st.deref(args[0]));

    if !value.is_var() {
        let items = match value {
            HeapCellValue::Lis(l) => vec![
                HeapCellValue::Atom(atom!("."), 0),
                HeapCellValue::Var(l),
                HeapCellValue::Var(l + 1),
            ],
            HeapCellValue::Str(s) => match m.machine_st.heap[s] {
                HeapCellValue::Atom(name, arity) => {
                    let mut items = vec![HeapCellValue::Atom(name, 0)];
                    items.extend((1..=arity).map(|i| HeapCellValue::Var(s + i)));
                    items
                }
                _ => unreachable!(),
            },
            constant => vec![constant],
        };

        let list = m.machine_st.heap.to_list(items);
        return Ok(m.machine_st.unify(args[1], list));
    }

    // construction: the right-hand list supplies functor and arguments.
    let mut items = vec![];
    let mut cell = args[1];

    loop {
        let value = m.machine_st.store(m.machine_st.deref(cell));

        match value {
            HeapCellValue::Atom(name, 0) if name == atom!("[]") => break,
            HeapCellValue::Lis(l) => {
                items.push(m.machine_st.heap[l]);
                cell = m.machine_st.heap[l + 1];
            }
            _ if value.is_var() => {
                return Err(MachineError::InstantiationError(atom!("=.."), 2))
            }
            _ => {
                return Err(MachineError::TypeError(
                    ValidType::List,
                    print_heap_term(&m.machine_st, args[1]),
                ))
            }
        }
    }

    if items.is_empty() {
        return Err(MachineError::DomainError("non_empty_list", "[]".to_string()));
    }

    let functor = m.machine_st.store(m.machine_st.deref(items[0]));
    let term_args = &items[1..];

    let built = match functor {
        HeapCellValue::Atom(name, 0) if !term_args.is_empty() => {
            if name == atom!(".") && term_args.len() == 2 {
                m.machine_st.heap.put_list(term_args[0], term_args[1])
            } else {
                m.machine_st.heap.put_structure(name, term_args)
            }
        }
        constant if term_args.is_empty() && constant.is_constant() => constant,
        _ if functor.is_var() => return Err(MachineError::InstantiationError(atom!("=.."), 2)),
        _ => {
            return Err(MachineError::TypeError(
                ValidType::Atom,
                print_heap_term(&m.machine_st, functor),
            ))
        }
    };

    Ok(m.machine_st.unify(args[0], built))
}

fn copy_term_2(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let copy = {
        let MachineState {
            ref mut heap,
            ref stack,
            ..
        } = m.machine_st;

        let mut copier = OwnHeapCopier { heap, stack };
        copy_term(&mut copier, args[0])
    };

    Ok(m.machine_st.unify(args[1], copy))
}

fn length_2(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let mut cell = args[0];
    let mut count: i64 = 0;
    let mut visited: FxHashSet<usize> = FxHashSet::default();

    loop {
        let value = m.machine_st.store(m.machine_st.deref(cell));

        match value {
            HeapCellValue::Atom(name, 0) if name == atom!("[]") => {
                return Ok(m.machine_st.unify(args[1], HeapCellValue::Fixnum(count)));
            }
            HeapCellValue::Lis(l) => {
                if !visited.insert(l) {
                    return Ok(false);
                }

                count += 1;
                cell = HeapCellValue::Var(l + 1);
            }
            _ if value.is_var() => {
                // a partial list: a bound length instantiates the tail.
                let n = m.machine_st.store(m.machine_st.deref(args[1]));

                match n {
                    HeapCellValue::Fixnum(n) if n >= count => {
                        let mut tail = HeapCellValue::Atom(atom!("[]"), 0);

                        for _ in 0..(n - count) {
                            let var = m.machine_st.heap.new_var();
                            tail = m.machine_st.heap.put_list(var, tail);
                        }

                        return Ok(m.machine_st.unify(cell, tail));
                    }
                    HeapCellValue::Fixnum(_) => return Ok(false),
                    _ => {
                        return Err(MachineError::InstantiationError(atom!("length"), 2));
                    }
                }
            }
            _ => return Ok(false),
        }
    }
}

/// `between/3` enumerates through a lazily unrolled disjunction: each
/// redo re-enters with a narrowed lower bound.
fn between_3(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let low = arithmetic::eval(&m.machine_st, args[0])?;
    let high = arithmetic::eval(&m.machine_st, args[1])?;

    let x = m.machine_st.store(m.machine_st.deref(args[2]));

    match x {
        HeapCellValue::Fixnum(_) | HeapCellValue::Big(_) => {
            let n = read_number(&m.machine_st, x);
            Ok(low.cmp(&n) != Ordering::Greater && n.cmp(&high) != Ordering::Greater)
        }
        _ if x.is_var() => {
            if low.cmp(&high) == Ordering::Greater {
                return Ok(false);
            }

            let low_cell = low.to_cell(&mut m.machine_st.heap);

            if low.cmp(&high) == Ordering::Equal {
                return Ok(m.machine_st.unify(args[2], low_cell));
            }

            // (X = Low ; between(Low + 1, High, X))
            let machine_st = &mut m.machine_st;
            let next_low = arithmetic::add(&low, &Number::Fixnum(1));
            let next_low = next_low.to_cell(&mut machine_st.heap);
            let high_cell = high.to_cell(&mut machine_st.heap);

            let eq = machine_st
                .heap
                .put_structure(atom!("="), &[args[2], low_cell]);
            let rec = machine_st
                .heap
                .put_structure(atom!("between"), &[next_low, high_cell, args[2]]);
            let goal = machine_st.heap.put_structure(atom!(";"), &[eq, rec]);

            machine_st.p = CodePtr::Term(goal);
            Ok(true)
        }
        _ => Err(MachineError::TypeError(
            ValidType::Integer,
            print_heap_term(&m.machine_st, x),
        )),
    }
}

// ---- meta.

fn call_n(m: &mut Machine, arity: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let addr = m.machine_st.deref(args[0]);
    let value = m.machine_st.store(addr);

    if value.is_var() {
        return Err(MachineError::InstantiationError(atom!("call"), arity));
    }

    let goal = if arity == 1 {
        addr
    } else {
        // extend the goal with the supplied extra arguments.
        let (name, mut goal_args) = match value {
            HeapCellValue::Atom(name, 0) => (name, vec![]),
            HeapCellValue::Str(s) => match m.machine_st.heap[s] {
                HeapCellValue::Atom(name, n) => {
                    (name, (1..=n).map(|i| HeapCellValue::Var(s + i)).collect())
                }
                _ => unreachable!(),
            },
            _ => {
                return Err(MachineError::TypeError(
                    ValidType::Callable,
                    print_heap_term(&m.machine_st, value),
                ))
            }
        };

        for extra in &args[1..] {
            // globalize: a heap structure must never capture a frame
            // slot that could be deallocated under it.
            let addr = m.machine_st.deref(*extra);

            let arg = match addr {
                HeapCellValue::StackVar(..) => {
                    let cell = m.machine_st.heap.new_var();
                    let r = addr.as_var().unwrap();
                    m.machine_st.bind(r, cell);
                    cell
                }
                _ => addr,
            };

            goal_args.push(arg);
        }

        m.machine_st.heap.put_structure(name, &goal_args)
    };

    // cuts inside a metacalled goal are local to it.
    let b = m.machine_st.b;
    let goal = m.replace_cuts(goal, b);

    m.machine_st.p = CodePtr::Term(goal);
    Ok(true)
}

/// `findall/3` runs its goal to exhaustion inside a nested instance,
/// lifting each solution's template into a side heap, then restores the
/// outer query and materializes the collected list.
fn findall_3(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let template = args[0];
    let goal = args[1];
    let bag = args[2];

    let goal_addr = m.machine_st.deref(goal);

    if m.machine_st.store(goal_addr).is_var() {
        return Err(MachineError::InstantiationError(atom!("findall"), 3));
    }

    m.new_instance();

    let collected = (|m: &mut Machine| -> Result<(Heap, Vec<HeapCellValue>), MachineError> {
        let b = m.machine_st.b;
        let goal = m.replace_cuts(goal_addr, b);

        let mut lifted = Heap::new();
        let mut roots = vec![];

        let mut found = m.execute_sub_goal(goal)?;

        while found {
            let root = {
                let MachineState {
                    ref heap,
                    ref stack,
                    ..
                } = m.machine_st;

                let mut copier = CrossHeapCopier {
                    src: heap,
                    src_stack: Some(stack),
                    dst: &mut lifted,
                };

                copy_term(&mut copier, template)
            };

            roots.push(root);

            found = if m.has_more() {
                m.machine_st.fail = true;
                m.run()?
            } else {
                false
            };
        }

        Ok((lifted, roots))
    })(m);

    m.release_instance();

    let (lifted, roots) = collected?;

    let items: Vec<_> = roots
        .into_iter()
        .map(|root| {
            let mut copier = CrossHeapCopier {
                src: &lifted,
                src_stack: None,
                dst: &mut m.machine_st.heap,
            };

            copy_term(&mut copier, root)
        })
        .collect();

    let list = m.machine_st.heap.to_list(items);
    Ok(m.machine_st.unify(bag, list))
}

// ---- database update.

fn assert_clause(
    m: &mut Machine,
    args: &[HeapCellValue],
    append: bool,
) -> Result<bool, MachineError> {
    m.load_clause(args[0], append)?;
    Ok(true)
}

fn assertz_1(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    assert_clause(m, args, true)
}

fn asserta_1(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    assert_clause(m, args, false)
}

/// Logical retract: unify against a renamed copy of each stored clause
/// in order, tombstone the first match. Bindings of the successful
/// match remain, speculative ones of failed candidates are unwound.
fn retract_1(m: &mut Machine, _: usize, args: &[HeapCellValue]) -> Result<bool, MachineError> {
    let value = m.machine_st.store(m.machine_st.deref(args[0]));

    let (head_cell, body_cell) = match value {
        HeapCellValue::Str(s) if m.machine_st.heap[s] == HeapCellValue::Atom(atom!(":-"), 2) => {
            (m.machine_st.heap[s + 1], Some(m.machine_st.heap[s + 2]))
        }
        other if !other.is_var() => (other, None),
        _ => return Err(MachineError::InstantiationError(atom!("retract"), 1)),
    };

    let head_value = m.machine_st.store(m.machine_st.deref(head_cell));

    let (name, arity) = match head_value {
        HeapCellValue::Atom(name, 0) => (name, 0),
        HeapCellValue::Str(s) => match m.machine_st.heap[s] {
            HeapCellValue::Atom(name, arity) => (name, arity),
            _ => unreachable!(),
        },
        _ => {
            return Err(MachineError::TypeError(
                ValidType::Callable,
                print_heap_term(&m.machine_st, head_value),
            ))
        }
    };

    let key = (atom!("user"), name, arity);

    let candidates: Vec<(usize, HeapCellValue, HeapCellValue)> = {
        match m.indices.predicates.get(&key) {
            Some(skeleton) => skeleton
                .live_clauses()
                .map(|(i, clause)| (i, clause.head, clause.body))
                .collect(),
            None => return Ok(false),
        }
    };

    // force every speculative binding onto the trail: candidates that
    // fail to match are unwound in place, without backtracking.
    let saved_hb = m.machine_st.hb;
    let saved_b = m.machine_st.b;

    m.machine_st.hb = m.machine_st.heap.h();
    m.machine_st.b = usize::MAX;

    let result = retract_candidates(m, &key, head_cell, body_cell, candidates);

    m.machine_st.hb = saved_hb;
    m.machine_st.b = saved_b;

    result
}

fn retract_candidates(
    m: &mut Machine,
    key: &PredicateKey,
    head_cell: HeapCellValue,
    body_cell: Option<HeapCellValue>,
    candidates: Vec<(usize, HeapCellValue, HeapCellValue)>,
) -> Result<bool, MachineError> {
    for (index, stored_head, stored_body) in candidates {
        let mark = m.machine_st.tr;
        let heap_mark = m.machine_st.heap.h();

        let mut seen = fxhash::FxHashMap::default();

        let (renamed_head, renamed_body) = {
            let mut copier = CrossHeapCopier {
                src: &m.indices.clause_store,
                src_stack: None,
                dst: &mut m.machine_st.heap,
            };

            let head = copy_term_with(&mut seen, &mut copier, stored_head);
            let body = copy_term_with(&mut seen, &mut copier, stored_body);
            (head, body)
        };

        let body_matches = match body_cell {
            Some(body_cell) => m.machine_st.unify(body_cell, renamed_body),
            None => renamed_body == HeapCellValue::Atom(atom!("true"), 0),
        };

        if body_matches && m.machine_st.unify(head_cell, renamed_head) {
            m.indices.erase_clause(*key, index);
            return Ok(true);
        }

        // exact undo of the speculative match.
        m.machine_st.unwind_trail(mark);
        m.machine_st.heap.truncate(heap_mark);
    }

    Ok(false)
}
