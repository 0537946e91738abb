use crate::atom_table::*;
use crate::machine::machine_state::*;
use crate::types::*;

use fxhash::FxHashSet;

fn atom_needs_quoting(s: &str) -> bool {
    if s.is_empty() {
        return true;
    }

    let first = s.chars().next().unwrap();

    if first.is_ascii_lowercase() {
        return !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    }

    const SOLO: &[&str] = &["[]", "{}", "!", ";", ",", "|"];

    if SOLO.contains(&s) {
        return false;
    }

    const SYMBOLIC: &str = "+-*/\\^<>=~:.?@#&$";

    !s.chars().all(|c| SYMBOLIC.contains(c))
}

fn push_atom(output: &mut String, s: &str) {
    if atom_needs_quoting(s) {
        output.push('\'');

        for c in s.chars() {
            if c == '\'' {
                output.push('\\');
            }

            output.push(c);
        }

        output.push('\'');
    } else {
        output.push_str(s);
    }
}

enum PrintItem {
    Cell(HeapCellValue),
    Str(&'static str),
    /// Continue a list at the tail cell address.
    ListTail(usize),
    /// Leave a structure: drop its address from the active path.
    Exit(usize),
}

/// Renders a term in canonical notation with list syntax. Structures on
/// the active traversal path are tracked in a visited set, so cyclic
/// terms print with an ellipsis instead of diverging.
pub fn print_heap_term(machine_st: &MachineState, cell: HeapCellValue) -> String {
    let mut output = String::new();
    let mut visited: FxHashSet<usize> = FxHashSet::default();
    let mut items = vec![PrintItem::Cell(cell)];

    while let Some(item) = items.pop() {
        let cell = match item {
            PrintItem::Str(s) => {
                output.push_str(s);
                continue;
            }
            PrintItem::Exit(addr) => {
                visited.remove(&addr);
                continue;
            }
            PrintItem::ListTail(t) => {
                let addr = machine_st.deref(HeapCellValue::Var(t));
                let value = machine_st.store(addr);

                match value {
                    HeapCellValue::Atom(name, 0) if name == atom!("[]") => {
                        output.push(']');
                    }
                    HeapCellValue::Lis(l) => {
                        if visited.contains(&l) {
                            output.push_str("|...]");
                            continue;
                        }

                        visited.insert(l);
                        output.push(',');

                        items.push(PrintItem::Exit(l));
                        items.push(PrintItem::ListTail(l + 1));
                        items.push(PrintItem::Cell(HeapCellValue::Var(l)));
                    }
                    _ => {
                        output.push('|');
                        items.push(PrintItem::Str("]"));
                        items.push(PrintItem::Cell(addr));
                    }
                }

                continue;
            }
            PrintItem::Cell(cell) => cell,
        };

        let addr = machine_st.deref(cell);
        let value = machine_st.store(addr);

        match value {
            HeapCellValue::Var(h) => {
                output.push_str(&format!("_G{}", h));
            }
            HeapCellValue::StackVar(fr, sc) => {
                output.push_str(&format!("_S{}_{}", fr, sc));
            }
            HeapCellValue::Fixnum(n) => {
                output.push_str(&n.to_string());
            }
            HeapCellValue::Big(h) => {
                output.push_str(&machine_st.heap.read_big(h).to_string());
            }
            HeapCellValue::Atom(name, _) => {
                push_atom(&mut output, machine_st.atom_tbl.as_str(name));
            }
            HeapCellValue::CutPoint(b) => {
                output.push_str(&format!("$cut_point({})", b));
            }
            HeapCellValue::Lis(l) => {
                if visited.contains(&l) {
                    output.push_str("[...]");
                    continue;
                }

                visited.insert(l);
                output.push('[');

                items.push(PrintItem::Exit(l));
                items.push(PrintItem::ListTail(l + 1));
                items.push(PrintItem::Cell(HeapCellValue::Var(l)));
            }
            HeapCellValue::Str(s) => {
                if visited.contains(&s) {
                    output.push_str("...");
                    continue;
                }

                let (name, arity) = match machine_st.heap[s] {
                    HeapCellValue::Atom(name, arity) => (name, arity),
                    cell => unreachable!("structure points at {:?}", cell),
                };

                visited.insert(s);
                push_atom(&mut output, machine_st.atom_tbl.as_str(name));
                output.push('(');

                items.push(PrintItem::Exit(s));
                items.push(PrintItem::Str(")"));

                for i in (1..=arity).rev() {
                    if i < arity {
                        items.push(PrintItem::Str(","));
                    }

                    items.push(PrintItem::Cell(HeapCellValue::Var(s + i)));
                }
            }
            cell => unreachable!("print of a non-term cell: {:?}", cell),
        }
    }

    output
}
