use crate::forms::*;

use std::cell::Cell;

/// A traversal event over a compiler term.
#[derive(Debug, Clone)]
pub enum TermRef<'a> {
    AnonVar(Level),
    Clause(Level, &'a Cell<RegType>, Atom, &'a [Term]),
    Cons(Level, &'a Cell<RegType>, &'a Term, &'a Term),
    Literal(Level, &'a Cell<RegType>, &'a Literal),
    Var(Level, &'a Cell<VarReg>, Var),
}

use crate::atom_table::Atom;

impl<'a> TermRef<'a> {
    pub fn level(&self) -> Level {
        match self {
            TermRef::AnonVar(lvl)
            | TermRef::Clause(lvl, ..)
            | TermRef::Cons(lvl, ..)
            | TermRef::Literal(lvl, ..)
            | TermRef::Var(lvl, ..) => *lvl,
        }
    }
}

fn subterm_ref<'a>(term: &'a Term, lvl: Level) -> TermRef<'a> {
    match term {
        Term::AnonVar => TermRef::AnonVar(lvl),
        Term::Clause(cell, name, args) => TermRef::Clause(lvl, cell, *name, args),
        Term::Cons(cell, head, tail) => TermRef::Cons(lvl, cell, head, tail),
        Term::Literal(cell, literal) => TermRef::Literal(lvl, cell, literal),
        Term::Var(cell, var) => TermRef::Var(lvl, cell, var.clone()),
    }
}

fn post_order_into<'a>(term: &'a Term, lvl: Level, refs: &mut Vec<TermRef<'a>>) {
    match term {
        Term::Clause(_, _, args) => {
            for arg in args {
                post_order_into(arg, Level::Deep, refs);
            }
        }
        Term::Cons(_, head, tail) => {
            post_order_into(head, Level::Deep, refs);
            post_order_into(tail, Level::Deep, refs);
        }
        _ => {}
    }

    refs.push(subterm_ref(term, lvl));
}

/// Post-order (innermost first) traversal of a goal's arguments: inner
/// structures are visited before the argument positions that mention
/// them, so query compilation populates registers bottom-up.
pub fn post_order_refs<'a>(args: &'a [Term]) -> Vec<TermRef<'a>> {
    let mut refs = vec![];

    for arg in args {
        post_order_into(arg, Level::Shallow, &mut refs);
    }

    refs
}

/// Breadth-first (outermost first) traversal of a clause head's
/// arguments: matching works top-down.
pub fn breadth_first_refs<'a>(args: &'a [Term]) -> Vec<TermRef<'a>> {
    let mut queue: std::collections::VecDeque<(Level, &'a Term)> =
        args.iter().map(|arg| (Level::Shallow, arg)).collect();
    let mut refs = vec![];

    while let Some((lvl, term)) = queue.pop_front() {
        match term {
            Term::Clause(_, _, args) => {
                for arg in args {
                    queue.push_back((Level::Deep, arg));
                }
            }
            Term::Cons(_, head, tail) => {
                queue.push_back((Level::Deep, head));
                queue.push_back((Level::Deep, tail));
            }
            _ => {}
        }

        refs.push(subterm_ref(term, lvl));
    }

    refs
}

/// One element of a chunk: the head's argument vector or a body goal.
#[derive(Debug, Clone, Copy)]
pub enum ChunkedTerm<'a> {
    HeadClause(&'a [Term]),
    BodyTerm(&'a QueryTerm),
}

impl<'a> ChunkedTerm<'a> {
    /// Variable occurrences of this element, post-order, for the
    /// classification pass. Cut terms contribute their barrier variable
    /// as a shallow occurrence.
    pub fn term_refs(&self) -> Vec<TermRef<'a>> {
        match self {
            ChunkedTerm::HeadClause(args) => post_order_refs(args),
            ChunkedTerm::BodyTerm(QueryTerm::Clause(_, args)) => post_order_refs(args),
            ChunkedTerm::BodyTerm(QueryTerm::GetLevel { cell, var })
            | ChunkedTerm::BodyTerm(QueryTerm::GetCutPoint { cell, var })
            | ChunkedTerm::BodyTerm(QueryTerm::GlobalCut { cell, var })
            | ChunkedTerm::BodyTerm(QueryTerm::LocalCut { cell, var }) => {
                vec![TermRef::Var(Level::Shallow, cell, var.clone())]
            }
            _ => vec![],
        }
    }
}

/// A chunk: a run of body terms ending at a call boundary. Chunk numbers
/// are the spine of the temporary/permanent register decision.
#[derive(Debug)]
pub struct Chunk<'a> {
    pub chunk_num: usize,
    /// Arity of the chunk's terminating call; bounds the argument
    /// registers the chunk's last goal will overwrite.
    pub lt_arity: usize,
    pub terms: Vec<ChunkedTerm<'a>>,
}

/// Splits a clause into chunks. Every call (user predicate or builtin) is
/// a boundary; branch arms open fresh chunks on each side so a variable
/// shared between arms, or between an arm and the surrounding clause,
/// always spans a boundary and is forced permanent.
pub fn build_chunks<'a>(head: Option<&'a [Term]>, body: &'a [QueryTerm]) -> Vec<Chunk<'a>> {
    let mut chunks = vec![];
    let mut current: Vec<ChunkedTerm<'a>> = vec![];
    let mut chunk_num = 0;

    if let Some(args) = head {
        current.push(ChunkedTerm::HeadClause(args));
    }

    fn flush<'a>(
        chunks: &mut Vec<Chunk<'a>>,
        current: &mut Vec<ChunkedTerm<'a>>,
        chunk_num: &mut usize,
        lt_arity: usize,
    ) {
        if !current.is_empty() {
            chunks.push(Chunk {
                chunk_num: *chunk_num,
                lt_arity,
                terms: std::mem::take(current),
            });
            *chunk_num += 1;
        }
    }

    fn walk<'a>(
        body: &'a [QueryTerm],
        chunks: &mut Vec<Chunk<'a>>,
        current: &mut Vec<ChunkedTerm<'a>>,
        chunk_num: &mut usize,
    ) {
        for term in body {
            match term {
                QueryTerm::Clause(_, args) => {
                    current.push(ChunkedTerm::BodyTerm(term));
                    flush(chunks, current, chunk_num, args.len());
                }
                QueryTerm::Branch(arms) => {
                    flush(chunks, current, chunk_num, 0);

                    for arm in arms {
                        walk(arm, chunks, current, chunk_num);
                        flush(chunks, current, chunk_num, 0);
                    }
                }
                _ => current.push(ChunkedTerm::BodyTerm(term)),
            }
        }
    }

    walk(body, &mut chunks, &mut current, &mut chunk_num);
    flush(&mut chunks, &mut current, &mut chunk_num, 0);

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom_table::*;

    use std::rc::Rc;

    fn var(name: &str) -> Term {
        Term::Var(Cell::default(), Rc::new(name.to_string()))
    }

    #[test]
    fn post_order_visits_subterms_before_their_positions() {
        let args = vec![Term::Clause(
            Cell::default(),
            atom!("findall"),
            vec![var("X")],
        )];

        let refs = post_order_refs(&args);

        assert!(matches!(refs[0], TermRef::Var(Level::Deep, ..)));
        assert!(matches!(refs[1], TermRef::Clause(Level::Shallow, ..)));
    }

    #[test]
    fn chunks_split_at_calls() {
        let head = vec![var("X")];
        let body = vec![
            QueryTerm::Clause(atom!("is"), vec![var("Y"), var("X")]),
            QueryTerm::Clause(atom!("call"), vec![var("Y")]),
        ];

        let chunks = build_chunks(Some(&head), &body);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].terms.len(), 2);
        assert_eq!(chunks[1].terms.len(), 1);
    }
}
