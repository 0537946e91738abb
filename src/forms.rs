use crate::atom_table::*;

use dashu::integer::IBig;

use std::cell::Cell;
use std::rc::Rc;

pub const MAX_ARITY: usize = 255;

pub type Var = Rc<String>;

/// A self-contained constant as it appears in compiled instructions.
/// Big integers are materialized (not heap pointers) so code survives
/// heap truncation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Literal {
    Atom(Atom),
    Fixnum(i64),
    Integer(Rc<IBig>),
}

/// The compiler's view of a term. Register annotations are written into
/// the interior cells by the allocator as instructions are emitted.
#[derive(Debug, Clone)]
pub enum Term {
    AnonVar,
    Clause(Cell<RegType>, Atom, Vec<Term>),
    Cons(Cell<RegType>, Box<Term>, Box<Term>),
    Literal(Cell<RegType>, Literal),
    Var(Cell<VarReg>, Var),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Deep,
    Root,
    Shallow,
}

impl Level {
    pub(crate) fn child_level(self) -> Level {
        match self {
            Level::Root => Level::Shallow,
            _ => Level::Deep,
        }
    }
}

/// Program point classes used by the register allocator: the clause head,
/// a goal before the chunk's terminating call, or the call itself. The
/// chunk number counts call boundaries, which is exactly the "boundary
/// count" that decides temporary versus permanent allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GenContext {
    Head,
    Mid(usize),
    Last(usize),
}

impl GenContext {
    #[inline]
    pub fn chunk_num(self) -> usize {
        match self {
            GenContext::Head => 0,
            GenContext::Mid(cn) | GenContext::Last(cn) => cn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegType {
    Temp(usize),
    Perm(usize),
}

impl Default for RegType {
    fn default() -> Self {
        RegType::Temp(0)
    }
}

impl RegType {
    #[inline]
    pub fn reg_num(self) -> usize {
        match self {
            RegType::Temp(n) | RegType::Perm(n) => n,
        }
    }

    #[inline]
    pub fn is_perm(self) -> bool {
        matches!(self, RegType::Perm(_))
    }
}

#[macro_export]
macro_rules! temp_v {
    ($x:expr) => {
        $crate::forms::RegType::Temp($x)
    };
}

#[macro_export]
macro_rules! perm_v {
    ($x:expr) => {
        $crate::forms::RegType::Perm($x)
    };
}

/// A variable's allocation: its normalized register, and, if it sits in
/// an argument position, the argument index as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarReg {
    ArgAndNorm(RegType, usize),
    Norm(RegType),
}

impl VarReg {
    #[inline]
    pub fn norm(self) -> RegType {
        match self {
            VarReg::ArgAndNorm(reg, _) | VarReg::Norm(reg) => reg,
        }
    }
}

impl Default for VarReg {
    fn default() -> Self {
        VarReg::Norm(RegType::default())
    }
}

/// A lowered body goal.
#[derive(Debug)]
pub enum QueryTerm {
    /// A call, user predicate or builtin; every call is a chunk boundary.
    Clause(Atom, Vec<Term>),
    /// Inline disjunction: try/retry/trust over the arms.
    Branch(Vec<Vec<QueryTerm>>),
    /// Captures the cut barrier (`b0`) of the clause activation. Emitted
    /// once, ahead of any call, when a `!` occurs past the first call.
    GetLevel { cell: Cell<VarReg>, var: Var },
    /// Captures the current topmost choice point, ahead of an
    /// if-then-else skeleton (commit barrier) or at the head of a
    /// condition arm (barrier for cuts local to the condition).
    GetCutPoint { cell: Cell<VarReg>, var: Var },
    /// A `!` before the first call boundary.
    NeckCut,
    /// A `!` past the first call: prunes to the level in `var`.
    GlobalCut { cell: Cell<VarReg>, var: Var },
    /// An if-then-else commit: prunes to the level saved in `var`.
    LocalCut { cell: Cell<VarReg>, var: Var },
    Fail,
    Succeed,
}

#[derive(Debug)]
pub struct Fact {
    pub head: Term,
}

#[derive(Debug)]
pub struct Rule {
    pub head: (Atom, Vec<Term>),
    pub body: Vec<QueryTerm>,
}

#[derive(Debug)]
pub enum PredicateClause {
    Fact(Fact),
    Rule(Rule),
}

impl PredicateClause {
    pub(crate) fn args(&self) -> Option<&[Term]> {
        match self {
            PredicateClause::Fact(fact) => match &fact.head {
                Term::Clause(_, _, args) => Some(args),
                _ => None,
            },
            PredicateClause::Rule(rule) => {
                if rule.head.1.is_empty() {
                    None
                } else {
                    Some(&rule.head.1)
                }
            }
        }
    }

    pub(crate) fn first_arg(&self) -> Option<&Term> {
        self.args().and_then(|args| args.first())
    }
}

/// A maximal run of clauses indexable on the same argument, produced by
/// predicate splitting.
#[derive(Debug)]
pub struct ClauseSpan {
    pub left: usize,
    pub right: usize,
}
