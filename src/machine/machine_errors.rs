use crate::atom_table::*;

use std::fmt;

/// Runtime errors. Unification failure is *not* represented here; it is
/// ordinary control flow. These abort the current query.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineError {
    /// A builtin received an argument of the wrong type. Carries the
    /// expected type and a rendering of the culprit.
    TypeError(ValidType, String),
    /// A builtin required a bound argument and got an unbound variable.
    InstantiationError(Atom, usize),
    /// A goal referred to a predicate with no clauses and no builtin.
    ExistenceError(Atom, usize),
    DomainError(&'static str, String),
    /// Arithmetic evaluation failed, e.g. zero_divisor.
    EvaluationError(&'static str),
    /// Heap, stack or cost budget exhausted. Fatal for the query: the
    /// machine unwinds to the outermost choice point and clears all
    /// in-progress bindings before reporting it.
    ResourceError(ResourceError),
    /// A clause or program failed the load-time syntax checks.
    Syntax(SyntaxError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    HeapLimitExceeded(usize),
    StackLimitExceeded(usize),
    CostBudgetExhausted(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidType {
    Atom,
    Callable,
    Compound,
    Evaluable,
    Integer,
    List,
    Number,
}

impl ValidType {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidType::Atom => "atom",
            ValidType::Callable => "callable",
            ValidType::Compound => "compound",
            ValidType::Evaluable => "evaluable",
            ValidType::Integer => "integer",
            ValidType::List => "list",
            ValidType::Number => "number",
        }
    }
}

/// Load-time rejections. A clause failing these never becomes visible to
/// the indexer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyntaxError {
    ProgramIsNotAList,
    NotAClause,
    /// The head must be a callable term, and may not be a control functor.
    BadClauseHead(&'static str),
    /// A body goal was not callable (e.g. a bare integer).
    BadGoal,
    /// The reader could not tokenize or parse the source text.
    Parse(String),
}

/// Errors raised while compiling a clause to bytecode. These are internal
/// conditions; callers fall back to the interpreted path on receiving one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompilationError {
    ExceededMaxArity,
    InadmissibleFact,
}

impl fmt::Display for MachineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MachineError::TypeError(ty, culprit) => {
                write!(f, "type_error({}, {})", ty.as_str(), culprit)
            }
            MachineError::InstantiationError(name, arity) => {
                write!(f, "instantiation_error in {}/{}", name.index, arity)
            }
            MachineError::ExistenceError(name, arity) => {
                write!(f, "existence_error(procedure, {}/{})", name.index, arity)
            }
            MachineError::DomainError(domain, culprit) => {
                write!(f, "domain_error({}, {})", domain, culprit)
            }
            MachineError::EvaluationError(what) => write!(f, "evaluation_error({})", what),
            MachineError::ResourceError(res) => write!(f, "resource_error({:?})", res),
            MachineError::Syntax(err) => write!(f, "syntax_error({:?})", err),
        }
    }
}

impl From<SyntaxError> for MachineError {
    fn from(err: SyntaxError) -> Self {
        MachineError::Syntax(err)
    }
}

impl From<ResourceError> for MachineError {
    fn from(err: ResourceError) -> Self {
        MachineError::ResourceError(err)
    }
}
