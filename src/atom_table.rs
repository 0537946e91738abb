use fxhash::FxBuildHasher;
use indexmap::IndexSet;

use std::fmt;

/// An interned functor name. Equality and hashing go through the index,
/// so atoms are only comparable within the table that produced them.
/// Each `Machine` owns exactly one table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Atom {
    pub index: usize,
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(s) = static_str(*self) {
            write!(f, "atom!({:?})", s)
        } else {
            write!(f, "Atom({})", self.index)
        }
    }
}

macro_rules! static_atom_consts {
    ($idx:expr;) => {};
    ($idx:expr; $ident:ident => $string:expr $(, $rest:ident => $rest_string:expr)* $(,)?) => {
        pub const $ident: Atom = Atom { index: $idx };
        static_atom_consts!($idx + 1usize; $($rest => $rest_string),*);
    };
}

macro_rules! static_atoms {
    ($($ident:ident => $string:expr),* $(,)?) => {
        /// Atoms interned ahead of any user program, addressable as
        /// constants through the `atom!` macro.
        pub mod atoms {
            use super::Atom;

            static_atom_consts!(0usize; $($ident => $string),*);
        }

        pub(crate) static STATIC_STRINGS: &[&str] = &[$($string),*];
    };
}

static_atoms! {
    EMPTY_LIST => "[]",
    DOT => ".",
    COMMA => ",",
    SEMICOLON => ";",
    IF_THEN => "->",
    CLAUSE => ":-",
    QUERY => "?-",
    CUT => "!",
    NAF => "\\+",
    TRUE => "true",
    FAIL => "fail",
    FALSE => "false",
    USER => "user",
    UNIFY => "=",
    NOT_UNIFIABLE => "\\=",
    EQUAL => "==",
    NOT_EQUAL => "\\==",
    TERM_LESS => "@<",
    TERM_LESS_EQ => "@=<",
    TERM_GREATER => "@>",
    TERM_GREATER_EQ => "@>=",
    COMPARE => "compare",
    IS => "is",
    ARITH_EQ => "=:=",
    ARITH_NEQ => "=\\=",
    LESS => "<",
    LESS_EQ => "=<",
    GREATER => ">",
    GREATER_EQ => ">=",
    PLUS => "+",
    MINUS => "-",
    STAR => "*",
    SLASH => "/",
    SLASH_SLASH => "//",
    MOD => "mod",
    DIV => "div",
    REM => "rem",
    SHIFT_LEFT => "<<",
    SHIFT_RIGHT => ">>",
    AND_BITS => "/\\",
    OR_BITS => "\\/",
    XOR => "xor",
    BACKSLASH => "\\",
    MIN => "min",
    MAX => "max",
    GCD => "gcd",
    ABS => "abs",
    SIGN => "sign",
    VAR => "var",
    NONVAR => "nonvar",
    INTEGER => "integer",
    NUMBER => "number",
    ATOM => "atom",
    ATOMIC => "atomic",
    COMPOUND => "compound",
    CALLABLE => "callable",
    GROUND => "ground",
    IS_LIST => "is_list",
    FUNCTOR => "functor",
    ARG => "arg",
    UNIV => "=..",
    COPY_TERM => "copy_term",
    LENGTH => "length",
    BETWEEN => "between",
    FINDALL => "findall",
    ASSERT => "assert",
    ASSERTA => "asserta",
    ASSERTZ => "assertz",
    RETRACT => "retract",
    CALL => "call",
    COLON => ":",
    HALT => "halt",
    SYSTEM_CUT => "$cut",
    SYSTEM_RET => "$ret",
}

pub(crate) fn static_str(atom: Atom) -> Option<&'static str> {
    STATIC_STRINGS.get(atom.index).copied()
}

/// Resolves a string literal to its preinterned [`Atom`] at compile
/// time. Only the names listed in `static_atoms!` are accepted.
#[macro_export]
macro_rules! atom {
    ("[]") => { $crate::atom_table::atoms::EMPTY_LIST };
    (".") => { $crate::atom_table::atoms::DOT };
    (",") => { $crate::atom_table::atoms::COMMA };
    (";") => { $crate::atom_table::atoms::SEMICOLON };
    ("->") => { $crate::atom_table::atoms::IF_THEN };
    (":-") => { $crate::atom_table::atoms::CLAUSE };
    ("?-") => { $crate::atom_table::atoms::QUERY };
    ("!") => { $crate::atom_table::atoms::CUT };
    ("\\+") => { $crate::atom_table::atoms::NAF };
    ("true") => { $crate::atom_table::atoms::TRUE };
    ("fail") => { $crate::atom_table::atoms::FAIL };
    ("false") => { $crate::atom_table::atoms::FALSE };
    ("user") => { $crate::atom_table::atoms::USER };
    ("=") => { $crate::atom_table::atoms::UNIFY };
    ("\\=") => { $crate::atom_table::atoms::NOT_UNIFIABLE };
    ("==") => { $crate::atom_table::atoms::EQUAL };
    ("\\==") => { $crate::atom_table::atoms::NOT_EQUAL };
    ("@<") => { $crate::atom_table::atoms::TERM_LESS };
    ("@=<") => { $crate::atom_table::atoms::TERM_LESS_EQ };
    ("@>") => { $crate::atom_table::atoms::TERM_GREATER };
    ("@>=") => { $crate::atom_table::atoms::TERM_GREATER_EQ };
    ("compare") => { $crate::atom_table::atoms::COMPARE };
    ("is") => { $crate::atom_table::atoms::IS };
    ("=:=") => { $crate::atom_table::atoms::ARITH_EQ };
    ("=\\=") => { $crate::atom_table::atoms::ARITH_NEQ };
    ("<") => { $crate::atom_table::atoms::LESS };
    ("=<") => { $crate::atom_table::atoms::LESS_EQ };
    (">") => { $crate::atom_table::atoms::GREATER };
    (">=") => { $crate::atom_table::atoms::GREATER_EQ };
    ("+") => { $crate::atom_table::atoms::PLUS };
    ("-") => { $crate::atom_table::atoms::MINUS };
    ("*") => { $crate::atom_table::atoms::STAR };
    ("/") => { $crate::atom_table::atoms::SLASH };
    ("//") => { $crate::atom_table::atoms::SLASH_SLASH };
    ("mod") => { $crate::atom_table::atoms::MOD };
    ("div") => { $crate::atom_table::atoms::DIV };
    ("rem") => { $crate::atom_table::atoms::REM };
    ("<<") => { $crate::atom_table::atoms::SHIFT_LEFT };
    (">>") => { $crate::atom_table::atoms::SHIFT_RIGHT };
    ("/\\") => { $crate::atom_table::atoms::AND_BITS };
    ("\\/") => { $crate::atom_table::atoms::OR_BITS };
    ("xor") => { $crate::atom_table::atoms::XOR };
    ("\\") => { $crate::atom_table::atoms::BACKSLASH };
    ("min") => { $crate::atom_table::atoms::MIN };
    ("max") => { $crate::atom_table::atoms::MAX };
    ("gcd") => { $crate::atom_table::atoms::GCD };
    ("abs") => { $crate::atom_table::atoms::ABS };
    ("sign") => { $crate::atom_table::atoms::SIGN };
    ("var") => { $crate::atom_table::atoms::VAR };
    ("nonvar") => { $crate::atom_table::atoms::NONVAR };
    ("integer") => { $crate::atom_table::atoms::INTEGER };
    ("number") => { $crate::atom_table::atoms::NUMBER };
    ("atom") => { $crate::atom_table::atoms::ATOM };
    ("atomic") => { $crate::atom_table::atoms::ATOMIC };
    ("compound") => { $crate::atom_table::atoms::COMPOUND };
    ("callable") => { $crate::atom_table::atoms::CALLABLE };
    ("ground") => { $crate::atom_table::atoms::GROUND };
    ("is_list") => { $crate::atom_table::atoms::IS_LIST };
    ("functor") => { $crate::atom_table::atoms::FUNCTOR };
    ("arg") => { $crate::atom_table::atoms::ARG };
    ("=..") => { $crate::atom_table::atoms::UNIV };
    ("copy_term") => { $crate::atom_table::atoms::COPY_TERM };
    ("length") => { $crate::atom_table::atoms::LENGTH };
    ("between") => { $crate::atom_table::atoms::BETWEEN };
    ("findall") => { $crate::atom_table::atoms::FINDALL };
    ("assert") => { $crate::atom_table::atoms::ASSERT };
    ("asserta") => { $crate::atom_table::atoms::ASSERTA };
    ("assertz") => { $crate::atom_table::atoms::ASSERTZ };
    ("retract") => { $crate::atom_table::atoms::RETRACT };
    ("call") => { $crate::atom_table::atoms::CALL };
    (":") => { $crate::atom_table::atoms::COLON };
    ("halt") => { $crate::atom_table::atoms::HALT };
    ("$cut") => { $crate::atom_table::atoms::SYSTEM_CUT };
    ("$ret") => { $crate::atom_table::atoms::SYSTEM_RET };
}

/// Interning table for functor names. Indices below
/// `STATIC_STRINGS.len()` are the preinterned atoms above; the rest are
/// built at runtime.
#[derive(Debug)]
pub struct AtomTable {
    table: IndexSet<Box<str>, FxBuildHasher>,
}

impl AtomTable {
    pub fn new() -> Self {
        let mut table = IndexSet::with_hasher(FxBuildHasher::default());

        for s in STATIC_STRINGS {
            table.insert(Box::from(*s));
        }

        AtomTable { table }
    }

    pub fn build_with(&mut self, string: &str) -> Atom {
        if let Some(index) = self.table.get_index_of(string) {
            return Atom { index };
        }

        let (index, _) = self.table.insert_full(Box::from(string));
        Atom { index }
    }

    pub fn lookup(&self, string: &str) -> Option<Atom> {
        self.table.get_index_of(string).map(|index| Atom { index })
    }

    pub fn as_str(&self, atom: Atom) -> &str {
        self.table
            .get_index(atom.index)
            .map(|s| s.as_ref())
            .unwrap_or("")
    }
}

impl Default for AtomTable {
    fn default() -> Self {
        AtomTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_atoms_resolve_to_their_strings() {
        let tbl = AtomTable::new();

        assert_eq!(tbl.as_str(atom!("[]")), "[]");
        assert_eq!(tbl.as_str(atom!(",")), ",");
        assert_eq!(tbl.as_str(atom!("findall")), "findall");
        assert_eq!(tbl.as_str(atom!("$ret")), "$ret");
    }

    #[test]
    fn interning_is_idempotent() {
        let mut tbl = AtomTable::new();

        let a1 = tbl.build_with("append");
        let a2 = tbl.build_with("append");

        assert_eq!(a1, a2);
        assert_eq!(tbl.as_str(a1), "append");
        assert_eq!(tbl.build_with("true"), atom!("true"));
    }
}
