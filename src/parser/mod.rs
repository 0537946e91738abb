//! Reads clause and query source text into heap terms. The token classes
//! and the default operator table follow the usual Prolog conventions;
//! operator parsing is precedence climbing over that table.

use crate::atom_table::*;
use crate::machine::machine_errors::*;
use crate::machine::machine_state::*;
use crate::types::*;

use dashu::integer::IBig;
use indexmap::IndexMap;

const SYMBOLIC: &str = "+-*/\\^<>=~:.?@#&$";

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    /// A name immediately followed by `(`: a functor application.
    Functor(String),
    Var(String),
    Int(IBig),
    Open,
    Close,
    OpenList,
    CloseList,
    Comma,
    Bar,
    /// Clause terminator.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fixity {
    Xfx,
    Xfy,
    Yfx,
    Fy,
    Fx,
}

/// (priority, fixity); the standard table restricted to the operators
/// the engine defines.
fn infix_op(name: &str) -> Option<(usize, Fixity)> {
    match name {
        ":-" => Some((1200, Fixity::Xfx)),
        ";" => Some((1100, Fixity::Xfy)),
        "->" => Some((1050, Fixity::Xfy)),
        "," => Some((1000, Fixity::Xfy)),
        "=" | "\\=" | "==" | "\\==" | "@<" | "@=<" | "@>" | "@>=" | "is" | "=:=" | "=\\="
        | "<" | "=<" | ">" | ">=" | "=.." => Some((700, Fixity::Xfx)),
        "+" | "-" | "/\\" | "\\/" | "xor" => Some((500, Fixity::Yfx)),
        "*" | "/" | "//" | "mod" | "div" | "rem" | "<<" | ">>" => Some((400, Fixity::Yfx)),
        _ => None,
    }
}

fn prefix_op(name: &str) -> Option<(usize, Fixity)> {
    match name {
        ":-" | "?-" => Some((1200, Fixity::Fx)),
        "\\+" => Some((900, Fixity::Fy)),
        "-" | "+" | "\\" => Some((200, Fixity::Fy)),
        _ => None,
    }
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer {
            chars: src.chars().peekable(),
        }
    }

    fn skip_layout(&mut self) -> Result<(), SyntaxError> {
        loop {
            match self.chars.peek() {
                Some(c) if c.is_whitespace() => {
                    self.chars.next();
                }
                Some('%') => {
                    for c in self.chars.by_ref() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                Some('/') => {
                    // only a comment if followed by '*'.
                    let mut lookahead = self.chars.clone();
                    lookahead.next();

                    if lookahead.peek() == Some(&'*') {
                        self.chars.next();
                        self.chars.next();

                        let mut prev = ' ';

                        loop {
                            match self.chars.next() {
                                Some('/') if prev == '*' => break,
                                Some(c) => prev = c,
                                None => {
                                    return Err(SyntaxError::Parse(
                                        "unterminated block comment".to_string(),
                                    ))
                                }
                            }
                        }
                    } else {
                        return Ok(());
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn read_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut s = String::new();

        while let Some(&c) = self.chars.peek() {
            if pred(c) {
                s.push(c);
                self.chars.next();
            } else {
                break;
            }
        }

        s
    }

    fn read_quoted_atom(&mut self) -> Result<String, SyntaxError> {
        let mut s = String::new();

        loop {
            match self.chars.next() {
                Some('\'') => {
                    if self.chars.peek() == Some(&'\'') {
                        self.chars.next();
                        s.push('\'');
                    } else {
                        return Ok(s);
                    }
                }
                Some('\\') => match self.chars.next() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some('\\') => s.push('\\'),
                    Some('\'') => s.push('\''),
                    Some(c) => s.push(c),
                    None => {
                        return Err(SyntaxError::Parse("unterminated quoted atom".to_string()))
                    }
                },
                Some(c) => s.push(c),
                None => return Err(SyntaxError::Parse("unterminated quoted atom".to_string())),
            }
        }
    }

    fn name_token(&mut self, name: String) -> Token {
        if self.chars.peek() == Some(&'(') {
            self.chars.next();
            Token::Functor(name)
        } else {
            Token::Name(name)
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>, SyntaxError> {
        self.skip_layout()?;

        let c = match self.chars.peek() {
            Some(&c) => c,
            None => return Ok(None),
        };

        if c.is_ascii_digit() {
            let digits = self.read_while(|c| c.is_ascii_digit());
            let n = IBig::from_str_radix(&digits, 10)
                .map_err(|_| SyntaxError::Parse(format!("malformed integer {}", digits)))?;

            return Ok(Some(Token::Int(n)));
        }

        if c.is_ascii_lowercase() {
            let name = self.read_while(|c| c.is_ascii_alphanumeric() || c == '_');
            return Ok(Some(self.name_token(name)));
        }

        if c.is_ascii_uppercase() || c == '_' {
            let name = self.read_while(|c| c.is_ascii_alphanumeric() || c == '_');
            return Ok(Some(Token::Var(name)));
        }

        match c {
            '\'' => {
                self.chars.next();
                let name = self.read_quoted_atom()?;
                Ok(Some(self.name_token(name)))
            }
            '(' => {
                self.chars.next();
                Ok(Some(Token::Open))
            }
            ')' => {
                self.chars.next();
                Ok(Some(Token::Close))
            }
            '[' => {
                self.chars.next();

                // `[]` is an atom, possibly a functor name.
                let mut lookahead = self.chars.clone();
                if lookahead.next() == Some(']') {
                    self.chars.next();
                    return Ok(Some(self.name_token("[]".to_string())));
                }

                Ok(Some(Token::OpenList))
            }
            ']' => {
                self.chars.next();
                Ok(Some(Token::CloseList))
            }
            ',' => {
                self.chars.next();
                Ok(Some(Token::Comma))
            }
            '|' => {
                self.chars.next();
                Ok(Some(Token::Bar))
            }
            '!' | ';' => {
                self.chars.next();
                Ok(Some(self.name_token(c.to_string())))
            }
            _ if SYMBOLIC.contains(c) => {
                let name = self.read_while(|c| SYMBOLIC.contains(c));

                // a solitary '.' not glued to further symbolic chars
                // terminates the clause.
                if name == "." {
                    match self.chars.peek() {
                        None => return Ok(Some(Token::End)),
                        Some(&c) if c.is_whitespace() || c == '%' => {
                            return Ok(Some(Token::End))
                        }
                        _ => {}
                    }
                }

                Ok(Some(self.name_token(name)))
            }
            _ => Err(SyntaxError::Parse(format!("unexpected character {:?}", c))),
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, SyntaxError> {
        let mut tokens = vec![];

        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }

        Ok(tokens)
    }
}

/// One parsed clause or query: its root term and the named variables it
/// mentions, in first-occurrence order.
#[derive(Debug)]
pub struct TermWriteResult {
    pub term: HeapCellValue,
    pub var_dict: IndexMap<String, HeapCellValue>,
}

pub struct Parser<'a> {
    machine_st: &'a mut MachineState,
    tokens: Vec<Token>,
    pos: usize,
    var_dict: IndexMap<String, HeapCellValue>,
}

impl<'a> Parser<'a> {
    pub fn new(machine_st: &'a mut MachineState, src: &str) -> Result<Self, SyntaxError> {
        let tokens = Lexer::new(src).tokenize()?;

        Ok(Parser {
            machine_st,
            tokens,
            pos: 0,
            var_dict: IndexMap::new(),
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();

        if token.is_some() {
            self.pos += 1;
        }

        token
    }

    fn expect(&mut self, token: Token) -> Result<(), SyntaxError> {
        match self.advance() {
            Some(t) if t == token => Ok(()),
            t => Err(SyntaxError::Parse(format!(
                "expected {:?}, found {:?}",
                token, t
            ))),
        }
    }

    #[inline]
    pub fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn intern(&mut self, name: &str) -> Atom {
        self.machine_st.atom_tbl.build_with(name)
    }

    fn var_cell(&mut self, name: &str) -> HeapCellValue {
        if name == "_" {
            return self.machine_st.heap.new_var();
        }

        if let Some(&cell) = self.var_dict.get(name) {
            return cell;
        }

        let cell = self.machine_st.heap.new_var();
        self.var_dict.insert(name.to_string(), cell);
        cell
    }

    fn parse_arglist(&mut self) -> Result<Vec<HeapCellValue>, SyntaxError> {
        let mut args = vec![self.parse(999)?];

        while self.peek() == Some(&Token::Comma) {
            self.advance();
            args.push(self.parse(999)?);
        }

        self.expect(Token::Close)?;
        Ok(args)
    }

    fn parse_list(&mut self) -> Result<HeapCellValue, SyntaxError> {
        let mut elements = vec![self.parse(999)?];

        loop {
            match self.advance() {
                Some(Token::Comma) => elements.push(self.parse(999)?),
                Some(Token::Bar) => {
                    let tail = self.parse(999)?;
                    self.expect(Token::CloseList)?;

                    let mut list = tail;
                    for element in elements.into_iter().rev() {
                        list = self.machine_st.heap.put_list(element, list);
                    }

                    return Ok(list);
                }
                Some(Token::CloseList) => {
                    let mut list = HeapCellValue::Atom(atom!("[]"), 0);
                    for element in elements.into_iter().rev() {
                        list = self.machine_st.heap.put_list(element, list);
                    }

                    return Ok(list);
                }
                t => {
                    return Err(SyntaxError::Parse(format!(
                        "expected ',', '|' or ']' in list, found {:?}",
                        t
                    )))
                }
            }
        }
    }

    fn build_structure(
        &mut self,
        name: &str,
        args: &[HeapCellValue],
    ) -> HeapCellValue {
        let name = self.intern(name);

        // `'.'/2` is the list constructor; normalize it to a list pair
        // so one representation reaches the unifier.
        if name == atom!(".") && args.len() == 2 {
            return self.machine_st.heap.put_list(args[0], args[1]);
        }

        self.machine_st.heap.put_structure(name, args)
    }

    /// Parses a primary term: anything that can stand as an operand.
    fn parse_primary(&mut self, max_priority: usize) -> Result<HeapCellValue, SyntaxError> {
        match self.advance() {
            Some(Token::Int(n)) => Ok(self.machine_st.heap.put_integer(&n)),
            Some(Token::Var(name)) => Ok(self.var_cell(&name)),
            Some(Token::Open) => {
                let term = self.parse(1200)?;
                self.expect(Token::Close)?;
                Ok(term)
            }
            Some(Token::OpenList) => self.parse_list(),
            Some(Token::Functor(name)) => {
                let args = self.parse_arglist()?;
                Ok(self.build_structure(&name, &args))
            }
            Some(Token::Name(name)) => {
                // negative integer literals bind tighter than the
                // prefix minus operator.
                if name == "-" {
                    if let Some(Token::Int(_)) = self.peek() {
                        if let Some(Token::Int(n)) = self.advance() {
                            return Ok(self.machine_st.heap.put_integer(&(-n)));
                        }
                    }
                }

                if let Some((priority, fixity)) = prefix_op(&name) {
                    if priority <= max_priority && self.starts_term() {
                        let arg_priority = match fixity {
                            Fixity::Fy => priority,
                            _ => priority - 1,
                        };

                        let arg = self.parse(arg_priority)?;
                        return Ok(self.build_structure(&name, &[arg]));
                    }
                }

                Ok(HeapCellValue::Atom(self.intern(&name), 0))
            }
            t => Err(SyntaxError::Parse(format!(
                "expected a term, found {:?}",
                t
            ))),
        }
    }

    // whether the upcoming token can begin a term.
    fn starts_term(&self) -> bool {
        matches!(
            self.peek(),
            Some(Token::Int(_))
                | Some(Token::Var(_))
                | Some(Token::Open)
                | Some(Token::OpenList)
                | Some(Token::Functor(_))
                | Some(Token::Name(_))
        )
    }

    /// Precedence-climbing parse up to `max_priority`.
    fn parse(&mut self, max_priority: usize) -> Result<HeapCellValue, SyntaxError> {
        let mut left = self.parse_primary(max_priority)?;
        let mut left_priority = 0;

        loop {
            let op_name = match self.peek() {
                Some(Token::Name(name)) => name.clone(),
                Some(Token::Comma) => ",".to_string(),
                Some(Token::Bar) => {
                    // '|' in operator position reads as ';'.
                    ";".to_string()
                }
                _ => break,
            };

            let (priority, fixity) = match infix_op(&op_name) {
                Some(op) => op,
                None => break,
            };

            if priority > max_priority {
                break;
            }

            let (left_max, right_max) = match fixity {
                Fixity::Xfx => (priority - 1, priority - 1),
                Fixity::Xfy => (priority - 1, priority),
                Fixity::Yfx => (priority, priority - 1),
                _ => unreachable!(),
            };

            if left_priority > left_max {
                break;
            }

            self.advance();
            let right = self.parse(right_max)?;

            left = self.build_structure(&op_name, &[left, right]);
            left_priority = priority;
        }

        Ok(left)
    }

    /// Reads one clause/query term up to its `.` terminator.
    pub fn read_term(&mut self) -> Result<TermWriteResult, SyntaxError> {
        self.var_dict.clear();

        let term = self.parse(1200)?;
        self.expect(Token::End)?;

        Ok(TermWriteResult {
            term,
            var_dict: std::mem::take(&mut self.var_dict),
        })
    }
}

/// Parses an entire program: a sequence of `.`-terminated clauses.
pub fn parse_program(
    machine_st: &mut MachineState,
    src: &str,
) -> Result<Vec<TermWriteResult>, SyntaxError> {
    let mut parser = Parser::new(machine_st, src)?;
    let mut clauses = vec![];

    while !parser.at_end() {
        clauses.push(parser.read_term()?);
    }

    Ok(clauses)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(src: &str) -> (MachineState, TermWriteResult) {
        let mut machine_st = MachineState::new();
        let result = {
            let mut parser = Parser::new(&mut machine_st, src).unwrap();
            parser.read_term().unwrap()
        };

        (machine_st, result)
    }

    #[test]
    fn reads_facts_and_operators() {
        let (machine_st, result) = parse_one("append([H|T], L, [H|R]) :- append(T, L, R).");

        match result.term {
            HeapCellValue::Str(s) => match machine_st.heap[s] {
                HeapCellValue::Atom(name, 2) => {
                    assert_eq!(machine_st.atom_tbl.as_str(name), ":-");
                }
                cell => panic!("expected ':-'/2, got {:?}", cell),
            },
            cell => panic!("expected a structure, got {:?}", cell),
        }

        assert_eq!(result.var_dict.len(), 4);
    }

    #[test]
    fn infix_priorities_nest_correctly() {
        let (machine_st, result) = parse_one("X is 1 + 2 * 3.");

        // is(X, +(1, *(2, 3)))
        let s = match result.term {
            HeapCellValue::Str(s) => s,
            cell => panic!("expected a structure, got {:?}", cell),
        };

        let plus = match machine_st.heap.bound_deref(machine_st.heap[s + 2]) {
            HeapCellValue::Str(plus) => plus,
            cell => panic!("expected +/2, got {:?}", cell),
        };

        assert_eq!(
            machine_st.heap[plus],
            HeapCellValue::Atom(atom!("+"), 2)
        );
    }

    #[test]
    fn list_sugar_builds_list_pairs() {
        let (machine_st, result) = parse_one("[1, 2 | T].");

        match result.term {
            HeapCellValue::Lis(l) => {
                assert_eq!(machine_st.heap[l], HeapCellValue::Fixnum(1));
            }
            cell => panic!("expected a list, got {:?}", cell),
        }

        assert_eq!(result.var_dict.len(), 1);
    }

    #[test]
    fn negative_literals_and_big_integers() {
        let (machine_st, result) = parse_one("p(-5, 123456789012345678901234567890).");

        let s = match result.term {
            HeapCellValue::Str(s) => s,
            cell => panic!("expected a structure, got {:?}", cell),
        };

        assert_eq!(machine_st.heap[s + 1], HeapCellValue::Fixnum(-5));
        assert!(matches!(machine_st.heap[s + 2], HeapCellValue::Big(_)));
    }
}
