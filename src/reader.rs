// Islet Reader - S-Expression Parser
//
// Produces the value model of types.rs: atoms, proper and dotted lists,
// strings, characters, vectors, and the quote family expanded to their
// (quote x) / (quasiquote x) / (unquote x) / (unquote-splicing x) forms.

use crate::arena::Node;
use crate::machine::Machine;
use crate::types::{NodeId, Value};
use std::iter::Peekable;
use std::str::Chars;

/// Reader error types
#[derive(Debug, Clone)]
pub enum ReaderError {
    UnexpectedEof,
    UnexpectedChar(char),
    UnbalancedParen,
    InvalidChar(String),
}

impl std::fmt::Display for ReaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "Unexpected end of input"),
            Self::UnexpectedChar(c) => write!(f, "Unexpected character: '{}'", c),
            Self::UnbalancedParen => write!(f, "Unbalanced parentheses"),
            Self::InvalidChar(s) => write!(f, "Invalid character: {}", s),
        }
    }
}

pub type ReaderResult = Result<NodeId, ReaderError>;

/// The Islet reader
pub struct Reader<'a, 'b> {
    input: Peekable<Chars<'b>>,
    machine: &'a mut Machine,
    consumed: usize,
}

impl<'a, 'b> Reader<'a, 'b> {
    pub fn new(input: &'b str, machine: &'a mut Machine) -> Self {
        Self {
            input: input.chars().peekable(),
            machine,
            consumed: 0,
        }
    }

    /// Characters consumed so far; lets stream-backed reads advance.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn at_eof(&mut self) -> bool {
        self.skip_whitespace_and_comments();
        self.input.peek().is_none()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.input.next();
        if c.is_some() {
            self.consumed += 1;
        }
        c
    }

    /// Read a single expression
    pub fn read(&mut self) -> ReaderResult {
        self.skip_whitespace_and_comments();
        match self.input.peek() {
            None => Err(ReaderError::UnexpectedEof),
            Some(&c) => match c {
                '(' => {
                    self.bump();
                    self.read_list()
                }
                ')' => Err(ReaderError::UnexpectedChar(')')),
                '\'' => {
                    self.bump();
                    self.read_quote("QUOTE")
                }
                '`' => {
                    self.bump();
                    self.read_quote("QUASIQUOTE")
                }
                ',' => {
                    self.bump();
                    self.read_unquote()
                }
                '"' => {
                    self.bump();
                    self.read_string()
                }
                '#' => {
                    self.bump();
                    self.read_dispatch()
                }
                _ => self.read_atom(),
            },
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.input.peek() {
                Some(&c) if c.is_whitespace() => {
                    self.bump();
                }
                Some(&';') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    /// Read a list body after '(': (a b c) or (a . b)
    fn read_list(&mut self) -> ReaderResult {
        let mut elements = Vec::new();
        let mut dotted_cdr = None;

        loop {
            self.skip_whitespace_and_comments();
            match self.input.peek() {
                None => return Err(ReaderError::UnbalancedParen),
                Some(&')') => {
                    self.bump();
                    break;
                }
                Some(&'.') => {
                    self.bump();
                    match self.input.peek() {
                        Some(&c) if c.is_whitespace() || c == '(' || c == '\'' => {
                            self.skip_whitespace_and_comments();
                            dotted_cdr = Some(self.read()?);
                            self.skip_whitespace_and_comments();
                            if self.input.peek() != Some(&')') {
                                return Err(ReaderError::UnexpectedChar('.'));
                            }
                            self.bump();
                            break;
                        }
                        _ => {
                            // Symbol starting with a dot
                            let atom = self.read_atom_with_prefix('.')?;
                            elements.push(atom);
                        }
                    }
                }
                _ => elements.push(self.read()?),
            }
        }

        let mut result = dotted_cdr.unwrap_or(self.machine.nil_node);
        for elem in elements.into_iter().rev() {
            result = self.machine.cons(elem, result);
        }
        Ok(result)
    }

    /// 'x -> (quote x), `x -> (quasiquote x)
    fn read_quote(&mut self, wrapper: &str) -> ReaderResult {
        let expr = self.read()?;
        let sym = self.machine.intern_node(wrapper);
        Ok(self.machine.list(&[sym, expr]))
    }

    /// ,x -> (unquote x), ,@x -> (unquote-splicing x)
    fn read_unquote(&mut self) -> ReaderResult {
        let splice = self.input.peek() == Some(&'@');
        if splice {
            self.bump();
        }
        let expr = self.read()?;
        let name = if splice { "UNQUOTE-SPLICING" } else { "UNQUOTE" };
        let sym = self.machine.intern_node(name);
        Ok(self.machine.list(&[sym, expr]))
    }

    /// "hello" with backslash escapes
    fn read_string(&mut self) -> ReaderResult {
        let mut s = String::new();
        loop {
            match self.bump() {
                None => return Err(ReaderError::UnexpectedEof),
                Some('"') => break,
                Some('\\') => match self.bump() {
                    None => return Err(ReaderError::UnexpectedEof),
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some('r') => s.push('\r'),
                    Some(c) => s.push(c),
                },
                Some(c) => s.push(c),
            }
        }
        Ok(self.machine.make_string(&s))
    }

    /// Dispatch after '#': #'f, #\c, #(...)
    fn read_dispatch(&mut self) -> ReaderResult {
        match self.input.peek() {
            None => Err(ReaderError::UnexpectedEof),
            Some(&'\'') => {
                self.bump();
                let name = self.read()?;
                let sym = self.machine.intern_node("FUNCTION");
                Ok(self.machine.list(&[sym, name]))
            }
            Some(&'\\') => {
                self.bump();
                self.read_character()
            }
            Some(&'(') => {
                self.bump();
                self.read_vector()
            }
            Some(&c) => Err(ReaderError::UnexpectedChar(c)),
        }
    }

    /// #\x or #\space
    fn read_character(&mut self) -> ReaderResult {
        let first = match self.bump() {
            Some(c) => c,
            None => return Err(ReaderError::UnexpectedEof),
        };
        let mut name = String::new();
        name.push(first);
        if first.is_alphanumeric() {
            while let Some(&c) = self.input.peek() {
                if c.is_alphanumeric() || c == '-' {
                    name.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
        }

        let ch = match name.to_uppercase().as_str() {
            "SPACE" => ' ',
            "NEWLINE" => '\n',
            "TAB" => '\t',
            "RETURN" => '\r',
            _ if name.chars().count() == 1 => first,
            _ => return Err(ReaderError::InvalidChar(name)),
        };
        Ok(self.machine.make_character(ch))
    }

    /// #(1 2 3)
    fn read_vector(&mut self) -> ReaderResult {
        let mut elements = Vec::new();
        loop {
            self.skip_whitespace_and_comments();
            match self.input.peek() {
                None => return Err(ReaderError::UnbalancedParen),
                Some(&')') => {
                    self.bump();
                    break;
                }
                _ => elements.push(self.read()?),
            }
        }
        let vid = self.machine.arrays.alloc_from_vec(elements);
        Ok(self
            .machine
            .arena
            .alloc(Node::Leaf(Value::Vector(vid.0))))
    }

    fn is_delimiter(c: char) -> bool {
        c.is_whitespace() || matches!(c, '(' | ')' | '\'' | '`' | ',' | '"' | ';')
    }

    fn read_token(&mut self) -> String {
        let mut name = String::new();
        while let Some(&c) = self.input.peek() {
            if Self::is_delimiter(c) {
                break;
            }
            name.push(c);
            self.bump();
        }
        name
    }

    fn read_atom(&mut self) -> ReaderResult {
        let s = self.read_token();
        self.parse_atom(&s)
    }

    fn read_atom_with_prefix(&mut self, prefix: char) -> ReaderResult {
        let mut s = String::new();
        s.push(prefix);
        s.push_str(&self.read_token());
        self.parse_atom(&s)
    }

    /// Number or symbol
    fn parse_atom(&mut self, s: &str) -> ReaderResult {
        if s.eq_ignore_ascii_case("NIL") {
            return Ok(self.machine.nil_node);
        }
        if let Ok(n) = s.parse::<i64>() {
            return Ok(self.machine.make_integer(n));
        }
        if let Ok(bn) = s.parse::<num_bigint::BigInt>() {
            return Ok(self.machine.arena.alloc(Node::Leaf(Value::BigInt(bn))));
        }
        // A bare sign or dots are symbols, not floats
        if s.chars().any(|c| c.is_ascii_digit()) {
            if let Ok(f) = s.parse::<f64>() {
                return Ok(self.machine.make_float(f));
            }
        }
        Ok(self.machine.intern_node(s))
    }
}

/// Read one expression from a string
pub fn read_from_string(input: &str, machine: &mut Machine) -> ReaderResult {
    Reader::new(input, machine).read()
}

/// Read all expressions from a string
pub fn read_all(input: &str, machine: &mut Machine) -> Result<Vec<NodeId>, ReaderError> {
    let mut reader = Reader::new(input, machine);
    let mut results = Vec::new();
    while !reader.at_eof() {
        results.push(reader.read()?);
    }
    Ok(results)
}
