// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/parser.rs

// Reader for the parenthesized data used by assembly listings:
// lists, symbols, integers, strings, booleans and vectors.

// <>

use super::error::VmError;
use super::value::Value;

use std::iter;
use std::str;

struct Parser<'a> {
    chars: iter::Peekable<str::Bytes<'a>>,
    /// Accumulator for collecting token text
    acc: Vec<u8>,
    line: usize,
}

/// Parses exactly one datum; anything but whitespace or comments after
/// it is an error
pub fn parse(text: &str) -> Result<Value, VmError> {
    let mut p = Parser::new(text);
    let value = p.read_value()?;
    if p.skip_atmosphere() {
        return Err(p.error("unexpected text after datum"));
    }
    Ok(value)
}

/// Parses every datum in the input, in order
pub fn parse_all(text: &str) -> Result<Vec<Value>, VmError> {
    let mut p = Parser::new(text);
    let mut out = Vec::new();
    while p.skip_atmosphere() {
        out.push(p.read_value()?);
    }
    Ok(out)
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.bytes().peekable(),
            acc: Vec::new(),
            line: 1,
        }
    }

    fn error(&self, message: &str) -> VmError {
        VmError::Parse {
            line: self.line,
            message: message.to_string(),
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.chars.peek().copied()
    }

    fn next(&mut self) -> Result<u8, VmError> {
        match self.chars.next() {
            Some(c) => {
                if c == b'\n' {
                    self.line += 1;
                }
                Ok(c)
            }
            None => Err(self.error("unexpected end of input")),
        }
    }

    /// Skips whitespace and comments, reporting whether input remains
    fn skip_atmosphere(&mut self) -> bool {
        while let Some(c) = self.peek() {
            if c == b';' {
                while !matches!(self.peek(), Some(b'\n') | None) {
                    self.chars.next();
                }
            } else if c.is_ascii_whitespace() {
                if c == b'\n' {
                    self.line += 1;
                }
                self.chars.next();
            } else {
                return true;
            }
        }
        false
    }

    /// Returns a contiguous value parsed from the input stream. The
    /// reader is deduced from the first character.
    fn read_value(&mut self) -> Result<Value, VmError> {
        if !self.skip_atmosphere() {
            return Err(self.error("unexpected end of input"));
        }
        self.acc.clear();

        let c = self.next()?;
        match c {
            b'(' => self.read_list(),
            b')' => Err(self.error("unbalanced closing parenthesis")),
            b'\'' => {
                let quoted = self.read_value()?;
                Ok(Value::list(vec![Value::sym("quote"), quoted]))
            }
            b'"' => self.read_string(),
            b'#' => self.read_special(),
            b'+' | b'-' => {
                self.acc.push(c);
                match self.peek() {
                    Some(d) if d.is_ascii_digit() => self.read_number(),
                    _ => self.read_symbol(),
                }
            }
            _ if c.is_ascii_digit() => {
                self.acc.push(c);
                self.read_number()
            }
            _ if is_symbol_char(c) => {
                self.acc.push(c);
                self.read_symbol()
            }
            _ => Err(self.error(&format!("unexpected character '{}'", c as char))),
        }
    }

    fn read_list(&mut self) -> Result<Value, VmError> {
        let mut items = Vec::new();
        loop {
            if !self.skip_atmosphere() {
                return Err(self.error("unterminated list"));
            }
            match self.peek() {
                Some(b')') => {
                    self.next()?;
                    return Ok(Value::list(items));
                }
                Some(b'.') if self.is_lone_dot() => {
                    // may only appear immediately before the final element
                    if items.is_empty() {
                        return Err(self.error("dot at start of list"));
                    }
                    self.next()?;
                    let tail = self.read_value()?;
                    self.skip_atmosphere();
                    if self.next()? != b')' {
                        return Err(self.error("more than one datum after dot"));
                    }
                    return Ok(Value::list_with_tail(items, tail));
                }
                _ => items.push(self.read_value()?),
            }
        }
    }

    fn is_lone_dot(&self) -> bool {
        let mut ahead = self.chars.clone();
        ahead.next();
        matches!(ahead.next(), Some(c) if c.is_ascii_whitespace() || c == b'(')
    }

    fn read_vector(&mut self) -> Result<Value, VmError> {
        match self.read_list()?.list_to_vec() {
            Some(items) => Ok(Value::vector(items)),
            None => Err(self.error("dotted vector literal")),
        }
    }

    fn read_symbol(&mut self) -> Result<Value, VmError> {
        while let Some(c) = self.peek() {
            if c == b'(' || c == b')' || c.is_ascii_whitespace() {
                break;
            }
            if !is_symbol_char(c) {
                return Err(self.error(&format!("invalid character '{}' in symbol", c as char)));
            }
            self.acc.push(c);
            self.chars.next();
        }
        match str::from_utf8(&self.acc) {
            Ok(s) => Ok(Value::sym(s)),
            Err(_) => Err(self.error("symbol is not valid UTF-8")),
        }
    }

    fn read_string(&mut self) -> Result<Value, VmError> {
        let mut bytes = Vec::new();
        loop {
            match self.next()? {
                b'"' => break,
                b'\\' => match self.next()? {
                    b'n' => bytes.push(b'\n'),
                    b't' => bytes.push(b'\t'),
                    other => bytes.push(other),
                },
                c => bytes.push(c),
            }
        }
        match String::from_utf8(bytes) {
            Ok(s) => Ok(Value::string(&s)),
            Err(_) => Err(self.error("string is not valid UTF-8")),
        }
    }

    fn read_number(&mut self) -> Result<Value, VmError> {
        while let Some(c) = self.peek() {
            if c == b'(' || c == b')' || c.is_ascii_whitespace() {
                break;
            }
            self.acc.push(c);
            self.chars.next();
        }
        let text = String::from_utf8_lossy(&self.acc);
        match text.parse::<i64>() {
            Ok(n) => Ok(Value::Int(n)),
            Err(_) => Err(self.error(&format!("invalid integer literal {}", text))),
        }
    }

    fn read_special(&mut self) -> Result<Value, VmError> {
        if self.peek() == Some(b'(') {
            self.next()?;
            return self.read_vector();
        }
        while let Some(c) = self.peek() {
            if !c.is_ascii_alphanumeric() {
                break;
            }
            self.acc.push(c);
            self.chars.next();
        }
        match self.acc.as_slice() {
            b"t" | b"true" => Ok(Value::Bool(true)),
            b"f" | b"false" => Ok(Value::Bool(false)),
            b"undef" => Ok(Value::Undefined),
            _ => Err(self.error("unknown # syntax")),
        }
    }
}

fn is_symbol_char(c: u8) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            b'!' | b'$' | b'%' | b'&' | b'*' | b'+' | b'-' | b'.' | b'/' | b':' | b'<' | b'='
                | b'>' | b'?' | b'^' | b'_' | b'~'
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(text: &str) -> String {
        parse(text).unwrap().to_string()
    }

    #[test]
    fn atoms() {
        assert_eq!(parse("42").unwrap(), Value::Int(42));
        assert_eq!(parse("-7").unwrap(), Value::Int(-7));
        assert_eq!(parse("call/cc").unwrap(), Value::sym("call/cc"));
        assert_eq!(parse("-").unwrap(), Value::sym("-"));
        assert_eq!(parse("#t").unwrap(), Value::Bool(true));
        assert_eq!(parse("#f").unwrap(), Value::Bool(false));
        assert_eq!(parse("\"a \\\"b\\\"\"").unwrap(), Value::string("a \"b\""));
    }

    #[test]
    fn lists() {
        assert_eq!(read("(1 (2 3) ())"), "(1 (2 3) ())");
        assert_eq!(read("(1 . 2)"), "(1 . 2)");
        assert_eq!(read("(a b . (c))"), "(a b c)");
        assert_eq!(read("; leading comment\n(x ; inner\n y)"), "(x y)");
        assert_eq!(read("'a"), "(quote a)");
        assert_eq!(read("#(1 2)"), "#(1 2)");
    }

    #[test]
    fn many() {
        let forms = parse_all("(a) 1\n\n b").unwrap();
        assert_eq!(forms.len(), 3);
        assert!(parse_all("  ; nothing\n").unwrap().is_empty());
    }

    #[test]
    fn errors() {
        match parse("(1 2\n 3") {
            Err(VmError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(parse(")").is_err());
        assert!(parse("( . 1)").is_err());
        assert!(parse("(1 . 2 3)").is_err());
        assert!(parse("12x").is_err());
        assert!(parse("#q").is_err());
        assert!(parse("1 2").is_err());
    }
}
