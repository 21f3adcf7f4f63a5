//! Safe arithmetic for `override`, `#workgroup_count` and `#dispatch_count`.
//!
//! Expressions are parsed by a small recursive-descent evaluator over numbers,
//! `+ - * / % ^`, parentheses and a fixed set of math functions and constants.
//! Nothing else is accepted: any other identifier is reported as unsafe before
//! parsing starts.

use crate::error::PreprocessorErrorKind;

const FUNCTIONS: &[&str] = &[
    "abs", "acos", "acosh", "asin", "asinh", "atan", "atan2", "atanh", "cbrt", "ceil", "cos",
    "cosh", "exp", "exp2", "floor", "hypot", "log", "log10", "log2", "max", "min", "pow", "round",
    "sign", "sin", "sinh", "sqrt", "tan", "tanh", "trunc",
];

const CONSTANTS: &[(&str, f64)] = &[
    ("PI", std::f64::consts::PI),
    ("E", std::f64::consts::E),
    ("TAU", std::f64::consts::TAU),
];

/// Evaluates `expr`, rejecting anything outside the arithmetic whitelist.
pub fn evaluate(expr: &str) -> Result<f64, PreprocessorErrorKind> {
    let tokens = tokenize(expr)?;
    let unsafe_names: Vec<&str> = tokens
        .iter()
        .filter_map(|t| match t {
            Token::Ident(name)
                if !FUNCTIONS.contains(&name.as_str())
                    && !CONSTANTS.iter().any(|(c, _)| c == name) =>
            {
                Some(name.as_str())
            }
            _ => None,
        })
        .collect();
    if !unsafe_names.is_empty() {
        return Err(PreprocessorErrorKind::UnsafeSymbols(unsafe_names.join(", ")));
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expression()?;
    if parser.pos != parser.tokens.len() {
        return Err(PreprocessorErrorKind::Expression(format!(
            "unexpected trailing input in `{}`",
            expr.trim()
        )));
    }
    Ok(value)
}

/// Evaluates `expr` and truncates it to a `u32`.
pub fn evaluate_u32(expr: &str) -> Result<u32, PreprocessorErrorKind> {
    let value = evaluate(expr)?.trunc();
    if !value.is_finite() || value < 0.0 || value > u32::MAX as f64 {
        return Err(PreprocessorErrorKind::Expression(format!(
            "`{}` is not a valid u32 ({})",
            expr.trim(),
            value
        )));
    }
    Ok(value as u32)
}

/// Renders an evaluated value the way it is substituted back into WGSL.
pub fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, PreprocessorErrorKind> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) {
            let (value, next) = number(&chars, i)?;
            tokens.push(Token::Number(value));
            i = next;
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            tokens.push(match c {
                '+' | '-' | '*' | '/' | '%' | '^' => Token::Op(c),
                '(' => Token::LParen,
                ')' => Token::RParen,
                ',' => Token::Comma,
                other => {
                    return Err(PreprocessorErrorKind::UnsafeSymbols(other.to_string()));
                }
            });
            i += 1;
        }
    }
    Ok(tokens)
}

// Numeric literal starting at `start`, including WGSL suffixes (`u`, `i`, `f`, `h`)
// and hexadecimal integers.
fn number(chars: &[char], start: usize) -> Result<(f64, usize), PreprocessorErrorKind> {
    let mut i = start;
    if chars[i] == '0' && matches!(chars.get(i + 1), Some('x') | Some('X')) {
        i += 2;
        let digits_start = i;
        while i < chars.len() && chars[i].is_ascii_hexdigit() {
            i += 1;
        }
        let digits: String = chars[digits_start..i].iter().collect();
        let value = u64::from_str_radix(&digits, 16)
            .map_err(|_| PreprocessorErrorKind::Expression(format!("bad hex literal 0x{}", digits)))?;
        if matches!(chars.get(i), Some('u') | Some('i')) {
            i += 1;
        }
        return Ok((value as f64, i));
    }

    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        i += 1;
    }
    if matches!(chars.get(i), Some('e') | Some('E')) {
        let mut j = i + 1;
        if matches!(chars.get(j), Some('+') | Some('-')) {
            j += 1;
        }
        if chars.get(j).is_some_and(|c| c.is_ascii_digit()) {
            while j < chars.len() && chars[j].is_ascii_digit() {
                j += 1;
            }
            i = j;
        }
    }
    let literal: String = chars[start..i].iter().collect();
    let value = literal
        .parse::<f64>()
        .map_err(|_| PreprocessorErrorKind::Expression(format!("bad number {}", literal)))?;
    if matches!(chars.get(i), Some('u') | Some('i') | Some('f') | Some('h')) {
        i += 1;
    }
    Ok((value, i))
}

/// Nesting allowed through parentheses, unary signs and `^` before giving up.
const MAX_DEPTH: usize = 256;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), PreprocessorErrorKind> {
        match self.next() {
            Some(ref t) if *t == expected => Ok(()),
            other => Err(PreprocessorErrorKind::Expression(format!(
                "expected {:?}, found {:?}",
                expected, other
            ))),
        }
    }

    fn expression(&mut self) -> Result<f64, PreprocessorErrorKind> {
        let mut value = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, PreprocessorErrorKind> {
        let mut value = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.unary()?;
            value = match op {
                '*' => value * rhs,
                '/' => value / rhs,
                _ => value % rhs,
            };
        }
        Ok(value)
    }

    // Every recursive path passes through here.
    fn unary(&mut self) -> Result<f64, PreprocessorErrorKind> {
        if self.depth >= MAX_DEPTH {
            return Err(PreprocessorErrorKind::Expression(
                "expression nested too deeply".into(),
            ));
        }
        self.depth += 1;
        let value = self.signed();
        self.depth -= 1;
        value
    }

    fn signed(&mut self) -> Result<f64, PreprocessorErrorKind> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(-self.unary()?)
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    // `^` binds tighter than unary minus and associates to the right.
    fn power(&mut self) -> Result<f64, PreprocessorErrorKind> {
        let base = self.primary()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<f64, PreprocessorErrorKind> {
        match self.next() {
            Some(Token::Number(value)) => Ok(value),
            Some(Token::LParen) => {
                let value = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(value)
            }
            Some(Token::Ident(name)) => {
                if let Some((_, value)) = CONSTANTS.iter().find(|(c, _)| *c == name) {
                    return Ok(*value);
                }
                self.expect(Token::LParen)?;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    args.push(self.expression()?);
                    while self.peek() == Some(&Token::Comma) {
                        self.pos += 1;
                        args.push(self.expression()?);
                    }
                }
                self.expect(Token::RParen)?;
                call(&name, &args)
            }
            other => Err(PreprocessorErrorKind::Expression(format!(
                "unexpected {:?}",
                other
            ))),
        }
    }
}

fn call(name: &str, args: &[f64]) -> Result<f64, PreprocessorErrorKind> {
    let arity = |n: usize| {
        if args.len() == n {
            Ok(())
        } else {
            Err(PreprocessorErrorKind::Expression(format!(
                "{} takes {} argument(s), got {}",
                name,
                n,
                args.len()
            )))
        }
    };
    let value = match name {
        "max" | "min" => {
            if args.is_empty() {
                return Err(PreprocessorErrorKind::Expression(format!(
                    "{} needs at least one argument",
                    name
                )));
            }
            let fold = if name == "max" { f64::max } else { f64::min };
            args[1..].iter().fold(args[0], |acc, v| fold(acc, *v))
        }
        "atan2" => {
            arity(2)?;
            args[0].atan2(args[1])
        }
        "pow" => {
            arity(2)?;
            args[0].powf(args[1])
        }
        "hypot" => args.iter().map(|v| v * v).sum::<f64>().sqrt(),
        _ => {
            arity(1)?;
            let x = args[0];
            match name {
                "abs" => x.abs(),
                "acos" => x.acos(),
                "acosh" => x.acosh(),
                "asin" => x.asin(),
                "asinh" => x.asinh(),
                "atan" => x.atan(),
                "atanh" => x.atanh(),
                "cbrt" => x.cbrt(),
                "ceil" => x.ceil(),
                "cos" => x.cos(),
                "cosh" => x.cosh(),
                "exp" => x.exp(),
                "exp2" => x.exp2(),
                "floor" => x.floor(),
                "log" => x.ln(),
                "log10" => x.log10(),
                "log2" => x.log2(),
                "round" => x.round(),
                "sign" => {
                    if x == 0.0 {
                        0.0
                    } else {
                        x.signum()
                    }
                }
                "sin" => x.sin(),
                "sinh" => x.sinh(),
                "sqrt" => x.sqrt(),
                "tan" => x.tan(),
                "tanh" => x.tanh(),
                "trunc" => x.trunc(),
                _ => return Err(PreprocessorErrorKind::UnsafeSymbols(name.to_string())),
            }
        }
    };
    Ok(value)
}
