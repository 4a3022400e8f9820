//! The template expression language.
//!
//! A template is literal text with `{expression}` sections. Expressions
//! support dot-path variables, string/number/bool/null literals,
//! arithmetic, comparison, boolean logic, the ternary operator, and calls
//! to registered functions. The grammar is fixed.
//!
//! Parsing produces a [`Template`] that can be evaluated repeatedly
//! against an [`EvalContext`]; `Display` reconstructs a readable source
//! form for preview tooling.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::registry::Registry;
use crate::value::Value;

/// A positioned parse diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("at byte {position}: {message}")]
pub struct ParseError {
    /// Byte offset into the template source.
    pub position: usize,
    /// What went wrong.
    pub message: String,
}

impl ParseError {
    fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

/// A runtime evaluation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EvalError {
    /// What went wrong.
    pub message: String,
}

impl EvalError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Evaluation environment: the registry plus call-scoped locals.
pub struct EvalContext<'a> {
    /// The placeholder registry variables resolve against.
    pub registry: &'a Registry,
    /// Locals shadowing registry paths, checked first.
    pub locals: BTreeMap<String, Value>,
}

impl<'a> EvalContext<'a> {
    /// Context over a registry with no locals.
    #[must_use]
    pub fn new(registry: &'a Registry) -> Self {
        Self {
            registry,
            locals: BTreeMap::new(),
        }
    }

    fn lookup(&self, path: &str) -> Value {
        if let Some(value) = self.locals.get(path) {
            return value.clone();
        }
        self.registry.get(path)()
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

/// An expression AST node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    /// A dot-delimited registry path (or local).
    Variable(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
}

impl Expr {
    /// Evaluate against the given context.
    ///
    /// # Errors
    ///
    /// Returns an error on type mismatches or calls to non-functions.
    pub fn eval(&self, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
        match self {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::String(s.clone())),
            Expr::Variable(path) => Ok(ctx.lookup(path)),
            Expr::Unary(op, inner) => {
                let value = inner.eval(ctx)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                    UnaryOp::Neg => value
                        .as_number()
                        .map(|n| Value::Number(-n))
                        .ok_or_else(|| EvalError::new(format!("cannot negate {value:?}"))),
                }
            }
            Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, ctx),
            Expr::Ternary(cond, then, otherwise) => {
                if cond.eval(ctx)?.is_truthy() {
                    then.eval(ctx)
                } else {
                    otherwise.eval(ctx)
                }
            }
            Expr::Call(callee, args) => {
                let target = callee.eval(ctx)?;
                let Value::Function(f) = target else {
                    return Err(EvalError::new(format!("{callee} is not a function")));
                };
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push(arg.eval(ctx)?);
                }
                Ok(f(&evaluated))
            }
        }
    }

    /// Replace every occurrence of variable `from` with variable `to`.
    pub fn rebind_variable(&mut self, from: &str, to: &str) {
        match self {
            Expr::Variable(path) if path == from => *path = to.to_string(),
            Expr::Unary(_, inner) => inner.rebind_variable(from, to),
            Expr::Binary(_, lhs, rhs) => {
                lhs.rebind_variable(from, to);
                rhs.rebind_variable(from, to);
            }
            Expr::Ternary(cond, then, otherwise) => {
                cond.rebind_variable(from, to);
                then.rebind_variable(from, to);
                otherwise.rebind_variable(from, to);
            }
            Expr::Call(callee, args) => {
                callee.rebind_variable(from, to);
                for arg in args {
                    arg.rebind_variable(from, to);
                }
            }
            _ => {}
        }
    }

    fn needs_parens(&self) -> bool {
        matches!(self, Expr::Binary(..) | Expr::Ternary(..))
    }
}

fn eval_binary(
    op: BinOp,
    lhs: &Expr,
    rhs: &Expr,
    ctx: &EvalContext<'_>,
) -> Result<Value, EvalError> {
    // Boolean operators short-circuit.
    match op {
        BinOp::And => {
            return Ok(Value::Bool(
                lhs.eval(ctx)?.is_truthy() && rhs.eval(ctx)?.is_truthy(),
            ));
        }
        BinOp::Or => {
            return Ok(Value::Bool(
                lhs.eval(ctx)?.is_truthy() || rhs.eval(ctx)?.is_truthy(),
            ));
        }
        _ => {}
    }

    let left = lhs.eval(ctx)?;
    let right = rhs.eval(ctx)?;

    match op {
        BinOp::Eq => return Ok(Value::Bool(left == right)),
        BinOp::Ne => return Ok(Value::Bool(left != right)),
        BinOp::Add => {
            // String concatenation when either side is a string.
            if matches!(left, Value::String(_)) || matches!(right, Value::String(_)) {
                return Ok(Value::String(format!("{left}{right}")));
            }
        }
        _ => {}
    }

    let (a, b) = match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(EvalError::new(format!(
                "cannot apply {} to {left:?} and {right:?}",
                op.symbol()
            )));
        }
    };

    Ok(match op {
        BinOp::Add => Value::Number(a + b),
        BinOp::Sub => Value::Number(a - b),
        BinOp::Mul => Value::Number(a * b),
        BinOp::Div => Value::Number(a / b),
        BinOp::Rem => Value::Number(a % b),
        BinOp::Lt => Value::Bool(a < b),
        BinOp::Le => Value::Bool(a <= b),
        BinOp::Gt => Value::Bool(a > b),
        BinOp::Ge => Value::Bool(a >= b),
        BinOp::Eq | BinOp::Ne | BinOp::And | BinOp::Or => unreachable!("handled above"),
    })
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn wrapped(expr: &Expr, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            if expr.needs_parens() {
                write!(f, "({expr})")
            } else {
                write!(f, "{expr}")
            }
        }

        match self {
            Expr::Null => write!(f, "null"),
            Expr::Bool(b) => write!(f, "{b}"),
            Expr::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{n}")
                }
            }
            Expr::Str(s) => write!(f, "{s:?}"),
            Expr::Variable(path) => write!(f, "{path}"),
            Expr::Unary(op, inner) => {
                let symbol = match op {
                    UnaryOp::Not => "!",
                    UnaryOp::Neg => "-",
                };
                write!(f, "{symbol}")?;
                wrapped(inner, f)
            }
            Expr::Binary(op, lhs, rhs) => {
                wrapped(lhs, f)?;
                write!(f, " {} ", op.symbol())?;
                wrapped(rhs, f)
            }
            Expr::Ternary(cond, then, otherwise) => {
                wrapped(cond, f)?;
                write!(f, " ? ")?;
                wrapped(then, f)?;
                write!(f, " : ")?;
                wrapped(otherwise, f)
            }
            Expr::Call(callee, args) => {
                wrapped(callee, f)?;
                write!(f, "(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// One piece of a parsed template.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Literal text, emitted verbatim.
    Text(String),
    /// An embedded expression.
    Expr(Expr),
}

/// A parsed template: literal text interleaved with expressions.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parse template source.
    ///
    /// # Errors
    ///
    /// Returns every positioned diagnostic found in the source.
    pub fn parse(source: &str) -> Result<Self, Vec<ParseError>> {
        let mut segments = Vec::new();
        let mut errors = Vec::new();
        let mut text = String::new();
        let bytes = source.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] == b'{' {
                let Some(end) = source[i + 1..].find('}').map(|off| i + 1 + off) else {
                    errors.push(ParseError::new(i, "unclosed expression section"));
                    break;
                };
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                let inner = &source[i + 1..end];
                match parse_expression(inner) {
                    Ok(expr) => segments.push(Segment::Expr(expr)),
                    Err(mut err) => {
                        err.position += i + 1;
                        errors.push(err);
                    }
                }
                i = end + 1;
            } else {
                let ch = source[i..].chars().next().expect("in-bounds char");
                text.push(ch);
                i += ch.len_utf8();
            }
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        if errors.is_empty() {
            Ok(Self { segments })
        } else {
            Err(errors)
        }
    }

    /// Evaluate the template.
    ///
    /// A template that is a single expression yields that expression's
    /// value unchanged; mixed content concatenates into a `String`.
    ///
    /// # Errors
    ///
    /// Propagates the first expression evaluation failure.
    pub fn eval(&self, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
        if let [Segment::Expr(expr)] = self.segments.as_slice() {
            return expr.eval(ctx);
        }

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Expr(expr) => {
                    let value = expr.eval(ctx)?;
                    out.push_str(&value.to_string());
                }
            }
        }
        Ok(Value::String(out))
    }

    /// Rebind a variable across every embedded expression.
    pub fn rebind_variable(&mut self, from: &str, to: &str) {
        for segment in &mut self.segments {
            if let Segment::Expr(expr) = segment {
                expr.rebind_variable(from, to);
            }
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => write!(f, "{text}")?,
                Segment::Expr(expr) => write!(f, "{{{expr}}}")?,
            }
        }
        Ok(())
    }
}

/// Parse a bare expression (the inside of a `{...}` section).
///
/// # Errors
///
/// Returns the first positioned diagnostic.
pub fn parse_expression(source: &str) -> Result<Expr, ParseError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.ternary()?;
    if let Some((position, token)) = parser.peek_full() {
        return Err(ParseError::new(
            position,
            format!("unexpected trailing {token:?}"),
        ));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    Not,
    Question,
    Colon,
    LParen,
    RParen,
    Comma,
    Dot,
}

fn lex(source: &str) -> Result<Vec<(usize, Token)>, ParseError> {
    let mut tokens = Vec::new();
    let bytes = source.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        let b = bytes[i];
        match b {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
                continue;
            }
            b'0'..=b'9' => {
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    // A dot not followed by a digit belongs to the next token.
                    if bytes[i] == b'.'
                        && !bytes.get(i + 1).is_some_and(u8::is_ascii_digit)
                    {
                        break;
                    }
                    i += 1;
                }
                let number = source[start..i]
                    .parse()
                    .map_err(|_| ParseError::new(start, "malformed number"))?;
                tokens.push((start, Token::Number(number)));
            }
            b'"' | b'\'' => {
                let quote = b;
                i += 1;
                let mut out = String::new();
                loop {
                    if i >= bytes.len() {
                        return Err(ParseError::new(start, "unterminated string"));
                    }
                    if bytes[i] == quote {
                        i += 1;
                        break;
                    }
                    if bytes[i] == b'\\' && i + 1 < bytes.len() {
                        // The escaped character may be multibyte.
                        let ch = source[i + 1..].chars().next().expect("in-bounds char");
                        out.push(ch);
                        i += 1 + ch.len_utf8();
                        continue;
                    }
                    let ch = source[i..].chars().next().expect("in-bounds char");
                    out.push(ch);
                    i += ch.len_utf8();
                }
                tokens.push((start, Token::Str(out)));
            }
            b'+' => {
                tokens.push((start, Token::Plus));
                i += 1;
            }
            b'-' => {
                tokens.push((start, Token::Minus));
                i += 1;
            }
            b'*' => {
                tokens.push((start, Token::Star));
                i += 1;
            }
            b'/' => {
                tokens.push((start, Token::Slash));
                i += 1;
            }
            b'%' => {
                tokens.push((start, Token::Percent));
                i += 1;
            }
            b'(' => {
                tokens.push((start, Token::LParen));
                i += 1;
            }
            b')' => {
                tokens.push((start, Token::RParen));
                i += 1;
            }
            b',' => {
                tokens.push((start, Token::Comma));
                i += 1;
            }
            b'.' => {
                tokens.push((start, Token::Dot));
                i += 1;
            }
            b'?' => {
                tokens.push((start, Token::Question));
                i += 1;
            }
            b':' => {
                tokens.push((start, Token::Colon));
                i += 1;
            }
            b'=' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push((start, Token::EqEq));
                i += 2;
            }
            b'!' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push((start, Token::NotEq));
                i += 2;
            }
            b'!' => {
                tokens.push((start, Token::Not));
                i += 1;
            }
            b'<' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push((start, Token::LtEq));
                i += 2;
            }
            b'<' => {
                tokens.push((start, Token::Lt));
                i += 1;
            }
            b'>' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push((start, Token::GtEq));
                i += 2;
            }
            b'>' => {
                tokens.push((start, Token::Gt));
                i += 1;
            }
            b'&' if bytes.get(i + 1) == Some(&b'&') => {
                tokens.push((start, Token::AndAnd));
                i += 2;
            }
            b'|' if bytes.get(i + 1) == Some(&b'|') => {
                tokens.push((start, Token::OrOr));
                i += 2;
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                let token = match &source[start..i] {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    ident => Token::Ident(ident.to_string()),
                };
                tokens.push((start, token));
            }
            other => {
                return Err(ParseError::new(
                    start,
                    format!("unexpected character {:?}", other as char),
                ));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn peek_full(&self) -> Option<(usize, &Token)> {
        self.tokens.get(self.pos).map(|(p, t)| (*p, t))
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), ParseError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn error(&self, message: String) -> ParseError {
        let position = self
            .tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(0, |(p, _)| *p);
        ParseError::new(position, message)
    }

    fn ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.or()?;
        if self.eat(&Token::Question) {
            let then = self.ternary()?;
            self.expect(&Token::Colon, "':' in ternary")?;
            let otherwise = self.ternary()?;
            return Ok(Expr::Ternary(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(cond)
    }

    fn or(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.and()?;
            expr = Expr::Binary(BinOp::Or, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn and(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.equality()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.equality()?;
            expr = Expr::Binary(BinOp::And, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn equality(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.comparison()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::LtEq) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::GtEq) => BinOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.term()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.factor()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn factor(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Not) {
            let inner = self.unary()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        if self.eat(&Token::Minus) {
            let inner = self.unary()?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        while self.eat(&Token::LParen) {
            let mut args = Vec::new();
            if !self.eat(&Token::RParen) {
                loop {
                    args.push(self.ternary()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::RParen, "')' after arguments")?;
            }
            expr = Expr::Call(Box::new(expr), args);
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Null) => Ok(Expr::Null),
            Some(Token::LParen) => {
                let inner = self.ternary()?;
                self.expect(&Token::RParen, "closing ')'")?;
                Ok(inner)
            }
            Some(Token::Ident(first)) => {
                let mut path = first;
                while self.eat(&Token::Dot) {
                    match self.advance() {
                        Some(Token::Ident(seg)) => {
                            path.push('.');
                            path.push_str(&seg);
                        }
                        _ => return Err(self.error("expected identifier after '.'".into())),
                    }
                }
                Ok(Expr::Variable(path))
            }
            other => Err(self.error(format!("expected expression, found {other:?}"))),
        }
    }
}
