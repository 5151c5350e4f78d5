// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Claim-mapping expressions.
//!
//! A small, side-effect-free expression language evaluated against the
//! signing context, which is bound to the identifier `claims`.
//!
//! ```text
//! claims.email
//! claims["x-tenant"] + ":" + lower(claims.org)
//! has(claims.groups) ? claims.groups : []
//! {"street": claims.address.street, "verified": claims.email_verified == true}
//! ```
//!
//! Expressions are compiled once; compilation rejects syntax errors, unknown
//! identifiers and functions, and nesting deeper than [`MAX_DEPTH`].

use std::borrow::Cow;
use std::collections::BTreeMap;

use super::claims::{ClaimSet, ClaimValue};

/// Maximum nesting of a compiled expression.
pub const MAX_DEPTH: usize = 64;

/// Identifier the signing context is bound to.
pub const CLAIMS_VAR: &str = "claims";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("syntax error at offset {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("expression nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,

    #[error("unknown identifier `{0}`")]
    UnknownIdentifier(String),

    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("function `{0}` takes exactly one argument")]
    Arity(&'static str),

    #[error("has() requires a field or index selection")]
    InvalidHasArgument,

    #[error("no such key: {0}")]
    NoSuchKey(String),

    #[error("index {0} out of range")]
    IndexOutOfRange(i64),

    #[error("cannot apply {op} to {found}")]
    Type { op: &'static str, found: &'static str },

    #[error("integer overflow")]
    Overflow,
}

/// Runtime value of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn from_claim(value: &ClaimValue) -> Self {
        match value {
            ClaimValue::String(s) => Value::String(s.clone()),
            ClaimValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            ClaimValue::Bool(b) => Value::Bool(*b),
            ClaimValue::List(items) => {
                Value::List(items.iter().cloned().map(Value::String).collect())
            }
            ClaimValue::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_claim(v)))
                    .collect(),
            ),
        }
    }

    pub fn from_claims(claims: &ClaimSet) -> Self {
        Value::Map(
            claims
                .iter()
                .map(|(k, v)| (k.clone(), Value::from_claim(v)))
                .collect(),
        )
    }

    /// Convert to a claim value. Lists may only hold scalars.
    pub fn into_claim(self) -> Result<ClaimValue, ExprError> {
        Ok(match self {
            Value::String(s) => ClaimValue::String(s),
            Value::Int(i) => ClaimValue::Number(i.into()),
            Value::Float(f) => ClaimValue::Number(serde_json::Number::from_f64(f).ok_or(
                ExprError::Type {
                    op: "claim conversion",
                    found: "non-finite float",
                },
            )?),
            Value::Bool(b) => ClaimValue::Bool(b),
            Value::List(items) => ClaimValue::List(
                items
                    .into_iter()
                    .map(|item| item.into_scalar_string("list claim"))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(map) => ClaimValue::Map(
                map.into_iter()
                    .map(|(k, v)| v.into_claim().map(|v| (k, v)))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    fn into_scalar_string(self, op: &'static str) -> Result<String, ExprError> {
        match self {
            Value::String(s) => Ok(s),
            Value::Int(i) => Ok(i.to_string()),
            Value::Float(f) => Ok(f.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(ExprError::Type {
                op,
                found: other.kind(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Has,
    Size,
    Lower,
    Upper,
    String,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "has" => Some(Function::Has),
            "size" => Some(Function::Size),
            "lower" => Some(Function::Lower),
            "upper" => Some(Function::Upper),
            "string" => Some(Function::String),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Function::Has => "has",
            Function::Size => "size",
            Function::Lower => "lower",
            Function::Upper => "upper",
            Function::String => "string",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Claims,
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(Function, Box<Expr>),
}

/// A compiled expression.
#[derive(Debug, Clone)]
pub struct Program {
    source: String,
    root: Expr,
}

impl Program {
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
            end: source.len(),
        };
        let root = parser.parse_expr()?;
        if let Some((position, token)) = parser.tokens.get(parser.pos) {
            return Err(ExprError::Syntax {
                position: *position,
                message: format!("unexpected {token:?}"),
            });
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate with `claims` bound to `root`.
    pub fn evaluate(&self, root: &Value) -> Result<Value, ExprError> {
        eval(&self.root, root).map(Cow::into_owned)
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    True,
    False,
    Dot,
    Comma,
    Colon,
    Question,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Plus,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Bang,
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    let syntax = |position: usize, message: &str| ExprError::Syntax {
        position,
        message: message.to_string(),
    };

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let token = match c {
            '.' => single(&mut chars, Token::Dot),
            ',' => single(&mut chars, Token::Comma),
            ':' => single(&mut chars, Token::Colon),
            '?' => single(&mut chars, Token::Question),
            '(' => single(&mut chars, Token::LParen),
            ')' => single(&mut chars, Token::RParen),
            '[' => single(&mut chars, Token::LBracket),
            ']' => single(&mut chars, Token::RBracket),
            '{' => single(&mut chars, Token::LBrace),
            '}' => single(&mut chars, Token::RBrace),
            '+' => single(&mut chars, Token::Plus),
            '=' | '!' | '&' | '|' => {
                chars.next();
                let next = chars.peek().map(|&(_, n)| n);
                match (c, next) {
                    ('=', Some('=')) => {
                        chars.next();
                        Token::EqEq
                    }
                    ('!', Some('=')) => {
                        chars.next();
                        Token::NotEq
                    }
                    ('!', _) => Token::Bang,
                    ('&', Some('&')) => {
                        chars.next();
                        Token::AndAnd
                    }
                    ('|', Some('|')) => {
                        chars.next();
                        Token::OrOr
                    }
                    _ => return Err(syntax(start, "unexpected operator")),
                }
            }
            '"' | '\'' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, ch)) if ch == c => break,
                        Some((pos, '\\')) => match chars.next() {
                            Some((_, 'n')) => value.push('\n'),
                            Some((_, 't')) => value.push('\t'),
                            Some((_, 'r')) => value.push('\r'),
                            Some((_, ch @ ('\\' | '"' | '\''))) => value.push(ch),
                            _ => return Err(syntax(pos, "invalid escape")),
                        },
                        Some((_, ch)) => value.push(ch),
                        None => return Err(syntax(start, "unterminated string")),
                    }
                }
                Token::Str(value)
            }
            '0'..='9' => {
                let mut end = start;
                let mut is_float = false;
                while let Some(&(pos, ch)) = chars.peek() {
                    if ch.is_ascii_digit() {
                        end = pos + 1;
                        chars.next();
                    } else if ch == '.' && !is_float {
                        let after = source[pos + 1..].chars().next();
                        if !after.is_some_and(|a| a.is_ascii_digit()) {
                            break;
                        }
                        is_float = true;
                        end = pos + 1;
                        chars.next();
                    } else {
                        break;
                    }
                }
                let text = &source[start..end];
                if is_float {
                    Token::Float(
                        text.parse()
                            .map_err(|_| syntax(start, "invalid number"))?,
                    )
                } else {
                    Token::Int(
                        text.parse()
                            .map_err(|_| syntax(start, "integer literal out of range"))?,
                    )
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = start;
                while let Some(&(pos, ch)) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        end = pos + ch.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                match &source[start..end] {
                    "true" => Token::True,
                    "false" => Token::False,
                    ident => Token::Ident(ident.to_string()),
                }
            }
            _ => return Err(syntax(start, "unexpected character")),
        };
        tokens.push((start, token));
    }

    Ok(tokens)
}

fn single(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>, token: Token) -> Token {
    chars.next();
    token
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ExprError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {token:?}")))
        }
    }

    fn error(&self, message: &str) -> ExprError {
        ExprError::Syntax {
            position: self.position(),
            message: message.to_string(),
        }
    }

    /// Depth check for nodes built on top of `extra` earlier siblings.
    fn check_depth(&self, extra: usize) -> Result<(), ExprError> {
        if self.depth + extra > MAX_DEPTH {
            Err(ExprError::TooDeep)
        } else {
            Ok(())
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        self.depth += 1;
        self.check_depth(0)?;
        let expr = self.parse_conditional();
        self.depth -= 1;
        expr
    }

    fn parse_conditional(&mut self) -> Result<Expr, ExprError> {
        let condition = self.parse_binary(0)?;
        if !self.eat(&Token::Question) {
            return Ok(condition);
        }
        let then = self.parse_expr()?;
        self.expect(Token::Colon)?;
        let otherwise = self.parse_expr()?;
        Ok(Expr::Conditional(
            Box::new(condition),
            Box::new(then),
            Box::new(otherwise),
        ))
    }

    /// Precedence climbing over `||`, `&&`, `== !=`, `+`.
    fn parse_binary(&mut self, level: usize) -> Result<Expr, ExprError> {
        const LEVELS: &[&[(Token, BinaryOp)]] = &[
            &[(Token::OrOr, BinaryOp::Or)],
            &[(Token::AndAnd, BinaryOp::And)],
            &[(Token::EqEq, BinaryOp::Eq), (Token::NotEq, BinaryOp::Ne)],
            &[(Token::Plus, BinaryOp::Add)],
        ];

        let Some(operators) = LEVELS.get(level) else {
            return self.parse_unary(0);
        };

        let mut lhs = self.parse_binary(level + 1)?;
        let mut chained = 0;
        'outer: loop {
            for (token, op) in operators.iter() {
                if self.eat(token) {
                    chained += 1;
                    self.check_depth(chained)?;
                    let rhs = self.parse_binary(level + 1)?;
                    lhs = Expr::Binary(*op, Box::new(lhs), Box::new(rhs));
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn parse_unary(&mut self, negations: usize) -> Result<Expr, ExprError> {
        if self.eat(&Token::Bang) {
            self.check_depth(negations + 1)?;
            let inner = self.parse_unary(negations + 1)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_primary()?;
        let mut chained = 0;
        loop {
            if self.eat(&Token::Dot) {
                let Some(Token::Ident(name)) = self.advance() else {
                    return Err(self.error("expected field name after `.`"));
                };
                expr = Expr::Field(Box::new(expr), name);
            } else if self.eat(&Token::LBracket) {
                let index = self.parse_expr()?;
                self.expect(Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
            chained += 1;
            self.check_depth(chained)?;
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let position = self.position();
        match self.advance() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::Int(i))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::Float(f))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                Ok(Expr::List(items))
            }
            Some(Token::LBrace) => {
                let mut entries = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let key = self.parse_expr()?;
                        self.expect(Token::Colon)?;
                        let value = self.parse_expr()?;
                        entries.push((key, value));
                        if self.eat(&Token::RBrace) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                Ok(Expr::Map(entries))
            }
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let function = Function::lookup(&name)
                        .ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            self.expect(Token::Comma)?;
                        }
                    }
                    let [arg]: [Expr; 1] = args
                        .try_into()
                        .map_err(|_| ExprError::Arity(function.name()))?;
                    if function == Function::Has
                        && !matches!(arg, Expr::Field(..) | Expr::Index(..))
                    {
                        return Err(ExprError::InvalidHasArgument);
                    }
                    Ok(Expr::Call(function, Box::new(arg)))
                } else if name == CLAIMS_VAR {
                    Ok(Expr::Claims)
                } else {
                    Err(ExprError::UnknownIdentifier(name))
                }
            }
            Some(token) => Err(ExprError::Syntax {
                position,
                message: format!("unexpected {token:?}"),
            }),
            None => Err(ExprError::Syntax {
                position,
                message: "unexpected end of expression".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval<'a>(expr: &Expr, root: &'a Value) -> Result<Cow<'a, Value>, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(Cow::Owned(value.clone())),
        Expr::Claims => Ok(Cow::Borrowed(root)),
        Expr::Field(base, key) => select_key(eval(base, root)?, key),
        Expr::Index(base, index) => {
            let base = eval(base, root)?;
            match eval(index, root)?.as_ref() {
                Value::String(key) => select_key(base, key),
                Value::Int(i) => select_index(base, *i),
                other => Err(ExprError::Type {
                    op: "index",
                    found: other.kind(),
                }),
            }
        }
        Expr::List(items) => items
            .iter()
            .map(|item| eval(item, root).map(Cow::into_owned))
            .collect::<Result<Vec<_>, _>>()
            .map(|items| Cow::Owned(Value::List(items))),
        Expr::Map(entries) => {
            let mut map = BTreeMap::new();
            for (key, value) in entries {
                let key = match eval(key, root)?.into_owned() {
                    Value::String(key) => key,
                    other => {
                        return Err(ExprError::Type {
                            op: "map key",
                            found: other.kind(),
                        })
                    }
                };
                map.insert(key, eval(value, root)?.into_owned());
            }
            Ok(Cow::Owned(Value::Map(map)))
        }
        Expr::Not(inner) => {
            let value = as_bool(&*eval(inner, root)?, "!")?;
            Ok(Cow::Owned(Value::Bool(!value)))
        }
        Expr::Binary(op, lhs, rhs) => {
            let result = match op {
                BinaryOp::And => {
                    as_bool(&*eval(lhs, root)?, "&&")? && as_bool(&*eval(rhs, root)?, "&&")?
                }
                BinaryOp::Or => {
                    as_bool(&*eval(lhs, root)?, "||")? || as_bool(&*eval(rhs, root)?, "||")?
                }
                BinaryOp::Eq => values_equal(&*eval(lhs, root)?, &*eval(rhs, root)?),
                BinaryOp::Ne => !values_equal(&*eval(lhs, root)?, &*eval(rhs, root)?),
                BinaryOp::Add => {
                    let lhs = eval(lhs, root)?.into_owned();
                    let rhs = eval(rhs, root)?.into_owned();
                    return add(lhs, rhs).map(Cow::Owned);
                }
            };
            Ok(Cow::Owned(Value::Bool(result)))
        }
        Expr::Conditional(condition, then, otherwise) => {
            if as_bool(&*eval(condition, root)?, "?:")? {
                eval(then, root)
            } else {
                eval(otherwise, root)
            }
        }
        Expr::Call(function, arg) => call(*function, arg, root).map(Cow::Owned),
    }
}

fn select_key<'a>(base: Cow<'a, Value>, key: &str) -> Result<Cow<'a, Value>, ExprError> {
    let missing = || ExprError::NoSuchKey(key.to_string());
    match base {
        Cow::Borrowed(Value::Map(map)) => map.get(key).map(Cow::Borrowed).ok_or_else(missing),
        Cow::Owned(Value::Map(mut map)) => map.remove(key).map(Cow::Owned).ok_or_else(missing),
        other => Err(ExprError::Type {
            op: "field access",
            found: other.kind(),
        }),
    }
}

fn select_index(base: Cow<'_, Value>, index: i64) -> Result<Cow<'_, Value>, ExprError> {
    let slot = usize::try_from(index).map_err(|_| ExprError::IndexOutOfRange(index))?;
    match base {
        Cow::Borrowed(Value::List(items)) => items
            .get(slot)
            .map(Cow::Borrowed)
            .ok_or(ExprError::IndexOutOfRange(index)),
        Cow::Owned(Value::List(mut items)) => {
            if slot < items.len() {
                Ok(Cow::Owned(items.swap_remove(slot)))
            } else {
                Err(ExprError::IndexOutOfRange(index))
            }
        }
        other => Err(ExprError::Type {
            op: "list index",
            found: other.kind(),
        }),
    }
}

fn as_bool(value: &Value, op: &'static str) -> Result<bool, ExprError> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(ExprError::Type {
            op,
            found: other.kind(),
        }),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
        (Value::List(a), Value::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Map(a), Value::Map(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => lhs == rhs,
    }
}

fn add(lhs: Value, rhs: Value) -> Result<Value, ExprError> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => a.checked_add(b).map(Value::Int).ok_or(ExprError::Overflow),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(a as f64 + b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a + b as f64)),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
        (Value::String(mut a), Value::String(b)) => {
            a.push_str(&b);
            Ok(Value::String(a))
        }
        (Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (lhs, _) => Err(ExprError::Type {
            op: "+",
            found: lhs.kind(),
        }),
    }
}

fn call(function: Function, arg: &Expr, root: &Value) -> Result<Value, ExprError> {
    if function == Function::Has {
        return Ok(Value::Bool(eval(arg, root).is_ok()));
    }

    let value = eval(arg, root)?;
    if function == Function::String {
        return value
            .into_owned()
            .into_scalar_string("string")
            .map(Value::String);
    }

    match (function, value.as_ref()) {
        (Function::Size, Value::String(s)) => Ok(Value::Int(s.chars().count() as i64)),
        (Function::Size, Value::List(items)) => Ok(Value::Int(items.len() as i64)),
        (Function::Size, Value::Map(map)) => Ok(Value::Int(map.len() as i64)),
        (Function::Lower, Value::String(s)) => Ok(Value::String(s.to_lowercase())),
        (Function::Upper, Value::String(s)) => Ok(Value::String(s.to_uppercase())),
        (_, other) => Err(ExprError::Type {
            op: function.name(),
            found: other.kind(),
        }),
    }
}
