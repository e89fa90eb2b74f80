//! The expression evaluator: `${...}` template interpolation and a small
//! comparison/boolean language used by condition nodes, loop break
//! conditions, and formula nodes.
//!
//! The evaluator is pure: it reads an [`EvalContext`] and performs no I/O.
//! Missing context keys resolve to `null`, which interpolates as the empty
//! string.
//!
//! Supported grammar, loosest binding first:
//!
//! ```text
//! expr    := or
//! or      := and ("||" and)*
//! and     := eq ("&&" eq)*
//! eq      := cmp (("==" | "!=") cmp)*
//! cmp     := add (("<" | "<=" | ">" | ">=" | contains | in | matches) add)?
//! add     := mul (("+" | "-") mul)*
//! mul     := unary (("*" | "/" | "%") unary)*
//! unary   := ("!" | "-") unary | primary
//! primary := number | string | true | false | null | path | "(" expr ")"
//! ```

use std::collections::HashMap;

use serde_json::Value;

use crate::error::EngineError;
use crate::value::{is_truthy, resolve_path, to_display_string};

// ---------------------------------------------------------------------------
// Evaluation context
// ---------------------------------------------------------------------------

/// The immutable context a node evaluates against: the trigger payload,
/// execution metadata, completed node outputs keyed by node id, and any
/// scoped bindings (`loop`, `catch`, loop item variables).
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub trigger: Value,
    pub env: Value,
    pub nodes: HashMap<String, Value>,
    pub scoped: HashMap<String, Value>,
}

impl EvalContext {
    /// Resolve a dotted path. Scoped bindings shadow node outputs, which
    /// shadow nothing: `trigger` and `env` are reserved roots.
    pub fn lookup(&self, path: &str) -> Value {
        let head_end = path
            .find(['.', '['])
            .unwrap_or(path.len());
        let (head, rest) = path.split_at(head_end);
        let rest = rest.strip_prefix('.').unwrap_or(rest);

        let root = if let Some(v) = self.scoped.get(head) {
            v
        } else if head == "trigger" {
            &self.trigger
        } else if head == "env" {
            &self.env
        } else if let Some(v) = self.nodes.get(head) {
            v
        } else {
            return Value::Null;
        };

        if rest.is_empty() {
            root.clone()
        } else {
            resolve_path(root, rest).cloned().unwrap_or(Value::Null)
        }
    }
}

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Evaluate an expression to a JSON value.
pub fn evaluate(expr: &str, ctx: &EvalContext) -> Result<Value, EngineError> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser { tokens, pos: 0, ctx };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(EngineError::Expression(format!(
            "unexpected trailing input in expression {expr:?}"
        )));
    }
    Ok(value)
}

/// Evaluate an expression in boolean position.
pub fn evaluate_bool(expr: &str, ctx: &EvalContext) -> Result<bool, EngineError> {
    Ok(is_truthy(&evaluate(expr, ctx)?))
}

/// Interpolate every `${...}` span in a template, coercing each evaluated
/// expression to its display string.
pub fn interpolate(template: &str, ctx: &EvalContext) -> Result<String, EngineError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let inner_start = start + 2;
        let end = find_expr_end(rest, inner_start).ok_or_else(|| {
            EngineError::Expression(format!("unterminated ${{...}} in template {template:?}"))
        })?;
        let value = evaluate(&rest[inner_start..end], ctx)?;
        out.push_str(&to_display_string(&value));
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Resolve every expression in a JSON config before a node runs.
///
/// A string that is exactly one `${...}` span becomes the evaluated value
/// (preserving its type); any other string is interpolated. Objects and
/// arrays are walked recursively.
pub fn render_value(value: &Value, ctx: &EvalContext) -> Result<Value, EngineError> {
    match value {
        Value::String(s) => {
            if let Some(inner) = single_expression(s) {
                evaluate(inner, ctx)
            } else {
                Ok(Value::String(interpolate(s, ctx)?))
            }
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(render_value(item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_value(v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// If `s` is exactly one `${...}` span, return the inner expression.
fn single_expression(s: &str) -> Option<&str> {
    if !s.starts_with("${") {
        return None;
    }
    let end = find_expr_end(s, 2)?;
    if end == s.len() - 1 {
        Some(&s[2..end])
    } else {
        None
    }
}

/// Find the `}` closing the expression starting at `from`, skipping braces
/// inside string literals.
fn find_expr_end(s: &str, from: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = from;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' => quote = Some(b),
                b'}' => return Some(i),
                _ => {}
            },
        }
        i += 1;
    }
    None
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Path(String),
    True,
    False,
    Null,
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    And,
    Or,
    Bang,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Contains,
    In,
    Matches,
}

fn tokenize(input: &str) -> Result<Vec<Token>, EngineError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            b')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            b'+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            b'-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            b'*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            b'/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            b'%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            b'=' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            b'!' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            b'!' => {
                tokens.push(Token::Bang);
                i += 1;
            }
            b'<' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            b'<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            b'>' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            b'>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            b'&' if bytes.get(i + 1) == Some(&b'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            b'|' if bytes.get(i + 1) == Some(&b'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            b'\'' | b'"' => {
                let quote = b;
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] != quote {
                    j += 1;
                }
                if j >= bytes.len() {
                    return Err(EngineError::Expression(format!(
                        "unterminated string literal in {input:?}"
                    )));
                }
                tokens.push(Token::Str(input[start..j].to_owned()));
                i = j + 1;
            }
            b'0'..=b'9' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let text = &input[start..i];
                let num = text.parse::<f64>().map_err(|_| {
                    EngineError::Expression(format!("invalid number literal {text:?}"))
                })?;
                tokens.push(Token::Num(num));
            }
            b'A'..=b'Z' | b'a'..=b'z' | b'_' | b'$' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric()
                        || matches!(bytes[i], b'_' | b'.' | b'[' | b']' | b'$'))
                {
                    i += 1;
                }
                let word = &input[start..i];
                tokens.push(match word {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "contains" => Token::Contains,
                    "in" => Token::In,
                    "matches" => Token::Matches,
                    path => Token::Path(path.to_owned()),
                });
            }
            other => {
                return Err(EngineError::Expression(format!(
                    "unexpected character {:?} in expression {input:?}",
                    other as char
                )));
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser / evaluator
// ---------------------------------------------------------------------------

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    ctx: &'a EvalContext,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> Result<Value, EngineError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Value, EngineError> {
        let mut left = self.and_expr()?;
        while self.eat(&Token::Or) {
            let right = self.and_expr()?;
            left = Value::Bool(is_truthy(&left) || is_truthy(&right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Value, EngineError> {
        let mut left = self.eq_expr()?;
        while self.eat(&Token::And) {
            let right = self.eq_expr()?;
            left = Value::Bool(is_truthy(&left) && is_truthy(&right));
        }
        Ok(left)
    }

    fn eq_expr(&mut self) -> Result<Value, EngineError> {
        let mut left = self.cmp_expr()?;
        loop {
            if self.eat(&Token::Eq) {
                let right = self.cmp_expr()?;
                left = Value::Bool(values_equal(&left, &right));
            } else if self.eat(&Token::Ne) {
                let right = self.cmp_expr()?;
                left = Value::Bool(!values_equal(&left, &right));
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn cmp_expr(&mut self) -> Result<Value, EngineError> {
        let left = self.add_expr()?;
        let op = match self.peek() {
            Some(Token::Lt) => Cmp::Lt,
            Some(Token::Le) => Cmp::Le,
            Some(Token::Gt) => Cmp::Gt,
            Some(Token::Ge) => Cmp::Ge,
            Some(Token::Contains) => Cmp::Contains,
            Some(Token::In) => Cmp::In,
            Some(Token::Matches) => Cmp::Matches,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.add_expr()?;
        compare(op, &left, &right).map(Value::Bool)
    }

    fn add_expr(&mut self) -> Result<Value, EngineError> {
        let mut left = self.mul_expr()?;
        loop {
            if self.eat(&Token::Plus) {
                let right = self.mul_expr()?;
                left = add_values(&left, &right)?;
            } else if self.eat(&Token::Minus) {
                let right = self.mul_expr()?;
                left = arith(&left, &right, "-", |a, b| a - b)?;
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn mul_expr(&mut self) -> Result<Value, EngineError> {
        let mut left = self.unary_expr()?;
        loop {
            if self.eat(&Token::Star) {
                let right = self.unary_expr()?;
                left = arith(&left, &right, "*", |a, b| a * b)?;
            } else if self.eat(&Token::Slash) {
                let right = self.unary_expr()?;
                left = arith(&left, &right, "/", |a, b| a / b)?;
            } else if self.eat(&Token::Percent) {
                let right = self.unary_expr()?;
                left = arith(&left, &right, "%", |a, b| a % b)?;
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn unary_expr(&mut self) -> Result<Value, EngineError> {
        if self.eat(&Token::Bang) {
            let inner = self.unary_expr()?;
            return Ok(Value::Bool(!is_truthy(&inner)));
        }
        if self.eat(&Token::Minus) {
            let inner = self.unary_expr()?;
            let n = as_number(&inner, "-")?;
            return Ok(number(-n));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Value, EngineError> {
        match self.bump() {
            Some(Token::Num(n)) => Ok(number(n)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::True) => Ok(Value::Bool(true)),
            Some(Token::False) => Ok(Value::Bool(false)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::Path(p)) => Ok(self.ctx.lookup(&p)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                if !self.eat(&Token::RParen) {
                    return Err(EngineError::Expression("expected closing paren".into()));
                }
                Ok(inner)
            }
            other => Err(EngineError::Expression(format!(
                "unexpected token {other:?} in expression"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Cmp {
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    In,
    Matches,
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn as_number(v: &Value, op: &str) -> Result<f64, EngineError> {
    v.as_f64()
        .ok_or_else(|| EngineError::Expression(format!("operator {op:?} requires numbers, got {v}")))
}

fn arith(
    left: &Value,
    right: &Value,
    op: &str,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Value, EngineError> {
    Ok(number(f(as_number(left, op)?, as_number(right, op)?)))
}

fn add_values(left: &Value, right: &Value) -> Result<Value, EngineError> {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return Ok(number(a + b));
    }
    // String concatenation when either side is a string.
    if left.is_string() || right.is_string() {
        return Ok(Value::String(format!(
            "{}{}",
            to_display_string(left),
            to_display_string(right)
        )));
    }
    Err(EngineError::Expression(format!(
        "operator \"+\" requires numbers or strings, got {left} and {right}"
    )))
}

/// Equality with numeric coercion: `1 == 1.0` holds.
fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a == b;
    }
    left == right
}

fn compare(op: Cmp, left: &Value, right: &Value) -> Result<bool, EngineError> {
    match op {
        Cmp::Lt | Cmp::Le | Cmp::Gt | Cmp::Ge => {
            let ordering = if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
                a.partial_cmp(&b)
            } else if let (Some(a), Some(b)) = (left.as_str(), right.as_str()) {
                Some(a.cmp(b))
            } else {
                None
            };
            let Some(ordering) = ordering else {
                return Err(EngineError::Expression(format!(
                    "cannot order {left} and {right}"
                )));
            };
            Ok(match op {
                Cmp::Lt => ordering.is_lt(),
                Cmp::Le => ordering.is_le(),
                Cmp::Gt => ordering.is_gt(),
                Cmp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            })
        }
        Cmp::Contains => contains(left, right),
        Cmp::In => contains(right, left),
        Cmp::Matches => {
            let (Some(text), Some(pattern)) = (left.as_str(), right.as_str()) else {
                return Err(EngineError::Expression(format!(
                    "matches requires strings, got {left} and {right}"
                )));
            };
            let re = regex::Regex::new(pattern)
                .map_err(|e| EngineError::Expression(format!("invalid regex {pattern:?}: {e}")))?;
            Ok(re.is_match(text))
        }
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, EngineError> {
    match haystack {
        Value::String(s) => Ok(needle
            .as_str()
            .map(|n| s.contains(n))
            .unwrap_or(false)),
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        Value::Object(map) => Ok(needle
            .as_str()
            .map(|k| map.contains_key(k))
            .unwrap_or(false)),
        other => Err(EngineError::Expression(format!(
            "contains requires a string, array or object, got {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
