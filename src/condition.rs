//! C4: the fixed mini-expression language used by Connection `condition`,
//! Step `conditionLogic`, and DecisionOption `resultAction`.
//!
//! Grammar (precedence low -> high):
//!   expr       := or_expr
//!   or_expr    := and_expr ('||' and_expr)*
//!   and_expr   := unary ('&&' unary)*
//!   unary      := '!' unary | comparison
//!   comparison := atom (('==' | '!=' | '<' | '<=' | '>' | '>=') atom)?
//!   atom       := literal | reference | '(' expr ')'
//!
//! The evaluator is pure, total, and side-effect free. Parse/type failures
//! become `CoreError::ConditionError`; callers decide how to downgrade that
//! per §4.4/§7 (connections treat the edge as false, `resultAction`
//! rejects the decision).

use crate::error::{CoreError, CoreResult};
use crate::value::{Value, ValueMap};
use std::collections::HashMap;

/// The evaluation context: the execution-level KV map, the just-completed
/// step's KV map ("last"), and an optional selected outcome id.
pub struct Context<'a> {
    pub execution_data: &'a ValueMap,
    pub last: Option<&'a ValueMap>,
    pub outcome_id: Option<&'a str>,
}

impl<'a> Context<'a> {
    pub fn new(execution_data: &'a ValueMap) -> Self {
        Self {
            execution_data,
            last: None,
            outcome_id: None,
        }
    }

    pub fn with_last(mut self, last: &'a ValueMap) -> Self {
        self.last = Some(last);
        self
    }

    pub fn with_outcome(mut self, outcome_id: &'a str) -> Self {
        self.outcome_id = Some(outcome_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    String(String),
    Number(f64),
    Bool(bool),
    AndAnd,
    OrOr,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    LParen,
    RParen,
    Assign,
    Semicolon,
}

fn tokenize(src: &str) -> CoreResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ';' => {
                tokens.push(Token::Semicolon);
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    tokens.push(Token::Assign);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Lte);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Gte);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(CoreError::ConditionError(format!(
                        "unterminated string literal in '{}'",
                        src
                    )));
                }
                i += 1; // closing quote
                tokens.push(Token::String(s));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let num_str: String = chars[start..i].iter().collect();
                let num = num_str.parse::<f64>().map_err(|_| {
                    CoreError::ConditionError(format!("invalid number literal '{}'", num_str))
                })?;
                tokens.push(Token::Number(num));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => {
                return Err(CoreError::ConditionError(format!(
                    "unexpected character '{}' in condition '{}'",
                    other, src
                )));
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Reference(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompareOp {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, token: &Token) -> CoreResult<()> {
        match self.advance() {
            Some(t) if &t == token => Ok(()),
            other => Err(CoreError::ConditionError(format!(
                "expected {:?}, found {:?}",
                token, other
            ))),
        }
    }

    fn parse_expr(&mut self) -> CoreResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> CoreResult<Expr> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::OrOr)) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> CoreResult<Expr> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::AndAnd)) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> CoreResult<Expr> {
        if matches!(self.peek(), Some(Token::Bang)) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> CoreResult<Expr> {
        let left = self.parse_atom()?;
        let op = match self.peek() {
            Some(Token::EqEq) => Some(CompareOp::Eq),
            Some(Token::NotEq) => Some(CompareOp::NotEq),
            Some(Token::Lt) => Some(CompareOp::Lt),
            Some(Token::Lte) => Some(CompareOp::Lte),
            Some(Token::Gt) => Some(CompareOp::Gt),
            Some(Token::Gte) => Some(CompareOp::Gte),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_atom()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_atom(&mut self) -> CoreResult<Expr> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::String(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Bool(b)) => Ok(Expr::Literal(Value::Bool(b))),
            Some(Token::Ident(name)) => Ok(Expr::Reference(name)),
            other => Err(CoreError::ConditionError(format!(
                "expected literal, reference, or '(', found {:?}",
                other
            ))),
        }
    }
}

fn parse_expression(src: &str) -> CoreResult<Expr> {
    let tokens = tokenize(src)?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(CoreError::ConditionError(format!(
            "trailing tokens after parsing condition '{}'",
            src
        )));
    }
    Ok(expr)
}

fn resolve_reference(ctx: &Context, name: &str) -> CoreResult<Value> {
    if let Some(rest) = name.strip_prefix("ctx.") {
        Ok(ctx.execution_data.get(rest).cloned().unwrap_or(Value::Null))
    } else if let Some(rest) = name.strip_prefix("last.") {
        match ctx.last {
            Some(last) => Ok(last.get(rest).cloned().unwrap_or(Value::Null)),
            None => Ok(Value::Null),
        }
    } else if name == "outcome.id" {
        Ok(ctx
            .outcome_id
            .map(|id| Value::String(id.to_string()))
            .unwrap_or(Value::Null))
    } else {
        Err(CoreError::ConditionError(format!(
            "unrecognized reference '{}' (expected ctx.<key>, last.<key>, or outcome.id)",
            name
        )))
    }
}

fn eval_expr(ctx: &Context, expr: &Expr) -> CoreResult<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Reference(name) => resolve_reference(ctx, name),
        Expr::Not(inner) => Ok(Value::Bool(!eval_expr(ctx, inner)?.is_truthy())),
        Expr::And(l, r) => {
            let lv = eval_expr(ctx, l)?.is_truthy();
            if !lv {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval_expr(ctx, r)?.is_truthy()))
        }
        Expr::Or(l, r) => {
            let lv = eval_expr(ctx, l)?.is_truthy();
            if lv {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval_expr(ctx, r)?.is_truthy()))
        }
        Expr::Compare(op, l, r) => {
            let lv = eval_expr(ctx, l)?;
            let rv = eval_expr(ctx, r)?;
            compare(*op, &lv, &rv)
        }
    }
}

fn compare(op: CompareOp, lv: &Value, rv: &Value) -> CoreResult<Value> {
    let result = match op {
        CompareOp::Eq => values_equal(lv, rv),
        CompareOp::NotEq => !values_equal(lv, rv),
        CompareOp::Lt | CompareOp::Lte | CompareOp::Gt | CompareOp::Gte => {
            let (l, r) = (
                numeric_value(lv).ok_or_else(|| {
                    CoreError::ConditionError(format!("cannot order non-numeric value {:?}", lv))
                })?,
                numeric_value(rv).ok_or_else(|| {
                    CoreError::ConditionError(format!("cannot order non-numeric value {:?}", rv))
                })?,
            );
            match op {
                CompareOp::Lt => l < r,
                CompareOp::Lte => l <= r,
                CompareOp::Gt => l > r,
                CompareOp::Gte => l >= r,
                _ => unreachable!(),
            }
        }
    };
    Ok(Value::Bool(result))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        _ => false,
    }
}

fn numeric_value(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => Some(*n),
        _ => None,
    }
}

/// Evaluates a boolean condition expression (Connection `condition` or Step
/// `conditionLogic`) against the given context.
pub fn evaluate_condition(ctx: &Context, source: &str) -> CoreResult<bool> {
    let expr = parse_expression(source)?;
    Ok(eval_expr(ctx, &expr)?.is_truthy())
}

/// A single parsed `ctx.<key> = <literal>;` assignment.
struct Assignment {
    key: String,
    value: Value,
}

fn parse_result_action(source: &str) -> CoreResult<Vec<Assignment>> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(tokens);
    let mut assignments = Vec::new();

    while parser.pos < parser.tokens.len() {
        let name = match parser.advance() {
            Some(Token::Ident(name)) => name,
            other => {
                return Err(CoreError::ConditionError(format!(
                    "expected 'ctx.<key>' at start of assignment, found {:?}",
                    other
                )))
            }
        };
        let key = name.strip_prefix("ctx.").ok_or_else(|| {
            CoreError::ConditionError(format!(
                "resultAction assignments may only target ctx.<key>, found '{}'",
                name
            ))
        })?;
        parser.expect(&Token::Assign)?;
        let value = match parser.advance() {
            Some(Token::String(s)) => Value::String(s),
            Some(Token::Number(n)) => Value::Number(n),
            Some(Token::Bool(b)) => Value::Bool(b),
            other => {
                return Err(CoreError::ConditionError(format!(
                    "expected a literal value in assignment, found {:?}",
                    other
                )))
            }
        };
        assignments.push(Assignment {
            key: key.to_string(),
            value,
        });
        match parser.peek() {
            Some(Token::Semicolon) => {
                parser.advance();
            }
            None => break,
            other => {
                return Err(CoreError::ConditionError(format!(
                    "expected ';' between assignments, found {:?}",
                    other
                )))
            }
        }
    }

    Ok(assignments)
}

/// Applies a `resultAction` assignment sequence to `executionData` in order.
/// Fails the whole application (and the decision) on any parse/type error.
pub fn apply_result_action(execution_data: &mut ValueMap, source: &str) -> CoreResult<()> {
    if source.trim().is_empty() {
        return Ok(());
    }
    let assignments = parse_result_action(source)?;
    for assignment in assignments {
        execution_data.insert(assignment.key, assignment.value);
    }
    Ok(())
}
