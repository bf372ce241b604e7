//! Restricted boolean expressions for Condition nodes
//!
//! Grammar (lowest precedence first):
//!
//! ```text
//! expr       := and ( ("||" | "or") and )*
//! and        := unary ( ("&&" | "and") unary )*
//! unary      := ("!" | "not") unary | comparison
//! comparison := primary ( ("==" | "!=" | "<" | "<=" | ">" | ">=") primary )?
//! primary    := literal | name | "${" name "}" | "(" expr ")"
//! literal    := number | 'text' | "text" | true | false
//! ```
//!
//! Names resolve against an [`ExecutionContext`]. Nothing else is reachable
//! from an expression.

use crate::core::context::ExecutionContext;
use crate::core::error::{PipelineError, Result};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Text(String),
    Number(f64),
    Bool(bool),
    And,
    Or,
    Not,
    Cmp(CmpOp),
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Scalar),
    Var(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Scalar {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Scalar {
    /// Interpret a context value: booleans and numbers are recognised,
    /// anything else stays text
    fn from_variable(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("true") {
            return Scalar::Bool(true);
        }
        if trimmed.eq_ignore_ascii_case("false") {
            return Scalar::Bool(false);
        }
        match parse_number(trimmed) {
            Some(n) => Scalar::Number(n),
            None => Scalar::Text(raw.to_string()),
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Scalar::Bool(b) => *b,
            Scalar::Number(n) => *n != 0.0,
            Scalar::Text(s) => !s.is_empty(),
        }
    }

    fn render(&self) -> String {
        match self {
            Scalar::Bool(b) => b.to_string(),
            Scalar::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Scalar::Number(n) => n.to_string(),
            Scalar::Text(s) => s.clone(),
        }
    }
}

/// Only plain decimal numbers; rejects `inf`, `nan` and friends
fn parse_number(word: &str) -> Option<f64> {
    let digits = word.strip_prefix('-').unwrap_or(word);
    let first = digits.chars().next()?;
    if !(first.is_ascii_digit() || first == '.') {
        return None;
    }
    if !digits.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    word.parse().ok()
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let syntax = |msg: String| PipelineError::Configuration(format!("condition: {}", msg));

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == quote)
                    .map(|p| start + p)
                    .ok_or_else(|| syntax(format!("unterminated string at {}", i)))?;
                tokens.push(Token::Text(chars[start..end].iter().collect()));
                i = end + 1;
            }
            '$' if chars.get(i + 1) == Some(&'{') => {
                let start = i + 2;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == '}')
                    .map(|p| start + p)
                    .ok_or_else(|| syntax(format!("unterminated placeholder at {}", i)))?;
                let name: String = chars[start..end].iter().collect();
                if name.is_empty() || !name.chars().all(is_word_char) {
                    return Err(syntax(format!("invalid placeholder '${{{}}}'", name)));
                }
                tokens.push(Token::Name(name));
                i = end + 1;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(syntax(format!("expected '{0}{0}' at {1}", c, i)));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '=' | '!' | '<' | '>' => {
                let next_is_eq = chars.get(i + 1) == Some(&'=');
                let token = match (c, next_is_eq) {
                    ('=', true) => Token::Cmp(CmpOp::Eq),
                    ('!', true) => Token::Cmp(CmpOp::Ne),
                    ('<', true) => Token::Cmp(CmpOp::Le),
                    ('>', true) => Token::Cmp(CmpOp::Ge),
                    ('<', false) => Token::Cmp(CmpOp::Lt),
                    ('>', false) => Token::Cmp(CmpOp::Gt),
                    ('!', false) => Token::Not,
                    _ => return Err(syntax(format!("unexpected '=' at {}", i))),
                };
                i += if next_is_eq { 2 } else { 1 };
                tokens.push(token);
            }
            c if is_word_char(c) => {
                let start = i;
                while i < chars.len() && is_word_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.to_ascii_lowercase().as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => match parse_number(&word) {
                        Some(n) => Token::Number(n),
                        None => Token::Name(word),
                    },
                };
                tokens.push(token);
            }
            other => return Err(syntax(format!("unexpected character '{}' at {}", other, i))),
        }
    }

    Ok(tokens)
}

/// Deepest allowed nesting of parentheses and `not`
const MAX_NESTING: usize = 64;
/// Longest accepted expression, in tokens; bounds the depth of operator chains
const MAX_TOKENS: usize = 1024;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn error(&self, msg: &str) -> PipelineError {
        PipelineError::Configuration(format!("condition: {} (token {})", msg, self.pos))
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(PipelineError::Configuration(format!(
                "condition: nesting deeper than {} levels",
                MAX_NESTING
            )));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.enter()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_primary()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::Bool(b)) => Ok(Expr::Literal(Scalar::Bool(b))),
            Some(Token::Number(n)) => Ok(Expr::Literal(Scalar::Number(n))),
            Some(Token::Text(s)) => Ok(Expr::Literal(Scalar::Text(s))),
            Some(Token::Name(name)) => Ok(Expr::Var(name)),
            Some(Token::LParen) => {
                self.enter()?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            Some(_) => Err(self.error("expected a value")),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

/// A parsed condition expression
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse an expression; syntax problems are configuration errors
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(PipelineError::Configuration(
                "condition: expression is empty".to_string(),
            ));
        }
        if tokens.len() > MAX_TOKENS {
            return Err(PipelineError::Configuration(format!(
                "condition: expression longer than {} tokens",
                MAX_TOKENS
            )));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_or()?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against `ctx`; unknown names and ill-typed comparisons are
    /// execution errors
    pub fn evaluate(&self, ctx: &ExecutionContext) -> Result<bool> {
        Ok(eval(&self.expr, ctx)?.truthy())
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn eval(expr: &Expr, ctx: &ExecutionContext) -> Result<Scalar> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Var(name) => ctx
            .get(name)
            .map(Scalar::from_variable)
            .ok_or_else(|| PipelineError::Execution(format!("condition: unknown variable '{}'", name))),
        Expr::Not(inner) => Ok(Scalar::Bool(!eval(inner, ctx)?.truthy())),
        Expr::And(l, r) => {
            let result = eval(l, ctx)?.truthy() && eval(r, ctx)?.truthy();
            Ok(Scalar::Bool(result))
        }
        Expr::Or(l, r) => {
            let result = eval(l, ctx)?.truthy() || eval(r, ctx)?.truthy();
            Ok(Scalar::Bool(result))
        }
        Expr::Compare(op, l, r) => {
            let left = eval(l, ctx)?;
            let right = eval(r, ctx)?;
            compare(*op, &left, &right).map(Scalar::Bool)
        }
    }
}

fn compare(op: CmpOp, left: &Scalar, right: &Scalar) -> Result<bool> {
    let ordering = match (left, right) {
        (Scalar::Number(a), Scalar::Number(b)) => a.partial_cmp(b),
        (Scalar::Bool(a), Scalar::Bool(b)) => {
            return match op {
                CmpOp::Eq => Ok(a == b),
                CmpOp::Ne => Ok(a != b),
                _ => Err(PipelineError::Execution(
                    "condition: booleans cannot be ordered".to_string(),
                )),
            };
        }
        (Scalar::Text(a), Scalar::Text(b)) => Some(a.cmp(b)),
        // Mixed kinds compare by their text form
        (a, b) => {
            return match op {
                CmpOp::Eq => Ok(a.render() == b.render()),
                CmpOp::Ne => Ok(a.render() != b.render()),
                _ => Err(PipelineError::Execution(format!(
                    "condition: cannot order '{}' against '{}'",
                    a.render(),
                    b.render()
                ))),
            };
        }
    };

    let ordering = ordering
        .ok_or_else(|| PipelineError::Execution("condition: incomparable numbers".to_string()))?;
    Ok(match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    })
}
