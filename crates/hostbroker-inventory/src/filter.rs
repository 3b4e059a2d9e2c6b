//! Inventory filter expressions
//!
//! A filter is a `|`-separated chain of stages applied left to right:
//!
//! - `@inv.<path> <op> <literal>` keeps entries for which the comparison holds.
//!   Operators: `==`, `!=`, `<`, `<=`, `>`, `>=`, `in`, `not in`. Comparisons
//!   can be combined with `and`, `or` and `not`. A bare `@inv.<path>` keeps
//!   entries where the value is truthy.
//! - `@inv[i]` picks one entry; `@inv[a:b]` slices. Negative indices count
//!   from the end.
//!
//! ```
//! use hostbroker_inventory::Filter;
//!
//! let filter: Filter = r#"@inv._broker_provider == "Container" | @inv[-1]"#.parse().unwrap();
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::entry::InventoryEntry;
use crate::error::InventoryError;

const FILTER_KEY: &str = "@inv";

/// Parsed filter chain
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    source: String,
    stages: Vec<Stage>,
}

#[derive(Debug, Clone, PartialEq)]
enum Stage {
    Index(i64),
    Slice(Option<i64>, Option<i64>),
    Where(Expr),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Operand, Op, Operand),
    Truthy(Operand),
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Field(String),
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl Filter {
    /// Parse a filter expression
    ///
    /// # Errors
    /// Returns `InventoryError::InvalidFilter` describing the first problem found
    pub fn parse(source: &str) -> Result<Self, InventoryError> {
        let invalid = |message: String| InventoryError::InvalidFilter {
            filter: source.to_string(),
            message,
        };

        let mut stages = Vec::new();
        for segment in split_stages(source) {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            stages.push(parse_stage(segment).map_err(invalid)?);
        }

        if stages.is_empty() {
            return Err(invalid("empty filter".to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            stages,
        })
    }

    /// Run the chain over `entries`
    #[must_use]
    pub fn apply(&self, entries: Vec<InventoryEntry>) -> Vec<InventoryEntry> {
        self.stages
            .iter()
            .fold(entries, |entries, stage| stage.apply(entries))
    }

    /// Whether a single entry passes every predicate stage
    ///
    /// Index and slice stages are ignored, since they depend on the list.
    #[must_use]
    pub fn matches(&self, entry: &InventoryEntry) -> bool {
        self.stages.iter().all(|stage| match stage {
            Stage::Where(expr) => expr.eval(entry),
            Stage::Index(_) | Stage::Slice(..) => true,
        })
    }
}

impl FromStr for Filter {
    type Err = InventoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ============================================================================
// Evaluation
// ============================================================================

impl Stage {
    fn apply(&self, entries: Vec<InventoryEntry>) -> Vec<InventoryEntry> {
        let len = entries.len();
        match self {
            Stage::Index(i) => match resolve_index(*i, len) {
                Some(idx) if idx < len => entries.into_iter().nth(idx).into_iter().collect(),
                _ => Vec::new(),
            },
            Stage::Slice(start, end) => {
                let start = start.map_or(0, |s| clamp_index(s, len));
                let end = end.map_or(len, |e| clamp_index(e, len));
                if start >= end {
                    return Vec::new();
                }
                entries.into_iter().skip(start).take(end - start).collect()
            }
            Stage::Where(expr) => entries.into_iter().filter(|e| expr.eval(e)).collect(),
        }
    }
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    if index < 0 {
        len.checked_sub(usize::try_from(index.unsigned_abs()).ok()?)
    } else {
        usize::try_from(index).ok()
    }
}

fn clamp_index(index: i64, len: usize) -> usize {
    resolve_index(index, len).map_or(0, |i| i.min(len))
}

impl Expr {
    fn eval(&self, entry: &InventoryEntry) -> bool {
        match self {
            Expr::Or(a, b) => a.eval(entry) || b.eval(entry),
            Expr::And(a, b) => a.eval(entry) && b.eval(entry),
            Expr::Not(inner) => !inner.eval(entry),
            Expr::Truthy(operand) => truthy(&operand.resolve(entry)),
            Expr::Compare(lhs, op, rhs) => {
                let lhs = lhs.resolve(entry);
                let rhs = rhs.resolve(entry);
                match op {
                    Op::Eq => loose_eq(&lhs, &rhs),
                    Op::Ne => !loose_eq(&lhs, &rhs),
                    Op::Lt => compare(&lhs, &rhs) == Some(Ordering::Less),
                    Op::Le => matches!(compare(&lhs, &rhs), Some(Ordering::Less | Ordering::Equal)),
                    Op::Gt => compare(&lhs, &rhs) == Some(Ordering::Greater),
                    Op::Ge => matches!(
                        compare(&lhs, &rhs),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                    Op::In => contains(&rhs, &lhs),
                    Op::NotIn => !contains(&rhs, &lhs),
                }
            }
        }
    }
}

impl Operand {
    fn resolve(&self, entry: &InventoryEntry) -> Value {
        match self {
            Operand::Field(path) => entry.get_path(path).cloned().unwrap_or(Value::Null),
            Operand::Literal(value) => value.clone(),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
        (Value::Array(items), n) => items.iter().any(|item| loose_eq(item, n)),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Split on `|` outside of quotes
fn split_stages(source: &str) -> Vec<&str> {
    let mut stages = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in source.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (None, '"' | '\'') => quote = Some(c),
            (None, '|') => {
                stages.push(&source[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    stages.push(&source[start..]);
    stages
}

fn parse_stage(segment: &str) -> Result<Stage, String> {
    if let Some(rest) = segment.strip_prefix(FILTER_KEY)
        && let Some(inner) = rest.trim_start().strip_prefix('[')
    {
        let inner = inner
            .trim_end()
            .strip_suffix(']')
            .ok_or_else(|| format!("unclosed '[' in {segment:?}"))?;
        return parse_selection(inner.trim());
    }

    let tokens = tokenize(segment)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("unexpected {:?}", parser.tokens[parser.pos]));
    }
    if !expr.references_field() {
        return Err(format!("{segment:?} does not reference {FILTER_KEY}"));
    }
    Ok(Stage::Where(expr))
}

fn parse_selection(inner: &str) -> Result<Stage, String> {
    let parse_bound = |s: &str| -> Result<Option<i64>, String> {
        let s = s.trim();
        if s.is_empty() {
            Ok(None)
        } else {
            s.parse()
                .map(Some)
                .map_err(|_| format!("invalid index {s:?}"))
        }
    };

    match inner.split_once(':') {
        Some((start, end)) => Ok(Stage::Slice(parse_bound(start)?, parse_bound(end)?)),
        None => parse_bound(inner)?
            .map(Stage::Index)
            .ok_or_else(|| "empty index".to_string()),
    }
}

impl Expr {
    fn references_field(&self) -> bool {
        match self {
            Expr::Or(a, b) | Expr::And(a, b) => a.references_field() || b.references_field(),
            Expr::Not(inner) => inner.references_field(),
            Expr::Truthy(o) => matches!(o, Operand::Field(_)),
            Expr::Compare(a, _, b) => {
                matches!(a, Operand::Field(_)) || matches!(b, Operand::Field(_))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(String),
    Literal(Value),
    Op(Op),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

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
            '"' | '\'' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&x| x == c)
                    .ok_or_else(|| "unterminated string".to_string())?;
                let text: String = chars[i + 1..i + 1 + end].iter().collect();
                tokens.push(Token::Literal(Value::String(text)));
                i += end + 2;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (op, width) = match (c, next) {
                    ('=', Some('=')) => (Op::Eq, 2),
                    ('!', Some('=')) => (Op::Ne, 2),
                    ('<', Some('=')) => (Op::Le, 2),
                    ('>', Some('=')) => (Op::Ge, 2),
                    ('<', _) => (Op::Lt, 1),
                    ('>', _) => (Op::Gt, 1),
                    _ => return Err(format!("unknown operator at {:?}", &input[byte_offset(&chars, i)..])),
                };
                tokens.push(Token::Op(op));
                i += width;
            }
            _ => {
                let start = i;
                while i < chars.len()
                    && !chars[i].is_whitespace()
                    && !matches!(chars[i], '(' | ')' | '=' | '!' | '<' | '>' | '"' | '\'')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(word_token(&word)?);
            }
        }
    }

    // fold "not in" into one operator
    let mut folded: Vec<Token> = Vec::with_capacity(tokens.len());
    for token in tokens {
        if token == Token::Op(Op::In) && folded.last() == Some(&Token::Not) {
            folded.pop();
            folded.push(Token::Op(Op::NotIn));
        } else {
            folded.push(token);
        }
    }
    Ok(folded)
}

fn byte_offset(chars: &[char], idx: usize) -> usize {
    chars[..idx].iter().map(|c| c.len_utf8()).sum()
}

fn word_token(word: &str) -> Result<Token, String> {
    if let Some(path) = word.strip_prefix(FILTER_KEY) {
        let path = path
            .strip_prefix('.')
            .filter(|p| !p.is_empty())
            .ok_or_else(|| format!("expected {FILTER_KEY}.<field>, got {word:?}"))?;
        return Ok(Token::Field(path.to_string()));
    }

    Ok(match word {
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "in" => Token::Op(Op::In),
        "true" | "True" => Token::Literal(Value::Bool(true)),
        "false" | "False" => Token::Literal(Value::Bool(false)),
        "null" | "None" => Token::Literal(Value::Null),
        _ => {
            if let Ok(n) = word.parse::<i64>() {
                Token::Literal(Value::from(n))
            } else if let Ok(f) = word.parse::<f64>() {
                Token::Literal(Value::from(f))
            } else {
                return Err(format!("unexpected word {word:?}"));
            }
        }
    })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
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

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut expr = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            expr = Expr::Or(Box::new(expr), Box::new(self.parse_and()?));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut expr = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            expr = Expr::And(Box::new(expr), Box::new(self.parse_not()?));
        }
        Ok(expr)
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let expr = self.parse_or()?;
            return match self.next() {
                Some(Token::RParen) => Ok(expr),
                _ => Err("expected ')'".to_string()),
            };
        }

        let lhs = self.parse_operand()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let rhs = self.parse_operand()?;
            Ok(Expr::Compare(lhs, op, rhs))
        } else {
            Ok(Expr::Truthy(lhs))
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, String> {
        match self.next() {
            Some(Token::Field(path)) => Ok(Operand::Field(path)),
            Some(Token::Literal(value)) => Ok(Operand::Literal(value)),
            Some(other) => Err(format!("expected a value, got {other:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}
