//! Query predicates.
//!
//! Supported grammar, shared by the structured [`Filter`] and raw filter strings:
//!
//! ```text
//! expr       := or
//! or         := and ("or" and)*
//! and        := unary ("and" unary)*
//! unary      := "not" unary | "(" expr ")" | comparison
//! comparison := property ("eq" | "ne" | "gt" | "ge" | "lt" | "le") literal
//! literal    := 'text' | true | false | 42 | 42L | 4.2 | datetime'..' | guid'..' | X'0aff'
//! ```

use std::cmp::Ordering;

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::{
    Error,
    entity::{EntityRecord, PARTITION_KEY, PropertyValue, ROW_KEY, TIMESTAMP},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Gt => "gt",
            CompareOp::Ge => "ge",
            CompareOp::Lt => "lt",
            CompareOp::Le => "le",
        }
    }

    fn parse(word: &str) -> Option<Self> {
        Some(match word {
            "eq" => CompareOp::Eq,
            "ne" => CompareOp::Ne,
            "gt" => CompareOp::Gt,
            "ge" => CompareOp::Ge,
            "lt" => CompareOp::Lt,
            "le" => CompareOp::Le,
            _ => return None,
        })
    }

    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Compare {
        property: String,
        op: CompareOp,
        value: PropertyValue,
    },
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

/// A property reference used to build comparisons.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    name: String,
}

macro_rules! column_ops {
    ($($method:ident => $op:ident),+) => {
        $(
            pub fn $method(&self, value: impl Into<PropertyValue>) -> Filter {
                self.compare(CompareOp::$op, value)
            }
        )+
    };
}

impl Column {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn partition_key() -> Self {
        Self::new(PARTITION_KEY)
    }

    pub fn row_key() -> Self {
        Self::new(ROW_KEY)
    }

    pub fn timestamp() -> Self {
        Self::new(TIMESTAMP)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compare(&self, op: CompareOp, value: impl Into<PropertyValue>) -> Filter {
        Filter::Compare {
            property: self.name.clone(),
            op,
            value: value.into(),
        }
    }

    column_ops!(eq => Eq, ne => Ne, gt => Gt, ge => Ge, lt => Lt, le => Le);
}

impl Filter {
    pub fn and(self, other: Filter) -> Filter {
        Filter::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Filter) -> Filter {
        Filter::Or(Box::new(self), Box::new(other))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Filter {
        Filter::Not(Box::new(self))
    }

    /// Renders the server-native filter string.
    pub fn to_filter_string(&self) -> String {
        let mut out = String::new();
        self.render(&mut out);
        out
    }

    fn render(&self, out: &mut String) {
        match self {
            Filter::Compare {
                property,
                op,
                value,
            } => {
                out.push_str(property);
                out.push(' ');
                out.push_str(op.as_str());
                out.push(' ');
                render_literal(value, out);
            }
            Filter::And(left, right) => {
                render_operand(left, matches!(**left, Filter::Or(..)), out);
                out.push_str(" and ");
                render_operand(right, matches!(**right, Filter::Or(..)), out);
            }
            Filter::Or(left, right) => {
                left.render(out);
                out.push_str(" or ");
                right.render(out);
            }
            Filter::Not(inner) => {
                out.push_str("not ");
                render_operand(inner, true, out);
            }
        }
    }

    pub fn parse(input: &str) -> Result<Filter, Error> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            len: input.len(),
        };
        let filter = parser.parse_or()?;
        if let Some((offset, token)) = parser.tokens.get(parser.pos) {
            return Err(Error::InvalidFilter {
                offset: *offset,
                message: format!("unexpected {token:?}"),
            });
        }
        Ok(filter)
    }

    pub fn matches(&self, record: &EntityRecord) -> bool {
        match self {
            Filter::Compare {
                property,
                op,
                value,
            } => record
                .property(property)
                .and_then(|actual| compare_values(&actual, value))
                .is_some_and(|ordering| op.holds(ordering)),
            Filter::And(left, right) => left.matches(record) && right.matches(record),
            Filter::Or(left, right) => left.matches(record) || right.matches(record),
            Filter::Not(inner) => !inner.matches(record),
        }
    }
}

fn render_operand(filter: &Filter, parenthesize: bool, out: &mut String) {
    if parenthesize {
        out.push('(');
        filter.render(out);
        out.push(')');
    } else {
        filter.render(out);
    }
}

/// Double literals outside the finite range.
const INFINITY: &str = "INF";
const NAN: &str = "NaN";

fn render_literal(value: &PropertyValue, out: &mut String) {
    match value {
        PropertyValue::String(s) => {
            out.push('\'');
            out.push_str(&s.replace('\'', "''"));
            out.push('\'');
        }
        PropertyValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        PropertyValue::Int32(n) => out.push_str(&n.to_string()),
        PropertyValue::Int64(n) => {
            out.push_str(&n.to_string());
            out.push('L');
        }
        PropertyValue::Double(d) if d.is_nan() => out.push_str(NAN),
        PropertyValue::Double(d) if d.is_infinite() => {
            if d.is_sign_negative() {
                out.push('-');
            }
            out.push_str(INFINITY);
        }
        PropertyValue::Double(d) => out.push_str(&format!("{d:?}")),
        PropertyValue::DateTime(dt) => {
            out.push_str("datetime'");
            out.push_str(&dt.to_rfc3339_opts(SecondsFormat::AutoSi, true));
            out.push('\'');
        }
        PropertyValue::Guid(g) => {
            out.push_str("guid'");
            out.push_str(&g.to_string());
            out.push('\'');
        }
        PropertyValue::Binary(bytes) => {
            out.push_str("X'");
            out.push_str(&hex::encode(bytes));
            out.push('\'');
        }
    }
}

/// Orders two values when they are comparable. Integers and doubles compare
/// numerically; every other pairing requires identical types.
fn compare_values(actual: &PropertyValue, expected: &PropertyValue) -> Option<Ordering> {
    use PropertyValue::*;
    match (actual, expected) {
        (String(a), String(b)) => Some(a.as_str().cmp(b.as_str())),
        (Bool(a), Bool(b)) => Some(a.cmp(b)),
        (Int32(a), Int32(b)) => Some(a.cmp(b)),
        (Int64(a), Int64(b)) => Some(a.cmp(b)),
        (Int32(a), Int64(b)) => Some(i64::from(*a).cmp(b)),
        (Int64(a), Int32(b)) => Some(a.cmp(&i64::from(*b))),
        (Double(a), Double(b)) => a.partial_cmp(b),
        (Double(a), Int32(b)) => a.partial_cmp(&f64::from(*b)),
        (Int32(a), Double(b)) => f64::from(*a).partial_cmp(b),
        (Double(a), Int64(b)) => a.partial_cmp(&(*b as f64)),
        (Int64(a), Double(b)) => (*a as f64).partial_cmp(b),
        (DateTime(a), DateTime(b)) => Some(a.cmp(b)),
        (Guid(a), Guid(b)) => Some(a.cmp(b)),
        (Binary(a), Binary(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// What a query selects: everything, a structured filter, or a raw filter string.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Query {
    #[default]
    All,
    Filter(Filter),
    Raw(String),
}

impl Query {
    /// The filter string handed to the storage client, `None` for everything.
    pub fn to_filter_string(&self) -> Option<String> {
        match self {
            Query::All => None,
            Query::Filter(filter) => Some(filter.to_filter_string()),
            Query::Raw(raw) if raw.trim().is_empty() => None,
            Query::Raw(raw) => Some(raw.clone()),
        }
    }
}

impl From<Filter> for Query {
    fn from(filter: Filter) -> Self {
        Query::Filter(filter)
    }
}

impl From<String> for Query {
    fn from(raw: String) -> Self {
        Query::Raw(raw)
    }
}

impl From<&str> for Query {
    fn from(raw: &str) -> Self {
        Query::Raw(raw.to_string())
    }
}

impl From<&String> for Query {
    fn from(raw: &String) -> Self {
        Query::Raw(raw.clone())
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Literal(PropertyValue),
    Open,
    Close,
}

fn filter_error(offset: usize, message: impl Into<String>) -> Error {
    Error::InvalidFilter {
        offset,
        message: message.into(),
    }
}

/// Reads a quoted body starting after the opening quote; `''` escapes a quote.
fn read_quoted(input: &str, start: usize) -> Result<(String, usize), Error> {
    let bytes = input.as_bytes();
    let mut text = String::new();
    let mut i = start;
    loop {
        let Some(rest) = input.get(i..) else {
            return Err(filter_error(start, "unterminated quoted literal"));
        };
        let Some(quote) = rest.find('\'') else {
            return Err(filter_error(start, "unterminated quoted literal"));
        };
        text.push_str(&rest[..quote]);
        i += quote + 1;
        if bytes.get(i) == Some(&b'\'') {
            text.push('\'');
            i += 1;
        } else {
            return Ok((text, i));
        }
    }
}

fn typed_literal(prefix: &str, body: &str, offset: usize) -> Result<PropertyValue, Error> {
    match prefix.to_ascii_lowercase().as_str() {
        "datetime" => DateTime::parse_from_rfc3339(body)
            .map(|dt| PropertyValue::DateTime(dt.with_timezone(&Utc)))
            .map_err(|e| filter_error(offset, format!("invalid datetime {body:?}: {e}"))),
        "guid" => Uuid::parse_str(body)
            .map(PropertyValue::Guid)
            .map_err(|e| filter_error(offset, format!("invalid guid {body:?}: {e}"))),
        "x" | "binary" => hex::decode(body)
            .map(PropertyValue::Binary)
            .map_err(|e| filter_error(offset, format!("invalid binary {body:?}: {e}"))),
        other => Err(filter_error(offset, format!("unknown literal prefix {other:?}"))),
    }
}

fn number_literal(text: &str, offset: usize) -> Result<PropertyValue, Error> {
    if text.strip_prefix('-') == Some(INFINITY) {
        return Ok(PropertyValue::Double(f64::NEG_INFINITY));
    }
    let invalid = || filter_error(offset, format!("invalid number {text:?}"));
    if let Some(digits) = text.strip_suffix(['L', 'l']) {
        return digits.parse().map(PropertyValue::Int64).map_err(|_| invalid());
    }
    if text.contains(['.', 'e', 'E']) {
        return text.parse().map(PropertyValue::Double).map_err(|_| invalid());
    }
    text.parse().map(PropertyValue::Int32).map_err(|_| invalid())
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, Error> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'(' => {
                tokens.push((i, Token::Open));
                i += 1;
            }
            b')' => {
                tokens.push((i, Token::Close));
                i += 1;
            }
            b'\'' => {
                let (text, next) = read_quoted(input, i + 1)?;
                tokens.push((i, Token::Literal(PropertyValue::String(text))));
                i = next;
            }
            b'-' | b'0'..=b'9' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric()
                        || bytes[i] == b'.'
                        || (matches!(bytes[i], b'+' | b'-')
                            && matches!(bytes[i - 1], b'e' | b'E')))
                {
                    i += 1;
                }
                tokens.push((start, Token::Literal(number_literal(&input[start..i], start)?)));
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || matches!(bytes[i], b'_' | b'.'))
                {
                    i += 1;
                }
                let word = &input[start..i];
                if bytes.get(i) == Some(&b'\'') {
                    let (body, next) = read_quoted(input, i + 1)?;
                    tokens.push((start, Token::Literal(typed_literal(word, &body, start)?)));
                    i = next;
                } else if word == "true" || word == "false" {
                    tokens.push((start, Token::Literal(PropertyValue::Bool(word == "true"))));
                } else if word == INFINITY {
                    tokens.push((start, Token::Literal(PropertyValue::Double(f64::INFINITY))));
                } else if word == NAN {
                    tokens.push((start, Token::Literal(PropertyValue::Double(f64::NAN))));
                } else {
                    tokens.push((start, Token::Ident(word.to_string())));
                }
            }
            _ => {
                return Err(filter_error(
                    i,
                    format!("unexpected character {:?}", input[i..].chars().next()),
                ));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.len)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(word)) if word == keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Filter, Error> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") {
            left = left.or(self.parse_and()?);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Filter, Error> {
        let mut left = self.parse_unary()?;
        while self.eat_keyword("and") {
            left = left.and(self.parse_unary()?);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Filter, Error> {
        if self.eat_keyword("not") {
            return Ok(self.parse_unary()?.not());
        }
        let offset = self.offset();
        match self.next() {
            Some(Token::Open) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(filter_error(self.offset(), "expected ')'")),
                }
            }
            Some(Token::Ident(property)) => {
                let op_offset = self.offset();
                let op = match self.next() {
                    Some(Token::Ident(word)) => CompareOp::parse(&word),
                    _ => None,
                }
                .ok_or_else(|| filter_error(op_offset, "expected a comparison operator"))?;
                let value_offset = self.offset();
                match self.next() {
                    Some(Token::Literal(value)) => Ok(Filter::Compare {
                        property,
                        op,
                        value,
                    }),
                    _ => Err(filter_error(value_offset, "expected a literal")),
                }
            }
            _ => Err(filter_error(offset, "expected a comparison")),
        }
    }
}
