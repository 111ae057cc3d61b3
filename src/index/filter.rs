//! Tag filter expressions.
//!
//! # Overview
//!
//! A filter selects entities by their `category:value` tags:
//!
//! - `class:lake` matches an entity having exactly that tag
//! - `class:lake*` matches any tag starting with `class:lake`
//! - `AND`, `OR` and `NOT` combine terms (keywords are case-insensitive,
//!   `NOT` binds tighter than `AND`, which binds tighter than `OR`)
//! - parentheses group sub-expressions
//! - `"class:big lake"` quotes a term containing spaces; `\` escapes the
//!   next character inside quotes
//!
//! Matching ignores ASCII case. The empty expression matches every entity.
//!
//! A parsed [`TagFilter`] can be evaluated in memory with
//! [`TagFilter::matches`] or compiled to SQL with [`TagFilter::to_sql`];
//! both give the same answer for the same tags.
//!
//! # Example
//!
//! ```
//! use tagstore::index::TagFilter;
//! use tagstore::model::Tag;
//!
//! let filter = TagFilter::parse("(class:lake OR class:river) AND NOT meta:deleted").unwrap();
//! assert!(filter.matches(&[Tag::new("class", "Lake")]));
//! assert!(!filter.matches(&[Tag::new("class", "lake"), Tag::new("meta", "deleted")]));
//! ```

use regex::Regex;
use std::fmt;
use thiserror::Error;

use crate::model::Tag;

/// Errors raised while parsing a filter expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// A quoted term was not closed.
    #[error("unterminated quoted term starting at position {0}")]
    UnterminatedQuote(usize),

    /// A character outside the term alphabet appeared unquoted.
    #[error("unexpected character {ch:?} at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    /// A token appeared where it is not allowed.
    #[error("unexpected {found} at position {pos}")]
    UnexpectedToken { found: String, pos: usize },

    /// The expression ended in the middle of a term or group.
    #[error("unexpected end of expression")]
    UnexpectedEnd,

    /// Groups or `NOT`s are nested beyond [`MAX_NESTING`].
    #[error("expression nests deeper than {MAX_NESTING} levels at position {0}")]
    TooDeep(usize),
}

/// Maximum nesting of parentheses and `NOT` operators.
pub const MAX_NESTING: usize = 64;

/// One tag pattern, stored lowercased.
#[derive(Debug, Clone)]
pub struct TagPattern {
    pattern: String,
    wildcard: bool,
    regex: Option<Regex>,
}

impl TagPattern {
    /// Build a pattern; `*` anywhere makes it a wildcard pattern.
    #[must_use]
    pub fn new(pattern: &str) -> Self {
        let pattern = pattern.to_ascii_lowercase();
        let wildcard = pattern.contains('*');
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = if wildcard {
            Regex::new(&format!("(?s)^{}$", body)).ok()
        } else {
            None
        };
        Self {
            pattern,
            wildcard,
            regex,
        }
    }

    /// The lowercased pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// Whether a full `category:value` tag string matches.
    #[must_use]
    pub fn matches_str(&self, tag: &str) -> bool {
        let tag = tag.to_ascii_lowercase();
        match &self.regex {
            Some(re) => re.is_match(&tag),
            None => tag == self.pattern,
        }
    }

    /// SQL `LIKE` pattern equivalent to this wildcard, using `\` as escape.
    #[must_use]
    pub fn like_pattern(&self) -> String {
        let mut out = String::with_capacity(self.pattern.len() + 4);
        for ch in self.pattern.chars() {
            match ch {
                '*' => out.push('%'),
                '%' | '_' | '\\' => {
                    out.push('\\');
                    out.push(ch);
                }
                _ => out.push(ch),
            }
        }
        out
    }
}

impl PartialEq for TagPattern {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for TagPattern {}

/// Parsed filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagFilter {
    /// Matches every entity (the empty expression).
    Any,
    /// At least one tag matches the pattern.
    Term(TagPattern),
    Not(Box<TagFilter>),
    /// Every operand matches. Always holds two or more operands.
    And(Vec<TagFilter>),
    /// At least one operand matches. Always holds two or more operands.
    Or(Vec<TagFilter>),
}

/// SQL expression fragment testing one tag of media row `m`.
const TAG_EXPR: &str = "lower(t.category || ':' || t.value)";

/// Expression-tree height SQLite sees for one compiled term.
const TERM_SQL_DEPTH: usize = 8;

impl TagFilter {
    /// Parse a filter expression.
    ///
    /// # Errors
    ///
    /// Returns a [`FilterError`] describing the first syntax error.
    pub fn parse(expression: &str) -> Result<Self, FilterError> {
        let tokens = tokenize(expression)?;
        if tokens.is_empty() {
            return Ok(Self::Any);
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let filter = parser.parse_or()?;
        match parser.tokens.get(parser.pos) {
            None => Ok(filter),
            Some((token, pos)) => Err(FilterError::UnexpectedToken {
                found: token.describe(),
                pos: *pos,
            }),
        }
    }

    /// Evaluate against the tags of one entity.
    #[must_use]
    pub fn matches(&self, tags: &[Tag]) -> bool {
        match self {
            Self::Any => true,
            Self::Term(pattern) => tags.iter().any(|t| pattern.matches_str(&t.full())),
            Self::Not(inner) => !inner.matches(tags),
            Self::And(operands) => operands.iter().all(|f| f.matches(tags)),
            Self::Or(operands) => operands.iter().any(|f| f.matches(tags)),
        }
    }

    /// Number of bound parameters [`TagFilter::to_sql`] produces.
    #[must_use]
    pub fn term_count(&self) -> usize {
        match self {
            Self::Any => 0,
            Self::Term(_) => 1,
            Self::Not(inner) => inner.term_count(),
            Self::And(operands) | Self::Or(operands) => {
                operands.iter().map(Self::term_count).sum()
            }
        }
    }

    /// Approximate height of the SQL expression tree of [`TagFilter::to_sql`].
    ///
    /// Long `AND`/`OR` chains are emitted as balanced trees, so each chain
    /// adds only the base-2 logarithm of its length.
    #[must_use]
    pub fn sql_depth(&self) -> usize {
        match self {
            Self::Any => 1,
            Self::Term(_) => TERM_SQL_DEPTH,
            Self::Not(inner) => inner.sql_depth() + 1,
            Self::And(operands) | Self::Or(operands) => {
                let deepest = operands.iter().map(Self::sql_depth).max().unwrap_or(1);
                let levels = operands.len().max(1).next_power_of_two().trailing_zeros() as usize;
                deepest + levels
            }
        }
    }

    /// Compile to a SQL boolean expression over a `media` row aliased `m`.
    ///
    /// Bound values are appended to `params` in placeholder order.
    pub fn to_sql(&self, params: &mut Vec<String>) -> String {
        match self {
            Self::Any => "1".to_string(),
            Self::Term(pattern) => {
                let cmp = if pattern.is_wildcard() {
                    params.push(pattern.like_pattern());
                    format!("{} LIKE ? ESCAPE '\\'", TAG_EXPR)
                } else {
                    params.push(pattern.as_str().to_string());
                    format!("{} = ?", TAG_EXPR)
                };
                format!(
                    "EXISTS (SELECT 1 FROM tags t WHERE t.media_id = m.id AND {})",
                    cmp
                )
            }
            Self::Not(inner) => format!("NOT ({})", inner.to_sql(params)),
            Self::And(operands) => join_balanced(&compile_all(operands, params), "AND"),
            Self::Or(operands) => join_balanced(&compile_all(operands, params), "OR"),
        }
    }
}

fn compile_all(operands: &[TagFilter], params: &mut Vec<String>) -> Vec<String> {
    operands.iter().map(|f| f.to_sql(params)).collect()
}

/// Join `parts` with `op`, parenthesized as a balanced binary tree.
///
/// Operand order is preserved so placeholders stay aligned with their params.
fn join_balanced(parts: &[String], op: &str) -> String {
    match parts {
        [] => "1".to_string(),
        [single] => single.clone(),
        _ => {
            let (left, right) = parts.split_at(parts.len() / 2);
            format!(
                "({} {} {})",
                join_balanced(left, op),
                op,
                join_balanced(right, op)
            )
        }
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => Ok(()),
            Self::Term(p) => {
                if !p.as_str().is_empty() && p.as_str().chars().all(is_term_char) && !is_keyword(p.as_str()) {
                    f.write_str(p.as_str())
                } else {
                    f.write_str("\"")?;
                    for ch in p.as_str().chars() {
                        if ch == '"' || ch == '\\' {
                            f.write_str("\\")?;
                        }
                        write!(f, "{}", ch)?;
                    }
                    f.write_str("\"")
                }
            }
            Self::Not(inner) => write!(f, "NOT {}", Grouped(inner)),
            Self::And(operands) => write_joined(f, operands, " AND "),
            Self::Or(operands) => write_joined(f, operands, " OR "),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, operands: &[TagFilter], sep: &str) -> fmt::Result {
    for (i, operand) in operands.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{}", Grouped(operand))?;
    }
    Ok(())
}

/// Parenthesizes compound sub-expressions when displayed.
struct Grouped<'a>(&'a TagFilter);

impl fmt::Display for Grouped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            TagFilter::And(..) | TagFilter::Or(..) => write!(f, "({})", self.0),
            other => write!(f, "{}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Term(String),
    And,
    Or,
    Not,
    Open,
    Close,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Term(t) => format!("term {:?}", t),
            Self::And => "AND".to_string(),
            Self::Or => "OR".to_string(),
            Self::Not => "NOT".to_string(),
            Self::Open => "'('".to_string(),
            Self::Close => "')'".to_string(),
        }
    }
}

fn is_term_char(ch: char) -> bool {
    ch.is_alphanumeric() || matches!(ch, ':' | '*' | '-' | '_')
}

fn is_keyword(word: &str) -> bool {
    ["and", "or", "not"]
        .iter()
        .any(|k| word.eq_ignore_ascii_case(k))
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, FilterError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, ch)) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
        } else if ch == '(' {
            chars.next();
            tokens.push((Token::Open, pos));
        } else if ch == ')' {
            chars.next();
            tokens.push((Token::Close, pos));
        } else if ch == '"' {
            chars.next();
            let mut term = String::new();
            let mut closed = false;
            while let Some((_, c)) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some((_, escaped)) => term.push(escaped),
                        None => break,
                    },
                    '"' => {
                        closed = true;
                        break;
                    }
                    _ => term.push(c),
                }
            }
            if !closed {
                return Err(FilterError::UnterminatedQuote(pos));
            }
            tokens.push((Token::Term(term), pos));
        } else if is_term_char(ch) {
            let mut word = String::new();
            while let Some(&(_, c)) = chars.peek() {
                if !is_term_char(c) {
                    break;
                }
                word.push(c);
                chars.next();
            }
            let token = if word.eq_ignore_ascii_case("and") {
                Token::And
            } else if word.eq_ignore_ascii_case("or") {
                Token::Or
            } else if word.eq_ignore_ascii_case("not") {
                Token::Not
            } else {
                Token::Term(word)
            };
            tokens.push((token, pos));
        } else {
            return Err(FilterError::UnexpectedChar { ch, pos });
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let item = self.tokens.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn enter(&mut self, pos: usize) -> Result<(), FilterError> {
        if self.depth >= MAX_NESTING {
            return Err(FilterError::TooDeep(pos));
        }
        self.depth += 1;
        Ok(())
    }

    fn parse_or(&mut self) -> Result<TagFilter, FilterError> {
        let mut operands = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            operands.push(self.parse_and()?);
        }
        Ok(if operands.len() == 1 {
            operands.remove(0)
        } else {
            TagFilter::Or(operands)
        })
    }

    fn parse_and(&mut self) -> Result<TagFilter, FilterError> {
        let mut operands = vec![self.parse_not()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            operands.push(self.parse_not()?);
        }
        Ok(if operands.len() == 1 {
            operands.remove(0)
        } else {
            TagFilter::And(operands)
        })
    }

    fn parse_not(&mut self) -> Result<TagFilter, FilterError> {
        if let Some((Token::Not, pos)) = self.tokens.get(self.pos) {
            let pos = *pos;
            self.pos += 1;
            self.enter(pos)?;
            let inner = self.parse_not()?;
            self.depth -= 1;
            return Ok(TagFilter::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<TagFilter, FilterError> {
        match self.next() {
            Some((Token::Term(term), _)) => Ok(TagFilter::Term(TagPattern::new(&term))),
            Some((Token::Open, pos)) => {
                self.enter(pos)?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.next() {
                    Some((Token::Close, _)) => Ok(inner),
                    Some((token, pos)) => Err(FilterError::UnexpectedToken {
                        found: token.describe(),
                        pos,
                    }),
                    None => Err(FilterError::UnexpectedEnd),
                }
            }
            Some((token, pos)) => Err(FilterError::UnexpectedToken {
                found: token.describe(),
                pos,
            }),
            None => Err(FilterError::UnexpectedEnd),
        }
    }
}
