//! Boolean conditions over a post's full tag set.
//!
//! Grammar:
//! ```text
//! expr   := term (("or" | "|") term)*
//! term   := factor (("and" | "&") factor)*
//! factor := ("not" | "!") factor | "(" expr ")" | pattern
//! ```
//! A pattern holds when any tag of the post matches it.

use std::collections::BTreeSet;
use std::iter::Peekable;
use std::vec::IntoIter;

use thiserror::Error;

use crate::pipeline::matcher::TagMatcher;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    #[error("condition is empty")]
    Empty,

    #[error("unexpected end of condition")]
    UnexpectedEnd,

    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("unbalanced parentheses")]
    Unbalanced,

    #[error("condition nests deeper than {0} levels")]
    TooDeep(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Tag(TagMatcher),
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    And,
    Or,
    Not,
    Open,
    Close,
    Pattern(String),
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(source);
        if tokens.is_empty() {
            return Err(ConditionError::Empty);
        }

        let mut tokens = tokens.into_iter().peekable();
        let condition = parse_expr(&mut tokens, 0)?;

        match tokens.next() {
            None => Ok(condition),
            Some(Token::Close) => Err(ConditionError::Unbalanced),
            Some(other) => Err(ConditionError::UnexpectedToken(describe(&other))),
        }
    }

    pub fn evaluate(&self, tags: &BTreeSet<String>) -> bool {
        match self {
            Condition::Tag(matcher) => matcher.matches_any(tags),
            Condition::Not(inner) => !inner.evaluate(tags),
            Condition::And(left, right) => left.evaluate(tags) && right.evaluate(tags),
            Condition::Or(left, right) => left.evaluate(tags) || right.evaluate(tags),
        }
    }
}

fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();

    let flush = |word: &mut String, tokens: &mut Vec<Token>| {
        if word.is_empty() {
            return;
        }
        let token = match word.to_lowercase().as_str() {
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            _ => Token::Pattern(word.clone()),
        };
        tokens.push(token);
        word.clear();
    };

    for c in source.chars() {
        let symbol = match c {
            '(' => Some(Token::Open),
            ')' => Some(Token::Close),
            '&' => Some(Token::And),
            '|' => Some(Token::Or),
            '!' if word.is_empty() => Some(Token::Not),
            _ => None,
        };

        if let Some(symbol) = symbol {
            flush(&mut word, &mut tokens);
            tokens.push(symbol);
        } else if c.is_whitespace() {
            flush(&mut word, &mut tokens);
        } else {
            word.push(c);
        }
    }
    flush(&mut word, &mut tokens);

    tokens
}

type Tokens = Peekable<IntoIter<Token>>;

/// Parentheses and negations allowed around a single factor.
const MAX_DEPTH: usize = 64;

fn parse_expr(tokens: &mut Tokens, depth: usize) -> Result<Condition, ConditionError> {
    let mut left = parse_term(tokens, depth)?;
    while tokens.peek() == Some(&Token::Or) {
        tokens.next();
        let right = parse_term(tokens, depth)?;
        left = Condition::Or(Box::new(left), Box::new(right));
    }
    Ok(left)
}

fn parse_term(tokens: &mut Tokens, depth: usize) -> Result<Condition, ConditionError> {
    let mut left = parse_factor(tokens, depth)?;
    while tokens.peek() == Some(&Token::And) {
        tokens.next();
        let right = parse_factor(tokens, depth)?;
        left = Condition::And(Box::new(left), Box::new(right));
    }
    Ok(left)
}

fn parse_factor(tokens: &mut Tokens, depth: usize) -> Result<Condition, ConditionError> {
    if depth > MAX_DEPTH {
        return Err(ConditionError::TooDeep(MAX_DEPTH));
    }
    match tokens.next() {
        None => Err(ConditionError::UnexpectedEnd),
        Some(Token::Not) => Ok(Condition::Not(Box::new(parse_factor(tokens, depth + 1)?))),
        Some(Token::Open) => {
            let inner = parse_expr(tokens, depth + 1)?;
            match tokens.next() {
                Some(Token::Close) => Ok(inner),
                _ => Err(ConditionError::Unbalanced),
            }
        }
        Some(Token::Pattern(pattern)) => Ok(Condition::Tag(TagMatcher::new(&pattern))),
        Some(Token::Close) => Err(ConditionError::Unbalanced),
        Some(other) => Err(ConditionError::UnexpectedToken(describe(&other))),
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::And => "and".to_string(),
        Token::Or => "or".to_string(),
        Token::Not => "not".to_string(),
        Token::Open => "(".to_string(),
        Token::Close => ")".to_string(),
        Token::Pattern(p) => p.clone(),
    }
}
