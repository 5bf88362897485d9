//! SQL-like filter expressions over artifact properties
//!
//! Filters such as `org = 'org1' and year >= 2024` decide which artifacts a
//! source discovers. Evaluation is three-valued: a comparison on a property
//! that is not known yet (e.g. a directory above the level where `year` is
//! parsed) is *unknown*, which lets path-walking sources prune a directory
//! only when no file below it could ever match.

use rowpipe_common::{Result, SdkError};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(String),
    Op(CompareOp),
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
    In,
    Like,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Compare {
        field: String,
        op: CompareOp,
        value: String,
    },
    In {
        field: String,
        values: Vec<String>,
        negated: bool,
    },
    Like {
        field: String,
        pattern: String,
        negated: bool,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

/// A parsed filter expression
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    source: String,
    expr: Expr,
}

impl Filter {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(SdkError::Filter(format!(
                "unexpected {:?} in '{}'",
                tok, source
            )));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against the given properties; `None` means unknown
    pub fn evaluate(&self, properties: &HashMap<String, String>) -> Option<bool> {
        eval(&self.expr, properties)
    }

    /// True only when the filter definitely matches
    pub fn matches(&self, properties: &HashMap<String, String>) -> bool {
        self.evaluate(properties) == Some(true)
    }

    /// False only when the filter definitely cannot match
    pub fn may_match(&self, properties: &HashMap<String, String>) -> bool {
        self.evaluate(properties) != Some(false)
    }
}

impl FromStr for Filter {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self> {
        Filter::parse(s)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn eval(expr: &Expr, props: &HashMap<String, String>) -> Option<bool> {
    match expr {
        Expr::Compare { field, op, value } => {
            let actual = props.get(field)?;
            let ord = compare_values(actual, value);
            Some(match op {
                CompareOp::Eq => ord == Ordering::Equal,
                CompareOp::Ne => ord != Ordering::Equal,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Ge => ord != Ordering::Less,
            })
        }
        Expr::In {
            field,
            values,
            negated,
        } => {
            let actual = props.get(field)?;
            let found = values
                .iter()
                .any(|v| compare_values(actual, v) == Ordering::Equal);
            Some(found != *negated)
        }
        Expr::Like {
            field,
            pattern,
            negated,
        } => {
            let actual = props.get(field)?;
            Some(like(actual, pattern) != *negated)
        }
        Expr::And(a, b) => match (eval(a, props), eval(b, props)) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        Expr::Or(a, b) => match (eval(a, props), eval(b, props)) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
        Expr::Not(inner) => eval(inner, props).map(|v| !v),
    }
}

/// Numeric comparison when both sides are numbers, otherwise lexical
fn compare_values(actual: &str, expected: &str) -> Ordering {
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => actual.cmp(expected),
    }
}

/// SQL `LIKE` with `%` (any run) and `_` (any single character)
fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((bp, bt)) = backtrack {
            p = bp + 1;
            t = bt + 1;
            backtrack = Some((bp, bt + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
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
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += 2;
            }
            '<' => match chars.get(i + 1) {
                Some('=') => {
                    tokens.push(Token::Op(CompareOp::Le));
                    i += 2;
                }
                Some('>') => {
                    tokens.push(Token::Op(CompareOp::Ne));
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Op(CompareOp::Lt));
                    i += 1;
                }
            },
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CompareOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CompareOp::Gt));
                    i += 1;
                }
            }
            '\'' => {
                // '' inside a string is an escaped quote
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(SdkError::Filter(format!(
                                "unterminated string in '{}'",
                                source
                            )))
                        }
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Number(chars[start..i].iter().collect()));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.to_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "like" => Token::Like,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(SdkError::Filter(format!(
                    "unexpected character '{}' in '{}'",
                    other, source
                )))
            }
        }
    }

    Ok(tokens)
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
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
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

    fn expect(&mut self, expected: &Token) -> Result<()> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(SdkError::Filter(format!(
                "expected {:?}, found {:?}",
                expected,
                self.peek()
            )))
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        if self.eat(&Token::LParen) {
            let expr = self.parse_or()?;
            self.expect(&Token::RParen)?;
            return Ok(expr);
        }

        let field = match self.next() {
            Some(Token::Ident(name)) => name,
            other => {
                return Err(SdkError::Filter(format!(
                    "expected a property name, found {:?}",
                    other
                )))
            }
        };

        let negated = self.eat(&Token::Not);
        match self.next() {
            Some(Token::Op(op)) if !negated => Ok(Expr::Compare {
                field,
                op,
                value: self.parse_literal()?,
            }),
            Some(Token::In) => {
                self.expect(&Token::LParen)?;
                let mut values = vec![self.parse_literal()?];
                while self.eat(&Token::Comma) {
                    values.push(self.parse_literal()?);
                }
                self.expect(&Token::RParen)?;
                Ok(Expr::In {
                    field,
                    values,
                    negated,
                })
            }
            Some(Token::Like) => match self.next() {
                Some(Token::Str(pattern)) => Ok(Expr::Like {
                    field,
                    pattern,
                    negated,
                }),
                other => Err(SdkError::Filter(format!(
                    "like requires a string pattern, found {:?}",
                    other
                ))),
            },
            other => Err(SdkError::Filter(format!(
                "expected an operator after '{}', found {:?}",
                field, other
            ))),
        }
    }

    fn parse_literal(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Str(s)) | Some(Token::Number(s)) => Ok(s),
            other => Err(SdkError::Filter(format!(
                "expected a literal, found {:?}",
                other
            ))),
        }
    }
}
