use std::{collections::BTreeSet, fmt, str::FromStr};

use crate::geofile::feature::{normalize_key, FeatureMap};

/// Reasons a rule filter can fail to parse. Positions are 1-based character columns.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("empty filter expression")]
    Empty,
    #[error("unexpected character '{character}' at column {position}")]
    UnexpectedCharacter { character: char, position: usize },
    #[error("unterminated string literal starting at column {0}")]
    UnterminatedString(usize),
    #[error("unknown method '.{name}()' at column {position}")]
    UnknownMethod { name: String, position: usize },
    #[error("invalid attribute key '{0}', keys may only contain lowercase letters, '_' and ':'")]
    InvalidKey(String),
    #[error("expected {expected} at column {position}, found {found}")]
    Unexpected {
        expected: &'static str,
        found: String,
        position: usize,
    },
    #[error("expected {expected} but the expression ended")]
    UnexpectedEnd { expected: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
}

/// A rule filter compiled into a tree. Missing attributes compare as null: equality and
/// membership tests on them are false, their negations true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Compare {
        key: String,
        op: CompareOp,
        value: String,
    },
    In {
        key: String,
        values: BTreeSet<String>,
        negated: bool,
    },
    IsNull {
        key: String,
        negated: bool,
    },
    Not(Box<Predicate>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn evaluate(&self, attributes: &FeatureMap) -> bool {
        match self {
            Predicate::Compare { key, op, value } => {
                let actual = attributes.get(key);
                match op {
                    CompareOp::Eq => actual == Some(value),
                    CompareOp::NotEq => actual != Some(value),
                }
            }
            Predicate::In {
                key,
                values,
                negated,
            } => {
                let found = attributes
                    .get(key)
                    .map_or(false, |actual| values.contains(actual));
                found != *negated
            }
            Predicate::IsNull { key, negated } => attributes.contains_key(key) == *negated,
            Predicate::Not(inner) => !inner.evaluate(attributes),
            Predicate::And(terms) => terms.iter().all(|term| term.evaluate(attributes)),
            Predicate::Or(terms) => terms.iter().any(|term| term.evaluate(attributes)),
        }
    }

    /// All attribute keys referenced by the predicate, already normalized.
    pub fn keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        self.collect_keys(&mut keys);
        keys
    }

    fn collect_keys(&self, keys: &mut BTreeSet<String>) {
        match self {
            Predicate::Compare { key, .. }
            | Predicate::In { key, .. }
            | Predicate::IsNull { key, .. } => {
                keys.insert(key.clone());
            }
            Predicate::Not(inner) => inner.collect_keys(keys),
            Predicate::And(terms) | Predicate::Or(terms) => {
                for term in terms {
                    term.collect_keys(keys);
                }
            }
        }
    }
}

impl FromStr for Predicate {
    type Err = RuleParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err(RuleParseError::Empty);
        }
        let mut parser = Parser { tokens, index: 0 };
        let predicate = parser.parse_or()?;
        match parser.peek() {
            None => Ok(predicate),
            Some(token) => Err(RuleParseError::Unexpected {
                expected: "end of expression",
                found: token.kind.to_string(),
                position: token.position,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Key(String),
    Literal(String),
    And,
    Or,
    Not,
    In,
    Eq,
    NotEq,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    NullTest { negated: bool },
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Key(key) => write!(f, "key '{}'", key),
            TokenKind::Literal(value) => write!(f, "value '{}'", value),
            TokenKind::And => write!(f, "'and'"),
            TokenKind::Or => write!(f, "'or'"),
            TokenKind::Not => write!(f, "'not'"),
            TokenKind::In => write!(f, "'in'"),
            TokenKind::Eq => write!(f, "'=='"),
            TokenKind::NotEq => write!(f, "'!='"),
            TokenKind::LParen => write!(f, "'('"),
            TokenKind::RParen => write!(f, "')'"),
            TokenKind::LBracket => write!(f, "'['"),
            TokenKind::RBracket => write!(f, "']'"),
            TokenKind::Comma => write!(f, "','"),
            TokenKind::NullTest { negated: false } => write!(f, "'.isnull()'"),
            TokenKind::NullTest { negated: true } => write!(f, "'.notnull()'"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == ':'
}

fn tokenize(text: &str) -> Result<Vec<Token>, RuleParseError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let position = i + 1;
        let next = chars.get(i + 1).copied();
        let kind = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ',' => TokenKind::Comma,
            '&' => TokenKind::And,
            '|' => TokenKind::Or,
            '~' => TokenKind::Not,
            '=' | '!' if next == Some('=') => {
                i += 2;
                tokens.push(Token {
                    kind: if c == '=' {
                        TokenKind::Eq
                    } else {
                        TokenKind::NotEq
                    },
                    position,
                });
                continue;
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&other| other == c)
                    .ok_or(RuleParseError::UnterminatedString(position))?;
                let value: String = chars[i + 1..i + 1 + end].iter().collect();
                i += end + 2;
                tokens.push(Token {
                    kind: TokenKind::Literal(value),
                    position,
                });
                continue;
            }
            '.' => {
                let name: String = chars[i + 1..]
                    .iter()
                    .take_while(|other| other.is_alphanumeric())
                    .collect();
                let after_name = i + 1 + name.chars().count();
                if chars.get(after_name) != Some(&'(') || chars.get(after_name + 1) != Some(&')')
                {
                    return Err(RuleParseError::UnknownMethod { name, position });
                }
                let negated = match name.as_str() {
                    "isnull" | "isna" => false,
                    "notnull" | "notna" => true,
                    _ => return Err(RuleParseError::UnknownMethod { name, position }),
                };
                i = after_name + 2;
                tokens.push(Token {
                    kind: TokenKind::NullTest { negated },
                    position,
                });
                continue;
            }
            c if c.is_ascii_digit()
                || (c == '-' && next.map_or(false, |next| next.is_ascii_digit())) =>
            {
                let number: String = std::iter::once(c)
                    .chain(
                        chars[i + 1..]
                            .iter()
                            .copied()
                            .take_while(|other| other.is_ascii_digit() || *other == '.'),
                    )
                    .collect();
                i += number.chars().count();
                tokens.push(Token {
                    kind: TokenKind::Literal(number),
                    position,
                });
                continue;
            }
            c if is_word_char(c) => {
                let word: String = chars[i..]
                    .iter()
                    .copied()
                    .take_while(|other| is_word_char(*other))
                    .collect();
                i += word.chars().count();
                let kind = match word.as_str() {
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    "in" => TokenKind::In,
                    _ => {
                        if !word
                            .chars()
                            .all(|other| other.is_ascii_lowercase() || other == '_' || other == ':')
                        {
                            return Err(RuleParseError::InvalidKey(word));
                        }
                        TokenKind::Key(normalize_key(&word))
                    }
                };
                tokens.push(Token { kind, position });
                continue;
            }
            other => {
                return Err(RuleParseError::UnexpectedCharacter {
                    character: other,
                    position,
                })
            }
        };
        tokens.push(Token { kind, position });
        i += 1;
    }
    Ok(tokens)
}

/// Recursive descent over the token list. `and` binds tighter than `or`, `not` tighter
/// than both.
struct Parser {
    tokens: Vec<Token>,
    index: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index)
    }

    fn next_token(&mut self, expected: &'static str) -> Result<Token, RuleParseError> {
        let token = self
            .tokens
            .get(self.index)
            .cloned()
            .ok_or(RuleParseError::UnexpectedEnd { expected })?;
        self.index += 1;
        Ok(token)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().map_or(false, |token| &token.kind == kind) {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &'static str) -> Result<(), RuleParseError> {
        let token = self.next_token(expected)?;
        if token.kind == kind {
            Ok(())
        } else {
            Err(unexpected(expected, &token))
        }
    }

    fn parse_or(&mut self) -> Result<Predicate, RuleParseError> {
        let mut terms = vec![self.parse_and()?];
        while self.eat(&TokenKind::Or) {
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Predicate::Or(terms)
        })
    }

    fn parse_and(&mut self) -> Result<Predicate, RuleParseError> {
        let mut terms = vec![self.parse_unary()?];
        while self.eat(&TokenKind::And) {
            terms.push(self.parse_unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Predicate::And(terms)
        })
    }

    fn parse_unary(&mut self) -> Result<Predicate, RuleParseError> {
        if self.eat(&TokenKind::Not) {
            return Ok(Predicate::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Predicate, RuleParseError> {
        let expected = "attribute key or '('";
        let token = self.next_token(expected)?;
        match token.kind {
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Key(key) => self.parse_test(key),
            _ => Err(unexpected(expected, &token)),
        }
    }

    fn parse_test(&mut self, key: String) -> Result<Predicate, RuleParseError> {
        let expected = "'==', '!=', 'in', 'not in' or a null test";
        let token = self.next_token(expected)?;
        match token.kind {
            TokenKind::Eq => Ok(Predicate::Compare {
                key,
                op: CompareOp::Eq,
                value: self.parse_literal()?,
            }),
            TokenKind::NotEq => Ok(Predicate::Compare {
                key,
                op: CompareOp::NotEq,
                value: self.parse_literal()?,
            }),
            TokenKind::In => Ok(Predicate::In {
                key,
                values: self.parse_list()?,
                negated: false,
            }),
            TokenKind::Not => {
                self.expect(TokenKind::In, "'in'")?;
                Ok(Predicate::In {
                    key,
                    values: self.parse_list()?,
                    negated: true,
                })
            }
            TokenKind::NullTest { negated } => Ok(Predicate::IsNull { key, negated }),
            _ => Err(unexpected(expected, &token)),
        }
    }

    fn parse_literal(&mut self) -> Result<String, RuleParseError> {
        let expected = "a quoted value";
        let token = self.next_token(expected)?;
        match token.kind {
            TokenKind::Literal(value) => Ok(value),
            _ => Err(unexpected(expected, &token)),
        }
    }

    fn parse_list(&mut self) -> Result<BTreeSet<String>, RuleParseError> {
        self.expect(TokenKind::LBracket, "'['")?;
        let mut values = BTreeSet::new();
        loop {
            if self.eat(&TokenKind::RBracket) {
                return Ok(values);
            }
            values.insert(self.parse_literal()?);
            let expected = "',' or ']'";
            let token = self.next_token(expected)?;
            match token.kind {
                TokenKind::Comma => continue,
                TokenKind::RBracket => return Ok(values),
                _ => return Err(unexpected(expected, &token)),
            }
        }
    }
}

fn unexpected(expected: &'static str, token: &Token) -> RuleParseError {
    RuleParseError::Unexpected {
        expected,
        found: token.kind.to_string(),
        position: token.position,
    }
}
