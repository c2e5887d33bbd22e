//! Boolean filter expressions over object columns and tags.
//!
//! The text form reads like
//!
//! ```text
//! typ = invoice and (nr : R1 or amount >= 100) and not done = 1
//! ```
//!
//! Operators: `=`, `!=`, `<`, `<=`, `>`, `>=`, `:` (contains), `^=` (starts
//! with). Values are bare words or double-quoted strings; bare numbers, ISO
//! dates and `null` are typed.

use chrono::NaiveDate;
use color_eyre::{eyre::eyre, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
  Equal,
  NotEqual,
  Less,
  LessOrEqual,
  Greater,
  GreaterOrEqual,
  Contains,
  StartsWith,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
  Null,
  Text(String),
  Integer(i64),
  Number(f64),
  Date(NaiveDate),
}

impl FilterValue {
  /// Type a bare word: integer, number, ISO date, `null`, else text.
  fn from_word(word: &str) -> Self {
    if word.eq_ignore_ascii_case("null") {
      Self::Null
    } else if let Ok(i) = word.parse::<i64>() {
      Self::Integer(i)
    } else if let Some(n) = word
      .chars()
      .all(|c| c.is_ascii_digit() || ".-+eE".contains(c))
      .then(|| word.parse::<f64>().ok())
      .flatten()
    {
      Self::Number(n)
    } else if let Ok(d) = NaiveDate::parse_from_str(word, "%Y-%m-%d") {
      Self::Date(d)
    } else {
      Self::Text(word.to_string())
    }
  }
}

impl fmt::Display for FilterValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Null => write!(f, "null"),
      Self::Text(s) => write!(f, "{}", s),
      Self::Integer(i) => write!(f, "{}", i),
      Self::Number(n) => write!(f, "{}", n),
      Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
  /// Matches everything
  True,
  And(Vec<Filter>),
  Or(Vec<Filter>),
  Not(Box<Filter>),
  Compare {
    column: String,
    op: CompareOp,
    value: FilterValue,
  },
}

impl Filter {
  pub fn compare(column: &str, op: CompareOp, value: FilterValue) -> Self {
    Self::Compare {
      column: column.to_string(),
      op,
      value,
    }
  }

  /// Parse the text form. Blank input is [`Filter::True`].
  pub fn parse(text: &str) -> Result<Self> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
      return Ok(Self::True);
    }

    let mut parser = Parser { tokens, pos: 0 };
    let filter = parser.parse_or()?;
    match parser.peek() {
      None => Ok(filter),
      Some(token) => Err(eyre!("Unexpected {} in filter '{}'", token, text)),
    }
  }

  /// Column names referenced by comparisons, in order of appearance.
  pub fn columns(&self) -> Vec<&str> {
    let mut out = Vec::new();
    self.collect_columns(&mut out);
    out
  }

  fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
    match self {
      Self::True => {}
      Self::And(items) | Self::Or(items) => items.iter().for_each(|f| f.collect_columns(out)),
      Self::Not(inner) => inner.collect_columns(out),
      Self::Compare { column, .. } => out.push(column),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
  LParen,
  RParen,
  Op(CompareOp),
  Word(String),
  Quoted(String),
}

impl fmt::Display for Token {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Token::LParen => write!(f, "'('"),
      Token::RParen => write!(f, "')'"),
      Token::Op(op) => write!(f, "operator {:?}", op),
      Token::Word(w) => write!(f, "'{}'", w),
      Token::Quoted(q) => write!(f, "\"{}\"", q),
    }
  }
}

fn is_word_char(c: char) -> bool {
  !c.is_whitespace() && !"()=!<>:^\"".contains(c)
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
  let mut tokens = Vec::new();
  let mut chars = text.chars().peekable();

  while let Some(&c) = chars.peek() {
    if c.is_whitespace() {
      chars.next();
      continue;
    }

    chars.next();
    let token = match c {
      '(' => Token::LParen,
      ')' => Token::RParen,
      ':' => Token::Op(CompareOp::Contains),
      '=' => Token::Op(CompareOp::Equal),
      '!' | '^' => {
        if chars.next_if_eq(&'=').is_none() {
          return Err(eyre!("Expected '=' after '{}'", c));
        }
        Token::Op(if c == '!' {
          CompareOp::NotEqual
        } else {
          CompareOp::StartsWith
        })
      }
      '<' | '>' => {
        let or_equal = chars.next_if_eq(&'=').is_some();
        Token::Op(match (c, or_equal) {
          ('<', false) => CompareOp::Less,
          ('<', true) => CompareOp::LessOrEqual,
          (_, false) => CompareOp::Greater,
          (_, true) => CompareOp::GreaterOrEqual,
        })
      }
      '"' => {
        let mut value = String::new();
        loop {
          match chars.next() {
            Some('"') => break,
            Some('\\') => match chars.next() {
              Some(escaped) => value.push(escaped),
              None => return Err(eyre!("Unterminated string in filter")),
            },
            Some(ch) => value.push(ch),
            None => return Err(eyre!("Unterminated string in filter")),
          }
        }
        Token::Quoted(value)
      }
      _ => {
        let mut word = c.to_string();
        while let Some(ch) = chars.next_if(|ch| is_word_char(*ch)) {
          word.push(ch);
        }
        Token::Word(word)
      }
    };
    tokens.push(token);
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
    let token = self.tokens.get(self.pos).cloned();
    self.pos += 1;
    token
  }

  fn eat_keyword(&mut self, keyword: &str) -> bool {
    match self.peek() {
      Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword) => {
        self.pos += 1;
        true
      }
      _ => false,
    }
  }

  fn parse_or(&mut self) -> Result<Filter> {
    let mut items = vec![self.parse_and()?];
    while self.eat_keyword("or") {
      items.push(self.parse_and()?);
    }
    Ok(if items.len() == 1 {
      items.remove(0)
    } else {
      Filter::Or(items)
    })
  }

  fn parse_and(&mut self) -> Result<Filter> {
    let mut items = vec![self.parse_unary()?];
    while self.eat_keyword("and") {
      items.push(self.parse_unary()?);
    }
    Ok(if items.len() == 1 {
      items.remove(0)
    } else {
      Filter::And(items)
    })
  }

  fn parse_unary(&mut self) -> Result<Filter> {
    if self.eat_keyword("not") {
      return Ok(Filter::Not(Box::new(self.parse_unary()?)));
    }

    match self.next() {
      Some(Token::LParen) => {
        let inner = self.parse_or()?;
        match self.next() {
          Some(Token::RParen) => Ok(inner),
          Some(other) => Err(eyre!("Expected ')' but found {}", other)),
          None => Err(eyre!("Missing ')' in filter")),
        }
      }
      Some(Token::Word(column)) => {
        let op = match self.next() {
          Some(Token::Op(op)) => op,
          Some(other) => return Err(eyre!("Expected an operator after '{}', found {}", column, other)),
          None => return Err(eyre!("Expected an operator after '{}'", column)),
        };
        let value = match self.next() {
          Some(Token::Word(word)) => FilterValue::from_word(&word),
          Some(Token::Quoted(text)) => FilterValue::Text(text),
          Some(other) => return Err(eyre!("Expected a value after '{}', found {}", column, other)),
          None => return Err(eyre!("Expected a value after '{}'", column)),
        };
        Ok(Filter::Compare { column, op, value })
      }
      Some(other) => Err(eyre!("Unexpected {} in filter", other)),
      None => Err(eyre!("Unexpected end of filter")),
    }
  }
}
