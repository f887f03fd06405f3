//! Boolean keyword mini-language: atoms, `and`/`or`/`not`, and parentheses.
//!
//! No parser-combinator crate appears anywhere in the corpus, so this is a small
//! hand-rolled recursive-descent parser over a flat token stream. Grammar:
//!
//! ```text
//! expr   := term (OR term)*
//! term   := factor (AND factor)*
//! factor := NOT factor | "(" expr ")" | ATOM
//! ```
//!
//! `and` binds tighter than `or`; adjacent atoms with no operator between them are
//! treated as an implicit `and` (`"fast smoke"` means `fast and smoke`).

use crate::core::error::CanaryError;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeywordExpr {
    Atom(String),
    Not(Box<KeywordExpr>),
    And(Box<KeywordExpr>, Box<KeywordExpr>),
    Or(Box<KeywordExpr>, Box<KeywordExpr>),
}

impl KeywordExpr {
    pub fn eval(&self, keywords: &HashSet<String>) -> bool {
        match self {
            KeywordExpr::Atom(a) => keywords.contains(a),
            KeywordExpr::Not(e) => !e.eval(keywords),
            KeywordExpr::And(l, r) => l.eval(keywords) && r.eval(keywords),
            KeywordExpr::Or(l, r) => l.eval(keywords) || r.eval(keywords),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    And,
    Or,
    Not,
    LParen,
    RParen,
    Atom(String),
}

fn tokenize(src: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    let flush = |cur: &mut String, tokens: &mut Vec<Token>| {
        if cur.is_empty() {
            return;
        }
        let word = std::mem::take(cur);
        tokens.push(match word.as_str() {
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            _ => Token::Atom(word),
        });
    };
    for c in src.chars() {
        match c {
            '(' => {
                flush(&mut cur, &mut tokens);
                tokens.push(Token::LParen);
            }
            ')' => {
                flush(&mut cur, &mut tokens);
                tokens.push(Token::RParen);
            }
            c if c.is_whitespace() => flush(&mut cur, &mut tokens),
            c => cur.push(c),
        }
    }
    flush(&mut cur, &mut tokens);
    tokens
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
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_expr(&mut self) -> Result<KeywordExpr, CanaryError> {
        let mut lhs = self.parse_term()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            let rhs = self.parse_term()?;
            lhs = KeywordExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<KeywordExpr, CanaryError> {
        let mut lhs = self.parse_factor()?;
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.next();
                    let rhs = self.parse_factor()?;
                    lhs = KeywordExpr::And(Box::new(lhs), Box::new(rhs));
                }
                Some(Token::Atom(_)) | Some(Token::LParen) | Some(Token::Not) => {
                    // implicit "and" between adjacent atoms
                    let rhs = self.parse_factor()?;
                    lhs = KeywordExpr::And(Box::new(lhs), Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_factor(&mut self) -> Result<KeywordExpr, CanaryError> {
        match self.next() {
            Some(Token::Not) => Ok(KeywordExpr::Not(Box::new(self.parse_factor()?))),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(CanaryError::ValidationError(
                        "unbalanced parentheses in keyword expression".into(),
                    )),
                }
            }
            Some(Token::Atom(a)) => Ok(KeywordExpr::Atom(a)),
            other => Err(CanaryError::ValidationError(format!(
                "unexpected token in keyword expression: {:?}",
                other
            ))),
        }
    }
}

pub fn parse(src: &str) -> Result<KeywordExpr, CanaryError> {
    let tokens = tokenize(src);
    if tokens.is_empty() {
        return Err(CanaryError::ValidationError(
            "empty keyword expression".into(),
        ));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(CanaryError::ValidationError(
            "trailing tokens in keyword expression".into(),
        ));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kw(words: &[&str]) -> HashSet<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_atom() {
        let expr = parse("fast").unwrap();
        assert!(expr.eval(&kw(&["fast"])));
        assert!(!expr.eval(&kw(&["slow"])));
    }

    #[test]
    fn test_and_or() {
        let expr = parse("fast and not slow").unwrap();
        assert!(expr.eval(&kw(&["fast"])));
        assert!(!expr.eval(&kw(&["fast", "slow"])));

        let expr2 = parse("fast or slow").unwrap();
        assert!(expr2.eval(&kw(&["slow"])));
        assert!(!expr2.eval(&kw(&["medium"])));
    }

    #[test]
    fn test_implicit_and() {
        let expr = parse("fast smoke").unwrap();
        assert!(expr.eval(&kw(&["fast", "smoke"])));
        assert!(!expr.eval(&kw(&["fast"])));
    }

    #[test]
    fn test_parentheses_precedence() {
        let expr = parse("(fast or slow) and not flaky").unwrap();
        assert!(expr.eval(&kw(&["fast"])));
        assert!(!expr.eval(&kw(&["fast", "flaky"])));
    }

    #[test]
    fn test_unbalanced_parens_errors() {
        assert!(parse("(fast and slow").is_err());
    }

    #[test]
    fn test_empty_expr_errors() {
        assert!(parse("   ").is_err());
    }
}
