use super::Expr;
use std::collections::BTreeSet;

/// Bounds recursion through `!` and `(` so hostile input cannot exhaust the stack.
const MAX_DEPTH: usize = 128;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid selector {selector:?} at offset {offset}: {reason}")]
pub struct ParseError {
    selector: String,
    offset: usize,
    reason: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Eq,
    Ne,
    Not,
    And,
    Or,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

pub(super) fn parse(input: &str) -> Result<Expr, ParseError> {
    let tokens = lex(input)?;
    if tokens.is_empty() {
        return Ok(Expr::All);
    }

    let mut parser = Parser {
        input,
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.or()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-')
}

fn lex(input: &str) -> Result<Vec<(usize, Token)>, ParseError> {
    let err = |offset, reason| ParseError {
        selector: input.to_string(),
        offset,
        reason,
    };

    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let tok = match c {
            c if c.is_whitespace() => continue,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            ',' => Token::Comma,
            '=' => match chars.next() {
                Some((_, '=')) => Token::Eq,
                _ => return Err(err(i, "expected '=='")),
            },
            '!' => match chars.peek() {
                Some((_, '=')) => {
                    chars.next();
                    Token::Ne
                }
                _ => Token::Not,
            },
            '&' => match chars.next() {
                Some((_, '&')) => Token::And,
                _ => return Err(err(i, "expected '&&'")),
            },
            '|' => match chars.next() {
                Some((_, '|')) => Token::Or,
                _ => return Err(err(i, "expected '||'")),
            },
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, c)) if c == quote => break,
                        Some((_, c)) => value.push(c),
                        None => return Err(err(i, "unterminated string")),
                    }
                }
                Token::Str(value)
            }
            c if is_key_char(c) => {
                let mut ident = c.to_string();
                while let Some((_, c)) = chars.peek() {
                    if !is_key_char(*c) {
                        break;
                    }
                    ident.push(*c);
                    chars.next();
                }
                Token::Ident(ident)
            }
            _ => return Err(err(i, "unexpected character")),
        };
        tokens.push((i, tok));
    }

    Ok(tokens)
}

// === impl Parser ===

impl Parser<'_> {
    fn error(&self, reason: &'static str) -> ParseError {
        let offset = self
            .tokens
            .get(self.pos)
            .map(|(i, _)| *i)
            .unwrap_or(self.input.len());
        ParseError {
            selector: self.input.to_string(),
            offset,
            reason,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn unread(&mut self, consumed: bool) {
        if consumed {
            self.pos -= 1;
        }
    }

    fn expect(&mut self, want: Token, reason: &'static str) -> Result<(), ParseError> {
        if self.peek() == Some(&want) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(reason))
        }
    }

    fn expect_keyword(&mut self, kw: &str, reason: &'static str) -> Result<(), ParseError> {
        match self.peek() {
            Some(Token::Ident(i)) if i == kw => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(self.error(reason)),
        }
    }

    fn string(&mut self) -> Result<String, ParseError> {
        if let Some(Token::Str(s)) = self.peek() {
            let s = s.clone();
            self.pos += 1;
            return Ok(s);
        }
        Err(self.error("expected a quoted string"))
    }

    fn or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn descend(&mut self) -> Result<(), ParseError> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error("selector nested too deeply"));
        }
        self.depth += 1;
        Ok(())
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some(&Token::Not) {
            self.descend()?;
            self.pos += 1;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let key = match self.next() {
            Some(Token::LParen) => {
                self.descend()?;
                let expr = self.or()?;
                self.expect(Token::RParen, "expected ')'")?;
                self.depth -= 1;
                return Ok(expr);
            }
            Some(Token::Ident(ident)) => ident,
            other => {
                // Step back so the error points at the offending token.
                self.unread(other.is_some());
                return Err(self.error("expected a label key, '(' or '!'"));
            }
        };

        // Function-style terms.
        if self.peek() == Some(&Token::LParen) {
            return match key.as_str() {
                "all" => {
                    self.pos += 1;
                    self.expect(Token::RParen, "expected ')' after all(")?;
                    Ok(Expr::All)
                }
                "has" => {
                    self.pos += 1;
                    let k = match self.next() {
                        Some(Token::Ident(k)) => k,
                        _ => return Err(self.error("expected a label key in has()")),
                    };
                    self.expect(Token::RParen, "expected ')' after has(key")?;
                    Ok(Expr::Has(k))
                }
                _ => Err(self.error("unknown function")),
            };
        }

        match self.next() {
            Some(Token::Eq) => Ok(Expr::Eq(key, self.string()?)),
            Some(Token::Ne) => Ok(Expr::Ne(key, self.string()?)),
            Some(Token::Ident(op)) => match op.as_str() {
                "in" => Ok(Expr::In(key, self.set()?)),
                "not" => {
                    self.expect_keyword("in", "expected 'in' after 'not'")?;
                    Ok(Expr::NotIn(key, self.set()?))
                }
                "starts" => {
                    self.expect_keyword("with", "expected 'with' after 'starts'")?;
                    Ok(Expr::StartsWith(key, self.string()?))
                }
                "ends" => {
                    self.expect_keyword("with", "expected 'with' after 'ends'")?;
                    Ok(Expr::EndsWith(key, self.string()?))
                }
                "contains" => Ok(Expr::Contains(key, self.string()?)),
                _ => {
                    self.pos -= 1;
                    Err(self.error("unknown operator"))
                }
            },
            other => {
                self.unread(other.is_some());
                Err(self.error("expected an operator"))
            }
        }
    }

    fn set(&mut self) -> Result<BTreeSet<String>, ParseError> {
        self.expect(Token::LBrace, "expected '{'")?;
        let mut values = BTreeSet::new();
        if self.peek() == Some(&Token::RBrace) {
            self.pos += 1;
            return Ok(values);
        }
        loop {
            values.insert(self.string()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RBrace) => return Ok(values),
                other => {
                    self.unread(other.is_some());
                    return Err(self.error("expected ',' or '}'"));
                }
            }
        }
    }
}
