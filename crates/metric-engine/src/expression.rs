//! Arithmetic formula parsing and evaluation.
//!
//! Expression metrics carry formulas like `(net_income / revenue) * 100`
//! that reference other metrics by id. Formulas are parsed once when the
//! registry loads; evaluation substitutes already-computed operand values
//! and propagates null instead of erroring.

use appraisal_core::ValuationError;
use std::collections::BTreeSet;

/// Binary arithmetic operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Parsed formula node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Metric(String),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ValuationError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '0'..='9' | '.' => {
                let mut literal = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        literal.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = literal.parse::<f64>().map_err(|_| {
                    ValuationError::InvalidConfiguration(format!(
                        "bad numeric literal '{}' in formula",
                        literal
                    ))
                })?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(ValuationError::InvalidConfiguration(format!(
                    "unexpected character '{}' in formula",
                    other
                )));
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

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    // expr := term (('+' | '-') term)*
    fn parse_expr(&mut self) -> Result<Expr, ValuationError> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    // term := factor (('*' | '/') factor)*
    fn parse_term(&mut self) -> Result<Expr, ValuationError> {
        let mut lhs = self.parse_factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_factor()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    // factor := '-' factor | '(' expr ')' | number | ident
    fn parse_factor(&mut self) -> Result<Expr, ValuationError> {
        match self.advance() {
            Some(Token::Minus) => Ok(Expr::Neg(Box::new(self.parse_factor()?))),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ValuationError::InvalidConfiguration(
                        "unbalanced parenthesis in formula".to_string(),
                    )),
                }
            }
            Some(Token::Number(value)) => Ok(Expr::Number(value)),
            Some(Token::Ident(name)) => Ok(Expr::Metric(name)),
            Some(token) => Err(ValuationError::InvalidConfiguration(format!(
                "unexpected token {:?} in formula",
                token
            ))),
            None => Err(ValuationError::InvalidConfiguration(
                "formula ended unexpectedly".to_string(),
            )),
        }
    }
}

impl Expr {
    /// Parse a formula string into an expression tree.
    pub fn parse(formula: &str) -> Result<Self, ValuationError> {
        let tokens = tokenize(formula)?;
        if tokens.is_empty() {
            return Err(ValuationError::InvalidConfiguration(
                "empty formula".to_string(),
            ));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(ValuationError::InvalidConfiguration(format!(
                "unexpected trailing token {:?} in formula",
                parser.tokens[parser.pos]
            )));
        }
        Ok(expr)
    }

    /// Metric ids this expression reads.
    pub fn references(&self) -> BTreeSet<String> {
        let mut refs = BTreeSet::new();
        self.collect_refs(&mut refs);
        refs
    }

    fn collect_refs(&self, refs: &mut BTreeSet<String>) {
        match self {
            Expr::Metric(id) => {
                refs.insert(id.clone());
            }
            Expr::Neg(inner) => inner.collect_refs(refs),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_refs(refs);
                rhs.collect_refs(refs);
            }
            Expr::Number(_) => {}
        }
    }

    /// Evaluate against an operand resolver. Any null operand or a
    /// division by zero makes the whole expression null.
    pub fn evaluate<F>(&self, resolve: &F) -> Option<f64>
    where
        F: Fn(&str) -> Option<f64>,
    {
        match self {
            Expr::Number(value) => Some(*value),
            Expr::Metric(id) => resolve(id),
            Expr::Neg(inner) => inner.evaluate(resolve).map(|v| -v),
            Expr::Binary { op, lhs, rhs } => {
                let l = lhs.evaluate(resolve)?;
                let r = rhs.evaluate(resolve)?;
                match op {
                    BinaryOp::Add => Some(l + r),
                    BinaryOp::Sub => Some(l - r),
                    BinaryOp::Mul => Some(l * r),
                    BinaryOp::Div => {
                        if r == 0.0 {
                            None
                        } else {
                            Some(l / r)
                        }
                    }
                }
            }
        }
    }
}
