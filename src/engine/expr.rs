//! Arithmetic-only formula language.
//!
//! Formulas are authored by end users and evaluated server-side, so the
//! grammar is closed: numeric literals, `+ - * /`, parentheses, unary minus
//! and bare variable references. Anything else (calls, member access,
//! assignment, other operators) is rejected while tokenizing or parsing, and
//! no textual substitution ever happens: variables are resolved against the
//! AST.
//!
//! ```text
//! expr    := term (("+" | "-") term)*
//! term    := unary (("*" | "/") unary)*
//! unary   := "-" unary | primary
//! primary := NUMBER | IDENT | "(" expr ")"
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;
use thiserror::Error;

// ---

/// Maximum nesting of parentheses and unary minus.
pub const MAX_DEPTH: usize = 64;

/// Maximum formula length in characters. Keeps the AST (and the recursive
/// tree walk over it) shallow enough for any thread stack.
pub const MAX_FORMULA_LEN: usize = 4096;

/// Rejection of a formula at authoring time.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyntaxError {
    #[error("formula is empty")]
    Empty,

    #[error("formula is longer than {max} characters")]
    TooLong { max: usize },

    #[error("unexpected character '{ch}' at position {position}")]
    UnexpectedChar { ch: char, position: usize },

    #[error("invalid number '{text}' at position {position}")]
    InvalidNumber { text: String, position: usize },

    #[error("unexpected token '{token}' at position {position}")]
    UnexpectedToken { token: String, position: usize },

    #[error("function calls are not allowed: '{name}' at position {position}")]
    FunctionCall { name: String, position: usize },

    #[error("unexpected end of formula")]
    UnexpectedEnd,

    #[error("parenthesis opened at position {position} is never closed")]
    UnclosedParen { position: usize },

    #[error("unknown variable '{name}' at position {position}")]
    UnknownVariable { name: String, position: usize },

    #[error("formula nests deeper than {max} levels")]
    TooDeep { max: usize },
}

impl SyntaxError {
    /// The piece of formula text the error is about, when there is one.
    pub fn offending_token(&self) -> Option<String> {
        match self {
            SyntaxError::UnexpectedChar { ch, .. } => Some(ch.to_string()),
            SyntaxError::InvalidNumber { text, .. } => Some(text.clone()),
            SyntaxError::UnexpectedToken { token, .. } => Some(token.clone()),
            SyntaxError::FunctionCall { name, .. } => Some(name.clone()),
            SyntaxError::UnknownVariable { name, .. } => Some(name.clone()),
            SyntaxError::UnclosedParen { .. } => Some("(".to_string()),
            _ => None,
        }
    }

    /// Character offset of the offending token, when there is one.
    pub fn position(&self) -> Option<usize> {
        match self {
            SyntaxError::UnexpectedChar { position, .. }
            | SyntaxError::InvalidNumber { position, .. }
            | SyntaxError::UnexpectedToken { position, .. }
            | SyntaxError::FunctionCall { position, .. }
            | SyntaxError::UnclosedParen { position }
            | SyntaxError::UnknownVariable { position, .. } => Some(*position),
            _ => None,
        }
    }
}

/// Failure while evaluating a parsed formula.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvalError {
    #[error("unknown variable '{name}'")]
    UnknownVariable { name: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("result is not a finite number")]
    NonFinite,
}

/// Either phase failing, for callers that parse and evaluate in one go.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    #[error(transparent)]
    Eval(#[from] EvalError),
}

// ---

/// Name to value lookup used during evaluation.
pub trait Bindings {
    fn lookup(&self, name: &str) -> Option<f64>;
}

impl Bindings for HashMap<String, f64> {
    fn lookup(&self, name: &str) -> Option<f64> {
        self.get(name).copied()
    }
}

impl Bindings for BTreeMap<String, f64> {
    fn lookup(&self, name: &str) -> Option<f64> {
        self.get(name).copied()
    }
}

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sym = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        };
        f.write_str(sym)
    }
}

/// Typed formula AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable { name: String, position: usize },
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    fn collect_variables<'a>(&'a self, out: &mut Vec<(&'a str, usize)>) {
        match self {
            Expr::Number(_) => {}
            Expr::Variable { name, position } => out.push((name, *position)),
            Expr::Neg(inner) => inner.collect_variables(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_variables(out);
                rhs.collect_variables(out);
            }
        }
    }

    fn eval<B: Bindings + ?Sized>(&self, bindings: &B) -> Result<f64, EvalError> {
        // ---
        let value = match self {
            Expr::Number(n) => *n,
            Expr::Variable { name, .. } => bindings
                .lookup(name)
                .ok_or_else(|| EvalError::UnknownVariable { name: name.clone() })?,
            Expr::Neg(inner) => -inner.eval(bindings)?,
            Expr::Binary { op, lhs, rhs } => {
                let l = lhs.eval(bindings)?;
                let r = rhs.eval(bindings)?;
                match op {
                    BinaryOp::Add => l + r,
                    BinaryOp::Sub => l - r,
                    BinaryOp::Mul => l * r,
                    BinaryOp::Div => {
                        if r == 0.0 {
                            return Err(EvalError::DivisionByZero);
                        }
                        l / r
                    }
                }
            }
        };

        if !value.is_finite() {
            return Err(EvalError::NonFinite);
        }
        Ok(value)
    }
}

/// A parsed formula. Immutable, `Send + Sync`, cheap to evaluate repeatedly.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    ast: Expr,
}

impl Formula {
    /// Parse `text` against the arithmetic grammar without checking
    /// variable names.
    pub fn parse(text: &str) -> Result<Self, SyntaxError> {
        // ---
        if text.chars().count() > MAX_FORMULA_LEN {
            return Err(SyntaxError::TooLong {
                max: MAX_FORMULA_LEN,
            });
        }
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err(SyntaxError::Empty);
        }
        let ast = Parser::new(tokens).parse()?;
        Ok(Self {
            source: text.to_string(),
            ast,
        })
    }

    /// Distinct variable names referenced by the formula.
    pub fn variables(&self) -> BTreeSet<&str> {
        self.variable_refs().into_iter().map(|(n, _)| n).collect()
    }

    pub fn references(&self, name: &str) -> bool {
        self.variable_refs().iter().any(|(n, _)| *n == name)
    }

    /// Fails on the first reference (in source order) that `is_known`
    /// rejects.
    pub fn check_variables(&self, is_known: impl Fn(&str) -> bool) -> Result<(), SyntaxError> {
        // ---
        match self.variable_refs().into_iter().find(|(n, _)| !is_known(n)) {
            Some((name, position)) => Err(SyntaxError::UnknownVariable {
                name: name.to_string(),
                position,
            }),
            None => Ok(()),
        }
    }

    pub fn evaluate<B: Bindings + ?Sized>(&self, bindings: &B) -> Result<f64, EvalError> {
        self.ast.eval(bindings)
    }

    fn variable_refs(&self) -> Vec<(&str, usize)> {
        let mut out = Vec::new();
        self.ast.collect_variables(&mut out);
        out
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse `text` and check every referenced variable against `known`.
///
/// Runs at authoring time, before any reading exists, so only names are
/// checked.
pub fn validate<S: AsRef<str>>(text: &str, known: &[S]) -> Result<Formula, SyntaxError> {
    // ---
    let formula = Formula::parse(text)?;
    formula.check_variables(|name| known.iter().any(|k| k.as_ref() == name))?;
    Ok(formula)
}

/// Parse and evaluate `text` in one step.
pub fn evaluate<B: Bindings + ?Sized>(text: &str, bindings: &B) -> Result<f64, FormulaError> {
    let formula = Formula::parse(text)?;
    Ok(formula.evaluate(bindings)?)
}

/// `true` if `name` can be referenced from a formula as a whole identifier.
pub fn is_identifier(name: &str) -> bool {
    // ---
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if is_ident_start(c) => chars.all(is_ident_continue),
        _ => false,
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

// ---

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

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{n}"),
            Token::Ident(name) => f.write_str(name),
            Token::Plus => f.write_str("+"),
            Token::Minus => f.write_str("-"),
            Token::Star => f.write_str("*"),
            Token::Slash => f.write_str("/"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Spanned {
    token: Token,
    position: usize,
}

fn tokenize(text: &str) -> Result<Vec<Spanned>, SyntaxError> {
    // ---
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let token = match c {
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '(' => Token::LParen,
            ')' => Token::RParen,
            _ if c.is_ascii_digit()
                || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) =>
            {
                i = scan_number(&chars, i);
                let literal: String = chars[start..i].iter().collect();
                let value = literal
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| SyntaxError::InvalidNumber {
                        text: literal.clone(),
                        position: start,
                    })?;
                tokens.push(Spanned {
                    token: Token::Number(value),
                    position: start,
                });
                continue;
            }
            _ if is_ident_start(c) => {
                while i < chars.len() && is_ident_continue(chars[i]) {
                    i += 1;
                }
                tokens.push(Spanned {
                    token: Token::Ident(chars[start..i].iter().collect()),
                    position: start,
                });
                continue;
            }
            _ => {
                return Err(SyntaxError::UnexpectedChar {
                    ch: c,
                    position: start,
                })
            }
        };

        tokens.push(Spanned {
            token,
            position: start,
        });
        i += 1;
    }

    Ok(tokens)
}

/// Returns the index one past the end of the numeric literal at `i`.
fn scan_number(chars: &[char], mut i: usize) -> usize {
    // ---
    let digits = |chars: &[char], mut i: usize| {
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        i
    };

    i = digits(chars, i);
    if i < chars.len() && chars[i] == '.' {
        i = digits(chars, i + 1);
    }

    // Exponent only when digits actually follow, so `2e` stays `2` then `e`.
    if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
        let mut j = i + 1;
        if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].is_ascii_digit() {
            i = digits(chars, j);
        }
    }
    i
}

// ---

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn parse(mut self) -> Result<Expr, SyntaxError> {
        // ---
        let expr = self.expr()?;
        match self.tokens.get(self.pos) {
            None => Ok(expr),
            Some(extra) => Err(unexpected(extra)),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn next(&mut self) -> Option<Spanned> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn enter(&mut self) -> Result<(), SyntaxError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(SyntaxError::TooDeep { max: MAX_DEPTH });
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<Expr, SyntaxError> {
        // ---
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn term(&mut self) -> Result<Expr, SyntaxError> {
        // ---
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, SyntaxError> {
        // ---
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            self.enter()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, SyntaxError> {
        // ---
        let Some(Spanned { token, position }) = self.next() else {
            return Err(SyntaxError::UnexpectedEnd);
        };

        match token {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Ident(name) => {
                if self.peek() == Some(&Token::LParen) {
                    return Err(SyntaxError::FunctionCall { name, position });
                }
                Ok(Expr::Variable { name, position })
            }
            Token::LParen => {
                self.enter()?;
                let inner = self.expr()?;
                match self.next() {
                    Some(Spanned {
                        token: Token::RParen,
                        ..
                    }) => {
                        self.depth -= 1;
                        Ok(inner)
                    }
                    Some(other) => Err(unexpected(&other)),
                    None => Err(SyntaxError::UnclosedParen { position }),
                }
            }
            other => Err(SyntaxError::UnexpectedToken {
                token: other.to_string(),
                position,
            }),
        }
    }
}

fn unexpected(s: &Spanned) -> SyntaxError {
    SyntaxError::UnexpectedToken {
        token: s.token.to_string(),
        position: s.position,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn vars(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_precedence_and_associativity() {
        // ---
        let b = vars(&[]);
        assert_eq!(evaluate("1 + 2 * 3", &b), Ok(7.0));
        assert_eq!(evaluate("(1 + 2) * 3", &b), Ok(9.0));
        assert_eq!(evaluate("10 - 4 - 3", &b), Ok(3.0));
        assert_eq!(evaluate("24 / 4 / 2", &b), Ok(3.0));
        assert_eq!(evaluate("-2 * -3", &b), Ok(6.0));
        assert_eq!(evaluate("--4", &b), Ok(4.0));
        assert_eq!(evaluate("1.5e2 + .5", &b), Ok(150.5));
    }

    #[test]
    fn test_variables_bind_as_whole_identifiers() {
        // ---
        let b = vars(&[("a", 2.0), ("abc", 5.0)]);
        assert_eq!(evaluate("abc + a", &b), Ok(7.0));

        // `a` must not leak into `abc` when `abc` is unbound.
        let only_a = vars(&[("a", 2.0)]);
        assert_eq!(
            evaluate("abc + a", &only_a),
            Err(FormulaError::Eval(EvalError::UnknownVariable {
                name: "abc".to_string()
            }))
        );
    }

    #[test]
    fn test_validate_checks_names_without_values() {
        // ---
        let known = ["P", "K"];
        let formula = validate("P * K", &known).expect("valid formula");
        assert_eq!(formula.variables(), BTreeSet::from(["K", "P"]));

        let err = validate("P * Kx", &known).unwrap_err();
        assert_eq!(
            err,
            SyntaxError::UnknownVariable {
                name: "Kx".to_string(),
                position: 4
            }
        );
        assert_eq!(err.offending_token().as_deref(), Some("Kx"));
    }

    #[test]
    fn test_grammar_rejects_non_arithmetic() {
        // ---
        let known = ["x", "y", "os"];
        let rejected = [
            "sqrt(x)",
            "x = 1",
            "x.y",
            "os.system",
            "__import__('os')",
            "x; y",
            "x ** 2",
            "x ^ 2",
            "x % 2",
            "[x]",
            "x, y",
            "x > y",
            "x ? 1 : 2",
            "+x",
            "2x",
            "x y",
            "",
            "   ",
            "(x",
            "x)",
            "x +",
        ];
        for text in rejected {
            assert!(validate(text, &known).is_err(), "accepted {text:?}");
        }
    }

    #[test]
    fn test_error_names_offending_token() {
        // ---
        let err = Formula::parse("a * max(b)").unwrap_err();
        assert_eq!(
            err,
            SyntaxError::FunctionCall {
                name: "max".to_string(),
                position: 4
            }
        );

        let err = Formula::parse("a = 3").unwrap_err();
        assert_eq!(err.offending_token().as_deref(), Some("="));
        assert_eq!(err.position(), Some(2));

        assert_eq!(
            Formula::parse("(a + b").unwrap_err(),
            SyntaxError::UnclosedParen { position: 0 }
        );
    }

    #[test]
    fn test_eval_errors() {
        // ---
        let b = vars(&[("x", 0.0), ("big", 1e308)]);
        assert_eq!(
            evaluate("1 / x", &b),
            Err(FormulaError::Eval(EvalError::DivisionByZero))
        );
        assert_eq!(
            evaluate("1 / -x", &b),
            Err(FormulaError::Eval(EvalError::DivisionByZero))
        );
        assert_eq!(
            evaluate("big * 10", &b),
            Err(FormulaError::Eval(EvalError::NonFinite))
        );
        assert!(matches!(
            evaluate("1e999", &b),
            Err(FormulaError::Syntax(SyntaxError::InvalidNumber { .. }))
        ));
    }

    #[test]
    fn test_nesting_is_bounded() {
        // ---
        let ok = format!("{}1{}", "(".repeat(MAX_DEPTH), ")".repeat(MAX_DEPTH));
        assert!(Formula::parse(&ok).is_ok());

        let deep = format!(
            "{}1{}",
            "(".repeat(MAX_DEPTH + 1),
            ")".repeat(MAX_DEPTH + 1)
        );
        assert_eq!(
            Formula::parse(&deep).unwrap_err(),
            SyntaxError::TooDeep { max: MAX_DEPTH }
        );

        let negs = format!("{}1", "-".repeat(MAX_DEPTH + 1));
        assert!(Formula::parse(&negs).is_err());

        let long = vec!["1"; MAX_FORMULA_LEN].join("+");
        assert_eq!(
            Formula::parse(&long).unwrap_err(),
            SyntaxError::TooLong {
                max: MAX_FORMULA_LEN
            }
        );
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        // ---
        let b = vars(&[("a", 0.1), ("b", 0.2), ("c", 3.0)]);
        let formula = Formula::parse("(a + b) * c / 7 - a * b").unwrap();
        let first = formula.evaluate(&b).unwrap();
        for _ in 0..100 {
            assert_eq!(formula.evaluate(&b).unwrap().to_bits(), first.to_bits());
        }
    }

    #[test]
    fn test_identifier_shape() {
        // ---
        assert!(is_identifier("P"));
        assert!(is_identifier("_h2o"));
        assert!(is_identifier("Nível"));
        assert!(!is_identifier("2P"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
    }
}
