//! Rule predicate language
//!
//! A small, side-effect free expression language evaluated over the fields
//! of a normalized message:
//!
//! ```text
//! "cherry picked from commit" in message
//! subject.startswith("mms") and "alice@example.com" in addr_from
//! matches(subject, "^\[rust-.*\]") || is_spam
//! header("X-Mailing-List") == "announce"
//! ```
//!
//! Expressions are parsed once into an [`Expr`] and evaluated by a tree
//! walking interpreter. Evaluation never mutates state.

use regex::{Regex, RegexBuilder};
use std::fmt;
use thiserror::Error;

/// Maximum compiled size of a `matches()` pattern
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Value of a message field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Text(&'a str),
    Flag(bool),
}

/// Anything predicates can be evaluated against
pub trait FieldSource {
    /// Named field, `None` when the name is unknown
    fn field(&self, name: &str) -> Option<FieldValue<'_>>;

    /// Raw header by wire name
    fn header(&self, name: &str) -> Option<&str>;
}

/// Predicate parse or evaluation failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PredicateError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("unknown field {0:?}")]
    UnknownField(String),

    #[error("unknown function {0:?}")]
    UnknownFunction(String),

    #[error("{function}() takes {expected} argument(s), got {got}")]
    Arity {
        function: String,
        expected: usize,
        got: usize,
    },

    #[error("type mismatch: {0}")]
    Type(String),

    #[error("invalid pattern {pattern:?}: {message}")]
    Regex { pattern: String, message: String },
}

impl From<PredicateError> for mailjudge_common::Error {
    fn from(e: PredicateError) -> Self {
        mailjudge_common::Error::Predicate(e.to_string())
    }
}

type Result<T> = std::result::Result<T, PredicateError>;

/// Boolean expression
#[derive(Debug, Clone)]
pub enum Expr {
    /// Truthiness of a single operand
    Value(Operand),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    /// `needle in haystack`
    In,
    NotIn,
}

/// String test functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Contains,
    StartsWith,
    EndsWith,
    Equals,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "contains" => Some(Func::Contains),
            "startswith" => Some(Func::StartsWith),
            "endswith" => Some(Func::EndsWith),
            "equals" => Some(Func::Equals),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Func::Contains => "contains",
            Func::StartsWith => "startswith",
            Func::EndsWith => "endswith",
            Func::Equals => "equals",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Operand {
    Str(String),
    Bool(bool),
    Field(String),
    Header(String),
    Call { func: Func, subject: Box<Operand>, arg: Box<Operand> },
    Matches { subject: Box<Operand>, regex: Regex },
    Group(Box<Expr>),
}

/// Evaluated operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Value<'a> {
    Text(&'a str),
    Bool(bool),
}

impl Value<'_> {
    fn truthy(self) -> bool {
        match self {
            Value::Text(text) => !text.is_empty(),
            Value::Bool(flag) => flag,
        }
    }
}

impl<'a> Value<'a> {
    fn text(self, context: &str) -> Result<&'a str> {
        match self {
            Value::Text(text) => Ok(text),
            Value::Bool(_) => Err(PredicateError::Type(format!(
                "{} expects text, got a boolean",
                context
            ))),
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompareOp::Eq => f.write_str("=="),
            CompareOp::NotEq => f.write_str("!="),
            CompareOp::In => f.write_str("in"),
            CompareOp::NotIn => f.write_str("not in"),
        }
    }
}

impl Expr {
    /// Evaluate against a message. `and`/`or` short-circuit.
    pub fn eval<S: FieldSource + ?Sized>(&self, source: &S) -> Result<bool> {
        match self {
            Expr::Value(operand) => Ok(operand.value(source)?.truthy()),
            Expr::Compare { left, op, right } => {
                let left = left.value(source)?;
                let right = right.value(source)?;
                compare(left, *op, right)
            }
            Expr::Not(inner) => Ok(!inner.eval(source)?),
            Expr::And(a, b) => Ok(a.eval(source)? && b.eval(source)?),
            Expr::Or(a, b) => Ok(a.eval(source)? || b.eval(source)?),
        }
    }
}

fn compare(left: Value<'_>, op: CompareOp, right: Value<'_>) -> Result<bool> {
    match op {
        CompareOp::Eq | CompareOp::NotEq => {
            let equal = match (left, right) {
                (Value::Text(a), Value::Text(b)) => a == b,
                (Value::Bool(a), Value::Bool(b)) => a == b,
                _ => {
                    return Err(PredicateError::Type(format!(
                        "cannot compare text and boolean with {}",
                        op
                    )))
                }
            };
            Ok(if op == CompareOp::Eq { equal } else { !equal })
        }
        CompareOp::In | CompareOp::NotIn => {
            let context = op.to_string();
            let needle = left.text(&context)?;
            let haystack = right.text(&context)?;
            let found = haystack.contains(needle);
            Ok(if op == CompareOp::In { found } else { !found })
        }
    }
}

impl Operand {
    fn value<'a, S: FieldSource + ?Sized>(&'a self, source: &'a S) -> Result<Value<'a>> {
        match self {
            Operand::Str(text) => Ok(Value::Text(text)),
            Operand::Bool(flag) => Ok(Value::Bool(*flag)),
            Operand::Field(name) => match source.field(name) {
                Some(FieldValue::Text(text)) => Ok(Value::Text(text)),
                Some(FieldValue::Flag(flag)) => Ok(Value::Bool(flag)),
                None => Err(PredicateError::UnknownField(name.clone())),
            },
            Operand::Header(name) => Ok(Value::Text(source.header(name).unwrap_or(""))),
            Operand::Call { func, subject, arg } => {
                let subject = subject.value(source)?.text(func.name())?;
                let arg = arg.value(source)?.text(func.name())?;
                let result = match func {
                    Func::Contains => subject.contains(arg),
                    Func::StartsWith => subject.starts_with(arg),
                    Func::EndsWith => subject.ends_with(arg),
                    Func::Equals => subject == arg,
                };
                Ok(Value::Bool(result))
            }
            Operand::Matches { subject, regex } => {
                let subject = subject.value(source)?.text("matches")?;
                Ok(Value::Bool(regex.is_match(subject)))
            }
            Operand::Group(expr) => Ok(Value::Bool(expr.eval(source)?)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Str(String),
    Ident(String),
    LParen,
    RParen,
    Comma,
    Dot,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Bang,
}

fn syntax(offset: usize, message: impl Into<String>) -> PredicateError {
    PredicateError::Syntax {
        offset,
        message: message.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '"' | '\'' => {
                chars.next();
                let quote = c;
                let mut text = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        // only quotes and backslash are escapes; `\d`, `\[`
                        // and friends reach `matches()` untouched
                        '\\' => match chars.next() {
                            Some((_, escaped @ ('"' | '\'' | '\\'))) => text.push(escaped),
                            Some((_, other)) => {
                                text.push('\\');
                                text.push(other);
                            }
                            None => break,
                        },
                        c if c == quote => {
                            closed = true;
                            break;
                        }
                        c => text.push(c),
                    }
                }
                if !closed {
                    return Err(syntax(offset, "unterminated string"));
                }
                tokens.push((Token::Str(text), offset));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((Token::Ident(ident), offset));
            }
            _ => {
                chars.next();
                let next = chars.peek().map(|&(_, c)| c);
                let token = match (c, next) {
                    ('(', _) => Token::LParen,
                    (')', _) => Token::RParen,
                    (',', _) => Token::Comma,
                    ('.', _) => Token::Dot,
                    ('=', Some('=')) => Token::EqEq,
                    ('!', Some('=')) => Token::NotEq,
                    ('&', Some('&')) => Token::AndAnd,
                    ('|', Some('|')) => Token::OrOr,
                    ('!', _) => Token::Bang,
                    _ => return Err(syntax(offset, format!("unexpected character {:?}", c))),
                };
                if matches!(token, Token::EqEq | Token::NotEq | Token::AndAnd | Token::OrOr) {
                    chars.next();
                }
                tokens.push((token, offset));
            }
        }
    }

    Ok(tokens)
}

/// Parse a predicate expression
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
    };
    if parser.tokens.is_empty() {
        return Err(syntax(0, "empty expression"));
    }
    let expr = parser.parse_or()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(syntax(parser.offset(), format!("unexpected {:?}", token))),
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(_, o)| *o)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        token
    }

    fn is_keyword(&self, ahead: usize, keyword: &str) -> bool {
        matches!(self.peek_at(ahead), Some(Token::Ident(i)) if i == keyword)
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        let offset = self.offset();
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(syntax(offset, format!("expected {:?}, found {:?}", expected, token))),
            None => Err(syntax(offset, format!("expected {:?}, found end of input", expected))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut expr = self.parse_and()?;
        while matches!(self.peek(), Some(Token::OrOr)) || self.is_keyword(0, "or") {
            self.advance();
            let right = self.parse_and()?;
            expr = Expr::Or(Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut expr = self.parse_not()?;
        while matches!(self.peek(), Some(Token::AndAnd)) || self.is_keyword(0, "and") {
            self.advance();
            let right = self.parse_not()?;
            expr = Expr::And(Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if matches!(self.peek(), Some(Token::Bang)) || self.is_keyword(0, "not") {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_operand()?;

        let op = match self.peek() {
            Some(Token::EqEq) => Some((CompareOp::Eq, 1)),
            Some(Token::NotEq) => Some((CompareOp::NotEq, 1)),
            Some(Token::Ident(i)) if i == "in" => Some((CompareOp::In, 1)),
            Some(Token::Ident(i)) if i == "not" && self.is_keyword(1, "in") => {
                Some((CompareOp::NotIn, 2))
            }
            _ => None,
        };
        let Some((op, width)) = op else {
            return Ok(Expr::Value(left));
        };
        self.pos += width;

        let right = self.parse_operand()?;
        Ok(Expr::Compare { left, op, right })
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        let mut operand = self.parse_primary()?;

        while matches!(self.peek(), Some(Token::Dot)) {
            self.advance();
            let offset = self.offset();
            let method = match self.advance() {
                Some(Token::Ident(name)) => name,
                _ => return Err(syntax(offset, "expected method name after '.'")),
            };
            let func = match method.as_str() {
                "startswith" | "endswith" | "contains" => Func::from_name(&method),
                _ => None,
            }
            .ok_or_else(|| PredicateError::UnknownFunction(method.clone()))?;

            let mut args = self.parse_args()?;
            if args.len() != 1 {
                return Err(PredicateError::Arity {
                    function: method,
                    expected: 1,
                    got: args.len(),
                });
            }
            operand = Operand::Call {
                func,
                subject: Box::new(operand),
                arg: Box::new(args.remove(0)),
            };
        }

        Ok(operand)
    }

    fn parse_primary(&mut self) -> Result<Operand> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::Str(text)) => Ok(Operand::Str(text)),
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(Operand::Group(Box::new(expr)))
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" | "True" => Ok(Operand::Bool(true)),
                "false" | "False" => Ok(Operand::Bool(false)),
                "and" | "or" | "not" | "in" => {
                    Err(syntax(offset, format!("unexpected keyword {:?}", name)))
                }
                _ if matches!(self.peek(), Some(Token::LParen)) => self.parse_call(name),
                _ => Ok(Operand::Field(name)),
            },
            Some(token) => Err(syntax(offset, format!("unexpected {:?}", token))),
            None => Err(syntax(offset, "unexpected end of input")),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Operand> {
        let mut args = self.parse_args()?;
        let arity = |expected: usize, got: usize| PredicateError::Arity {
            function: name.clone(),
            expected,
            got,
        };

        match name.as_str() {
            "header" => {
                if args.len() != 1 {
                    return Err(arity(1, args.len()));
                }
                match args.remove(0) {
                    Operand::Str(header) => Ok(Operand::Header(header)),
                    _ => Err(PredicateError::Type(
                        "header() expects a string literal".to_string(),
                    )),
                }
            }
            "matches" => {
                if args.len() != 2 {
                    return Err(arity(2, args.len()));
                }
                let pattern = match args.remove(1) {
                    Operand::Str(pattern) => pattern,
                    _ => {
                        return Err(PredicateError::Type(
                            "matches() expects a string literal pattern".to_string(),
                        ))
                    }
                };
                let regex = RegexBuilder::new(&pattern)
                    .case_insensitive(true)
                    .size_limit(REGEX_SIZE_LIMIT)
                    .build()
                    .map_err(|e| PredicateError::Regex {
                        pattern: pattern.clone(),
                        message: e.to_string(),
                    })?;
                Ok(Operand::Matches {
                    subject: Box::new(args.remove(0)),
                    regex,
                })
            }
            _ => {
                let func = Func::from_name(&name)
                    .ok_or_else(|| PredicateError::UnknownFunction(name.clone()))?;
                if args.len() != 2 {
                    return Err(arity(2, args.len()));
                }
                let arg = args.remove(1);
                let subject = args.remove(0);
                Ok(Operand::Call {
                    func,
                    subject: Box::new(subject),
                    arg: Box::new(arg),
                })
            }
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Operand>> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if matches!(self.peek(), Some(Token::RParen)) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_operand()?);
            let offset = self.offset();
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                _ => return Err(syntax(offset, "expected ',' or ')'")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    struct Fields(HashMap<&'static str, FieldValue<'static>>);

    impl FieldSource for Fields {
        fn field(&self, name: &str) -> Option<FieldValue<'_>> {
            self.0.get(name).copied()
        }

        fn header(&self, name: &str) -> Option<&str> {
            match name {
                "X-Mailing-List" => Some("announce"),
                _ => None,
            }
        }
    }

    fn fields() -> Fields {
        Fields(HashMap::from([
            ("subject", FieldValue::Text("mms from bob")),
            ("addr_from", FieldValue::Text("bob <bob@example.com>")),
            ("message", FieldValue::Text("(cherry picked from commit 1234abcd)")),
            ("addr_cc", FieldValue::Text("")),
            ("is_spam", FieldValue::Flag(false)),
        ]))
    }

    fn eval(source: &str) -> Result<bool> {
        parse(source)?.eval(&fields())
    }

    #[test]
    fn test_membership() {
        assert_eq!(eval(r#""cherry picked from commit" in message"#), Ok(true));
        assert_eq!(eval(r#""reverted" in message"#), Ok(false));
        assert_eq!(eval(r#""reverted" not in message"#), Ok(true));
    }

    #[test]
    fn test_methods_and_boolean_operators() {
        assert_eq!(
            eval(r#"subject.startswith("mms") and "bob@example.com" in addr_from"#),
            Ok(true)
        );
        assert_eq!(eval(r#"subject.endswith("bob") && !is_spam"#), Ok(true));
        assert_eq!(eval(r#"is_spam or subject.contains("alice")"#), Ok(false));
        assert_eq!(eval(r#"not (is_spam || addr_cc)"#), Ok(true));
    }

    #[test]
    fn test_functions() {
        assert_eq!(eval(r#"contains(subject, "from")"#), Ok(true));
        assert_eq!(eval(r#"startswith(addr_from, "bob")"#), Ok(true));
        assert_eq!(eval(r#"endswith(addr_from, ".org>")"#), Ok(false));
        assert_eq!(eval(r#"equals(subject, "mms from bob")"#), Ok(true));
        assert_eq!(eval(r#"matches(subject, "^MMS\s+from")"#), Ok(true));
        assert_eq!(eval(r#"header("X-Mailing-List") == "announce""#), Ok(true));
        assert_eq!(eval(r#"header("X-Missing") == """#), Ok(true));
    }

    #[test]
    fn test_regex_escapes_are_kept() {
        let source = Fields(HashMap::from([
            ("subject", FieldValue::Text("[rust-announce] release 1.82")),
            ("message", FieldValue::Text(r#"she said "hi" \o/"#)),
        ]));

        let expr = parse(r#"matches(subject, "^\[rust-.*\]")"#).unwrap();
        assert_eq!(expr.eval(&source), Ok(true));

        let expr = parse(r#"matches(subject, "release \d+\.\d+$")"#).unwrap();
        assert_eq!(expr.eval(&source), Ok(true));

        let expr = parse(r#"matches(subject, "\d{4}")"#).unwrap();
        assert_eq!(expr.eval(&source), Ok(false));

        let expr = parse(r#""\"hi\" \\o/" in message"#).unwrap();
        assert_eq!(expr.eval(&source), Ok(true));
    }

    #[test]
    fn test_documented_examples_parse() {
        for source in [
            r#""cherry picked from commit" in message"#,
            r#"subject.startswith("mms") and "alice@example.com" in addr_from"#,
            r#"matches(subject, "^\[rust-.*\]") || is_spam"#,
            r#"header("X-Mailing-List") == "announce""#,
        ] {
            assert!(parse(source).is_ok(), "{}", source);
        }
    }

    #[test]
    fn test_equality() {
        assert_eq!(eval(r#"subject == 'mms from bob'"#), Ok(true));
        assert_eq!(eval(r#"subject != "mms from bob""#), Ok(false));
        assert_eq!(eval("is_spam == false"), Ok(true));
    }

    #[test]
    fn test_precedence() {
        // and binds tighter than or
        assert_eq!(eval(r#"true or false and false"#), Ok(true));
        assert_eq!(eval(r#"(true or false) and false"#), Ok(false));
        assert_eq!(eval(r#"not "x" in subject"#), Ok(true));
    }

    #[test]
    fn test_short_circuit_skips_errors() {
        assert_eq!(eval("false and no_such_field"), Ok(false));
        assert_eq!(eval("true or no_such_field"), Ok(true));
    }

    #[test]
    fn test_evaluation_errors() {
        assert_eq!(
            eval("no_such_field"),
            Err(PredicateError::UnknownField("no_such_field".to_string()))
        );
        assert!(matches!(eval(r#""x" in is_spam"#), Err(PredicateError::Type(_))));
        assert!(matches!(eval(r#"subject == true"#), Err(PredicateError::Type(_))));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse(""), Err(PredicateError::Syntax { .. })));
        assert!(matches!(parse(r#""open"#), Err(PredicateError::Syntax { .. })));
        assert!(matches!(parse("subject =="), Err(PredicateError::Syntax { .. })));
        assert!(matches!(parse("(subject"), Err(PredicateError::Syntax { .. })));
        assert!(matches!(parse("subject $ x"), Err(PredicateError::Syntax { .. })));
        assert!(matches!(parse("__import__('os')"), Err(PredicateError::UnknownFunction(_))));
        assert!(matches!(parse("subject.upper()"), Err(PredicateError::UnknownFunction(_))));
        assert!(matches!(parse(r#"contains(subject)"#), Err(PredicateError::Arity { .. })));
        assert!(matches!(parse(r#"matches(subject, "(")"#), Err(PredicateError::Regex { .. })));
    }

    #[test]
    fn test_error_converts_to_common_error() {
        let err: mailjudge_common::Error = PredicateError::UnknownField("x".to_string()).into();
        assert_eq!(err.code(), "PREDICATE_ERROR");
    }
}
