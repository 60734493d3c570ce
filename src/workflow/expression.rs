//! Context Expressions
//!
//! A small expression language evaluated against the shared context. It
//! drives step `condition`s, the `condition` executor, and `script`
//! expressions.
//!
//! # Syntax
//!
//! - Literals: `42`, `1.5`, `'text'`, `"text"`, `true`, `false`, `null`
//! - Context paths: `user.name`, `rows.0` (missing paths are `null`)
//! - Braced paths for keys that are not plain words: `${fetch-data.rows}`
//! - Operators, loosest first: `||`, `&&`, `== !=`, `< <= > >=`, `+ -`, `* /`, unary `! -`
//! - Functions: `exists(path)`, `len(value)`
//!
//! `+` concatenates when either side is a string. `&&` and `||` short-circuit
//! and yield booleans based on truthiness.

use serde_json::{Number, Value};
use thiserror::Error;

use super::model::Context;

/// Errors raised while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("Syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("Type error: {0}")]
    Type(String),

    #[error("Unknown function: '{0}'")]
    UnknownFunction(String),

    #[error("Division by zero")]
    DivisionByZero,
}

fn syntax(position: usize, message: impl Into<String>) -> ExpressionError {
    ExpressionError::Syntax {
        position,
        message: message.into(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    /// `${...}` reference; never a literal or function name
    Path(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

const OPERATORS: &[&str] = &[
    "==", "!=", "<=", ">=", "&&", "||", "<", ">", "!", "+", "-", "*", "/",
];

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    'outer: while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        match c {
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
                continue;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
                continue;
            }
            ',' => {
                tokens.push((i, Token::Comma));
                i += 1;
                continue;
            }
            '\'' | '"' => {
                let start = i;
                let mut text = String::new();
                i += 1;
                while i < chars.len() {
                    match chars[i] {
                        '\\' if i + 1 < chars.len() => {
                            text.push(chars[i + 1]);
                            i += 2;
                        }
                        ch if ch == c => {
                            tokens.push((start, Token::Str(text)));
                            i += 1;
                            continue 'outer;
                        }
                        ch => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                return Err(syntax(start, "unterminated string literal"));
            }
            _ => {}
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let number = text
                .parse::<f64>()
                .map_err(|_| syntax(start, format!("invalid number '{}'", text)))?;
            tokens.push((start, Token::Number(number)));
            continue;
        }

        if c == '$' && chars.get(i + 1) == Some(&'{') {
            let start = i;
            let Some(end) = chars[i + 2..].iter().position(|ch| *ch == '}') else {
                return Err(syntax(start, "unterminated '${' path"));
            };
            let path: String = chars[i + 2..i + 2 + end].iter().collect();
            let path = path.trim();
            if path.is_empty() {
                return Err(syntax(start, "empty '${}' path"));
            }
            tokens.push((start, Token::Path(path.to_string())));
            i += end + 3;
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '$')) {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push((start, Token::Ident(text)));
            continue;
        }

        let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
        match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                tokens.push((i, Token::Op(*op)));
                i += op.len();
            }
            None => return Err(syntax(i, format!("unexpected character '{}'", c))),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Call(String, Vec<Expr>),
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn eat_op(&mut self, ops: &[(&str, BinaryOp)]) -> Option<BinaryOp> {
        if let Some(Token::Op(op)) = self.peek() {
            if let Some((_, binary)) = ops.iter().find(|(text, _)| text == op) {
                let binary = *binary;
                self.pos += 1;
                return Some(binary);
            }
        }
        None
    }

    fn binary_level(
        &mut self,
        ops: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, ExpressionError>,
    ) -> Result<Expr, ExpressionError> {
        let mut left = next(self)?;
        while let Some(op) = self.eat_op(ops) {
            let right = next(self)?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(&[("||", BinaryOp::Or)], Self::and)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(&[("&&", BinaryOp::And)], Self::equality)
    }

    fn equality(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(
            &[("==", BinaryOp::Eq), ("!=", BinaryOp::Ne)],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(
            &[
                ("<", BinaryOp::Lt),
                ("<=", BinaryOp::Le),
                (">", BinaryOp::Gt),
                (">=", BinaryOp::Ge),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(
            &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(&[("*", BinaryOp::Mul), ("/", BinaryOp::Div)], Self::unary)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        match self.peek() {
            Some(Token::Op("!")) => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Some(Token::Op("-")) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let position = self.position();
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n)?)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Path(path)) => Ok(Expr::Path(path)),
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(syntax(position, "missing closing ')'")),
                }
            }
            Some(Token::Ident(name)) => {
                let literal = match name.as_str() {
                    "true" => Some(Value::Bool(true)),
                    "false" => Some(Value::Bool(false)),
                    "null" => Some(Value::Null),
                    _ => None,
                };
                if let Some(value) = literal {
                    return Ok(Expr::Literal(value));
                }
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Expr::Path(name.trim_start_matches('$').to_string()));
                }

                self.pos += 1;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.or()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                match self.advance() {
                    Some(Token::RParen) => Ok(Expr::Call(name, args)),
                    _ => Err(syntax(position, "missing ')' after function arguments")),
                }
            }
            Some(other) => Err(syntax(position, format!("unexpected token {:?}", other))),
            None => Err(syntax(position, "unexpected end of expression")),
        }
    }
}

/// A parsed expression, reusable across evaluations.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    /// Returns the original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the expression against a context.
    pub fn evaluate(&self, context: &Context) -> Result<Value, ExpressionError> {
        eval(&self.root, context)
    }
}

/// Parses an expression.
pub fn parse(source: &str) -> Result<Expression, ExpressionError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(syntax(0, "empty expression"));
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        end: source.chars().count(),
    };
    let root = parser.or()?;
    if parser.pos < parser.tokens.len() {
        return Err(syntax(parser.position(), "unexpected trailing input"));
    }

    Ok(Expression {
        source: source.to_string(),
        root,
    })
}

/// Parses and evaluates an expression in one go.
pub fn evaluate(source: &str, context: &Context) -> Result<Value, ExpressionError> {
    parse(source)?.evaluate(context)
}

/// Evaluates an expression and reduces the result to its truthiness.
pub fn evaluate_condition(source: &str, context: &Context) -> Result<bool, ExpressionError> {
    Ok(is_truthy(&evaluate(source, context)?))
}

/// `null`, `false`, `0`, `""`, `[]` and `{}` are false; everything else is true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Looks up a dotted path in the context.
///
/// An exact key match wins over path traversal, so flat keys containing
/// dots stay addressable.
pub fn lookup<'a>(context: &'a Context, path: &str) -> Option<&'a Value> {
    if let Some(value) = context.get(path) {
        return Some(value);
    }

    let mut segments = path.split('.');
    let mut current = context.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Replaces `${path}` placeholders with context values.
///
/// Strings are inserted verbatim, other values as JSON, missing paths as
/// empty text.
pub fn render_template(template: &str, context: &Context) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let path = after[..end].trim();
                if let Some(value) = lookup(context, path) {
                    output.push_str(&display_value(value));
                }
                rest = &after[end + 1..];
            }
            None => {
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    output.push_str(rest);
    output
}

/// Text form of a value: strings unquoted, everything else as JSON.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn number_value(n: f64) -> Result<Value, ExpressionError> {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        return Ok(Value::from(n as i64));
    }
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| ExpressionError::Type(format!("{} is not a finite number", n)))
}

fn as_number(value: &Value, op: &str) -> Result<f64, ExpressionError> {
    value
        .as_f64()
        .ok_or_else(|| ExpressionError::Type(format!("'{}' expects numbers, got {}", op, value)))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value, op: BinaryOp) -> Result<bool, ExpressionError> {
    let ordering = match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .ok_or_else(|| ExpressionError::Type("cannot compare NaN".to_string()))?,
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => {
            return Err(ExpressionError::Type(format!(
                "cannot compare {} with {}",
                a, b
            )))
        }
    };

    Ok(match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    })
}

fn eval(expr: &Expr, context: &Context) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(path) => Ok(lookup(context, path).cloned().unwrap_or(Value::Null)),
        Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&eval(inner, context)?))),
        Expr::Neg(inner) => number_value(-as_number(&eval(inner, context)?, "-")?),
        Expr::Call(name, args) => call(name, args, context),
        Expr::Binary(left, BinaryOp::Or, right) => {
            let l = is_truthy(&eval(left, context)?);
            Ok(Value::Bool(l || is_truthy(&eval(right, context)?)))
        }
        Expr::Binary(left, BinaryOp::And, right) => {
            let l = is_truthy(&eval(left, context)?);
            Ok(Value::Bool(l && is_truthy(&eval(right, context)?)))
        }
        Expr::Binary(left, op, right) => binary(*op, eval(left, context)?, eval(right, context)?),
    }
}

fn binary(op: BinaryOp, l: Value, r: Value) -> Result<Value, ExpressionError> {
    match op {
        BinaryOp::Or => Ok(Value::Bool(is_truthy(&l) || is_truthy(&r))),
        BinaryOp::And => Ok(Value::Bool(is_truthy(&l) && is_truthy(&r))),
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(&l, &r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            Ok(Value::Bool(compare(&l, &r, op)?))
        }
        BinaryOp::Add if l.is_string() || r.is_string() => Ok(Value::String(format!(
            "{}{}",
            display_value(&l),
            display_value(&r)
        ))),
        BinaryOp::Add => number_value(as_number(&l, "+")? + as_number(&r, "+")?),
        BinaryOp::Sub => number_value(as_number(&l, "-")? - as_number(&r, "-")?),
        BinaryOp::Mul => number_value(as_number(&l, "*")? * as_number(&r, "*")?),
        BinaryOp::Div => {
            let divisor = as_number(&r, "/")?;
            if divisor == 0.0 {
                return Err(ExpressionError::DivisionByZero);
            }
            number_value(as_number(&l, "/")? / divisor)
        }
    }
}

fn call(name: &str, args: &[Expr], context: &Context) -> Result<Value, ExpressionError> {
    match (name, args) {
        ("exists", [Expr::Path(path)]) => Ok(Value::Bool(lookup(context, path).is_some())),
        ("exists", _) => Err(ExpressionError::Type(
            "exists() takes a single context path".to_string(),
        )),
        ("len", [arg]) => match eval(arg, context)? {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(a) => Ok(Value::from(a.len())),
            Value::Object(o) => Ok(Value::from(o.len())),
            Value::Null => Ok(Value::from(0)),
            other => Err(ExpressionError::Type(format!("len() of {}", other))),
        },
        ("len", _) => Err(ExpressionError::Type("len() takes one argument".to_string())),
        _ => Err(ExpressionError::UnknownFunction(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Context {
        json!({
            "count": 3,
            "ratio": 0.5,
            "name": "ada",
            "flag": true,
            "empty": "",
            "user": { "role": "admin", "tags": ["a", "b"] },
            "fetch.rows": 10,
            "step-one": "done"
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_literals() {
        let c = Context::new();
        assert_eq!(evaluate("42", &c).unwrap(), json!(42));
        assert_eq!(evaluate("1.5", &c).unwrap(), json!(1.5));
        assert_eq!(evaluate("'hi'", &c).unwrap(), json!("hi"));
        assert_eq!(evaluate("\"hi\"", &c).unwrap(), json!("hi"));
        assert_eq!(evaluate("true", &c).unwrap(), json!(true));
        assert_eq!(evaluate("null", &c).unwrap(), Value::Null);
    }

    #[test]
    fn test_paths() {
        let c = ctx();
        assert_eq!(evaluate("count", &c).unwrap(), json!(3));
        assert_eq!(evaluate("user.role", &c).unwrap(), json!("admin"));
        assert_eq!(evaluate("user.tags.1", &c).unwrap(), json!("b"));
        assert_eq!(evaluate("fetch.rows", &c).unwrap(), json!(10));
        assert_eq!(evaluate("${step-one}", &c).unwrap(), json!("done"));
        assert_eq!(evaluate("${ user.role }", &c).unwrap(), json!("admin"));
        assert!(matches!(evaluate("${step-one", &c), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(evaluate("${}", &c), Err(ExpressionError::Syntax { .. })));
        assert_eq!(evaluate("missing.path", &c).unwrap(), Value::Null);
        assert_eq!(evaluate("$name", &c).unwrap(), json!("ada"));
    }

    #[test]
    fn test_comparisons() {
        let c = ctx();
        assert!(evaluate_condition("count == 3", &c).unwrap());
        assert!(evaluate_condition("count == 3.0", &c).unwrap());
        assert!(evaluate_condition("count != 4", &c).unwrap());
        assert!(evaluate_condition("count > 2 && count <= 3", &c).unwrap());
        assert!(evaluate_condition("name == 'ada'", &c).unwrap());
        assert!(evaluate_condition("name < 'bob'", &c).unwrap());
        assert!(!evaluate_condition("ratio >= 1", &c).unwrap());
    }

    #[test]
    fn test_logic_and_truthiness() {
        let c = ctx();
        assert!(evaluate_condition("flag", &c).unwrap());
        assert!(!evaluate_condition("!flag", &c).unwrap());
        assert!(!evaluate_condition("empty", &c).unwrap());
        assert!(!evaluate_condition("missing", &c).unwrap());
        assert!(evaluate_condition("missing || flag", &c).unwrap());
        assert!(!evaluate_condition("flag && (count > 10)", &c).unwrap());
    }

    #[test]
    fn test_short_circuit_skips_errors() {
        let c = ctx();
        assert!(!evaluate_condition("false && (1 / 0)", &c).unwrap());
        assert!(evaluate_condition("true || (1 / 0)", &c).unwrap());
    }

    #[test]
    fn test_arithmetic() {
        let c = ctx();
        assert_eq!(evaluate("count * 2 + 1", &c).unwrap(), json!(7));
        assert_eq!(evaluate("(count + 1) * 2", &c).unwrap(), json!(8));
        assert_eq!(evaluate("count / 2", &c).unwrap(), json!(1.5));
        assert_eq!(evaluate("-count", &c).unwrap(), json!(-3));
        assert_eq!(evaluate("10 - 4 - 3", &c).unwrap(), json!(3));
        assert_eq!(evaluate("count-1", &c).unwrap(), json!(2));
        assert_eq!(evaluate("count-ratio", &c).unwrap(), json!(2.5));
        assert_eq!(evaluate("${step-one} + '!'", &c).unwrap(), json!("done!"));
        assert!(evaluate_condition("count-1 == 2", &c).unwrap());
        assert!(evaluate_condition("count-ratio > 0", &c).unwrap());
    }

    #[test]
    fn test_string_concat() {
        let c = ctx();
        assert_eq!(evaluate("'hi ' + name", &c).unwrap(), json!("hi ada"));
        assert_eq!(evaluate("'rows: ' + count", &c).unwrap(), json!("rows: 3"));
    }

    #[test]
    fn test_functions() {
        let c = ctx();
        assert!(evaluate_condition("exists(user.role)", &c).unwrap());
        assert!(!evaluate_condition("exists(user.email)", &c).unwrap());
        assert_eq!(evaluate("len(user.tags)", &c).unwrap(), json!(2));
        assert_eq!(evaluate("len(name)", &c).unwrap(), json!(3));
        assert!(matches!(
            evaluate("nope(1)", &c),
            Err(ExpressionError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_errors() {
        let c = ctx();
        assert!(matches!(parse(""), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(parse("(1 + 2"), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(parse("'open"), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(parse("1 2"), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(parse("a # b"), Err(ExpressionError::Syntax { .. })));
        assert_eq!(evaluate("1 / 0", &c), Err(ExpressionError::DivisionByZero));
        assert!(matches!(evaluate("flag * 2", &c), Err(ExpressionError::Type(_))));
        assert!(matches!(evaluate("user < 1", &c), Err(ExpressionError::Type(_))));
    }

    #[test]
    fn test_parsed_expression_reuse() {
        let expr = parse("count + 1").unwrap();
        assert_eq!(expr.source(), "count + 1");

        let mut c = ctx();
        assert_eq!(expr.evaluate(&c).unwrap(), json!(4));
        c.insert("count".to_string(), json!(9));
        assert_eq!(expr.evaluate(&c).unwrap(), json!(10));
    }

    #[test]
    fn test_render_template() {
        let c = ctx();
        assert_eq!(
            render_template("hello ${name}, role=${user.role}", &c),
            "hello ada, role=admin"
        );
        assert_eq!(render_template("tags=${user.tags}", &c), "tags=[\"a\",\"b\"]");
        assert_eq!(render_template("x=${missing}!", &c), "x=!");
        assert_eq!(render_template("open ${name", &c), "open ${name");
        assert_eq!(render_template("plain", &c), "plain");
    }

    #[test]
    fn test_is_truthy() {
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!([])));
        assert!(!is_truthy(&json!({})));
        assert!(is_truthy(&json!(0.1)));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!([0])));
    }
}
