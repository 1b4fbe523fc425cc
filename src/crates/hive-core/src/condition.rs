//! Edge condition expression language.
//!
//! Grammar (see the graph spec format): identifiers referencing keys in the
//! source node's namespace, string/number/boolean literals, operators
//! `== != < <= > >= && || !`, parentheses, and the calls `exists(key)`,
//! `len(value)`, `contains(haystack, needle)`.
//!
//! Evaluation is pure and never unwinds: [`evaluate`] returns
//! `Result<Value, EvalError>` and [`holds`] collapses every error —
//! including unresolved identifiers and parse failures — to `false`.

use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Why an expression failed to evaluate. All variants collapse to `false`
/// at the edge-selection layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unresolved identifier '{0}'")]
    Unresolved(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("bad call: {0}")]
    BadCall(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    LParen,
    RParen,
    Comma,
    Minus,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{s}"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::Num(n) => write!(f, "{n}"),
            Token::Bool(b) => write!(f, "{b}"),
            Token::Null => write!(f, "null"),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
            Token::Minus => write!(f, "-"),
        }
    }
}

fn lex(input: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
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
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(EvalError::Parse("single '=' is not an operator".into()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(EvalError::Parse("single '&' is not an operator".into()));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(EvalError::Parse("single '|' is not an operator".into()));
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&'\\') => {
                            match chars.get(i + 1) {
                                Some(&esc) => {
                                    s.push(match esc {
                                        'n' => '\n',
                                        't' => '\t',
                                        other => other,
                                    });
                                    i += 2;
                                }
                                None => {
                                    return Err(EvalError::Parse(
                                        "unterminated escape in string literal".into(),
                                    ))
                                }
                            }
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => {
                            return Err(EvalError::Parse("unterminated string literal".into()))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| EvalError::Parse(format!("bad number '{text}'")))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(match text.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    _ => Token::Ident(text),
                });
            }
            other => return Err(EvalError::Parse(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Ident(String),
    Literal(Value),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
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
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: &Token) -> Result<(), EvalError> {
        match self.next() {
            Some(ref t) if t == token => Ok(()),
            Some(t) => Err(EvalError::Parse(format!("expected '{token}', found '{t}'"))),
            None => Err(EvalError::Parse(format!("expected '{token}', found end"))),
        }
    }

    // or := and ('||' and)*
    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // and := comparison ('&&' comparison)*
    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_comparison()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // comparison := unary (compare_op unary)?
    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::Ne) => CompareOp::Ne,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::Le) => CompareOp::Le,
            Some(Token::Gt) => CompareOp::Gt,
            Some(Token::Ge) => CompareOp::Ge,
            _ => return Ok(left),
        };
        self.next();
        let right = self.parse_unary()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    // unary := '!' unary | '-' unary | primary
    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        match self.peek() {
            Some(Token::Not) => {
                self.next();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::Minus) => {
                self.next();
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    // primary := literal | ident | ident '(' args ')' | '(' or ')'
    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Bool(b)) => Ok(Expr::Literal(Value::Bool(b))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.next();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.next();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(&Token::RParen)?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(t) => Err(EvalError::Parse(format!("unexpected token '{t}'"))),
            None => Err(EvalError::Parse("unexpected end of expression".into())),
        }
    }
}

/// Parse an expression string.
pub fn parse(input: &str) -> Result<Expr, EvalError> {
    let tokens = lex(input)?;
    if tokens.is_empty() {
        return Err(EvalError::Parse("empty expression".into()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(EvalError::Parse("trailing tokens after expression".into()));
    }
    Ok(expr)
}

/// Look up a (possibly dotted) identifier in the namespace.
fn resolve<'a>(name: &str, ns: &'a Map<String, Value>) -> Option<&'a Value> {
    if let Some(v) = ns.get(name) {
        return Some(v);
    }
    let mut parts = name.split('.');
    let mut current = ns.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Truthiness used by `&&`, `||`, `!`, and [`holds`]: null and false are
/// false; numbers are true when non-zero; strings, arrays, and objects are
/// true when non-empty.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool, EvalError> {
    use CompareOp::*;
    match op {
        Eq => Ok(values_equal(left, right)),
        Ne => Ok(!values_equal(left, right)),
        Lt | Le | Gt | Ge => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => {
                    let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                    a.partial_cmp(&b).ok_or_else(|| {
                        EvalError::TypeMismatch("NaN is not comparable".into())
                    })?
                }
                (Value::String(a), Value::String(b)) => a.cmp(b),
                (a, b) => {
                    return Err(EvalError::TypeMismatch(format!(
                        "cannot order {} and {}",
                        type_name(a),
                        type_name(b)
                    )))
                }
            };
            Ok(match op {
                Lt => ordering.is_lt(),
                Le => ordering.is_le(),
                Gt => ordering.is_gt(),
                Ge => ordering.is_ge(),
                _ => unreachable!(),
            })
        }
    }
}

/// Structural equality with numeric coercion (1 == 1.0).
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (a, b) => a == b,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Evaluate an expression against a namespace.
pub fn evaluate(expr: &Expr, ns: &Map<String, Value>) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => resolve(name, ns)
            .cloned()
            .ok_or_else(|| EvalError::Unresolved(name.clone())),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&evaluate(inner, ns)?))),
        Expr::Neg(inner) => match evaluate(inner, ns)? {
            Value::Number(n) => {
                let f = n.as_f64().ok_or_else(|| {
                    EvalError::TypeMismatch("cannot negate this number".into())
                })?;
                Ok(serde_json::Number::from_f64(-f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null))
            }
            other => Err(EvalError::TypeMismatch(format!(
                "cannot negate {}",
                type_name(&other)
            ))),
        },
        Expr::And(l, r) => {
            if !truthy(&evaluate(l, ns)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&evaluate(r, ns)?)))
        }
        Expr::Or(l, r) => {
            if truthy(&evaluate(l, ns)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&evaluate(r, ns)?)))
        }
        Expr::Compare(op, l, r) => {
            let left = evaluate(l, ns)?;
            let right = evaluate(r, ns)?;
            Ok(Value::Bool(compare(*op, &left, &right)?))
        }
        Expr::Call(name, args) => call(name, args, ns),
    }
}

fn call(name: &str, args: &[Expr], ns: &Map<String, Value>) -> Result<Value, EvalError> {
    match name {
        "exists" => {
            let [arg] = args else {
                return Err(EvalError::BadCall("exists takes one argument".into()));
            };
            let key = match arg {
                Expr::Ident(name) => name.clone(),
                Expr::Literal(Value::String(s)) => s.clone(),
                _ => {
                    return Err(EvalError::BadCall(
                        "exists takes a key name".into(),
                    ))
                }
            };
            Ok(Value::Bool(resolve(&key, ns).is_some()))
        }
        "len" => {
            let [arg] = args else {
                return Err(EvalError::BadCall("len takes one argument".into()));
            };
            let value = evaluate(arg, ns)?;
            let n = match &value {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => {
                    return Err(EvalError::TypeMismatch(format!(
                        "len of {}",
                        type_name(other)
                    )))
                }
            };
            Ok(Value::Number(n.into()))
        }
        "contains" => {
            let [haystack, needle] = args else {
                return Err(EvalError::BadCall("contains takes two arguments".into()));
            };
            let haystack = evaluate(haystack, ns)?;
            let needle = evaluate(needle, ns)?;
            let found = match (&haystack, &needle) {
                (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
                (Value::Array(h), n) => h.iter().any(|v| values_equal(v, n)),
                (Value::Object(h), Value::String(n)) => h.contains_key(n),
                (h, n) => {
                    return Err(EvalError::TypeMismatch(format!(
                        "contains({}, {})",
                        type_name(h),
                        type_name(n)
                    )))
                }
            };
            Ok(Value::Bool(found))
        }
        other => Err(EvalError::BadCall(format!("unknown function '{other}'"))),
    }
}

/// Parse and evaluate, collapsing every error to `false`.
///
/// This is the edge-selection entry point: bad expressions and unresolved
/// names must never unwind the executor.
pub fn holds(input: &str, ns: &Map<String, Value>) -> bool {
    match parse(input) {
        Ok(expr) => match evaluate(&expr, ns) {
            Ok(value) => truthy(&value),
            Err(_) => false,
        },
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ns(value: serde_json::Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_comparisons_and_logic() {
        let ns = ns(json!({"x": 3, "name": "alpha", "ok": true}));
        assert!(holds("x > 0", &ns));
        assert!(holds("x >= 3 && x <= 3", &ns));
        assert!(!holds("x < 3", &ns));
        assert!(holds("name == 'alpha'", &ns));
        assert!(holds("name == \"alpha\"", &ns));
        assert!(holds("name != 'beta' || x == 99", &ns));
        assert!(holds("!(x == 4)", &ns));
        assert!(holds("ok", &ns));
        assert!(holds("x == 3.0", &ns));
    }

    #[test]
    fn test_unresolved_identifier_is_false() {
        let ns = ns(json!({"x": 1}));
        assert!(!holds("missing == 1", &ns));
        assert!(!holds("missing", &ns));
        // But exists() resolves it explicitly.
        assert!(!holds("exists(missing)", &ns));
        assert!(holds("!exists(missing)", &ns));
        assert!(holds("exists(x)", &ns));
    }

    #[test]
    fn test_type_mismatch_is_false_via_holds() {
        let ns = ns(json!({"x": 3, "name": "alpha"}));
        assert!(!holds("x < name", &ns));
        assert!(!holds("len(x) > 0", &ns));
    }

    #[test]
    fn test_builtins() {
        let ns = ns(json!({
            "text": "hello world",
            "items": [1, 2, 3],
            "obj": {"a": 1}
        }));
        assert!(holds("len(text) == 11", &ns));
        assert!(holds("len(items) == 3", &ns));
        assert!(holds("contains(text, 'world')", &ns));
        assert!(holds("contains(items, 2)", &ns));
        assert!(holds("contains(obj, 'a')", &ns));
        assert!(!holds("contains(items, 9)", &ns));
    }

    #[test]
    fn test_dotted_identifiers() {
        let ns = ns(json!({"result": {"score": 0.9, "label": "pos"}}));
        assert!(holds("result.score > 0.5", &ns));
        assert!(holds("result.label == 'pos'", &ns));
        assert!(!holds("result.missing == 1", &ns));
    }

    #[test]
    fn test_negative_numbers() {
        let ns = ns(json!({"x": -5}));
        assert!(holds("x < 0", &ns));
        assert!(holds("x == -5", &ns));
        assert!(!holds("x > -10 && x > 0", &ns));
    }

    #[test]
    fn test_router_scenario_conditions() {
        let pos = ns(json!({"routed": "pos"}));
        let neg = ns(json!({"routed": "neg"}));
        assert!(holds("routed == 'pos'", &pos));
        assert!(!holds("routed == 'pos'", &neg));
        assert!(holds("routed == 'neg'", &neg));
    }

    #[test]
    fn test_parse_errors_are_false() {
        let ns = ns(json!({"x": 1}));
        assert!(!holds("x ==", &ns));
        assert!(!holds("x = 1", &ns));
        assert!(!holds("((x)", &ns));
        assert!(!holds("", &ns));
        assert!(!holds("x & y", &ns));
    }

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!([])));
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!([0])));
    }
}
