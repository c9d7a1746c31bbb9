//! Decision-table expression language.
//!
//! Expressions are boolean predicates over `variables`:
//!
//! ```text
//! score >= 0.5 and (tier == "gold" or tags contains "vip")
//! not variables.flags.blocked && status in ["open", "pending"]
//! ```
//!
//! Manipulations are `;`- or newline-separated assignments, `path = expr` or
//! `path += expr`. Nothing else is executable.

use serde_json::{Map, Number, Value};

use crewgraph_core::error::{CrewGraphError, Result};
use crewgraph_core::variables::{normalize_path, VariableStore};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Number),
    Str(String),
    Ident(String),
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Bang,
    AndAnd,
    OrOr,
    Minus,
    Assign,
    PlusAssign,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Separator,
}

fn err(msg: impl Into<String>) -> CrewGraphError {
    CrewGraphError::Expression(msg.into())
}

fn tokenize(src: &str, newline_separates: bool) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' if newline_separates => {
                tokens.push(Token::Separator);
                i += 1;
            }
            ';' => {
                tokens.push(Token::Separator);
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
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
            '=' | '!' | '<' | '>' | '+' | '&' | '|' => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Eq, 2),
                    ('=', _) => (Token::Assign, 1),
                    ('!', Some('=')) => (Token::Ne, 2),
                    ('!', _) => (Token::Bang, 1),
                    ('<', Some('=')) => (Token::Le, 2),
                    ('<', _) => (Token::Lt, 1),
                    ('>', Some('=')) => (Token::Ge, 2),
                    ('>', _) => (Token::Gt, 1),
                    ('+', Some('=')) => (Token::PlusAssign, 2),
                    ('&', Some('&')) => (Token::AndAnd, 2),
                    ('|', Some('|')) => (Token::OrOr, 2),
                    _ => return Err(err(format!("unexpected character '{c}' at {i}"))),
                };
                tokens.push(token);
                i += width;
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(err("unterminated string literal")),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => text.push('\n'),
                                Some('t') => text.push('\t'),
                                Some(&other) => text.push(other),
                                None => return Err(err("unterminated string literal")),
                            }
                            i += 2;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(parse_number(&text)?));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if text.ends_with('.') || text.contains("..") {
                    return Err(err(format!("malformed path '{text}'")));
                }
                tokens.push(Token::Ident(text));
            }
            other => return Err(err(format!("unexpected character '{other}' at {i}"))),
        }
    }
    Ok(tokens)
}

fn parse_number(text: &str) -> Result<Number> {
    if let Ok(n) = text.parse::<i64>() {
        return Ok(Number::from(n));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .ok_or_else(|| err(format!("invalid number '{text}'")))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    In,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(String),
    Array(Vec<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word)
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.advance() {
            Some(t) if *t == expected => Ok(()),
            Some(t) => Err(err(format!("expected {expected:?}, found {t:?}"))),
            None => Err(err(format!("expected {expected:?}, found end of input"))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::OrOr)) || self.is_keyword("or") {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(Token::AndAnd)) || self.is_keyword("and") {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if matches!(self.peek(), Some(Token::Bang)) || self.is_keyword("not") {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Ident(w)) if w == "contains" => CmpOp::Contains,
            Some(Token::Ident(w)) if w == "in" => CmpOp::In,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_unary()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.advance();
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance().cloned() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" | "None" => Expr::Literal(Value::Null),
                "and" | "or" | "not" | "contains" | "in" => {
                    return Err(err(format!("unexpected keyword '{word}'")))
                }
                _ => Expr::Path(word),
            }),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if matches!(self.peek(), Some(Token::RBracket)) {
                    self.advance();
                    return Ok(Expr::Array(items));
                }
                loop {
                    items.push(self.parse_or()?);
                    match self.advance() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => break,
                        other => {
                            return Err(err(format!("expected ',' or ']', found {other:?}")))
                        }
                    }
                }
                Ok(Expr::Array(items))
            }
            Some(t) => Err(err(format!("unexpected token {t:?}"))),
            None => Err(err("unexpected end of expression")),
        }
    }
}

/// A parsed boolean predicate. The empty expression always matches.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    ast: Option<Expr>,
}

impl Expression {
    pub fn parse(src: &str) -> Result<Self> {
        let tokens = tokenize(src, false)?;
        if tokens.is_empty() {
            return Ok(Self { ast: None });
        }
        let mut parser = Parser::new(&tokens);
        let ast = parser.parse_or()?;
        if !parser.at_end() {
            return Err(err(format!(
                "unexpected trailing input in expression '{}'",
                src.trim()
            )));
        }
        Ok(Self { ast: Some(ast) })
    }

    /// Evaluate against the current variables.
    pub fn evaluate(&self, vars: &VariableStore) -> Result<Value> {
        match &self.ast {
            None => Ok(Value::Bool(true)),
            Some(ast) => eval(ast, vars),
        }
    }

    /// Evaluate and coerce the result to a boolean.
    pub fn matches(&self, vars: &VariableStore) -> Result<bool> {
        Ok(truthy(&self.evaluate(vars)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum AssignOp {
    Set,
    Add,
}

#[derive(Debug, Clone, PartialEq)]
struct Assignment {
    path: String,
    op: AssignOp,
    value: Expr,
}

/// Parsed side effects of a matched condition group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manipulation {
    statements: Vec<Assignment>,
}

impl Manipulation {
    pub fn parse(src: &str) -> Result<Self> {
        let tokens = tokenize(src, true)?;
        let mut statements = Vec::new();
        for statement in tokens.split(|t| *t == Token::Separator) {
            if statement.is_empty() {
                continue;
            }
            let path = match statement.first() {
                Some(Token::Ident(p)) if !normalize_path(p).is_empty() => p.clone(),
                other => return Err(err(format!("assignment must start with a path, found {other:?}"))),
            };
            let op = match statement.get(1) {
                Some(Token::Assign) => AssignOp::Set,
                Some(Token::PlusAssign) => AssignOp::Add,
                other => return Err(err(format!("expected '=' or '+=', found {other:?}"))),
            };
            let mut parser = Parser::new(&statement[2..]);
            let value = parser.parse_or()?;
            if !parser.at_end() {
                return Err(err(format!("unexpected trailing input after assignment to '{path}'")));
            }
            statements.push(Assignment { path, op, value });
        }
        Ok(Self { statements })
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Run every assignment in order; later statements see earlier writes.
    pub fn apply(&self, vars: &mut VariableStore) -> Result<()> {
        for stmt in &self.statements {
            let value = eval(&stmt.value, vars)?;
            let value = match stmt.op {
                AssignOp::Set => value,
                AssignOp::Add => {
                    let current = vars.get(&stmt.path).cloned().unwrap_or(Value::Null);
                    add(current, value)?
                }
            };
            vars.set(&stmt.path, value)?;
        }
        Ok(())
    }
}

fn eval(expr: &Expr, vars: &VariableStore) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(path) => {
            if normalize_path(path).is_empty() {
                return Ok(vars.snapshot());
            }
            Ok(vars.get(path).cloned().unwrap_or(Value::Null))
        }
        Expr::Array(items) => items
            .iter()
            .map(|item| eval(item, vars))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Expr::Neg(inner) => match eval(inner, vars)? {
            Value::Number(n) => match n.as_i64().and_then(i64::checked_neg) {
                Some(i) => Ok(Value::from(i)),
                None => Ok(number_value(-n.as_f64().unwrap_or(0.0))),
            },
            other => Err(err(format!("cannot negate {other}"))),
        },
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, vars)?))),
        Expr::And(l, r) => {
            if !truthy(&eval(l, vars)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(r, vars)?)))
        }
        Expr::Or(l, r) => {
            if truthy(&eval(l, vars)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(r, vars)?)))
        }
        Expr::Compare(op, l, r) => {
            let left = eval(l, vars)?;
            let right = eval(r, vars)?;
            compare(*op, &left, &right).map(Value::Bool)
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
            _ => a == b,
        },
        _ => left == right,
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool> {
    match op {
        CmpOp::Eq => Ok(values_equal(left, right)),
        CmpOp::Ne => Ok(!values_equal(left, right)),
        CmpOp::Gt | CmpOp::Ge | CmpOp::Lt | CmpOp::Le => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => a
                    .as_f64()
                    .zip(b.as_f64())
                    .and_then(|(a, b)| a.partial_cmp(&b)),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            }
            .ok_or_else(|| err(format!("cannot order {left} and {right}")))?;
            Ok(match op {
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                CmpOp::Lt => ordering.is_lt(),
                _ => ordering.is_le(),
            })
        }
        CmpOp::Contains => contains(left, right),
        CmpOp::In => contains(right, left),
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool> {
    match haystack {
        Value::Null => Ok(false),
        Value::String(s) => match needle {
            Value::String(n) => Ok(s.contains(n.as_str())),
            other => Ok(s.contains(&display(other))),
        },
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            other => Err(err(format!("object keys are strings, got {other}"))),
        },
        other => Err(err(format!("'contains' is not defined for {other}"))),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn number_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn add(current: Value, value: Value) -> Result<Value> {
    match (current, value) {
        (Value::Null, v) => Ok(v),
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                if let Some(sum) = a.checked_add(b) {
                    return Ok(Value::from(sum));
                }
            }
            match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => Ok(number_value(a + b)),
                _ => Err(err("numeric overflow")),
            }
        }
        (Value::String(mut s), v) => {
            s.push_str(&display(&v));
            Ok(Value::String(s))
        }
        (Value::Array(mut items), v) => {
            items.push(v);
            Ok(Value::Array(items))
        }
        (Value::Object(mut map), Value::Object(extra)) => {
            map.extend(extra);
            Ok(Value::Object(map))
        }
        (current, v) => Err(err(format!("cannot add {v} to {current}"))),
    }
}

/// Evaluate `expression` against a bare JSON mapping.
pub fn evaluate_on(expression: &str, values: &Map<String, Value>) -> Result<bool> {
    Expression::parse(expression)?.matches(&VariableStore::from_map(values.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(value: Value) -> VariableStore {
        VariableStore::from_map(value.as_object().cloned().unwrap())
    }

    fn check(expr: &str, vars: &VariableStore) -> bool {
        Expression::parse(expr).unwrap().matches(vars).unwrap()
    }

    #[test]
    fn comparisons_on_numbers_and_strings() {
        let vars = store(json!({"x": 5, "name": "bob", "ratio": 0.5}));
        assert!(check("x > 0", &vars));
        assert!(check("x >= 5", &vars));
        assert!(!check("x < 5", &vars));
        assert!(check("x == 5.0", &vars));
        assert!(check("ratio <= 0.5", &vars));
        assert!(check("name == 'bob'", &vars));
        assert!(check("name != \"alice\"", &vars));
        assert!(check("x > -1", &vars));
    }

    #[test]
    fn negating_the_smallest_integer_falls_back_to_float() {
        let vars = store(json!({"x": i64::MIN}));
        assert!(check("-x > 0", &vars));
        let value = Expression::parse("-x").unwrap().evaluate(&vars).unwrap();
        assert_eq!(value.as_f64(), Some(-(i64::MIN as f64)));
    }

    #[test]
    fn boolean_operators_and_precedence() {
        let vars = store(json!({"a": true, "b": false, "n": 3}));
        assert!(check("a and not b", &vars));
        assert!(check("a && !b", &vars));
        assert!(check("b or n == 3", &vars));
        assert!(!check("b || (n > 3 and a)", &vars));
        assert!(check("a or b and false", &vars));
    }

    #[test]
    fn contains_and_in() {
        let vars = store(json!({
            "tags": ["vip", "new"],
            "text": "hello world",
            "profile": {"email": "x@y"},
            "status": "open"
        }));
        assert!(check("tags contains 'vip'", &vars));
        assert!(check("text contains 'world'", &vars));
        assert!(check("profile contains 'email'", &vars));
        assert!(check("status in ['open', 'pending']", &vars));
        assert!(!check("'closed' in tags", &vars));
    }

    #[test]
    fn missing_paths_are_null() {
        let vars = store(json!({"user": {}}));
        assert!(check("user.age == null", &vars));
        assert!(!check("variables.user.name", &vars));
        assert!(!check("missing contains 'x'", &vars));
    }

    #[test]
    fn empty_expression_is_true() {
        assert!(check("   ", &VariableStore::new()));
    }

    #[test]
    fn ordering_mismatched_types_is_an_error() {
        let vars = store(json!({"x": "abc"}));
        let result = Expression::parse("x > 1").unwrap().matches(&vars);
        assert!(matches!(result, Err(CrewGraphError::Expression(_))));
    }

    #[test]
    fn parse_errors() {
        assert!(Expression::parse("x >").is_err());
        assert!(Expression::parse("(x == 1").is_err());
        assert!(Expression::parse("x == 1 2").is_err());
        assert!(Expression::parse("x = 1").is_err());
        assert!(Expression::parse("'open").is_err());
    }

    #[test]
    fn manipulation_assigns_in_order() {
        let mut vars = store(json!({"count": 1, "log": "a"}));
        let m = Manipulation::parse("count += 2; log += 'b'\nflags.seen = true\ntotal = count * 2")
            .err();
        assert!(m.is_some(), "'*' is not part of the language");

        let m = Manipulation::parse(
            "count += 2; log += 'b'\nflags.seen = true\nvariables.copy = count",
        )
        .unwrap();
        m.apply(&mut vars).unwrap();
        assert_eq!(
            vars.snapshot(),
            json!({"count": 3, "log": "ab", "flags": {"seen": true}, "copy": 3})
        );
    }

    #[test]
    fn manipulation_rejects_non_assignments() {
        assert!(Manipulation::parse("x == 1").is_err());
        assert!(Manipulation::parse("1 = x").is_err());
        assert!(Manipulation::parse("variables = 1").is_err());
        assert!(Manipulation::parse("").unwrap().is_empty());
    }

    #[test]
    fn add_appends_to_arrays() {
        let mut vars = store(json!({"items": [1]}));
        Manipulation::parse("items += 2").unwrap().apply(&mut vars).unwrap();
        assert_eq!(vars.get("items"), Some(&json!([1, 2])));
    }

    #[test]
    fn evaluate_on_plain_map() {
        let map = json!({"x": 2}).as_object().cloned().unwrap();
        assert!(evaluate_on("x in [1, 2]", &map).unwrap());
    }
}
