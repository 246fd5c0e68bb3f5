// Expression evaluation for if-conditions, tests, until-loops, thresholds,
// and `{{ ... }}` payload templating.
// The evaluator is pure: (expression, environment) -> value. The environment
// is a `serde_json::Value` map rendered by the caller; the engine never knows
// where the data came from.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Number, Value};

use crate::errors::{Result, RundownError};

/// A user function callable from expressions, registered at load time.
pub type UserFunc = Arc<dyn Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync>;

/// An empty function table for callers with no user functions.
pub fn no_funcs() -> HashMap<String, UserFunc> {
    HashMap::new()
}

/// Evaluate `expr` against `env`.
pub fn eval(expr: &str, env: &Value) -> Result<Value> {
    eval_with_funcs(expr, env, &HashMap::new())
}

pub fn eval_with_funcs(expr: &str, env: &Value, funcs: &HashMap<String, UserFunc>) -> Result<Value> {
    let tokens = lex(expr).map_err(|message| err(expr, message))?;
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_or().map_err(|message| err(expr, message))?;
    if parser.pos != parser.tokens.len() {
        return Err(err(expr, "unexpected trailing input".to_string()));
    }
    eval_node(&ast, env, funcs).map_err(|message| err(expr, message))
}

/// Evaluate `expr` and collapse the result to a boolean by truthiness.
pub fn eval_cond(expr: &str, env: &Value, funcs: &HashMap<String, UserFunc>) -> Result<bool> {
    Ok(is_truthy(&eval_with_funcs(expr, env, funcs)?))
}

/// Truthiness: null, false, zero, the empty string, and empty collections are
/// false; everything else is true.
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

fn err(expr: &str, message: String) -> RundownError {
    RundownError::Expr { expr: expr.to_string(), message }
}

// ---------------------------------------------------------------------------
// Templating
// ---------------------------------------------------------------------------

/// Render a `{{ expr }}` template. A template that is exactly one expression
/// yields the typed value; mixed text yields a string.
pub fn render_template(
    template: &str,
    env: &Value,
    funcs: &HashMap<String, UserFunc>,
) -> Result<Value> {
    let trimmed = template.trim();
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") {
        let inner = &trimmed[2..trimmed.len() - 2];
        if !inner.contains("{{") && !inner.contains("}}") {
            return eval_with_funcs(inner, env, funcs);
        }
    }

    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| err(template, "unterminated {{".to_string()))?;
        let value = eval_with_funcs(&after[..end], env, funcs)?;
        out.push_str(&value_to_string(&value));
        rest = &after[end + 2..];
    }
    if out.is_empty() && rest.len() == template.len() {
        return Ok(Value::String(template.to_string()));
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Render every string inside a JSON tree, recursing through maps and arrays.
pub fn render_value(value: &Value, env: &Value, funcs: &HashMap<String, UserFunc>) -> Result<Value> {
    match value {
        Value::String(s) => render_template(s, env, funcs),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(render_value(item, env, funcs)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_value(v, env, funcs)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// String form used when a template mixes expressions with literal text.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Punct(&'static str),
}

fn lex(input: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            let mut is_float = false;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                if chars[i] == '.' {
                    // A dot not followed by a digit is member access, not a decimal point.
                    if i + 1 >= chars.len() || !chars[i + 1].is_ascii_digit() {
                        break;
                    }
                    is_float = true;
                }
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            if is_float {
                tokens.push(Token::Float(text.parse().map_err(|_| format!("bad number {text:?}"))?));
            } else {
                tokens.push(Token::Int(text.parse().map_err(|_| format!("bad number {text:?}"))?));
            }
            continue;
        }
        if c == '\'' || c == '"' {
            let quote = c;
            i += 1;
            let mut s = String::new();
            loop {
                if i >= chars.len() {
                    return Err("unterminated string".to_string());
                }
                let ch = chars[i];
                if ch == quote {
                    i += 1;
                    break;
                }
                if ch == '\\' && i + 1 < chars.len() {
                    i += 1;
                    match chars[i] {
                        'n' => s.push('\n'),
                        't' => s.push('\t'),
                        other => s.push(other),
                    }
                } else {
                    s.push(ch);
                }
                i += 1;
            }
            tokens.push(Token::Str(s));
            continue;
        }
        let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        let punct = match two.as_str() {
            "==" | "!=" | "<=" | ">=" | "&&" | "||" => Some(match two.as_str() {
                "==" => "==",
                "!=" => "!=",
                "<=" => "<=",
                ">=" => ">=",
                "&&" => "&&",
                _ => "||",
            }),
            _ => None,
        };
        if let Some(p) = punct {
            tokens.push(Token::Punct(p));
            i += 2;
            continue;
        }
        let single = match c {
            '(' => "(",
            ')' => ")",
            '[' => "[",
            ']' => "]",
            '.' => ".",
            ',' => ",",
            '!' => "!",
            '<' => "<",
            '>' => ">",
            '+' => "+",
            '-' => "-",
            '*' => "*",
            '/' => "/",
            '%' => "%",
            other => return Err(format!("unexpected character {other:?}")),
        };
        tokens.push(Token::Punct(single));
        i += 1;
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Node {
    Lit(Value),
    Ident(String),
    Member(Box<Node>, String),
    Index(Box<Node>, Box<Node>),
    Call(String, Vec<Node>),
    Not(Box<Node>),
    Neg(Box<Node>),
    Binary(&'static str, Box<Node>, Box<Node>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if matches!(self.peek(), Some(Token::Punct(q)) if *q == p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> std::result::Result<(), String> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(format!("expected {p:?}"))
        }
    }

    fn parse_or(&mut self) -> std::result::Result<Node, String> {
        let mut node = self.parse_and()?;
        while self.eat_punct("||") {
            let rhs = self.parse_and()?;
            node = Node::Binary("||", Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> std::result::Result<Node, String> {
        let mut node = self.parse_equality()?;
        while self.eat_punct("&&") {
            let rhs = self.parse_equality()?;
            node = Node::Binary("&&", Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_equality(&mut self) -> std::result::Result<Node, String> {
        let mut node = self.parse_comparison()?;
        loop {
            let op = if self.eat_punct("==") {
                "=="
            } else if self.eat_punct("!=") {
                "!="
            } else {
                break;
            };
            let rhs = self.parse_comparison()?;
            node = Node::Binary(op, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_comparison(&mut self) -> std::result::Result<Node, String> {
        let mut node = self.parse_additive()?;
        loop {
            let op = if self.eat_punct("<=") {
                "<="
            } else if self.eat_punct(">=") {
                ">="
            } else if self.eat_punct("<") {
                "<"
            } else if self.eat_punct(">") {
                ">"
            } else {
                break;
            };
            let rhs = self.parse_additive()?;
            node = Node::Binary(op, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_additive(&mut self) -> std::result::Result<Node, String> {
        let mut node = self.parse_multiplicative()?;
        loop {
            let op = if self.eat_punct("+") {
                "+"
            } else if self.eat_punct("-") {
                "-"
            } else {
                break;
            };
            let rhs = self.parse_multiplicative()?;
            node = Node::Binary(op, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_multiplicative(&mut self) -> std::result::Result<Node, String> {
        let mut node = self.parse_unary()?;
        loop {
            let op = if self.eat_punct("*") {
                "*"
            } else if self.eat_punct("/") {
                "/"
            } else if self.eat_punct("%") {
                "%"
            } else {
                break;
            };
            let rhs = self.parse_unary()?;
            node = Node::Binary(op, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> std::result::Result<Node, String> {
        if self.eat_punct("!") {
            return Ok(Node::Not(Box::new(self.parse_unary()?)));
        }
        if self.eat_punct("-") {
            return Ok(Node::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> std::result::Result<Node, String> {
        let mut node = self.parse_primary()?;
        loop {
            if self.eat_punct(".") {
                match self.peek().cloned() {
                    Some(Token::Ident(name)) => {
                        self.pos += 1;
                        node = Node::Member(Box::new(node), name);
                    }
                    Some(Token::Int(n)) => {
                        // steps.0 style access on sequence outputs
                        self.pos += 1;
                        node = Node::Index(Box::new(node), Box::new(Node::Lit(json!(n))));
                    }
                    _ => return Err("expected member name after '.'".to_string()),
                }
            } else if self.eat_punct("[") {
                let index = self.parse_or()?;
                self.expect_punct("]")?;
                node = Node::Index(Box::new(node), Box::new(index));
            } else {
                break;
            }
        }
        Ok(node)
    }

    fn parse_primary(&mut self) -> std::result::Result<Node, String> {
        match self.peek().cloned() {
            Some(Token::Int(n)) => {
                self.pos += 1;
                Ok(Node::Lit(json!(n)))
            }
            Some(Token::Float(f)) => {
                self.pos += 1;
                Ok(Node::Lit(json!(f)))
            }
            Some(Token::Str(s)) => {
                self.pos += 1;
                Ok(Node::Lit(Value::String(s)))
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                match name.as_str() {
                    "true" => return Ok(Node::Lit(Value::Bool(true))),
                    "false" => return Ok(Node::Lit(Value::Bool(false))),
                    "nil" | "null" => return Ok(Node::Lit(Value::Null)),
                    _ => {}
                }
                if self.eat_punct("(") {
                    let mut args = Vec::new();
                    if !self.eat_punct(")") {
                        loop {
                            args.push(self.parse_or()?);
                            if self.eat_punct(")") {
                                break;
                            }
                            self.expect_punct(",")?;
                        }
                    }
                    Ok(Node::Call(name, args))
                } else {
                    Ok(Node::Ident(name))
                }
            }
            Some(Token::Punct("(")) => {
                self.pos += 1;
                let node = self.parse_or()?;
                self.expect_punct(")")?;
                Ok(node)
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval_node(
    node: &Node,
    env: &Value,
    funcs: &HashMap<String, UserFunc>,
) -> std::result::Result<Value, String> {
    match node {
        Node::Lit(v) => Ok(v.clone()),
        // An unknown name resolves to null so conditions over not-yet-recorded
        // store keys stay expressible.
        Node::Ident(name) => Ok(env.get(name).cloned().unwrap_or(Value::Null)),
        Node::Member(base, name) => {
            let base = eval_node(base, env, funcs)?;
            Ok(base.get(name).cloned().unwrap_or(Value::Null))
        }
        Node::Index(base, index) => {
            let base = eval_node(base, env, funcs)?;
            let index = eval_node(index, env, funcs)?;
            let out = match (&base, &index) {
                (Value::Array(items), Value::Number(n)) => {
                    n.as_u64().and_then(|i| items.get(i as usize)).cloned()
                }
                (Value::Object(map), Value::String(key)) => map.get(key).cloned(),
                (Value::Object(map), Value::Number(n)) => map.get(&n.to_string()).cloned(),
                _ => None,
            };
            Ok(out.unwrap_or(Value::Null))
        }
        Node::Call(name, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_node(arg, env, funcs)?);
            }
            call_function(name, &values, funcs)
        }
        Node::Not(inner) => Ok(Value::Bool(!is_truthy(&eval_node(inner, env, funcs)?))),
        Node::Neg(inner) => match eval_node(inner, env, funcs)? {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(json!(-i))
                } else {
                    Ok(json!(-n.as_f64().unwrap_or(0.0)))
                }
            }
            other => Err(format!("cannot negate {other}")),
        },
        Node::Binary(op, lhs, rhs) => {
            // Short-circuit the logical operators.
            if *op == "&&" {
                let left = eval_node(lhs, env, funcs)?;
                if !is_truthy(&left) {
                    return Ok(Value::Bool(false));
                }
                return Ok(Value::Bool(is_truthy(&eval_node(rhs, env, funcs)?)));
            }
            if *op == "||" {
                let left = eval_node(lhs, env, funcs)?;
                if is_truthy(&left) {
                    return Ok(Value::Bool(true));
                }
                return Ok(Value::Bool(is_truthy(&eval_node(rhs, env, funcs)?)));
            }
            let left = eval_node(lhs, env, funcs)?;
            let right = eval_node(rhs, env, funcs)?;
            eval_binary(op, &left, &right)
        }
    }
}

fn eval_binary(op: &str, left: &Value, right: &Value) -> std::result::Result<Value, String> {
    match op {
        "==" => Ok(Value::Bool(loose_eq(left, right))),
        "!=" => Ok(Value::Bool(!loose_eq(left, right))),
        "<" | "<=" | ">" | ">=" => {
            let ord = compare(left, right)
                .ok_or_else(|| format!("cannot compare {left} and {right}"))?;
            let result = match op {
                "<" => ord.is_lt(),
                "<=" => ord.is_le(),
                ">" => ord.is_gt(),
                _ => ord.is_ge(),
            };
            Ok(Value::Bool(result))
        }
        "+" => match (left, right) {
            (Value::String(a), b) => Ok(Value::String(format!("{a}{}", value_to_string(b)))),
            (a, Value::String(b)) => Ok(Value::String(format!("{}{b}", value_to_string(a)))),
            _ => numeric(op, left, right),
        },
        "-" | "*" | "/" | "%" => numeric(op, left, right),
        other => Err(format!("unknown operator {other}")),
    }
}

fn numeric(op: &str, left: &Value, right: &Value) -> std::result::Result<Value, String> {
    let (a, b) = match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(format!("operator {op} needs numbers, got {left} and {right}")),
    };
    let both_int = left.is_i64() && right.is_i64();
    let result = match op {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" => {
            if b == 0.0 {
                return Err("division by zero".to_string());
            }
            a / b
        }
        "%" => {
            if b == 0.0 {
                return Err("division by zero".to_string());
            }
            a % b
        }
        _ => unreachable!(),
    };
    if both_int && op != "/" && result.fract() == 0.0 {
        Ok(json!(result as i64))
    } else {
        Ok(Number::from_f64(result).map(Value::Number).unwrap_or(Value::Null))
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a == b;
    }
    left == right
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return Some(a.cmp(b));
    }
    None
}

fn call_function(
    name: &str,
    args: &[Value],
    funcs: &HashMap<String, UserFunc>,
) -> std::result::Result<Value, String> {
    match name {
        "len" => {
            let arg = args.first().ok_or("len needs one argument")?;
            let n = match arg {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                Value::Null => 0,
                _ => return Err(format!("len not defined for {arg}")),
            };
            Ok(json!(n))
        }
        "contains" => {
            let (a, b) = two_args(name, args)?;
            let found = match a {
                Value::String(s) => s.contains(&value_to_string(b)),
                Value::Array(items) => items.iter().any(|v| loose_eq(v, b)),
                Value::Object(map) => map.contains_key(&value_to_string(b)),
                _ => false,
            };
            Ok(Value::Bool(found))
        }
        "startsWith" => {
            let (a, b) = two_args(name, args)?;
            Ok(Value::Bool(value_to_string(a).starts_with(&value_to_string(b))))
        }
        "endsWith" => {
            let (a, b) = two_args(name, args)?;
            Ok(Value::Bool(value_to_string(a).ends_with(&value_to_string(b))))
        }
        "string" => {
            let arg = args.first().ok_or("string needs one argument")?;
            Ok(Value::String(value_to_string(arg)))
        }
        "int" => {
            let arg = args.first().ok_or("int needs one argument")?;
            let n = match arg {
                Value::Number(n) => n.as_f64().unwrap_or(0.0) as i64,
                Value::String(s) => {
                    s.trim().parse::<f64>().map_err(|_| format!("int: cannot parse {s:?}"))? as i64
                }
                Value::Bool(b) => *b as i64,
                _ => return Err(format!("int not defined for {arg}")),
            };
            Ok(json!(n))
        }
        _ => match funcs.get(name) {
            Some(f) => f(args),
            None => Err(format!("unknown function {name}")),
        },
    }
}

fn two_args<'a>(name: &str, args: &'a [Value]) -> std::result::Result<(&'a Value, &'a Value), String> {
    match args {
        [a, b] => Ok((a, b)),
        _ => Err(format!("{name} needs two arguments")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Value {
        json!({
            "vars": {"message": "hello", "count": 3},
            "steps": [
                {"stdout": "hello!!\n", "exit_code": 0},
                {"status": 200, "body": {"ok": true}}
            ],
            "current": {"status": 200, "body": {"ok": true}},
            "succeeded": 11,
            "failed": 10,
        })
    }

    #[test]
    fn literals() {
        assert_eq!(eval("42", &env()).unwrap(), json!(42));
        assert_eq!(eval("4.5", &env()).unwrap(), json!(4.5));
        assert_eq!(eval("'hi'", &env()).unwrap(), json!("hi"));
        assert_eq!(eval("true", &env()).unwrap(), json!(true));
        assert_eq!(eval("nil", &env()).unwrap(), Value::Null);
    }

    #[test]
    fn path_access() {
        assert_eq!(eval("vars.message", &env()).unwrap(), json!("hello"));
        assert_eq!(eval("steps[0].exit_code", &env()).unwrap(), json!(0));
        assert_eq!(eval("steps[1].body.ok", &env()).unwrap(), json!(true));
        assert_eq!(eval("current['status']", &env()).unwrap(), json!(200));
        assert_eq!(eval("vars.missing", &env()).unwrap(), Value::Null);
    }

    #[test]
    fn comparisons() {
        assert_eq!(eval("succeeded > 10", &env()).unwrap(), json!(true));
        assert_eq!(eval("failed < 10", &env()).unwrap(), json!(false));
        assert_eq!(eval("current.status == 200", &env()).unwrap(), json!(true));
        assert_eq!(eval("vars.message != 'bye'", &env()).unwrap(), json!(true));
        assert_eq!(eval("'abc' < 'abd'", &env()).unwrap(), json!(true));
    }

    #[test]
    fn logic_and_negation() {
        assert_eq!(eval("true && failed < 10", &env()).unwrap(), json!(false));
        assert_eq!(eval("false || succeeded > 10", &env()).unwrap(), json!(true));
        assert_eq!(eval("!false", &env()).unwrap(), json!(true));
        // Short circuit: the rhs would error if evaluated.
        assert_eq!(eval("false && (1 / 0)", &env()).unwrap(), json!(false));
    }

    #[test]
    fn arithmetic() {
        assert_eq!(eval("1 + 2 * 3", &env()).unwrap(), json!(7));
        assert_eq!(eval("(1 + 2) * 3", &env()).unwrap(), json!(9));
        assert_eq!(eval("7 % 3", &env()).unwrap(), json!(1));
        assert_eq!(eval("vars.count + 1", &env()).unwrap(), json!(4));
        assert_eq!(eval("10 / 4", &env()).unwrap(), json!(2.5));
        assert!(eval("1 / 0", &env()).is_err());
    }

    #[test]
    fn builtin_functions() {
        assert_eq!(eval("len(steps)", &env()).unwrap(), json!(2));
        assert_eq!(eval("len(vars.message)", &env()).unwrap(), json!(5));
        assert_eq!(eval("contains(vars.message, 'ell')", &env()).unwrap(), json!(true));
        assert_eq!(eval("startsWith(vars.message, 'he')", &env()).unwrap(), json!(true));
        assert_eq!(eval("endsWith(vars.message, 'lo')", &env()).unwrap(), json!(true));
        assert_eq!(eval("int('42')", &env()).unwrap(), json!(42));
        assert_eq!(eval("string(succeeded)", &env()).unwrap(), json!("11"));
    }

    #[test]
    fn user_functions() {
        let mut funcs = no_funcs();
        funcs.insert(
            "double".to_string(),
            Arc::new(|args: &[Value]| {
                let n = args[0].as_i64().ok_or("double needs an int")?;
                Ok(json!(n * 2))
            }) as UserFunc,
        );
        assert_eq!(eval_with_funcs("double(21)", &env(), &funcs).unwrap(), json!(42));
        assert!(eval("double(21)", &env()).is_err());
    }

    #[test]
    fn truthiness() {
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("x")));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!([])));
    }

    #[test]
    fn template_single_expression_keeps_type() {
        let v = render_template("{{ steps[1].status }}", &env(), &no_funcs()).unwrap();
        assert_eq!(v, json!(200));
    }

    #[test]
    fn template_mixed_text_renders_string() {
        let v = render_template("status={{ current.status }}!", &env(), &no_funcs()).unwrap();
        assert_eq!(v, json!("status=200!"));
    }

    #[test]
    fn template_without_markers_is_identity() {
        let v = render_template("plain text", &env(), &no_funcs()).unwrap();
        assert_eq!(v, json!("plain text"));
    }

    #[test]
    fn render_value_recurses() {
        let payload = json!({
            "command": "echo {{ vars.message }}",
            "nested": [{"n": "{{ vars.count }}"}],
        });
        let rendered = render_value(&payload, &env(), &no_funcs()).unwrap();
        assert_eq!(rendered["command"], json!("echo hello"));
        assert_eq!(rendered["nested"][0]["n"], json!(3));
    }

    #[test]
    fn trailing_garbage_is_an_error() {
        assert!(eval("1 2", &env()).is_err());
        assert!(eval("vars.", &env()).is_err());
    }
}
