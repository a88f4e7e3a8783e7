use serde_json::{Map, Value};
use std::collections::HashMap;

use super::parser::{Accessor, BinaryOp, Expr, LogicalOp, Place, Stmt, UnaryOp};
use super::{ScriptError, ScriptState};
use crate::mqtt::message_manager::stringify;

/// Largest array index a script may write
const MAX_INDEX: usize = 65_535;
const MAX_FIXED_DIGITS: usize = 100;

enum Flow {
    Continue,
    Return(Option<Value>),
}

enum Key {
    Field(String),
    Index(usize),
}

pub(crate) struct Interpreter<'s, 'o> {
    message: Value,
    locals: HashMap<String, Value>,
    state: ScriptState<'s>,
    output: Option<&'o mut dyn FnMut(Value)>,
}

impl<'s, 'o> Interpreter<'s, 'o> {
    pub(crate) fn new(message: Value, state: ScriptState<'s>, output: Option<&'o mut dyn FnMut(Value)>) -> Self {
        Self {
            message,
            locals: HashMap::new(),
            state,
            output,
        }
    }

    pub(crate) fn run(mut self, program: &[Stmt]) -> Result<Option<Value>, ScriptError> {
        match self.exec_block(program)? {
            Flow::Return(value) => Ok(value.filter(|v| !v.is_null())),
            Flow::Continue => Ok(None),
        }
    }

    fn exec_block(&mut self, body: &[Stmt]) -> Result<Flow, ScriptError> {
        for stmt in body {
            if let Flow::Return(value) = self.exec(stmt)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Continue)
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow, ScriptError> {
        match stmt {
            Stmt::Let(name, expr) => {
                let value = self.eval(expr)?;
                self.locals.insert(name.clone(), value);
                Ok(Flow::Continue)
            }
            Stmt::Assign(place, expr) => {
                let value = self.eval(expr)?;
                self.assign(place, value)?;
                Ok(Flow::Continue)
            }
            Stmt::If(condition, then_branch, else_branch) => {
                if truthy(&self.eval(condition)?) {
                    self.exec_block(then_branch)
                } else {
                    self.exec_block(else_branch)
                }
            }
            Stmt::Return(None) => Ok(Flow::Return(None)),
            Stmt::Return(Some(expr)) => Ok(Flow::Return(Some(self.eval(expr)?))),
            Stmt::Expr(expr) => {
                self.eval(expr)?;
                Ok(Flow::Continue)
            }
        }
    }

    fn is_local(&self, name: &str) -> bool {
        self.locals.contains_key(name)
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, ScriptError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(name) => self.lookup(name),
            Expr::Member(base, name) => {
                if let Expr::Var(root) = base.as_ref() {
                    if root == "state" && !self.is_local(root) {
                        return Ok(if name == "global" {
                            Value::Object(self.state.global.clone())
                        } else {
                            self.state.local.get(name).cloned().unwrap_or(Value::Null)
                        });
                    }
                }
                let target = self.eval(base)?;
                member(&target, name)
            }
            Expr::Index(base, index) => {
                let target = self.eval(base)?;
                let index = self.eval(index)?;
                match (&target, &index) {
                    (Value::Array(items), Value::Number(_)) => Ok(as_index(&index)
                        .and_then(|i| items.get(i).cloned())
                        .unwrap_or(Value::Null)),
                    (Value::String(s), Value::Number(_)) => Ok(as_index(&index)
                        .and_then(|i| s.chars().nth(i))
                        .map(|c| Value::String(c.to_string()))
                        .unwrap_or(Value::Null)),
                    _ => member(&target, &display(&index)),
                }
            }
            Expr::Call(callee, args) => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                match callee.as_ref() {
                    Expr::Var(name) if name == "emit" && !self.is_local(name) => match self.output.as_mut() {
                        Some(output) => {
                            output(args.first().cloned().unwrap_or(Value::Null));
                            Ok(Value::Null)
                        }
                        None => Err(ScriptError::Runtime("'emit' is not available here".to_string())),
                    },
                    Expr::Var(name) if !self.is_local(name) => call_function(name, &args),
                    Expr::Member(base, method) => {
                        if let Expr::Var(namespace) = base.as_ref() {
                            if (namespace == "JSON" || namespace == "Math")
                                && !self.is_local(namespace)
                            {
                                return call_function(&format!("{}.{}", namespace, method), &args);
                            }
                        }
                        let receiver = self.eval(base)?;
                        call_method(&receiver, method, &args)
                    }
                    _ => Err(ScriptError::Runtime("expression is not callable".to_string())),
                }
            }
            Expr::Unary(UnaryOp::Not, operand) => Ok(Value::Bool(!truthy(&self.eval(operand)?))),
            Expr::Unary(UnaryOp::Neg, operand) => Ok(number(-to_number(&self.eval(operand)?))),
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                Ok(binary(*op, &left, &right))
            }
            Expr::Logical(op, left, right) => {
                let left = self.eval(left)?;
                let short_circuit = match op {
                    LogicalOp::And => !truthy(&left),
                    LogicalOp::Or => truthy(&left),
                    LogicalOp::Nullish => !left.is_null(),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval(right)
                }
            }
            Expr::Conditional(condition, then_value, else_value) => {
                if truthy(&self.eval(condition)?) {
                    self.eval(then_value)
                } else {
                    self.eval(else_value)
                }
            }
            Expr::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Result<_, _>>()?,
            )),
            Expr::Object(fields) => {
                let mut map = Map::new();
                for (key, value) in fields {
                    map.insert(key.clone(), self.eval(value)?);
                }
                Ok(Value::Object(map))
            }
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, ScriptError> {
        if let Some(value) = self.locals.get(name) {
            return Ok(value.clone());
        }
        match name {
            "message" | "value" => Ok(self.message.clone()),
            "state" => {
                let mut snapshot = self.state.local.clone();
                snapshot.insert(
                    "global".to_string(),
                    Value::Object(self.state.global.clone()),
                );
                Ok(Value::Object(snapshot))
            }
            _ => Err(ScriptError::Runtime(format!("'{}' is not defined", name))),
        }
    }

    fn assign(&mut self, place: &Place, value: Value) -> Result<(), ScriptError> {
        let mut keys = Vec::with_capacity(place.path.len());
        for accessor in &place.path {
            keys.push(match accessor {
                Accessor::Field(name) => Key::Field(name.clone()),
                Accessor::Index(expr) => {
                    let index = self.eval(expr)?;
                    if index.as_f64().is_some_and(|n| n > MAX_INDEX as f64) {
                        return Err(ScriptError::Runtime(format!(
                            "index {} is out of range",
                            display(&index)
                        )));
                    }
                    match as_index(&index) {
                        Some(i) if index.is_number() => Key::Index(i),
                        _ => Key::Field(display(&index)),
                    }
                }
            });
        }

        if self.locals.contains_key(&place.root) {
            let slot = self
                .locals
                .get_mut(&place.root)
                .ok_or_else(|| ScriptError::Runtime(format!("'{}' is not defined", place.root)))?;
            return set_in(slot, &keys, value);
        }

        match place.root.as_str() {
            "message" | "value" => set_in(&mut self.message, &keys, value),
            "state" => match keys.split_first() {
                None => Err(ScriptError::Runtime("state cannot be replaced".to_string())),
                Some((Key::Field(field), [])) if field == "global" => match value {
                    Value::Object(map) => {
                        *self.state.global = map;
                        Ok(())
                    }
                    _ => Err(ScriptError::Runtime(
                        "state.global must be an object".to_string(),
                    )),
                },
                Some((Key::Field(field), rest)) if field == "global" => {
                    set_in_map(self.state.global, rest, value)
                }
                Some(_) => set_in_map(self.state.local, &keys, value),
            },
            other => Err(ScriptError::Runtime(format!(
                "assignment to undeclared variable '{}'",
                other
            ))),
        }
    }
}

fn set_in(target: &mut Value, keys: &[Key], value: Value) -> Result<(), ScriptError> {
    let Some((key, rest)) = keys.split_first() else {
        *target = value;
        return Ok(());
    };
    match key {
        Key::Field(name) => {
            if target.is_null() {
                *target = Value::Object(Map::new());
            }
            let map = target.as_object_mut().ok_or_else(|| {
                ScriptError::Runtime(format!("cannot set property '{}' on a non-object", name))
            })?;
            let slot = map.entry(name.clone()).or_insert(Value::Null);
            set_in(slot, rest, value)
        }
        Key::Index(index) => {
            let items = target.as_array_mut().ok_or_else(|| {
                ScriptError::Runtime(format!("cannot set index {} on a non-array", index))
            })?;
            if *index >= items.len() {
                let len = index
                    .checked_add(1)
                    .filter(|len| *len <= MAX_INDEX + 1)
                    .ok_or_else(|| ScriptError::Runtime(format!("index {} is out of range", index)))?;
                items.resize(len, Value::Null);
            }
            set_in(&mut items[*index], rest, value)
        }
    }
}

fn set_in_map(map: &mut Map<String, Value>, keys: &[Key], value: Value) -> Result<(), ScriptError> {
    let Some((key, rest)) = keys.split_first() else {
        return Err(ScriptError::Runtime("missing property name".to_string()));
    };
    let name = match key {
        Key::Field(name) => name.clone(),
        Key::Index(index) => index.to_string(),
    };
    let slot = map.entry(name).or_insert(Value::Null);
    set_in(slot, rest, value)
}

fn as_index(value: &Value) -> Option<usize> {
    let n = value.as_f64()?;
    (n >= 0.0 && n.fract() == 0.0 && n <= MAX_INDEX as f64).then_some(n as usize)
}

fn member(target: &Value, name: &str) -> Result<Value, ScriptError> {
    match target {
        Value::Null => Err(ScriptError::Runtime(format!(
            "cannot read property '{}' of null",
            name
        ))),
        Value::String(s) if name == "length" => Ok(Value::from(s.chars().count())),
        Value::Array(items) if name == "length" => Ok(Value::from(items.len())),
        Value::Array(items) => Ok(name
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i).cloned())
            .unwrap_or(Value::Null)),
        Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
        _ => Ok(Value::Null),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::Add => {
            if left.is_string() || right.is_string() {
                Value::String(format!("{}{}", display(left), display(right)))
            } else {
                number(to_number(left) + to_number(right))
            }
        }
        BinaryOp::Sub => number(to_number(left) - to_number(right)),
        BinaryOp::Mul => number(to_number(left) * to_number(right)),
        BinaryOp::Div => number(to_number(left) / to_number(right)),
        BinaryOp::Rem => number(to_number(left) % to_number(right)),
        BinaryOp::Eq => Value::Bool(loose_eq(left, right)),
        BinaryOp::NotEq => Value::Bool(!loose_eq(left, right)),
        BinaryOp::StrictEq => Value::Bool(strict_eq(left, right)),
        BinaryOp::StrictNotEq => Value::Bool(!strict_eq(left, right)),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let ordering = match (left, right) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => to_number(left).partial_cmp(&to_number(right)),
            };
            let result = match ordering {
                None => false,
                Some(ordering) => match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::LtEq => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                },
            };
            Value::Bool(result)
        }
    }
}

fn call_function(name: &str, args: &[Value]) -> Result<Value, ScriptError> {
    let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);
    match name {
        "JSON.parse" => match arg(0) {
            Value::String(text) => serde_json::from_str(&text)
                .map_err(|e| ScriptError::Runtime(format!("JSON.parse failed: {}", e))),
            other => Ok(other),
        },
        "JSON.stringify" => Ok(Value::String(arg(0).to_string())),
        "Number" => Ok(number(to_number(&arg(0)))),
        "String" => Ok(Value::String(display(&arg(0)))),
        "Boolean" => Ok(Value::Bool(truthy(&arg(0)))),
        "parseInt" => {
            let radix = args.get(1).map(to_number).unwrap_or(10.0) as u32;
            Ok(parse_int(&display(&arg(0)), radix)
                .map(|n| number(n as f64))
                .unwrap_or(Value::Null))
        }
        "parseFloat" => Ok(parse_float(&display(&arg(0)))
            .map(number)
            .unwrap_or(Value::Null)),
        "isNaN" => Ok(Value::Bool(to_number(&arg(0)).is_nan())),
        "Math.round" => Ok(number((to_number(&arg(0)) + 0.5).floor())),
        "Math.floor" => Ok(number(to_number(&arg(0)).floor())),
        "Math.ceil" => Ok(number(to_number(&arg(0)).ceil())),
        "Math.abs" => Ok(number(to_number(&arg(0)).abs())),
        "Math.min" => Ok(number(
            args.iter().map(to_number).fold(f64::INFINITY, f64::min),
        )),
        "Math.max" => Ok(number(
            args.iter().map(to_number).fold(f64::NEG_INFINITY, f64::max),
        )),
        other => Err(ScriptError::Runtime(format!("'{}' is not a function", other))),
    }
}

fn call_method(receiver: &Value, method: &str, args: &[Value]) -> Result<Value, ScriptError> {
    let text_arg = |i: usize| args.get(i).map(display).unwrap_or_default();
    match (receiver, method) {
        (Value::Null, _) => Err(ScriptError::Runtime(format!(
            "cannot call '{}' on null",
            method
        ))),
        (_, "toString") => Ok(Value::String(display(receiver))),
        (Value::String(s), "toLowerCase") => Ok(Value::String(s.to_lowercase())),
        (Value::String(s), "toUpperCase") => Ok(Value::String(s.to_uppercase())),
        (Value::String(s), "trim") => Ok(Value::String(s.trim().to_string())),
        (Value::String(s), "includes") => Ok(Value::Bool(s.contains(&text_arg(0)))),
        (Value::String(s), "startsWith") => Ok(Value::Bool(s.starts_with(&text_arg(0)))),
        (Value::String(s), "endsWith") => Ok(Value::Bool(s.ends_with(&text_arg(0)))),
        (Value::String(s), "indexOf") => Ok(s
            .find(&text_arg(0))
            .map(|byte| number(s[..byte].chars().count() as f64))
            .unwrap_or_else(|| number(-1.0))),
        (Value::String(s), "replace") => {
            Ok(Value::String(s.replacen(&text_arg(0), &text_arg(1), 1)))
        }
        (Value::String(s), "split") => {
            let separator = text_arg(0);
            let parts: Vec<Value> = if separator.is_empty() {
                s.chars().map(|c| Value::String(c.to_string())).collect()
            } else {
                s.split(separator.as_str())
                    .map(|part| Value::String(part.to_string()))
                    .collect()
            };
            Ok(Value::Array(parts))
        }
        (Value::String(s), "substring") => {
            let chars: Vec<char> = s.chars().collect();
            let clamp = |v: f64| (v.max(0.0) as usize).min(chars.len());
            let start = clamp(args.first().map(to_number).unwrap_or(0.0));
            let end = args
                .get(1)
                .map(|v| clamp(to_number(v)))
                .unwrap_or(chars.len());
            let (start, end) = if start <= end { (start, end) } else { (end, start) };
            Ok(Value::String(chars[start..end].iter().collect()))
        }
        (Value::Number(_), "toFixed") => {
            let digits = args
                .first()
                .map(to_number)
                .unwrap_or(0.0)
                .clamp(0.0, MAX_FIXED_DIGITS as f64) as usize;
            Ok(Value::String(format!(
                "{:.*}",
                digits,
                to_number(receiver)
            )))
        }
        (Value::Array(items), "includes") => {
            let needle = args.first().cloned().unwrap_or(Value::Null);
            Ok(Value::Bool(items.iter().any(|item| strict_eq(item, &needle))))
        }
        (Value::Array(items), "indexOf") => {
            let needle = args.first().cloned().unwrap_or(Value::Null);
            Ok(items
                .iter()
                .position(|item| strict_eq(item, &needle))
                .map(|i| number(i as f64))
                .unwrap_or_else(|| number(-1.0)))
        }
        (Value::Array(items), "join") => {
            let separator = args.first().map(display).unwrap_or_else(|| ",".to_string());
            Ok(Value::String(
                items.iter().map(display).collect::<Vec<_>>().join(&separator),
            ))
        }
        _ => Err(ScriptError::Runtime(format!(
            "'{}' is not a function",
            method
        ))),
    }
}

/// Builds a JSON number, keeping integral values integral so they print
/// without a fractional part. Non-finite results become `null`.
pub(crate) fn number(n: f64) -> Value {
    if !n.is_finite() {
        return Value::Null;
    }
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Value::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

pub(crate) fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse().unwrap_or(f64::NAN)
            }
        }
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

pub(crate) fn display(value: &Value) -> String {
    match value {
        Value::Array(items) => items.iter().map(display).collect::<Vec<_>>().join(","),
        other => stringify(other),
    }
}

fn strict_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(_), Value::String(_))
        | (Value::String(_), Value::Number(_))
        | (Value::Bool(_), _)
        | (_, Value::Bool(_))
            if std::mem::discriminant(left) != std::mem::discriminant(right) =>
        {
            to_number(left) == to_number(right)
        }
        (Value::Array(_) | Value::Object(_), Value::String(_))
        | (Value::String(_), Value::Array(_) | Value::Object(_)) => display(left) == display(right),
        _ => strict_eq(left, right),
    }
}

fn parse_int(text: &str, radix: u32) -> Option<i64> {
    let radix = if (2..=36).contains(&radix) { radix } else { 10 };
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let digits = if radix == 16 {
        digits
            .strip_prefix("0x")
            .or_else(|| digits.strip_prefix("0X"))
            .unwrap_or(digits)
    } else {
        digits
    };
    let end = digits
        .char_indices()
        .find(|(_, c)| !c.is_digit(radix))
        .map(|(i, _)| i)
        .unwrap_or(digits.len());
    let value = i64::from_str_radix(&digits[..end], radix).ok()?;
    Some(if negative { -value } else { value })
}

fn parse_float(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let candidate: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
        .collect();
    (1..=candidate.len())
        .rev()
        .find_map(|len| candidate[..len].parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_stay_integral_when_possible() {
        assert_eq!(number(3.0), json!(3));
        assert_eq!(number(2.5), json!(2.5));
        assert_eq!(number(f64::NAN), Value::Null);
    }

    #[test]
    fn loose_equality_follows_coercion_rules() {
        assert!(loose_eq(&json!("1"), &json!(1)));
        assert!(loose_eq(&json!(true), &json!(1)));
        assert!(loose_eq(&json!(false), &json!("0")));
        assert!(!loose_eq(&json!(null), &json!(0)));
        assert!(!strict_eq(&json!("1"), &json!(1)));
        assert!(strict_eq(&json!(1), &json!(1.0)));
    }

    #[test]
    fn parses_integer_prefixes() {
        assert_eq!(parse_int("42px", 10), Some(42));
        assert_eq!(parse_int("-0x1f", 16), Some(-31));
        assert_eq!(parse_int("abc", 10), None);
        assert_eq!(parse_float("21.5°C"), Some(21.5));
    }

    #[test]
    fn indexes_are_bounded() {
        assert_eq!(as_index(&json!(3)), Some(3));
        assert_eq!(as_index(&json!(1e300)), None);
        assert_eq!(as_index(&json!(-1)), None);
        assert_eq!(as_index(&json!(1.5)), None);

        let mut items = json!([]);
        assert!(set_in(&mut items, &[Key::Index(MAX_INDEX + 1)], json!(true)).is_err());
        assert!(set_in(&mut items, &[Key::Index(usize::MAX)], json!(true)).is_err());
        assert!(set_in(&mut items, &[Key::Index(2)], json!(true)).is_ok());
        assert_eq!(items, json!([null, null, true]));
    }
}
