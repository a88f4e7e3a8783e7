//! # Transform Scripts
//!
//! Per-topic `apply` transforms written in a small, loop-free expression language.
//! A script receives the current message (`message`, alias `value`) and a
//! per-property `state` object that survives between invocations. Every property's
//! state exposes the same `state.global` object, so properties of one device can
//! share data.
//!
//! ```text
//! state.count = (state.count ?? 0) + 1;
//! if (message === "") { return; }
//! return JSON.parse(message).power == "ON";
//! ```
//!
//! Scripts are compiled when configuration is loaded, so syntax errors surface
//! before the device connects. Evaluation has no access to I/O and cannot loop,
//! so every invocation terminates. Returning nothing (or `null`) suppresses the
//! message.

mod eval;
mod lexer;
mod parser;

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("{0}")]
    Runtime(String),
}

/// Compiled transform with the signature `(input, &mut state) -> Option<output>`
#[derive(Clone)]
pub struct TransformScript {
    source: Arc<str>,
    program: Arc<Vec<parser::Stmt>>,
}

impl TransformScript {
    pub fn compile(source: &str) -> Result<Self, ScriptError> {
        let tokens = lexer::tokenize(source)?;
        let program = parser::parse(tokens, source.len())?;
        Ok(Self {
            source: Arc::from(source),
            program: Arc::new(program),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Runs the script against `input`. `Ok(None)` means the message is suppressed.
    pub fn run(&self, input: Value, state: ScriptState<'_>) -> Result<Option<Value>, ScriptError> {
        eval::Interpreter::new(input, state, None).run(&self.program)
    }

    /// Like [`run`](Self::run), with `emit(value)` forwarding values to `output`.
    pub fn run_with_output(
        &self,
        input: Value,
        state: ScriptState<'_>,
        output: &mut dyn FnMut(Value),
    ) -> Result<Option<Value>, ScriptError> {
        eval::Interpreter::new(input, state, Some(output)).run(&self.program)
    }
}

impl fmt::Debug for TransformScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TransformScript").field(&self.source).finish()
    }
}

impl PartialEq for TransformScript {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

/// Mutable view of one property's state plus the device-wide global object
pub struct ScriptState<'a> {
    pub local: &'a mut Map<String, Value>,
    pub global: &'a mut Map<String, Value>,
}

/// Apply-state store: one state object per property, created on first use.
#[derive(Debug, Default)]
pub struct ApplyStateStore {
    properties: HashMap<String, Map<String, Value>>,
    global: Map<String, Value>,
}

impl ApplyStateStore {
    pub fn state_for(&mut self, property: &str) -> ScriptState<'_> {
        let local = self.properties.entry(property.to_string()).or_default();
        ScriptState {
            local,
            global: &mut self.global,
        }
    }

    pub fn property(&self, property: &str) -> Option<&Map<String, Value>> {
        self.properties.get(property)
    }

    pub fn global(&self) -> &Map<String, Value> {
        &self.global
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(source: &str, input: Value) -> Result<Option<Value>, ScriptError> {
        let mut store = ApplyStateStore::default();
        TransformScript::compile(source)?.run(input, store.state_for("on"))
    }

    #[test]
    fn maps_payload_to_boolean() {
        let script = "return message == 'ON' ? true : false;";
        assert_eq!(run(script, json!("ON")).unwrap(), Some(json!(true)));
        assert_eq!(run(script, json!("OFF")).unwrap(), Some(json!(false)));
    }

    #[test]
    fn missing_return_suppresses_message() {
        assert_eq!(run("let x = message;", json!("1")).unwrap(), None);
        assert_eq!(run("return;", json!("1")).unwrap(), None);
        assert_eq!(run("return undefined;", json!("1")).unwrap(), None);
    }

    #[test]
    fn parses_json_and_extracts_fields() {
        let script = "let body = JSON.parse(message); return body.sensor.temp * 2;";
        assert_eq!(
            run(script, json!(r#"{"sensor":{"temp":10.5}}"#)).unwrap(),
            Some(json!(21))
        );
    }

    #[test]
    fn state_persists_per_property_and_shares_global() {
        let mut store = ApplyStateStore::default();
        let counter = TransformScript::compile(
            "state.count = (state.count ?? 0) + 1; state.global.last = message; return state.count;",
        )
        .unwrap();
        let reader = TransformScript::compile("return state.global.last;").unwrap();

        assert_eq!(
            counter.run(json!("a"), store.state_for("on")).unwrap(),
            Some(json!(1))
        );
        assert_eq!(
            counter.run(json!("b"), store.state_for("on")).unwrap(),
            Some(json!(2))
        );
        assert_eq!(
            counter.run(json!("c"), store.state_for("brightness")).unwrap(),
            Some(json!(1))
        );
        assert_eq!(
            reader.run(json!(null), store.state_for("hue")).unwrap(),
            Some(json!("c"))
        );
        assert_eq!(store.property("on").unwrap()["count"], json!(2));
        assert_eq!(store.global()["last"], json!("c"));
    }

    #[test]
    fn if_else_chains_and_string_methods() {
        let script = r#"
            let text = message.trim().toLowerCase();
            if (text.startsWith("on")) {
                return 1;
            } else if (text == "off") {
                return 0;
            }
            return;
        "#;
        assert_eq!(run(script, json!("  ON ")).unwrap(), Some(json!(1)));
        assert_eq!(run(script, json!("Off")).unwrap(), Some(json!(0)));
        assert_eq!(run(script, json!("toggle")).unwrap(), None);
    }

    #[test]
    fn string_concatenation_and_objects() {
        assert_eq!(
            run("return 'level:' + message;", json!(5)).unwrap(),
            Some(json!("level:5"))
        );
        assert_eq!(
            run("return JSON.stringify({ state: message ? 'ON' : 'OFF' });", json!(true)).unwrap(),
            Some(json!(r#"{"state":"ON"}"#))
        );
    }

    #[test]
    fn emit_forwards_values_to_output() {
        let mut store = ApplyStateStore::default();
        let script = TransformScript::compile(
            "let body = JSON.parse(message); emit(body.a); emit(body.b); return;",
        )
        .unwrap();
        let mut emitted = Vec::new();
        let result = script
            .run_with_output(json!(r#"{"a":1,"b":"two"}"#), store.state_for("on"), &mut |v: Value| {
                emitted.push(v)
            })
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(emitted, vec![json!(1), json!("two")]);

        assert!(matches!(run("emit(message);", json!(1)), Err(ScriptError::Runtime(_))));
    }

    #[test]
    fn huge_payload_index_is_a_runtime_error() {
        let script = "state.seen = state.seen ?? []; state.seen[Number(message)] = true; return message;";
        assert!(matches!(run(script, json!("1e300")), Err(ScriptError::Runtime(_))));
        assert!(matches!(run(script, json!("70000")), Err(ScriptError::Runtime(_))));
        assert_eq!(run(script, json!("2")).unwrap(), Some(json!("2")));
    }

    #[test]
    fn to_fixed_digits_are_clamped() {
        assert_eq!(run("return message.toFixed(2);", json!(3.14159)).unwrap(), Some(json!("3.14")));
        let long = run("return message.toFixed(1000000000);", json!(1)).unwrap().unwrap();
        assert_eq!(long.as_str().map(str::len), Some(102));
    }

    #[test]
    fn runtime_errors_are_reported() {
        assert!(matches!(
            run("return JSON.parse(message).x;", json!("not json")),
            Err(ScriptError::Runtime(_))
        ));
        assert!(matches!(
            run("return message.missing.deeper;", json!({})),
            Err(ScriptError::Runtime(_))
        ));
        assert!(matches!(
            run("return nothing;", json!(1)),
            Err(ScriptError::Runtime(_))
        ));
    }

    #[test]
    fn syntax_errors_fail_compilation() {
        assert!(matches!(
            TransformScript::compile("return message +;"),
            Err(ScriptError::Syntax { .. })
        ));
    }
}
