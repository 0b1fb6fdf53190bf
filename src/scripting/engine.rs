//! Rhai Script Engine Implementation
//!
//! This module provides the configured Rhai engine shared by the node compiler
//! and the sandbox workers.
//!
//! ## Logging
//!
//! - `log(value)` - Record any value as a node log entry
//! - `print(text)` - Record a string as a node log entry
//!
//! Log entries are buffered per engine and drained with
//! [`ScriptEngine::take_logs`].
//!
//! ## Helper Functions
//!
//! - `to_secs(time)` - Convert a `#{sec, nsec}` receive time to seconds
//! - `derivative(current, previous, dt)` - Compute rate of change
//! - `smooth(current, previous, alpha)` - Exponential smoothing (EWMA)
//! - `lowpass(current, previous, cutoff_hz, dt)` - First-order lowpass filter
//! - `deadband(value, center, width)` - Apply deadband/hysteresis
//! - `lerp(a, b, t)` / `map_range(x, in_min, in_max, out_min, out_max)`

use crate::config::ScriptLimits;
use crate::types::{Diagnostic, DiagnosticCode, DiagnosticSource, LogSource, UserNodeLog};
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, FuncArgs, ParseError, Scope, AST};
use std::sync::{Arc, Mutex};

/// Log values recorded by scripts, waiting to be drained.
pub type SharedLogBuffer = Arc<Mutex<Vec<serde_json::Value>>>;

/// A Rhai engine with safety limits, helper functions and log capture.
pub struct ScriptEngine {
    engine: Engine,
    logs: SharedLogBuffer,
}

impl ScriptEngine {
    pub fn new(limits: &ScriptLimits) -> Self {
        let logs: SharedLogBuffer = Arc::new(Mutex::new(Vec::new()));
        let mut engine = Engine::new();
        Self::configure_engine(&mut engine, limits, logs.clone());
        Self { engine, logs }
    }

    fn configure_engine(engine: &mut Engine, limits: &ScriptLimits, logs: SharedLogBuffer) {
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(limits.max_call_levels);
        engine.set_max_operations(limits.max_operations);
        engine.set_max_string_size(limits.max_string_size);
        engine.set_max_array_size(limits.max_array_size);
        engine.set_max_map_size(limits.max_map_size);

        {
            let logs = logs.clone();
            engine.on_print(move |text: &str| {
                if let Ok(mut logs) = logs.lock() {
                    logs.push(serde_json::Value::String(text.to_string()));
                }
            });
        }
        {
            let logs = logs.clone();
            engine.on_debug(move |text: &str, _source: Option<&str>, _pos: rhai::Position| {
                if let Ok(mut logs) = logs.lock() {
                    logs.push(serde_json::Value::String(text.to_string()));
                }
            });
        }
        engine.register_fn("log", move |value: Dynamic| {
            let value = rhai::serde::from_dynamic::<serde_json::Value>(&value)
                .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
            if let Ok(mut logs) = logs.lock() {
                logs.push(value);
            }
        });

        engine.register_fn("to_secs", |time: rhai::Map| -> f64 {
            let part = |key: &str| {
                time.get(key)
                    .and_then(|v| v.as_int().ok().map(|i| i as f64).or(v.as_float().ok()))
                    .unwrap_or(0.0)
            };
            part("sec") + part("nsec") / 1e9
        });

        engine.register_fn(
            "derivative",
            |current: f64, previous: f64, dt: f64| -> f64 {
                if dt > 0.0 && !previous.is_nan() {
                    (current - previous) / dt
                } else {
                    0.0
                }
            },
        );

        engine.register_fn("smooth", |current: f64, previous: f64, alpha: f64| -> f64 {
            let alpha = alpha.clamp(0.0, 1.0);
            if !previous.is_nan() {
                alpha * previous + (1.0 - alpha) * current
            } else {
                current
            }
        });

        engine.register_fn(
            "lowpass",
            |current: f64, previous: f64, cutoff_hz: f64, dt: f64| -> f64 {
                if !previous.is_nan() && dt > 0.0 && cutoff_hz > 0.0 {
                    let rc = 1.0 / (2.0 * std::f64::consts::PI * cutoff_hz);
                    let alpha = dt / (rc + dt);
                    previous + alpha * (current - previous)
                } else {
                    current
                }
            },
        );

        engine.register_fn("deadband", |value: f64, center: f64, width: f64| -> f64 {
            if (value - center).abs() < width / 2.0 {
                center
            } else {
                value
            }
        });

        engine.register_fn("lerp", |a: f64, b: f64, t: f64| a + (b - a) * t);
        engine.register_fn(
            "map_range",
            |x: f64, in_min: f64, in_max: f64, out_min: f64, out_max: f64| {
                (x - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
            },
        );
    }

    pub fn compile(&self, source: &str) -> Result<AST, ParseError> {
        self.engine.compile(source)
    }

    /// Compile a node on top of a library, so node functions can call
    /// library functions.
    pub fn compile_with_library(&self, library: &str, source: &str) -> Result<AST, ParseError> {
        let library = self.engine.compile(library)?;
        let node = self.engine.compile(source)?;
        Ok(library.merge(&node))
    }

    /// Run an AST's top-level statements.
    pub fn run(&self, scope: &mut Scope, ast: &AST) -> Result<(), Box<EvalAltResult>> {
        self.engine.run_ast_with_scope(scope, ast)
    }

    /// Call a script function without re-running top-level statements.
    pub fn call(
        &self,
        scope: &mut Scope,
        ast: &AST,
        name: &str,
        args: impl FuncArgs,
    ) -> Result<Dynamic, Box<EvalAltResult>> {
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        self.engine
            .call_fn_with_options::<Dynamic>(options, scope, ast, name, args)
    }

    /// Like [`call`](Self::call) with `this` bound to `state`, so a function
    /// can keep values between calls.
    pub fn call_with_state(
        &self,
        scope: &mut Scope,
        ast: &AST,
        name: &str,
        args: impl FuncArgs,
        state: &mut Dynamic,
    ) -> Result<Dynamic, Box<EvalAltResult>> {
        let options = CallFnOptions::new()
            .eval_ast(false)
            .rewind_scope(true)
            .bind_this_ptr(state);
        self.engine
            .call_fn_with_options::<Dynamic>(options, scope, ast, name, args)
    }

    /// Drain buffered log values, tagging them with `source`.
    pub fn take_logs(&self, source: LogSource) -> Vec<UserNodeLog> {
        match self.logs.lock() {
            Ok(mut logs) => logs
                .drain(..)
                .map(|value| UserNodeLog::new(source, value))
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new(&ScriptLimits::default())
    }
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("pending_logs", &self.logs.lock().map(|l| l.len()).ok())
            .finish()
    }
}

/// Whether an AST defines `name` taking exactly `params` parameters.
pub fn has_function(ast: &AST, name: &str, params: usize) -> bool {
    ast.iter_functions()
        .any(|f| f.name == name && f.params.len() == params)
}

/// Turn a parse error into a positioned diagnostic.
pub fn parse_error_diagnostic(
    err: &ParseError,
    source: DiagnosticSource,
    code: DiagnosticCode,
) -> Diagnostic {
    let pos = err.position();
    Diagnostic::error(source, code, err.0.to_string()).at(pos.line(), pos.position())
}

/// Turn an evaluation error into a positioned diagnostic.
pub fn eval_error_diagnostic(
    err: &EvalAltResult,
    source: DiagnosticSource,
    code: DiagnosticCode,
) -> Diagnostic {
    let pos = err.position();
    Diagnostic::error(source, code, err.to_string()).at(pos.line(), pos.position())
}

/// Convert plain data into a script value.
pub fn to_script_value<T: serde::Serialize>(value: &T) -> Result<Dynamic, Box<EvalAltResult>> {
    rhai::serde::to_dynamic(value)
}

/// Convert a script value back into plain data.
pub fn from_script_value(value: &Dynamic) -> Result<serde_json::Value, Box<EvalAltResult>> {
    rhai::serde::from_dynamic::<serde_json::Value>(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_function() {
        let engine = ScriptEngine::default();
        let ast = engine.compile("fn double(x) { x * 2 }").unwrap();
        let mut scope = Scope::new();
        let result = engine.call(&mut scope, &ast, "double", (21_i64,)).unwrap();
        assert_eq!(result.as_int().unwrap(), 42);
    }

    #[test]
    fn test_library_functions_are_visible() {
        let engine = ScriptEngine::default();
        let ast = engine
            .compile_with_library("fn helper() { 7 }", "fn run() { helper() + 1 }")
            .unwrap();
        let mut scope = Scope::new();
        let result = engine.call(&mut scope, &ast, "run", ()).unwrap();
        assert_eq!(result.as_int().unwrap(), 8);
    }

    #[test]
    fn test_log_and_print_are_captured() {
        let engine = ScriptEngine::default();
        let ast = engine
            .compile(r#"fn go() { log(#{a: 1}); print("hello"); }"#)
            .unwrap();
        let mut scope = Scope::new();
        engine.call(&mut scope, &ast, "go", ()).unwrap();

        let logs = engine.take_logs(LogSource::Processing);
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].value, json!({"a": 1}));
        assert_eq!(logs[1].value, json!("hello"));
        assert!(engine.take_logs(LogSource::Processing).is_empty());
    }

    #[test]
    fn test_operation_limit_stops_infinite_loop() {
        let limits = ScriptLimits {
            max_operations: 1_000,
            ..Default::default()
        };
        let engine = ScriptEngine::new(&limits);
        let ast = engine.compile("fn spin() { loop { } }").unwrap();
        let mut scope = Scope::new();
        assert!(engine.call(&mut scope, &ast, "spin", ()).is_err());
    }

    #[test]
    fn test_parse_error_has_position() {
        let engine = ScriptEngine::default();
        let err = engine.compile("fn broken( {").unwrap_err();
        let diag =
            parse_error_diagnostic(&err, DiagnosticSource::Compile, DiagnosticCode::SyntaxError);
        assert!(diag.is_error());
        assert_eq!(diag.line, Some(1));
    }

    #[test]
    fn test_has_function_checks_arity() {
        let engine = ScriptEngine::default();
        let ast = engine.compile("fn process(a, b) { () }").unwrap();
        assert!(has_function(&ast, "process", 2));
        assert!(!has_function(&ast, "process", 1));
        assert!(!has_function(&ast, "inputs", 0));
    }

    #[test]
    fn test_helpers() {
        let engine = ScriptEngine::default();
        let ast = engine
            .compile("fn t() { to_secs(#{sec: 2, nsec: 500000000}) }")
            .unwrap();
        let mut scope = Scope::new();
        let secs = engine.call(&mut scope, &ast, "t", ()).unwrap();
        assert!((secs.as_float().unwrap() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_value_conversion() {
        let value = json!({"data": [1, 2.5, "x"], "ok": true});
        let dynamic = to_script_value(&value).unwrap();
        assert_eq!(from_script_value(&dynamic).unwrap(), value);
    }
}
