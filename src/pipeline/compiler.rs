//! Registration compiler adapter.
//!
//! Turns a user node's source into a [`CompiledNode`] descriptor: its input
//! topics, output topic and schema, and any diagnostics. Compilation never
//! fails outright; every problem is reported as a diagnostic.
//!
//! # Node contract
//!
//! ```rhai
//! fn inputs() { ["/a"] }               // required, non-empty
//! fn output() { "/studio_script/b" }   // required
//! fn schema() { "my/Schema" }          // optional, or #{ name, definition }
//! fn process(event, globals) {         // required
//!     #{ value: event.message.value * 2 }
//! }
//! ```

use crate::config::ScriptLimits;
use crate::scripting::engine::{
    eval_error_diagnostic, from_script_value, has_function, parse_error_diagnostic, ScriptEngine,
};
use crate::types::{
    Datatypes, Diagnostic, DiagnosticCode, DiagnosticSource, LogSource, MessageDefinition, Topic,
};
use rhai::{Dynamic, Scope, AST};
use std::sync::Arc;

/// Prefix for schema names of outputs that do not declare one.
pub const DEFAULT_SCHEMA_PREFIX: &str = "user_nodes/";

/// Everything the compiler needs to know about one node.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub name: String,
    pub source_code: String,
    pub topics: Arc<Vec<Topic>>,
    pub datatypes: Arc<Datatypes>,
    pub generated_library: Arc<str>,
}

/// Schema of a node's output topic, carried as data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputSchema {
    pub name: String,
    pub definition: Option<MessageDefinition>,
}

/// Compiled registration descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledNode {
    pub inputs: Vec<String>,
    /// Empty when the node did not resolve an output.
    pub output_topic: String,
    pub output_schema: OutputSchema,
    pub node_code: String,
    pub library_code: Arc<str>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompiledNode {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }
}

pub type CompileOutput = CompiledNode;

/// The external script compiler.
#[cfg_attr(test, mockall::automock)]
pub trait NodeCompiler: Send + Sync {
    fn compile(&self, request: &CompileRequest) -> CompileOutput;
}

/// Compiles Rhai user nodes.
#[derive(Debug)]
pub struct RhaiNodeCompiler {
    engine: ScriptEngine,
}

impl RhaiNodeCompiler {
    pub fn new(limits: &ScriptLimits) -> Self {
        Self {
            engine: ScriptEngine::new(limits),
        }
    }

    fn call(&self, ast: &AST, name: &str) -> Result<Dynamic, Diagnostic> {
        let mut scope = Scope::new();
        let result = self.engine.call(&mut scope, ast, name, ()).map_err(|err| {
            eval_error_diagnostic(
                &err,
                DiagnosticSource::Compile,
                DiagnosticCode::InvalidDeclaration,
            )
        });
        // Declarations are not allowed to log.
        let _ = self.engine.take_logs(LogSource::Registration);
        result
    }

    fn resolve_inputs(
        &self,
        ast: &AST,
        topics: &[Topic],
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Vec<String> {
        if !has_function(ast, "inputs", 0) {
            diagnostics.push(
                Diagnostic::error(
                    DiagnosticSource::InputTopicsChecker,
                    DiagnosticCode::NoInputs,
                    "Node does not declare its inputs",
                )
                .with_tip("Add fn inputs() { [\"/some_topic\"] }"),
            );
            return Vec::new();
        }

        let value = match self.call(ast, "inputs") {
            Ok(value) => value,
            Err(diag) => {
                diagnostics.push(diag);
                return Vec::new();
            }
        };

        let inputs: Option<Vec<String>> = value.into_array().ok().and_then(|array| {
            array
                .into_iter()
                .map(|item| item.into_string().ok())
                .collect()
        });
        let Some(inputs) = inputs else {
            diagnostics.push(Diagnostic::error(
                DiagnosticSource::InputTopicsChecker,
                DiagnosticCode::InvalidDeclaration,
                "inputs() must return an array of topic names",
            ));
            return Vec::new();
        };

        if inputs.is_empty() {
            diagnostics.push(Diagnostic::error(
                DiagnosticSource::InputTopicsChecker,
                DiagnosticCode::NoInputs,
                "Node must subscribe to at least one input topic",
            ));
        }

        for input in &inputs {
            if !topics.iter().any(|t| &t.name == input) {
                let mut available: Vec<&str> = topics.iter().map(|t| t.name.as_str()).collect();
                available.sort_unstable();
                diagnostics.push(
                    Diagnostic::error(
                        DiagnosticSource::InputTopicsChecker,
                        DiagnosticCode::InputTopicUnavailable,
                        format!("Input topic \"{}\" is not available", input),
                    )
                    .with_tip(if available.is_empty() {
                        "No topics are available from the data source".to_string()
                    } else {
                        format!("Available topics: {}", available.join(", "))
                    }),
                );
            }
        }
        inputs
    }

    fn resolve_output(&self, ast: &AST, diagnostics: &mut Vec<Diagnostic>) -> String {
        if !has_function(ast, "output", 0) {
            diagnostics.push(
                Diagnostic::error(
                    DiagnosticSource::OutputTopicChecker,
                    DiagnosticCode::MissingOutput,
                    "Node does not declare its output topic",
                )
                .with_tip("Add fn output() { \"/my_output\" }"),
            );
            return String::new();
        }
        match self.call(ast, "output").map(|v| v.into_string()) {
            Ok(Ok(topic)) => topic,
            Ok(Err(_)) => {
                diagnostics.push(Diagnostic::error(
                    DiagnosticSource::OutputTopicChecker,
                    DiagnosticCode::InvalidDeclaration,
                    "output() must return a topic name",
                ));
                String::new()
            }
            Err(diag) => {
                diagnostics.push(diag);
                String::new()
            }
        }
    }

    fn resolve_schema(
        &self,
        ast: &AST,
        node_name: &str,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> OutputSchema {
        let default = OutputSchema {
            name: format!("{}{}", DEFAULT_SCHEMA_PREFIX, node_name),
            definition: None,
        };
        if !has_function(ast, "schema", 0) {
            return default;
        }

        let value = match self.call(ast, "schema") {
            Ok(value) => value,
            Err(diag) => {
                diagnostics.push(diag);
                return default;
            }
        };

        if value.is_string() {
            return OutputSchema {
                name: value.into_string().unwrap_or(default.name),
                definition: None,
            };
        }

        let invalid = |message: String| {
            Diagnostic::error(
                DiagnosticSource::OutputTopicChecker,
                DiagnosticCode::InvalidDeclaration,
                message,
            )
        };
        let Some(map) = value.try_cast::<rhai::Map>() else {
            diagnostics.push(invalid(
                "schema() must return a schema name or #{ name, definition }".to_string(),
            ));
            return default;
        };

        let name = map
            .get("name")
            .and_then(|n| n.clone().into_string().ok())
            .unwrap_or(default.name);
        let definition = match map.get("definition") {
            None => None,
            Some(def) => match from_script_value(def)
                .map_err(|e| e.to_string())
                .and_then(|v| {
                    serde_json::from_value::<MessageDefinition>(v).map_err(|e| e.to_string())
                })
            {
                Ok(definition) => Some(definition),
                Err(e) => {
                    diagnostics.push(invalid(format!("Invalid schema definition: {}", e)));
                    None
                }
            },
        };
        OutputSchema { name, definition }
    }
}

impl Default for RhaiNodeCompiler {
    fn default() -> Self {
        Self::new(&ScriptLimits::default())
    }
}

impl NodeCompiler for RhaiNodeCompiler {
    fn compile(&self, request: &CompileRequest) -> CompileOutput {
        let mut output = CompiledNode {
            node_code: request.source_code.clone(),
            library_code: request.generated_library.clone(),
            ..Default::default()
        };

        if let Err(err) = self.engine.compile(&request.generated_library) {
            output.diagnostics.push(parse_error_diagnostic(
                &err,
                DiagnosticSource::Compile,
                DiagnosticCode::GeneratedLibrary,
            ));
            return output;
        }

        let node_ast = match self.engine.compile(&request.source_code) {
            Ok(ast) => ast,
            Err(err) => {
                output.diagnostics.push(parse_error_diagnostic(
                    &err,
                    DiagnosticSource::Compile,
                    DiagnosticCode::SyntaxError,
                ));
                return output;
            }
        };

        if !has_function(&node_ast, "process", 2) {
            output.diagnostics.push(
                Diagnostic::error(
                    DiagnosticSource::Compile,
                    DiagnosticCode::MissingProcessFunction,
                    "Node must define fn process(event, globals)",
                )
                .with_tip("process returns the output message as a map, or () for none"),
            );
        }

        let ast = match self
            .engine
            .compile_with_library(&request.generated_library, &request.source_code)
        {
            Ok(ast) => ast,
            Err(err) => {
                output.diagnostics.push(parse_error_diagnostic(
                    &err,
                    DiagnosticSource::Compile,
                    DiagnosticCode::SyntaxError,
                ));
                return output;
            }
        };

        output.inputs = self.resolve_inputs(&ast, &request.topics, &mut output.diagnostics);
        output.output_topic = self.resolve_output(&ast, &mut output.diagnostics);
        output.output_schema = self.resolve_schema(&ast, &request.name, &mut output.diagnostics);

        tracing::debug!(
            "Compiled node {}: {:?} -> {:?} ({} diagnostics)",
            request.name,
            output.inputs,
            output.output_topic,
            output.diagnostics.len()
        );
        output
    }
}
