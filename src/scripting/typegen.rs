//! Generated helper library for the current datatype catalog.
//!
//! For every datatype the library defines a constructor returning a map with
//! each field set to its zero value:
//!
//! ```rhai
//! // datatype "geometry/Point" { x: float64, y: float64 }
//! fn new_geometry_point() { #{ x: 0.0, y: 0.0 } }
//! ```
//!
//! Nested complex fields call the nested constructor. `fn datatype_names()`
//! returns every schema name in catalog order.

use crate::types::{Datatypes, MessageDefinitionField};
use std::collections::HashSet;
use std::fmt::Write;
use std::sync::Arc;

/// Rhai identifier for a schema name: lowercase, non-alphanumerics as `_`.
pub fn constructor_name(schema_name: &str) -> String {
    let mut ident = String::with_capacity(schema_name.len() + 4);
    ident.push_str("new_");
    for c in schema_name.chars() {
        if c.is_ascii_alphanumeric() {
            ident.push(c.to_ascii_lowercase());
        } else {
            ident.push('_');
        }
    }
    ident
}

fn zero_value(field: &MessageDefinitionField, datatypes: &Datatypes) -> String {
    if field.is_array {
        return "[]".to_string();
    }
    match field.type_name.as_str() {
        "bool" => "false".to_string(),
        "int8" | "uint8" | "int16" | "uint16" | "int32" | "uint32" | "int64" | "uint64"
        | "char" | "byte" => "0".to_string(),
        "float32" | "float64" => "0.0".to_string(),
        "string" | "wstring" => "\"\"".to_string(),
        "time" | "duration" => "#{ sec: 0, nsec: 0 }".to_string(),
        other if datatypes.contains_key(other) => format!("{}()", constructor_name(other)),
        _ => "()".to_string(),
    }
}

/// Rhai string literal for `s`. Control characters use the four digit
/// `\u` form.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Generate the library source for a datatype catalog.
pub fn generate_library(datatypes: &Datatypes) -> String {
    let mut out = String::new();
    let mut seen = HashSet::new();

    for (schema_name, definition) in datatypes {
        let ident = constructor_name(schema_name);
        if !seen.insert(ident.clone()) {
            tracing::debug!("Skipping constructor for {}: {} already defined", schema_name, ident);
            continue;
        }
        let _ = writeln!(out, "// {}", quote(schema_name));
        let _ = write!(out, "fn {}() {{ #{{", ident);
        let mut first = true;
        for field in &definition.fields {
            let _ = write!(
                out,
                "{} {}: {}",
                if first { "" } else { "," },
                quote(&field.name),
                zero_value(field, datatypes)
            );
            first = false;
        }
        let _ = writeln!(out, " }} }}");
    }

    let names: Vec<String> = datatypes.keys().map(|n| quote(n)).collect();
    let _ = writeln!(out, "fn datatype_names() {{ [{}] }}", names.join(", "));
    out
}

/// Caches the generated library by datatype catalog identity.
#[derive(Debug, Default)]
pub struct GeneratedLibraryCache {
    entry: Option<(Arc<Datatypes>, Arc<str>)>,
    generated: usize,
}

impl GeneratedLibraryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Library for `datatypes`, regenerated only when the catalog changed.
    pub fn get(&mut self, datatypes: &Arc<Datatypes>) -> Arc<str> {
        if let Some((key, library)) = &self.entry {
            if Arc::ptr_eq(key, datatypes) {
                return library.clone();
            }
        }
        let library: Arc<str> = generate_library(datatypes).into();
        self.generated += 1;
        self.entry = Some((datatypes.clone(), library.clone()));
        library
    }

    /// How many times a library was generated.
    pub fn generated(&self) -> usize {
        self.generated
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }
}
