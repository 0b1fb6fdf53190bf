//! Rhai scripting for user nodes
//!
//! User nodes are Rhai scripts. A node declares its topics through zero
//! argument functions and transforms messages in `process`:
//!
//! - `inputs()` - Array of input topic names (required, non-empty)
//! - `output()` - Output topic name (required)
//! - `schema()` - Output schema name, or `#{ name, definition }` (optional)
//! - `process(event, globals)` - Called once per input message. `event` is a
//!   map with `topic`, `receive_time`, `message` and `datatype`; `globals` is
//!   the global variable map. Return a map to publish it, or `()` to skip.
//!
//! Top-level statements run once when a worker registers the node. Inside
//! `process`, `this` is a map that persists between messages on the same
//! worker, so a node may keep running state there.
//!
//! ## Helper Functions
//!
//! - `log(value)` / `print(text)` - Captured and forwarded as node logs
//! - `to_secs(time)` - `#{ sec, nsec }` to floating-point seconds
//! - `derivative(current, previous, dt)` - Rate of change
//! - `smooth(current, previous, alpha)` - Exponential smoothing
//! - `lowpass(current, previous, cutoff_hz, dt)` - First-order lowpass
//! - `deadband(value, center, width)` - Deadband around a center
//! - `lerp(a, b, t)` / `map_range(value, in_min, in_max, out_min, out_max)`
//! - `new_<schema>()` - Zero-valued message of a known datatype, generated
//!   from the data source's datatype catalog
//!
//! ## Example Node
//!
//! ```rhai
//! fn inputs() { ["/imu"] }
//! fn output() { "/studio_script/imu_scaled" }
//!
//! fn process(event, globals) {
//!     let scale = globals.scale ?? 1.0;
//!     #{ accel: event.message.accel * scale }
//! }
//! ```

pub mod engine;
pub mod sandbox;
pub mod typegen;

pub use engine::{from_script_value, to_script_value, ScriptEngine, SharedLogBuffer};
pub use sandbox::RhaiSandbox;
pub use typegen::{generate_library, GeneratedLibraryCache};

/// Template user nodes for common use cases
pub mod builtins {
    /// Copy every input message to the output unchanged
    pub const PASSTHROUGH: &str = r#"
fn inputs() { ["/input"] }
fn output() { "/studio_script/passthrough" }

fn process(event, globals) {
    event.message
}
"#;

    /// Scale a numeric `value` field by the `scale` global variable
    pub const SCALE_BY_GLOBAL: &str = r#"
fn inputs() { ["/input"] }
fn output() { "/studio_script/scaled" }

fn process(event, globals) {
    let scale = if "scale" in globals { globals.scale } else { 1.0 };
    #{ value: event.message.value * scale }
}
"#;

    /// Rate of change of a numeric `value` field
    pub const RATE_OF_CHANGE: &str = r#"
fn inputs() { ["/input"] }
fn output() { "/studio_script/rate" }

fn process(event, globals) {
    let now = to_secs(event.receive_time);
    let value = event.message.value;
    let rate = if this.last_time == () || now <= this.last_time {
        0.0
    } else {
        derivative(value, this.last_value, now - this.last_time)
    };
    this.last_value = value;
    this.last_time = now;
    #{ rate: rate }
}
"#;

    /// Drop messages whose `value` is below the `threshold` global variable
    pub const THRESHOLD_FILTER: &str = r#"
fn inputs() { ["/input"] }
fn output() { "/studio_script/above_threshold" }

fn process(event, globals) {
    let threshold = if "threshold" in globals { globals.threshold } else { 0.0 };
    if event.message.value < threshold {
        return ();
    }
    event.message
}
"#;

    /// All templates with display names
    pub fn all() -> Vec<(&'static str, &'static str)> {
        vec![
            ("Passthrough", PASSTHROUGH),
            ("Scale by global", SCALE_BY_GLOBAL),
            ("Rate of change", RATE_OF_CHANGE),
            ("Threshold filter", THRESHOLD_FILTER),
        ]
    }
}
