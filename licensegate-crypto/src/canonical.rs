//! Canonical JSON serialization.
//!
//! Object keys are sorted by byte order at every depth, array order is kept,
//! and no whitespace is emitted. Signer and verifier build their JSON
//! independently, so this is the only form ever fed to the verifier.

use serde_json::Value;

/// Serializes `value` in canonical form.
#[must_use]
pub fn canonicalize_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&quote(key));
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Display on scalars is already compact JSON.
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn quote(s: &str) -> String {
    Value::String(s.to_owned()).to_string()
}
