//! The language wrapper generator: a small per-language capability set that
//! tells `evaluate` how to drive a command through a JSON-in/JSON-out
//! protocol, plus the JSON-safe sieve both sides of that protocol use to
//! agree on what can cross the boundary.
//!

use serde_json::Value;

/// Per-command language capability. `evaluate` is available on a command
/// iff its binding's `driver_template` returns `Some`.
pub trait LanguageBinding: Send + Sync {
    /// Argv fragments to append after the command's own fixed argv when
    /// running the driver (e.g. flags that disable site customization).
    fn extra_argv(&self) -> &[&'static str] {
        &[]
    }

    /// The driver script source to write as `jailed_code`, or `None` if this
    /// command has no evaluate-mode capability.
    fn driver_template(&self) -> Option<&str> {
        None
    }
}

/// A command with no evaluate-mode capability; only `execute` is usable.
pub struct PlainBinding;

impl LanguageBinding for PlainBinding {}

/// A Python 3 binding: globals in, globals out, via a small driver script
/// that serializes through stdin/stdout JSON.
pub struct PythonBinding;

impl LanguageBinding for PythonBinding {
    fn extra_argv(&self) -> &[&'static str] {
        &["-E", "-B"]
    }

    fn driver_template(&self) -> Option<&str> {
        Some(PYTHON3_DRIVER)
    }
}

/// Driver script executed inside the child for Python evaluate mode. Reads
/// `[code, globals_in, python_path]` as JSON from stdin, appends each
/// `python_path` entry (copied alongside the driver under its basename) to
/// `sys.path`, executes `code` with a globals dict seeded from `globals_in`,
/// swaps out `sys.stdout` for the duration so user `print`s cannot corrupt
/// the return channel, then filters the resulting globals through the same
/// JSON-safe sieve as the host side and writes them as JSON to the real
/// stdout.
const PYTHON3_DRIVER: &str = r#"
import io
import json
import sys

def _json_safe(value, seen_builtins=False):
    if value is None or isinstance(value, (bool, int, float, str)):
        try:
            json.loads(json.dumps(value))
        except (TypeError, ValueError):
            return None, False
        return value, True
    if isinstance(value, bytes):
        try:
            return value.decode("utf-8"), True
        except UnicodeDecodeError:
            return None, False
    if isinstance(value, (list, tuple)):
        out = []
        for item in value:
            safe_item, ok = _json_safe(item)
            if ok:
                out.append(safe_item)
        return out, True
    if isinstance(value, dict):
        out = {}
        for key, item in value.items():
            if key == "__builtins__":
                continue
            safe_key, key_ok = _json_safe(key)
            if not key_ok or not isinstance(safe_key, str):
                continue
            safe_item, item_ok = _json_safe(item)
            if item_ok:
                out[safe_key] = safe_item
        return out, True
    return None, False

def main():
    payload = json.loads(sys.stdin.read())
    code, globals_in, python_path = payload[0], payload[1], payload[2]

    for entry in python_path:
        sys.path.insert(0, entry)

    real_stdout = sys.stdout
    sys.stdout = io.StringIO()
    the_globals = dict(globals_in)
    try:
        exec(code, the_globals)
    finally:
        sys.stdout = real_stdout

    safe_globals, _ = _json_safe(the_globals)
    real_stdout.write(json.dumps(safe_globals))
    real_stdout.write("\n")

if __name__ == "__main__":
    main()
"#;

/// Filter a JSON value down to the values the wire protocol promises to
/// preserve exactly: `null`, booleans, numbers, strings, arrays, and
/// objects with string keys, dropping any `__builtins__` key and any value
/// (or key) that fails an encode/decode round trip. Runs on both sides: on
/// the host to shrink outgoing globals, and (conceptually, re-implemented
/// in the driver template above) inside the child to constrain what flows
/// back.
pub fn json_safe(value: &Value) -> Option<Value> {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            if round_trips(value) {
                Some(value.clone())
            } else {
                None
            }
        }
        Value::Array(items) => Some(Value::Array(items.iter().filter_map(json_safe).collect())),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, item) in map {
                if key == "__builtins__" {
                    continue;
                }
                if let Some(safe_item) = json_safe(item) {
                    out.insert(key.clone(), safe_item);
                }
            }
            Some(Value::Object(out))
        }
    }
}

fn round_trips(value: &Value) -> bool {
    match serde_json::to_string(value) {
        Ok(encoded) => matches!(serde_json::from_str::<Value>(&encoded), Ok(decoded) if &decoded == value),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn drops_dunder_builtins_key() {
        let input = json!({"a": 1, "__builtins__": {"print": "builtin"}});
        let filtered = json_safe(&input).unwrap();
        assert_eq!(json!({"a": 1}), filtered);
    }

    #[test]
    fn keeps_nested_plain_containers() {
        let input = json!({"a": [1, 2, {"b": "c"}], "d": null});
        let filtered = json_safe(&input).unwrap();
        assert_eq!(input, filtered);
    }

    #[test]
    fn plain_binding_has_no_driver_template() {
        assert!(PlainBinding.driver_template().is_none());
    }

    #[test]
    fn python_binding_has_a_driver_template() {
        assert!(PythonBinding.driver_template().is_some());
    }

    #[test]
    fn python_binding_passes_e_and_b_flags() {
        assert_eq!(&["-E", "-B"], PythonBinding.extra_argv());
    }

    #[test]
    fn plain_binding_has_no_extra_argv() {
        assert!(PlainBinding.extra_argv().is_empty());
    }
}
