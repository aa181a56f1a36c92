//! Cache key derivation.
//!
//! A key is the Sha256 digest of the task identity, the environment id, the
//! canonical rendering of the resolved inputs, and, for nested workflows,
//! the constructed graph's structural digest. Canonicalization makes equal
//! inputs render identically: object keys are sorted, sequences render
//! element-wise, and file-typed inputs contribute the digest of their
//! *content* rather than their path.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::lattice::TypeSpec;
use crate::task::FieldSpec;
use crate::value::Bindings;

use super::CacheError;

/// Content-derived cache key, hex-encoded.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derives the key for one work unit.
pub fn derive_key(
    task_id: &str,
    env_id: &str,
    canonical_inputs: &str,
    structural_digest: Option<&str>,
) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(env_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(canonical_inputs.as_bytes());
    if let Some(digest) = structural_digest {
        hasher.update(b"\x1f");
        hasher.update(digest.as_bytes());
    }
    CacheKey(hex(hasher))
}

/// Canonical rendering of resolved inputs against their declared fields.
///
/// Fields are rendered in sorted name order; values typed `File` (also
/// inside sequences, tuples, and maps) are replaced by their content
/// digest. Unbound optional fields are omitted.
///
/// File hashing reads file contents with blocking i/o, so async callers
/// run this on the blocking pool (the scheduler wraps it in
/// `spawn_blocking`).
pub fn canonical_bindings(inputs: &Bindings, specs: &[FieldSpec]) -> Result<String, CacheError> {
    let mut names: Vec<&String> = inputs.keys().collect();
    names.sort();
    let mut out = String::from("{");
    let mut first = true;
    for name in names {
        let value = &inputs[name];
        if !first {
            out.push(',');
        }
        first = false;
        let _ = write!(out, "{}:", quoted(name));
        match specs.iter().find(|s| &s.name == name) {
            Some(spec) => canonical_typed(value, &spec.ty, &mut out)?,
            None => out.push_str(&canonical_value(value)),
        }
    }
    out.push('}');
    Ok(out)
}

/// Canonical rendering of an untyped JSON value: object keys sorted,
/// everything else structural.
#[must_use]
pub fn canonical_value(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn canonical_typed(value: &Value, ty: &TypeSpec, out: &mut String) -> Result<(), CacheError> {
    match (ty, value) {
        (TypeSpec::File(_), Value::String(path)) => {
            let digest = file_digest(Path::new(path))?;
            let _ = write!(out, "{{\"file\":\"{digest}\"}}");
            Ok(())
        }
        (TypeSpec::Sequence(e) | TypeSpec::Set(e), Value::Array(items)) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonical_typed(item, e, out)?;
            }
            out.push(']');
            Ok(())
        }
        (TypeSpec::Tuple(es), Value::Array(items)) if es.len() == items.len() => {
            out.push('[');
            for (i, (item, e)) in items.iter().zip(es).enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonical_typed(item, e, out)?;
            }
            out.push(']');
            Ok(())
        }
        (TypeSpec::Map(_, v), Value::Object(map)) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:", quoted(key));
                canonical_typed(&map[*key], v, out)?;
            }
            out.push('}');
            Ok(())
        }
        // Unions and `Any` carry no static file evidence; render plainly.
        _ => {
            out.push_str(&canonical_value(value));
            Ok(())
        }
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::String(s) => out.push_str(&quoted(s)),
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
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:", quoted(key));
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

fn quoted(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\""))
}

/// Sha256 of a file's content. Blocking; see
/// [`canonical_bindings`] for how the async path offloads it.
pub fn file_digest(path: &Path) -> Result<String, CacheError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex(hasher))
}

fn hex(hasher: Sha256) -> String {
    let bytes = hasher.finalize();
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_sorts_object_keys() {
        let a = canonical_value(&json!({"b": 1, "a": [2, {"z": 0, "y": 1}]}));
        assert_eq!(a, r#"{"a":[2,{"y":1,"z":0}],"b":1}"#);
    }

    #[test]
    fn equal_bindings_derive_equal_keys() {
        let specs = vec![
            FieldSpec::required("a", TypeSpec::Int),
            FieldSpec::required("b", TypeSpec::Str),
        ];
        let mut left = Bindings::default();
        left.insert("b".into(), json!("x"));
        left.insert("a".into(), json!(1));
        let mut right = Bindings::default();
        right.insert("a".into(), json!(1));
        right.insert("b".into(), json!("x"));

        let cl = canonical_bindings(&left, &specs).unwrap();
        let cr = canonical_bindings(&right, &specs).unwrap();
        assert_eq!(cl, cr);
        assert_eq!(
            derive_key("t", "local", &cl, None),
            derive_key("t", "local", &cr, None)
        );
    }

    #[test]
    fn different_env_changes_key() {
        assert_ne!(
            derive_key("t", "local", "{}", None),
            derive_key("t", "docker", "{}", None)
        );
    }

    #[test]
    fn file_inputs_hash_content_not_path() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("one.txt");
        let p2 = dir.path().join("two.txt");
        std::fs::write(&p1, b"same bytes").unwrap();
        std::fs::write(&p2, b"same bytes").unwrap();

        let specs = vec![FieldSpec::required("f", TypeSpec::file("generic/file"))];
        let mut left = Bindings::default();
        left.insert("f".into(), json!(p1.to_string_lossy()));
        let mut right = Bindings::default();
        right.insert("f".into(), json!(p2.to_string_lossy()));

        assert_eq!(
            canonical_bindings(&left, &specs).unwrap(),
            canonical_bindings(&right, &specs).unwrap()
        );
    }
}
