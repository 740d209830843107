//! `${VAR}` resolution and `MISSING`-sentinel validation.
//!
//! Both operations are post-order walks over the raw configuration tree.
//! A string leaf participates only when the *entire* leaf matches the
//! reference syntax; there are never partially-resolved strings in the
//! output.

use regex::Regex;
use std::sync::OnceLock;

/// `${NAME}`
fn plain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\$\{([A-Za-z_][A-Za-z0-9_]*)\}$").unwrap())
}

/// `${oc.env:NAME}` or `${oc.env:NAME:default}`
fn oc_env_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\$\{oc\.env:([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}$").unwrap()
    })
}

/// Reject any `MISSING` sentinel left in the tree, reporting the dotted path
/// of the first offender (e.g. `target.api_endpoint.model_id`).
pub fn validate_no_missing(value: &serde_json::Value) -> crate::Result<()> {
    walk_missing(value, &mut Vec::new())
}

fn walk_missing(value: &serde_json::Value, path: &mut Vec<String>) -> crate::Result<()> {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                path.push(key.clone());
                walk_missing(child, path)?;
                path.pop();
            }
        }
        serde_json::Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                path.push(i.to_string());
                walk_missing(child, path)?;
                path.pop();
            }
        }
        serde_json::Value::String(s) if s == "MISSING" || s == "???" => {
            return Err(crate::Error::MissingValue {
                path: path.join("."),
            });
        }
        _ => {}
    }
    Ok(())
}

/// Resolve every `${VAR}` / `${oc.env:VAR[:default]}` leaf against the
/// process environment. A missing variable without a default is fatal.
pub fn resolve_env_vars(value: serde_json::Value) -> crate::Result<serde_json::Value> {
    resolve_env_vars_with(value, &|name| std::env::var(name).ok())
}

/// Resolution with an injected lookup, for tests.
pub fn resolve_env_vars_with(
    value: serde_json::Value,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> crate::Result<serde_json::Value> {
    let mut path = Vec::new();
    walk_resolve(value, lookup, &mut path)
}

fn walk_resolve(
    value: serde_json::Value,
    lookup: &dyn Fn(&str) -> Option<String>,
    path: &mut Vec<String>,
) -> crate::Result<serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, child) in map {
                path.push(key.clone());
                let resolved = walk_resolve(child, lookup, path)?;
                path.pop();
                out.insert(key, resolved);
            }
            Ok(serde_json::Value::Object(out))
        }
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, child) in items.into_iter().enumerate() {
                path.push(i.to_string());
                out.push(walk_resolve(child, lookup, path)?);
                path.pop();
            }
            Ok(serde_json::Value::Array(out))
        }
        serde_json::Value::String(s) => Ok(serde_json::Value::String(resolve_leaf(
            s, lookup, path,
        )?)),
        other => Ok(other),
    }
}

fn resolve_leaf(
    s: String,
    lookup: &dyn Fn(&str) -> Option<String>,
    path: &[String],
) -> crate::Result<String> {
    if let Some(caps) = plain_re().captures(&s) {
        let name = caps.get(1).unwrap().as_str();
        return lookup(name).ok_or_else(|| crate::Error::UnresolvedEnv {
            name: name.to_string(),
            path: path.join("."),
        });
    }
    if let Some(caps) = oc_env_re().captures(&s) {
        let name = caps.get(1).unwrap().as_str();
        return match lookup(name) {
            Some(v) => Ok(v),
            None => match caps.get(2) {
                Some(default) => Ok(default.as_str().to_string()),
                None => Err(crate::Error::UnresolvedEnv {
                    name: name.to_string(),
                    path: path.join("."),
                }),
            },
        };
    }
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_plain_reference_resolves() {
        let tree = json!({"evaluation": {"env_vars": {"evaluation": {"KEY": "${API_KEY}"}}}});
        let lookup = env(&[("API_KEY", "secret")]);
        let out = resolve_env_vars_with(tree, &lookup).unwrap();
        assert_eq!(out["evaluation"]["env_vars"]["evaluation"]["KEY"], "secret");
    }

    #[test]
    fn test_missing_var_reports_path() {
        let tree = json!({"a": [{"b": "${NOPE}"}]});
        let lookup = env(&[]);
        let err = resolve_env_vars_with(tree, &lookup).unwrap_err();
        assert!(err.to_string().contains("NOPE"));
        assert!(err.to_string().contains("a.0.b"));
    }

    #[test]
    fn test_oc_env_default_substitutes() {
        let tree = json!({"x": "${oc.env:NOPE:fallback}"});
        let out = resolve_env_vars_with(tree, &env(&[])).unwrap();
        assert_eq!(out["x"], "fallback");
        // And the value wins over the default when present.
        let tree = json!({"x": "${oc.env:SET:fallback}"});
        let out = resolve_env_vars_with(tree, &env(&[("SET", "real")])).unwrap();
        assert_eq!(out["x"], "real");
    }

    #[test]
    fn test_non_reference_strings_pass_through() {
        let tree = json!({"x": "literal ${not a ref", "y": "prefix-${VAR}-suffix"});
        let out = resolve_env_vars_with(tree.clone(), &env(&[])).unwrap();
        // Partial matches are not references; they pass through untouched.
        assert_eq!(out, tree);
    }

    #[test]
    fn test_missing_sentinel_paths() {
        let tree = json!({"target": {"api_endpoint": {"model_id": "MISSING"}}});
        let err = validate_no_missing(&tree).unwrap_err();
        assert_eq!(
            err.to_string(),
            "MISSING value at path: target.api_endpoint.model_id"
        );
        assert!(validate_no_missing(&json!({"ok": "value"})).is_ok());
    }
}
