//! `[[NAME]]` template token resolution.
//!
//! Substitution is single-pass: tokens introduced by a substituted value
//! are never re-expanded, so the engine cannot loop. Tokens with no
//! binding are left verbatim (best-effort policy); higher layers decide
//! whether leftovers are an error via [`unresolved_tokens`].

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Built-in variable names bound at work-unit time. Everything an
/// invocation references must be one of these, a pipeline variable from
/// the configuration, or a dataset-wide substitution.
pub const BUILTIN_TOKENS: &[&str] = &[
    "PARTICIPANT_ID",
    "SESSION_ID",
    "BIDS_PARTICIPANT_ID",
    "BIDS_SESSION_ID",
    "DPATH_ROOT",
    "DPATH_BIDS",
    "DPATH_PIPELINE",
    "DPATH_PIPELINE_OUTPUT",
    "DPATH_PIPELINE_WORK",
    "DPATH_PIPELINE_IDP",
    "DPATH_BIDS_DB",
    "FPATH_CONTAINER",
    "CONTAINER_COMMAND",
];

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[([A-Za-z0-9_]+)\]\]").expect("token pattern compiles"));

/// A scoped variable environment. Later insertions shadow earlier ones,
/// so callers assemble scopes dataset-wide first, pipeline second,
/// per-unit last.
#[derive(Debug, Clone, Default)]
pub struct SubstEnv {
    vars: BTreeMap<String, String>,
}

impl SubstEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn extend<I, K, V>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in entries {
            self.vars.insert(k.into(), v.into());
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }
}

/// Replace every resolvable `[[NAME]]` in `input`, leaving unresolved
/// tokens as-is.
pub fn resolve_str(input: &str, env: &SubstEnv) -> String {
    TOKEN_RE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            match env.get(&caps[1]) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Recursively resolve tokens in every string reachable from a JSON value.
/// Object keys are left untouched; only values are templates.
pub fn resolve_value(value: &Value, env: &SubstEnv) -> Value {
    match value {
        Value::String(s) => Value::String(resolve_str(s, env)),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, env)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, env)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// All token names referenced by `input`, in order of first appearance.
pub fn referenced_tokens(input: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for caps in TOKEN_RE.captures_iter(input) {
        let name = caps[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

/// Token names referenced by `input` that have no binding in `env`.
pub fn unresolved_tokens(input: &str, env: &SubstEnv) -> Vec<String> {
    referenced_tokens(input)
        .into_iter()
        .filter(|name| !env.contains(name))
        .collect()
}

/// All token names referenced anywhere in a JSON value tree.
pub fn referenced_tokens_in_value(value: &Value) -> Vec<String> {
    fn walk(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => {
                for name in referenced_tokens(s) {
                    if !out.contains(&name) {
                        out.push(name);
                    }
                }
            }
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            Value::Object(map) => map.values().for_each(|v| walk(v, out)),
            _ => {}
        }
    }
    let mut out = Vec::new();
    walk(value, &mut out);
    out
}
