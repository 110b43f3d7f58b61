//! Command-line descriptors and invocations.
//!
//! A descriptor is a Boutiques-style parameter schema over a command-line
//! template: the template contains value-keys (`[INPUT]`), and each input
//! describes its id, type, flag and constraints. An invocation binds input
//! ids to concrete values, which may contain `[[...]]` substitution
//! tokens. The builder turns (descriptor, invocation, environment) into a
//! single canonical command string — deterministically: the same inputs
//! always produce the same bytes.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::NipoppyError;
use crate::subst::{self, SubstEnv};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputType {
    String,
    Number,
    Flag,
    File,
}

/// One parameter in the descriptor schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorInput {
    pub id: String,
    #[serde(rename = "type")]
    pub input_type: InputType,
    #[serde(default)]
    pub optional: bool,
    #[serde(rename = "command-line-flag", default)]
    pub command_line_flag: Option<String>,
    #[serde(rename = "value-key")]
    pub value_key: String,
    #[serde(rename = "default-value", default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub list: bool,
    #[serde(rename = "value-choices", default)]
    pub value_choices: Option<Vec<Value>>,
}

/// The descriptor document (strict schema subset).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    pub name: String,
    #[serde(rename = "tool-version")]
    pub tool_version: String,
    #[serde(rename = "command-line")]
    pub command_line: String,
    pub inputs: Vec<DescriptorInput>,
}

impl Descriptor {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read descriptor {}", path.display()))?;
        let descriptor: Self = serde_json::from_str(&content).map_err(|e| {
            NipoppyError::config(format!("malformed descriptor {}: {e}", path.display()))
        })?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = BTreeMap::new();
        for input in &self.inputs {
            if seen.insert(input.id.clone(), ()).is_some() {
                return Err(NipoppyError::config(format!(
                    "descriptor {} declares input {:?} twice",
                    self.name, input.id
                ))
                .into());
            }
            if input.input_type == InputType::Flag && input.command_line_flag.is_none() {
                return Err(NipoppyError::config(format!(
                    "descriptor {} input {:?} is a Flag without a command-line-flag",
                    self.name, input.id
                ))
                .into());
            }
            if !self.command_line.contains(&input.value_key) {
                return Err(NipoppyError::config(format!(
                    "descriptor {} input {:?} names value-key {:?} absent from the command line",
                    self.name, input.id, input.value_key
                ))
                .into());
            }
        }
        Ok(())
    }

    pub fn input(&self, id: &str) -> Option<&DescriptorInput> {
        self.inputs.iter().find(|input| input.id == id)
    }
}

/// Parameter bindings for one descriptor: input id → bound value.
pub type Invocation = BTreeMap<String, Value>;

pub fn load_invocation(path: &Path) -> Result<Invocation> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read invocation {}", path.display()))?;
    let invocation: Invocation = serde_json::from_str(&content).map_err(|e| {
        NipoppyError::config(format!("malformed invocation {}: {e}", path.display()))
    })?;
    Ok(invocation)
}

/// Structural validation used at catalog-load time, before substitution
/// variables are known: unknown ids and missing required bindings are
/// rejected; value types are checked only once substitution has happened.
pub fn validate_invocation(descriptor: &Descriptor, invocation: &Invocation) -> Result<()> {
    for id in invocation.keys() {
        if descriptor.input(id).is_none() {
            return Err(NipoppyError::config(format!(
                "invocation binds unknown input {id:?} (descriptor {})",
                descriptor.name
            ))
            .into());
        }
    }
    for input in &descriptor.inputs {
        let bound = invocation.contains_key(&input.id) || input.default_value.is_some();
        if !bound && !input.optional && input.input_type != InputType::Flag {
            return Err(NipoppyError::config(format!(
                "invocation is missing required input {:?} (descriptor {})",
                input.id, descriptor.name
            ))
            .into());
        }
    }
    Ok(())
}

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern compiles"));

/// Build the canonical command string.
pub fn build_command(
    descriptor: &Descriptor,
    invocation: &Invocation,
    env: &SubstEnv,
) -> Result<String> {
    validate_invocation(descriptor, invocation)?;

    let mut command = descriptor.command_line.clone();
    for input in &descriptor.inputs {
        let raw = invocation
            .get(&input.id)
            .or(input.default_value.as_ref())
            .cloned();
        let fragment = match raw {
            Some(value) => {
                let resolved = subst::resolve_value(&value, env);
                render_fragment(descriptor, input, &resolved)?
            }
            None => String::new(),
        };
        command = command.replace(&input.value_key, &fragment);
    }

    Ok(WHITESPACE_RE.replace_all(&command, " ").trim().to_string())
}

fn render_fragment(
    descriptor: &Descriptor,
    input: &DescriptorInput,
    value: &Value,
) -> Result<String> {
    if input.input_type == InputType::Flag {
        let enabled = value.as_bool().ok_or_else(|| {
            NipoppyError::config(format!(
                "input {:?} is a Flag but bound to {value} (descriptor {})",
                input.id, descriptor.name
            ))
        })?;
        return Ok(if enabled {
            input.command_line_flag.clone().unwrap_or_default()
        } else {
            String::new()
        });
    }

    let values: Vec<&Value> = if input.list {
        value
            .as_array()
            .ok_or_else(|| {
                NipoppyError::config(format!(
                    "input {:?} is a list but bound to {value} (descriptor {})",
                    input.id, descriptor.name
                ))
            })?
            .iter()
            .collect()
    } else {
        vec![value]
    };

    let mut rendered = Vec::with_capacity(values.len());
    for v in &values {
        check_choice(descriptor, input, v)?;
        rendered.push(render_scalar(descriptor, input, v)?);
    }

    let joined = rendered.join(" ");
    Ok(match &input.command_line_flag {
        Some(flag) if !joined.is_empty() => format!("{flag} {joined}"),
        _ => joined,
    })
}

fn render_scalar(
    descriptor: &Descriptor,
    input: &DescriptorInput,
    value: &Value,
) -> Result<String> {
    match (input.input_type, value) {
        (InputType::String | InputType::File, Value::String(s)) => Ok(s.clone()),
        (InputType::Number, Value::Number(n)) => Ok(n.to_string()),
        // A numeric string is accepted so substitution tokens can bind numbers.
        (InputType::Number, Value::String(s)) if s.parse::<f64>().is_ok() => Ok(s.clone()),
        _ => Err(NipoppyError::config(format!(
            "input {:?} of type {:?} cannot be bound to {value} (descriptor {})",
            input.id, input.input_type, descriptor.name
        ))
        .into()),
    }
}

fn check_choice(descriptor: &Descriptor, input: &DescriptorInput, value: &Value) -> Result<()> {
    if let Some(choices) = &input.value_choices
        && !choices.contains(value)
    {
        return Err(NipoppyError::config(format!(
            "input {:?} value {value} is not one of {choices:?} (descriptor {})",
            input.id, descriptor.name
        ))
        .into());
    }
    Ok(())
}
