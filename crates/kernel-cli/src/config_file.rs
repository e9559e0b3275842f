//! On-disk configuration loading: YAML with `${VAR}` environment expansion.
//! Missing variables and unknown keys fail loudly at startup.

use std::path::Path;

use contracts::{ActionWhitelist, KernelConfig, KernelError};
use serde_yaml::Value;

pub fn load_config(path: &Path) -> Result<KernelConfig, KernelError> {
    let raw = read_yaml(path)?;
    let resolved = resolve_env(raw)?;
    let config: KernelConfig = serde_yaml::from_value(resolved)
        .map_err(|err| KernelError::invalid_config(format!("config validation failed: {err}")))?;
    config.validate()?;
    Ok(config)
}

pub fn load_whitelist(path: &Path) -> Result<ActionWhitelist, KernelError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|err| KernelError::invalid_config(format!("cannot read {}: {err}", path.display())))?;
    // Parsed straight from the document, not through an intermediate value
    // map, so a duplicated action key is rejected instead of last-one-wins.
    let whitelist: ActionWhitelist = serde_yaml::from_str(&contents).map_err(|err| {
        KernelError::invalid_config(format!("action whitelist validation failed: {err}"))
    })?;
    whitelist.validate()?;
    Ok(whitelist)
}

fn read_yaml(path: &Path) -> Result<Value, KernelError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|err| KernelError::invalid_config(format!("cannot read {}: {err}", path.display())))?;
    let value: Value = serde_yaml::from_str(&contents)
        .map_err(|err| KernelError::invalid_config(format!("invalid yaml in {}: {err}", path.display())))?;
    if value.is_null() {
        return Err(KernelError::invalid_config(format!(
            "empty config file: {}",
            path.display()
        )));
    }
    Ok(value)
}

fn resolve_env(value: Value) -> Result<Value, KernelError> {
    match value {
        Value::String(text) => Ok(Value::String(expand_env(&text)?)),
        Value::Sequence(items) => Ok(Value::Sequence(
            items
                .into_iter()
                .map(resolve_env)
                .collect::<Result<Vec<_>, _>>()?,
        )),
        Value::Mapping(mapping) => {
            let mut resolved = serde_yaml::Mapping::new();
            for (key, entry) in mapping {
                resolved.insert(key, resolve_env(entry)?);
            }
            Ok(Value::Mapping(resolved))
        }
        other => Ok(other),
    }
}

/// Expands every `${NAME}` token; a missing variable is a startup failure,
/// never an empty string.
fn expand_env(input: &str) -> Result<String, KernelError> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let end = tail.find('}').ok_or_else(|| {
            KernelError::invalid_config(format!("unterminated ${{..}} expansion in: {input}"))
        })?;
        let name = &tail[..end];
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(KernelError::invalid_config(format!(
                "invalid environment variable name in expansion: {name:?}"
            )));
        }
        let value = std::env::var(name).map_err(|_| {
            KernelError::invalid_config(format!("missing environment variable: {name}"))
        })?;
        output.push_str(&value);
        rest = &tail[end + 1..];
    }
    output.push_str(rest);
    Ok(output)
}
