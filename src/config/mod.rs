pub mod types;

use anyhow::{Context, Result};
use std::path::Path;

pub use types::Config;

/// Load and validate a config file. YAML and JSON both parse through
/// `serde_yml`.
pub fn load_config(path: &str) -> Result<Config> {
    let content = load_config_content(path)?;
    let config: Config = serde_yml::from_str(&content)
        .with_context(|| format!("failed to parse config '{}'", path))?;
    config.validate()?;
    Ok(config)
}

pub fn load_config_content(path: &str) -> Result<String> {
    let raw = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("failed to read config '{}'", path))?;
    Ok(expand_env_vars(&raw))
}

/// Expand `${VAR}` and `${VAR:-default}`. Undefined variables expand to
/// nothing. A bare `$` is left alone so passwords survive untouched.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' || chars.peek() != Some(&'{') {
            result.push(c);
            continue;
        }
        chars.next(); // '{'
        let mut name = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            name.push(c);
        }
        if !closed {
            result.push_str("${");
            result.push_str(&name);
            continue;
        }
        match name.split_once(":-") {
            Some((var, default)) => match std::env::var(var) {
                Ok(val) if !val.is_empty() => result.push_str(&val),
                _ => result.push_str(default),
            },
            None => {
                if let Ok(val) = std::env::var(&name) {
                    result.push_str(&val);
                }
            }
        }
    }

    result
}
