//! `${{ scope.NAME }}` substitution in configuration string scalars
//!
//! Three scopes are recognised: `env` (host environment), `vars` (`--var`
//! values) and `conf` (identifiers computed by the loader). Evaluation is a
//! single left-to-right pass; substituted text is never scanned again.

use crate::error::ConfigError;
use std::collections::BTreeMap;

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

/// Values available to template placeholders
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    env: BTreeMap<String, String>,
    vars: BTreeMap<String, String>,
    conf: BTreeMap<String, String>,
}

impl TemplateContext {
    /// Create a context that reads `env.*` from the host environment
    pub fn from_host(vars: BTreeMap<String, String>) -> Self {
        Self {
            env: std::env::vars().collect(),
            vars,
            conf: BTreeMap::new(),
        }
    }

    /// Replace the `env.*` scope
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Add or replace a `conf.*` value
    pub fn set_conf(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.conf.insert(key.into(), value.into());
        self
    }

    fn lookup(&self, scope: &str, key: &str, text: &str) -> Result<&str, ConfigError> {
        let table = match scope {
            "env" => &self.env,
            "vars" => &self.vars,
            "conf" => &self.conf,
            other => {
                return Err(ConfigError::MalformedTemplate {
                    text: text.to_string(),
                    reason: format!("unknown scope '{}'", other),
                })
            }
        };
        table
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::MissingTemplateKey {
                scope: scope.to_string(),
                key: key.to_string(),
            })
    }

    /// Expand every placeholder in `text`
    pub fn expand(&self, text: &str) -> Result<String, ConfigError> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find(OPEN) {
            out.push_str(&rest[..start]);
            let after_open = &rest[start + OPEN.len()..];
            let end = after_open
                .find(CLOSE)
                .ok_or_else(|| ConfigError::MalformedTemplate {
                    text: text.to_string(),
                    reason: "unterminated placeholder".to_string(),
                })?;

            let expr = after_open[..end].trim();
            let (scope, key) = parse_reference(expr).ok_or_else(|| {
                ConfigError::MalformedTemplate {
                    text: text.to_string(),
                    reason: format!("expected scope.NAME, found '{}'", expr),
                }
            })?;
            out.push_str(self.lookup(scope, key, text)?);
            rest = &after_open[end + CLOSE.len()..];
        }

        out.push_str(rest);
        Ok(out)
    }

    /// Expand placeholders in every string scalar of a YAML tree. Mapping keys
    /// are left untouched.
    pub fn expand_yaml(&self, value: &mut serde_yaml::Value) -> Result<(), ConfigError> {
        use serde_yaml::Value;

        match value {
            Value::String(s) => *s = self.expand(s)?,
            Value::Sequence(items) => {
                for item in items {
                    self.expand_yaml(item)?;
                }
            }
            Value::Mapping(map) => {
                for (_, item) in map.iter_mut() {
                    self.expand_yaml(item)?;
                }
            }
            Value::Tagged(tagged) => self.expand_yaml(&mut tagged.value)?,
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
        Ok(())
    }

    /// Expand placeholders in every string scalar of a TOML tree
    pub fn expand_toml(&self, value: &mut toml::Value) -> Result<(), ConfigError> {
        use toml::Value;

        match value {
            Value::String(s) => *s = self.expand(s)?,
            Value::Array(items) => {
                for item in items {
                    self.expand_toml(item)?;
                }
            }
            Value::Table(table) => {
                for (_, item) in table.iter_mut() {
                    self.expand_toml(item)?;
                }
            }
            Value::Integer(_) | Value::Float(_) | Value::Boolean(_) | Value::Datetime(_) => {}
        }
        Ok(())
    }
}

fn parse_reference(expr: &str) -> Option<(&str, &str)> {
    let (scope, key) = expr.split_once('.')?;
    let valid = |s: &str| {
        !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    };
    (valid(scope) && valid(key)).then_some((scope, key))
}

/// Parse a `KEY=VALUE` template variable as given on the command line
pub fn parse_var(s: &str) -> Result<(String, String), ConfigError> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(ConfigError::InvalidVar(s.to_string())),
    }
}
