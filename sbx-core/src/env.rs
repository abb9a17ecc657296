//! Environment variable management for the container

use std::collections::BTreeMap;
use std::env;

/// Variable pointing the in-container `sbx call` client at the gateway socket
pub const CALLS_SOCKET_VAR: &str = "SBX_CALLS_SOCKET";

/// Builder for environment variables in the container
#[derive(Debug, Default, Clone)]
pub struct EnvironmentBuilder {
    vars: BTreeMap<String, String>,
}

impl EnvironmentBuilder {
    /// Create a new environment builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an environment variable
    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) -> &mut Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Pass through an environment variable from the host, if it is set
    pub fn pass_through(&mut self, key: &str) -> &mut Self {
        match env::var(key) {
            Ok(value) => {
                self.vars.insert(key.to_string(), value);
            }
            Err(_) => tracing::debug!("Host variable {} is not set, not forwarding", key),
        }
        self
    }

    /// Pass through multiple environment variables from the host
    pub fn pass_through_many<'a, I>(&mut self, keys: I) -> &mut Self
    where
        I: IntoIterator<Item = &'a String>,
    {
        for key in keys {
            self.pass_through(key);
        }
        self
    }

    /// Names and values to hand to the runtime process
    pub fn build(&self) -> BTreeMap<String, String> {
        self.vars.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_env() {
        let mut builder = EnvironmentBuilder::new();
        builder.set("FOO", "bar");

        assert_eq!(builder.build().get("FOO"), Some(&"bar".to_string()));
    }

    #[test]
    fn test_later_values_override() {
        let mut builder = EnvironmentBuilder::new();
        builder.set("HOME", "/home/agent").set("EXTRA", "1").set("HOME", "/tmp");

        let vars = builder.build();
        assert_eq!(vars["HOME"], "/tmp");
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn test_pass_through_skips_unset() {
        let mut builder = EnvironmentBuilder::new();
        builder.pass_through_many(&["SBX_TEST_SURELY_UNSET_VARIABLE".to_string()]);
        assert!(builder.build().is_empty());
    }
}
