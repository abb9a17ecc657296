//! Configuration document schema types

use crate::error::ConfigError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A complete configuration document, after template evaluation
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigDocument {
    /// Default container image
    #[serde(default)]
    pub image: Option<String>,
    /// Default user the agent runs as inside the container
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub network: NetworkConfig,
    /// Named resource sets, in declaration order
    #[serde(default)]
    pub resources: IndexMap<String, ResourceSet>,
    /// Apply rules, evaluated in declaration order
    #[serde(default)]
    pub apply: Vec<ApplyRule>,
}

/// Network settings shared by every resource set
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Domains always allowed. `None` selects the built-in registry baseline.
    #[serde(default)]
    pub baseline: Option<Vec<String>>,
    /// Enforcement command invoked with the container id as its last argument
    #[serde(default)]
    pub enforcer: Vec<String>,
}

/// A named bag of capability grants
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResourceSet {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mounts: Vec<MountDecl>,
    /// HTTP(S) domains to allow, wildcards permitted
    #[serde(default)]
    pub domains: Vec<String>,
    /// Host environment variables to forward
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortForward>,
    #[serde(default)]
    pub calls: Vec<CallSpec>,
}

/// A host path to bind into the container
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MountDecl {
    /// Host path. `~/` is the host home, relative paths start at the workspace root.
    pub source: String,
    /// Container path, defaults to the resolved source
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub rw: bool,
}

/// A host-side command the agent may invoke through the call gateway
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(deny_unknown_fields)]
pub struct CallSpec {
    pub name: String,
    /// Program followed by fixed leading arguments
    pub command: Vec<String>,
    /// Pattern the space-joined arguments must match in full
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Binds resource sets to a workspace path
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ApplyRule {
    /// Workspace-relative path; `./` is the workspace root
    pub path: String,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A port published from the container to the host
///
/// Written as `PORT`, `HOST:CONTAINER`, `ADDR:HOST:CONTAINER`, each optionally
/// followed by `/tcp` or `/udp`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortForward {
    pub host_addr: Option<String>,
    pub host: u16,
    pub container: u16,
    pub protocol: Protocol,
}

impl FromStr for PortForward {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPort(s.to_string());

        let (ports, protocol) = match s.rsplit_once('/') {
            Some((ports, "tcp")) => (ports, Protocol::Tcp),
            Some((ports, "udp")) => (ports, Protocol::Udp),
            Some(_) => return Err(invalid()),
            None => (s, Protocol::Tcp),
        };

        let parts: Vec<&str> = ports.split(':').collect();
        let parse = |p: &str| p.parse::<u16>().ok().filter(|p| *p != 0).ok_or_else(invalid);

        let (host_addr, host, container) = match parts.as_slice() {
            [port] => (None, parse(port)?, parse(port)?),
            [host, container] => (None, parse(host)?, parse(container)?),
            [addr, host, container] if !addr.is_empty() => {
                (Some(addr.to_string()), parse(host)?, parse(container)?)
            }
            _ => return Err(invalid()),
        };

        Ok(Self {
            host_addr,
            host,
            container,
            protocol,
        })
    }
}

impl TryFrom<String> for PortForward {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortForward> for String {
    fn from(value: PortForward) -> Self {
        value.to_string()
    }
}

impl fmt::Display for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(addr) = &self.host_addr {
            write!(f, "{}:", addr)?;
        }
        write!(f, "{}:{}", self.host, self.container)?;
        match self.protocol {
            Protocol::Tcp => Ok(()),
            Protocol::Udp => write!(f, "/udp"),
        }
    }
}
