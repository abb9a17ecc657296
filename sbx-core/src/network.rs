//! Network policy generation
//!
//! The generator only describes what the container may reach. Enforcement is
//! delegated to a [`Firewall`](crate::driver::Firewall).

use crate::config::ResolvedPolicy;
use serde::Serialize;
use std::collections::BTreeSet;
use wildmatch::WildMatch;

/// Package registries allowed when the configuration names no baseline
pub const DEFAULT_BASELINE_DOMAINS: &[&str] = &[
    "registry.npmjs.org",
    "pypi.org",
    "files.pythonhosted.org",
    "crates.io",
    "static.crates.io",
    "index.crates.io",
    "proxy.golang.org",
    "rubygems.org",
];

/// Default-deny egress policy with an allow-list of domain patterns
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkPolicy {
    pub default_deny: bool,
    pub allowed_domains: BTreeSet<String>,
}

impl NetworkPolicy {
    /// Whether `host` is covered by an allowed pattern
    pub fn allows(&self, host: &str) -> bool {
        if !self.default_deny {
            return true;
        }
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.allowed_domains
            .iter()
            .any(|pattern| WildMatch::new(pattern).matches(&host))
    }
}

/// Build the network policy for a resolved policy
pub fn generate(policy: &ResolvedPolicy) -> NetworkPolicy {
    let mut allowed_domains = policy.domains.clone();
    allowed_domains.extend(
        policy
            .network_baseline
            .iter()
            .map(|d| d.trim_end_matches('.').to_ascii_lowercase()),
    );

    NetworkPolicy {
        default_deny: true,
        allowed_domains,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, ConfigFormat, ConfigLoader, ResolveRequest, TemplateContext};
    use std::path::Path;

    fn policy(yaml: &str) -> ResolvedPolicy {
        let doc = ConfigLoader::parse_str(yaml, ConfigFormat::Yaml, &TemplateContext::default())
            .unwrap();
        let root = Path::new("/workspace");
        resolve(
            &doc,
            &ResolveRequest {
                workspace_root: root,
                working_dir: root,
                workspace_rel_path: "",
                read_write: &[],
                resource_sets: &[],
                image: None,
                user: None,
                host_home: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_default_deny_with_baseline() {
        let net = generate(&policy("image: x\n"));
        assert!(net.default_deny);
        assert!(net.allows("pypi.org"));
        assert!(net.allows("registry.npmjs.org"));
        assert!(!net.allows("example.com"));
    }

    #[test]
    fn test_resource_domains_and_wildcards() {
        let net = generate(&policy(
            "image: x\nnetwork:\n  baseline: []\nresources:\n  gh:\n    domains: [github.com, \"*.githubusercontent.com\"]\napply:\n  - path: ./\n    resources: [gh]\n",
        ));
        assert!(net.allows("github.com"));
        assert!(net.allows("GitHub.com."));
        assert!(net.allows("raw.githubusercontent.com"));
        assert!(!net.allows("githubusercontent.com.evil.io"));
        assert!(!net.allows("pypi.org"));
        assert_eq!(net.allowed_domains.len(), 2);
    }
}
