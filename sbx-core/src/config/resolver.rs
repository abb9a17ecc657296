//! Policy resolution: apply rules + resource sets + CLI overrides into one
//! effective policy
//!
//! Resolution is a pure fold over the document. The only filesystem access is
//! canonicalizing the `-rw` paths, which must exist before anything else runs.

use super::loader::{container_home, DEFAULT_USER};
use super::sandbox::{absolute_from, SandboxConfig};
use super::schema::{ApplyRule, CallSpec, ConfigDocument, MountDecl, PortForward, ResourceSet};
use crate::error::ConfigError;
use crate::network::DEFAULT_BASELINE_DOMAINS;
use indexmap::IndexSet;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

type Result<T> = std::result::Result<T, ConfigError>;

/// Inputs to [`resolve`] beyond the configuration document
#[derive(Debug, Clone)]
pub struct ResolveRequest<'a> {
    /// Canonical workspace root
    pub workspace_root: &'a Path,
    /// Directory relative `-rw` paths are resolved against
    pub working_dir: &'a Path,
    /// Path the user is operating under, relative to the workspace root
    pub workspace_rel_path: &'a str,
    pub read_write: &'a [PathBuf],
    pub resource_sets: &'a [String],
    pub image: Option<&'a str>,
    pub user: Option<&'a str>,
    /// Host home directory used to expand `~/` in mount sources
    pub host_home: Option<&'a Path>,
}

/// A resource-set mount with its paths resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedMount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub rw: bool,
    /// Resource set that declared the mount
    pub origin: String,
}

/// The merged, concrete runtime policy for one invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedPolicy {
    pub workspace_root: PathBuf,
    pub workspace_rel_path: String,
    /// Contributing resource sets, rules first and CLI selections after
    pub resource_sets: Vec<String>,
    pub image: String,
    pub user: String,
    /// Container home of `user`
    pub home: String,
    pub mounts: Vec<ResolvedMount>,
    pub domains: BTreeSet<String>,
    /// Host environment variables to forward
    pub env: BTreeSet<String>,
    pub ports: BTreeSet<PortForward>,
    pub calls: BTreeMap<String, CallSpec>,
    /// The workspace root itself was passed as `-rw`
    pub workspace_writable: bool,
    /// Canonical `-rw` paths below the workspace root, parents first
    pub writable_paths: Vec<PathBuf>,
    pub network_baseline: Vec<String>,
    pub network_enforcer: Vec<String>,
}

impl ResolvedPolicy {
    /// Log the resolved policy for diagnosis
    pub fn log_summary(&self) {
        tracing::info!("Workspace: {}", self.workspace_root.display());
        tracing::info!(
            "Workspace path: ./{} ({})",
            self.workspace_rel_path,
            if self.workspace_writable { "rw" } else { "ro" }
        );
        tracing::info!("Image: {}", self.image);
        tracing::info!("User: {}", self.user);
        tracing::info!("Resource sets: {}", self.resource_sets.join(", "));
        for mount in &self.mounts {
            tracing::info!(
                "Mount: {} -> {} ({}, from {})",
                mount.source.display(),
                mount.target.display(),
                if mount.rw { "rw" } else { "ro" },
                mount.origin
            );
        }
        for path in &self.writable_paths {
            tracing::info!("Writable: {}", path.display());
        }
        let domains: Vec<&str> = self.domains.iter().map(String::as_str).collect();
        tracing::info!("Domains: {}", domains.join(", "));
        if !self.env.is_empty() {
            let env: Vec<&str> = self.env.iter().map(String::as_str).collect();
            tracing::info!("Forwarded env: {}", env.join(", "));
        }
        for port in &self.ports {
            tracing::info!("Port: {}", port);
        }
        for call in self.calls.values() {
            tracing::info!("Call: {} -> {}", call.name, call.command.join(" "));
        }
    }
}

/// Resolve the policy for a normalized invocation
pub fn resolve_for(doc: &ConfigDocument, config: &SandboxConfig) -> Result<ResolvedPolicy> {
    let rel = config.workspace_rel_path()?;
    let home = std::env::var_os("HOME").map(PathBuf::from);
    resolve(
        doc,
        &ResolveRequest {
            workspace_root: &config.workspace_root,
            working_dir: &config.working_dir,
            workspace_rel_path: &rel,
            read_write: &config.read_write,
            resource_sets: &config.resource_sets,
            image: config.image.as_deref(),
            user: config.user.as_deref(),
            host_home: home.as_deref(),
        },
    )
}

/// Merge every resource set that applies to the request into one policy
pub fn resolve(doc: &ConfigDocument, req: &ResolveRequest<'_>) -> Result<ResolvedPolicy> {
    let rel_segments = path_segments(req.workspace_rel_path)
        .ok_or_else(|| ConfigError::InvalidRulePath(req.workspace_rel_path.to_string()))?;

    // 1. Matching rules, in declaration order
    let mut matching: Vec<(usize, &ApplyRule)> = Vec::new();
    for (index, rule) in doc.apply.iter().enumerate() {
        let pattern =
            path_segments(&rule.path).ok_or_else(|| ConfigError::InvalidRulePath(rule.path.clone()))?;
        if rel_segments.starts_with(&pattern) {
            matching.push((index, rule));
        }
    }

    // 2. Union of resource-set names, first occurrence keeps its position
    let mut names: IndexSet<(&str, String)> = IndexSet::new();
    for (index, rule) in &matching {
        for name in &rule.resources {
            names.insert((name.as_str(), format!("apply rule #{} ({})", index + 1, rule.path)));
        }
    }
    for name in req.resource_sets {
        names.insert((name.as_str(), "--resources".to_string()));
    }

    // 3. Every name must exist
    let mut selected: IndexSet<&str> = IndexSet::new();
    for (name, referrer) in &names {
        if !doc.resources.contains_key(*name) {
            return Err(ConfigError::UnknownResourceSet {
                name: name.to_string(),
                referrer: referrer.clone(),
            });
        }
        selected.insert(name);
    }

    // 6. Writable paths, resolved first so mount targets can be checked against them
    let (workspace_writable, writable_paths) = resolve_writable(req)?;

    // 4. Merge
    let mut merger = Merger::new(req.workspace_root, &writable_paths);
    for name in &selected {
        merger.add(name, &doc.resources[*name], req)?;
    }

    // 5. Precedence: CLI > last matching rule > top level
    let image = req
        .image
        .map(str::to_string)
        .or_else(|| matching.iter().rev().find_map(|(_, r)| r.image.clone()))
        .or_else(|| doc.image.clone())
        .ok_or(ConfigError::MissingImage)?;
    let user = req
        .user
        .map(str::to_string)
        .or_else(|| matching.iter().rev().find_map(|(_, r)| r.user.clone()))
        .or_else(|| doc.user.clone())
        .unwrap_or_else(|| DEFAULT_USER.to_string());

    let network_baseline = doc
        .network
        .baseline
        .clone()
        .unwrap_or_else(|| DEFAULT_BASELINE_DOMAINS.iter().map(|d| d.to_string()).collect());

    Ok(ResolvedPolicy {
        workspace_root: req.workspace_root.to_path_buf(),
        workspace_rel_path: rel_segments.join("/"),
        resource_sets: selected.iter().map(|s| s.to_string()).collect(),
        image,
        home: container_home(&user),
        user,
        mounts: merger.mounts,
        domains: merger.domains,
        env: merger.env,
        ports: merger.ports.into_keys().collect(),
        calls: merger.calls,
        workspace_writable,
        writable_paths,
        network_baseline,
        network_enforcer: doc.network.enforcer.clone(),
    })
}

/// Whether an apply rule path covers a workspace-relative path
pub(crate) fn rule_applies(rule_path: &str, workspace_rel_path: &str) -> bool {
    match (path_segments(rule_path), path_segments(workspace_rel_path)) {
        (Some(pattern), Some(rel)) => rel.starts_with(&pattern),
        _ => false,
    }
}

/// Split a workspace-relative path into segments. `./`, `.` and the empty
/// string are the root. Returns `None` for absolute or escaping paths.
fn path_segments(path: &str) -> Option<Vec<&str>> {
    if path.starts_with('/') {
        return None;
    }
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            s => segments.push(s),
        }
    }
    Some(segments)
}

fn resolve_writable(req: &ResolveRequest<'_>) -> Result<(bool, Vec<PathBuf>)> {
    let mut workspace_writable = false;
    let mut paths = BTreeSet::new();

    for path in req.read_write {
        let absolute = absolute_from(req.working_dir, path);
        let canonical = absolute
            .canonicalize()
            .map_err(|_| ConfigError::RwPathNotFound(path.clone()))?;

        if !canonical.starts_with(req.workspace_root) {
            return Err(ConfigError::RwOutsideWorkspace {
                path: canonical,
                workspace: req.workspace_root.to_path_buf(),
            });
        }

        if canonical == req.workspace_root {
            workspace_writable = true;
        } else {
            paths.insert(canonical);
        }
    }

    Ok((workspace_writable, paths.into_iter().collect()))
}

/// Accumulates resource sets field by field
struct Merger {
    mounts: Vec<ResolvedMount>,
    /// Container target -> description of whoever claimed it
    targets: BTreeMap<PathBuf, String>,
    domains: BTreeSet<String>,
    env: BTreeSet<String>,
    ports: BTreeMap<PortForward, String>,
    calls: BTreeMap<String, CallSpec>,
}

impl Merger {
    fn new(workspace_root: &Path, writable_paths: &[PathBuf]) -> Self {
        let mut targets = BTreeMap::new();
        targets.insert(
            workspace_root.to_path_buf(),
            format!("workspace ({})", workspace_root.display()),
        );
        for path in writable_paths {
            targets.insert(path.clone(), format!("--rw ({})", path.display()));
        }
        Self {
            mounts: Vec::new(),
            targets,
            domains: BTreeSet::new(),
            env: BTreeSet::new(),
            ports: BTreeMap::new(),
            calls: BTreeMap::new(),
        }
    }

    fn add(
        &mut self,
        name: &str,
        set: &ResourceSet,
        req: &ResolveRequest<'_>,
    ) -> Result<()> {
        for decl in &set.mounts {
            self.add_mount(name, decl, req)?;
        }

        for domain in &set.domains {
            self.domains.insert(normalize_domain(domain, name)?);
        }

        self.env
            .extend(set.env.iter().filter(|v| !v.is_empty()).cloned());

        for port in &set.ports {
            self.add_port(name, port)?;
        }

        for call in &set.calls {
            self.add_call(call)?;
        }

        Ok(())
    }

    fn add_mount(&mut self, name: &str, decl: &MountDecl, req: &ResolveRequest<'_>) -> Result<()> {
        let source = expand_source(&decl.source, req)?;
        let target = match &decl.target {
            Some(target) if !target.starts_with('/') => {
                return Err(ConfigError::RelativeMountTarget(target.clone()))
            }
            Some(target) => lexical_normalize(Path::new(target)),
            None => source.clone(),
        };

        let mount = ResolvedMount {
            source,
            target,
            rw: decl.rw,
            origin: name.to_string(),
        };

        if let Some(first) = self.targets.get(&mount.target) {
            // Another set granting the identical mount is a no-op
            let duplicate = self
                .mounts
                .iter()
                .any(|m| m.target == mount.target && m.source == mount.source && m.rw == mount.rw);
            if duplicate {
                return Ok(());
            }
            return Err(ConfigError::MountConflict {
                target: mount.target.clone(),
                first: first.clone(),
                second: format!("{} ({})", name, mount.source.display()),
            });
        }

        self.targets.insert(
            mount.target.clone(),
            format!("{} ({})", name, mount.source.display()),
        );
        self.mounts.push(mount);
        Ok(())
    }

    fn add_port(&mut self, name: &str, port: &PortForward) -> Result<()> {
        let clash = self.ports.iter().find(|(existing, _)| {
            existing.host == port.host
                && existing.protocol == port.protocol
                && existing.host_addr == port.host_addr
                && existing.container != port.container
        });
        if let Some((existing, owner)) = clash {
            return Err(ConfigError::PortConflict {
                port: port.host,
                first: format!("{} ({})", owner, existing),
                second: format!("{} ({})", name, port),
            });
        }
        self.ports.entry(port.clone()).or_insert_with(|| name.to_string());
        Ok(())
    }

    fn add_call(&mut self, call: &CallSpec) -> Result<()> {
        if call.command.is_empty() || call.command[0].is_empty() {
            return Err(ConfigError::EmptyCallCommand(call.name.clone()));
        }
        crate::calls::compile_pattern(&call.args).map_err(|source| {
            ConfigError::InvalidCallPattern {
                name: call.name.clone(),
                source,
            }
        })?;

        match self.calls.get(&call.name) {
            Some(existing) if existing != call => Err(ConfigError::CallConflict(call.name.clone())),
            Some(_) => Ok(()),
            None => {
                self.calls.insert(call.name.clone(), call.clone());
                Ok(())
            }
        }
    }
}

fn expand_source(source: &str, req: &ResolveRequest<'_>) -> Result<PathBuf> {
    let path = if source == "~" || source.starts_with("~/") {
        let home = req
            .host_home
            .ok_or_else(|| ConfigError::EnvVarNotFound("HOME".to_string()))?;
        home.join(source.trim_start_matches('~').trim_start_matches('/'))
    } else {
        absolute_from(req.workspace_root, Path::new(source))
    };
    Ok(lexical_normalize(&path))
}

/// Remove `.` and resolve `..` components without touching the filesystem
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn normalize_domain(domain: &str, set: &str) -> Result<String> {
    let normalized = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    let invalid = normalized.is_empty()
        || normalized.contains("**")
        || normalized
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | ':' | '@'));
    if invalid {
        return Err(ConfigError::InvalidDomain {
            domain: domain.to_string(),
            set: set.to_string(),
        });
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::{ConfigFormat, ConfigLoader};
    use crate::config::template::TemplateContext;
    use std::collections::BTreeMap as Map;
    use std::fs;

    const FRONTEND: &str = r#"
image: base:1
resources:
  frontend:
    domains: [unpkg.com]
  backend:
    domains: [pypi.org]
apply:
  - path: frontend
    resources: [frontend]
  - path: backend
    resources: [backend]
"#;

    fn doc(yaml: &str) -> ConfigDocument {
        ConfigLoader::parse_str(yaml, ConfigFormat::Yaml, &TemplateContext::default()).unwrap()
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = tmp.path().canonicalize().unwrap();
            Self { _tmp: tmp, root }
        }

        fn request<'a>(&'a self, rel: &'a str) -> ResolveRequest<'a> {
            ResolveRequest {
                workspace_root: &self.root,
                working_dir: &self.root,
                workspace_rel_path: rel,
                read_write: &[],
                resource_sets: &[],
                image: None,
                user: None,
                host_home: Some(Path::new("/home/host")),
            }
        }
    }

    #[test]
    fn test_apply_rule_scenario() {
        let fx = Fixture::new();
        let doc = doc(FRONTEND);

        let policy = resolve(&doc, &fx.request("frontend")).unwrap();
        assert!(policy.domains.contains("unpkg.com"));
        assert!(!policy.domains.contains("pypi.org"));
        assert_eq!(policy.resource_sets, vec!["frontend"]);

        let policy = resolve(&doc, &fx.request("backend")).unwrap();
        assert!(!policy.domains.contains("unpkg.com"));
        assert!(policy.domains.contains("pypi.org"));
    }

    #[test]
    fn test_rule_matching_on_segments() {
        let fx = Fixture::new();
        let doc = doc(FRONTEND);

        let nested = resolve(&doc, &fx.request("frontend/src/components")).unwrap();
        assert!(nested.domains.contains("unpkg.com"));

        let sibling = resolve(&doc, &fx.request("frontend2")).unwrap();
        assert!(sibling.domains.is_empty());
        assert!(sibling.resource_sets.is_empty());
    }

    #[test]
    fn test_root_rule_matches_everything() {
        let fx = Fixture::new();
        let doc = doc(
            "image: x\nresources:\n  base:\n    domains: [github.com]\napply:\n  - path: ./\n    resources: [base]\n",
        );
        for rel in ["", "a", "a/b/c"] {
            let policy = resolve(&doc, &fx.request(rel)).unwrap();
            assert!(policy.domains.contains("github.com"), "no match for {:?}", rel);
        }
    }

    #[test]
    fn test_union_without_duplicates() {
        let fx = Fixture::new();
        let doc = doc(
            r#"
image: x
resources:
  a:
    domains: [x.com, Shared.com]
    env: [TOKEN]
  b:
    domains: [y.com, shared.com.]
    env: [TOKEN, OTHER]
apply:
  - path: ./
    resources: [a, b]
  - path: sub
    resources: [a]
"#,
        );
        let policy = resolve(&doc, &fx.request("sub")).unwrap();
        let domains: Vec<&str> = policy.domains.iter().map(String::as_str).collect();
        assert_eq!(domains, vec!["shared.com", "x.com", "y.com"]);
        assert_eq!(policy.env.len(), 2);
        assert_eq!(policy.resource_sets, vec!["a", "b"]);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let fx = Fixture::new();
        let doc = doc(
            r#"
image: x
resources:
  z:
    domains: [z.com, a.com]
    ports: ["9000", "8000"]
  a:
    domains: [m.com]
    calls:
      - name: b
        command: [echo]
      - name: a
        command: [echo]
apply:
  - path: ./
    resources: [z, a]
"#,
        );
        let first = resolve(&doc, &fx.request("")).unwrap();
        let second = resolve(&doc, &fx.request("")).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_unknown_resource_set() {
        let fx = Fixture::new();
        let doc = doc("image: x\napply:\n  - path: ./\n    resources: [missing]\n");
        let err = resolve(&doc, &fx.request("")).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownResourceSet { ref name, .. } if name == "missing"
        ));

        let doc = self::doc("image: x\n");
        let cli = vec!["ghost".to_string()];
        let mut req = fx.request("");
        req.resource_sets = &cli;
        let err = resolve(&doc, &req).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownResourceSet { ref referrer, .. } if referrer == "--resources"
        ));
    }

    #[test]
    fn test_cli_resource_sets_opt_in() {
        let fx = Fixture::new();
        let doc = doc(FRONTEND);
        let cli = vec!["backend".to_string()];
        let mut req = fx.request("frontend");
        req.resource_sets = &cli;
        let policy = resolve(&doc, &req).unwrap();
        assert!(policy.domains.contains("unpkg.com"));
        assert!(policy.domains.contains("pypi.org"));
        assert_eq!(policy.resource_sets, vec!["frontend", "backend"]);
    }

    #[test]
    fn test_image_precedence() {
        let fx = Fixture::new();
        let doc = doc(
            r#"
image: top:1
resources:
  a: {}
apply:
  - path: ./
    resources: [a]
    image: root:1
  - path: web
    resources: [a]
    image: web:1
  - path: web/app
    resources: [a]
"#,
        );

        assert_eq!(resolve(&doc, &fx.request("")).unwrap().image, "root:1");
        assert_eq!(resolve(&doc, &fx.request("web/app")).unwrap().image, "web:1");

        let mut req = fx.request("web/app");
        req.image = Some("cli:1");
        assert_eq!(resolve(&doc, &req).unwrap().image, "cli:1");

        let bare = self::doc("image: top:1\n");
        assert_eq!(resolve(&bare, &fx.request("web")).unwrap().image, "top:1");

        let none = self::doc("{}");
        assert!(matches!(
            resolve(&none, &fx.request("")),
            Err(ConfigError::MissingImage)
        ));
    }

    #[test]
    fn test_user_precedence() {
        let fx = Fixture::new();
        let doc = doc(
            "image: x\nuser: top\nresources:\n  a: {}\napply:\n  - path: web\n    resources: [a]\n    user: node\n",
        );
        let top = resolve(&doc, &fx.request("")).unwrap();
        assert_eq!(top.user, "top");
        assert_eq!(top.home, "/home/top");
        assert_eq!(resolve(&doc, &fx.request("web")).unwrap().user, "node");

        let mut req = fx.request("web");
        req.user = Some("root");
        let cli = resolve(&doc, &req).unwrap();
        assert_eq!(cli.user, "root");
        assert_eq!(cli.home, "/root");

        let bare = self::doc("image: x\n");
        assert_eq!(resolve(&bare, &fx.request("")).unwrap().user, DEFAULT_USER);
    }

    #[test]
    fn test_mount_conflict_detected() {
        let fx = Fixture::new();
        let doc = doc(
            r#"
image: x
resources:
  a:
    mounts:
      - source: /opt/one
        target: /data
  b:
    mounts:
      - source: /opt/two
        target: /data
apply:
  - path: ./
    resources: [a, b]
"#,
        );
        let err = resolve(&doc, &fx.request("")).unwrap_err();
        match err {
            ConfigError::MountConflict { target, first, second } => {
                assert_eq!(target, PathBuf::from("/data"));
                assert!(first.starts_with("a "));
                assert!(second.starts_with("b "));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_identical_mounts_collapse() {
        let fx = Fixture::new();
        let doc = doc(
            r#"
image: x
resources:
  a:
    mounts:
      - source: ~/.cache/pip
  b:
    mounts:
      - source: ~/.cache/pip
apply:
  - path: ./
    resources: [a, b]
"#,
        );
        let policy = resolve(&doc, &fx.request("")).unwrap();
        assert_eq!(policy.mounts.len(), 1);
        assert_eq!(policy.mounts[0].source, PathBuf::from("/home/host/.cache/pip"));
        assert_eq!(policy.mounts[0].target, policy.mounts[0].source);
        assert!(!policy.mounts[0].rw);
    }

    #[test]
    fn test_mount_onto_workspace_conflicts() {
        let fx = Fixture::new();
        let yaml = format!(
            "image: x\nresources:\n  a:\n    mounts:\n      - source: /opt\n        target: {}\napply:\n  - path: ./\n    resources: [a]\n",
            fx.root.display()
        );
        let doc = doc(&yaml);
        assert!(matches!(
            resolve(&doc, &fx.request("")),
            Err(ConfigError::MountConflict { .. })
        ));
    }

    #[test]
    fn test_relative_mount_source_and_target() {
        let fx = Fixture::new();
        let doc = doc(
            "image: x\nresources:\n  a:\n    mounts:\n      - source: ../shared/./cache\n        target: /cache\napply:\n  - path: ./\n    resources: [a]\n",
        );
        let policy = resolve(&doc, &fx.request("")).unwrap();
        let expected = fx.root.parent().unwrap().join("shared/cache");
        assert_eq!(policy.mounts[0].source, expected);

        let doc = self::doc(
            "image: x\nresources:\n  a:\n    mounts:\n      - source: /opt\n        target: cache\napply:\n  - path: ./\n    resources: [a]\n",
        );
        assert!(matches!(
            resolve(&doc, &fx.request("")),
            Err(ConfigError::RelativeMountTarget(_))
        ));
    }

    #[test]
    fn test_rw_paths_validated() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.root.join("web/dist")).unwrap();
        let doc = doc("image: x\n");

        let rw = vec![PathBuf::from("web/dist"), PathBuf::from("web")];
        let mut req = fx.request("");
        req.read_write = &rw;
        let policy = resolve(&doc, &req).unwrap();
        assert!(!policy.workspace_writable);
        assert_eq!(
            policy.writable_paths,
            vec![fx.root.join("web"), fx.root.join("web/dist")]
        );

        let missing = vec![PathBuf::from("nope")];
        req.read_write = &missing;
        assert!(matches!(
            resolve(&doc, &req),
            Err(ConfigError::RwPathNotFound(ref p)) if p == Path::new("nope")
        ));

        let outside = vec![fx.root.parent().unwrap().to_path_buf()];
        req.read_write = &outside;
        assert!(matches!(
            resolve(&doc, &req),
            Err(ConfigError::RwOutsideWorkspace { .. })
        ));

        let root = vec![PathBuf::from(".")];
        req.read_write = &root;
        let policy = resolve(&doc, &req).unwrap();
        assert!(policy.workspace_writable);
        assert!(policy.writable_paths.is_empty());
    }

    #[test]
    fn test_invalid_rule_paths() {
        let fx = Fixture::new();
        for path in ["/abs", "../up", "a/../b"] {
            let doc = doc(&format!("image: x\napply:\n  - path: \"{}\"\n", path));
            assert!(
                matches!(resolve(&doc, &fx.request("")), Err(ConfigError::InvalidRulePath(_))),
                "accepted {}",
                path
            );
        }
    }

    #[test]
    fn test_call_and_port_conflicts() {
        let fx = Fixture::new();
        let calls = doc(
            r#"
image: x
resources:
  a:
    calls:
      - name: deploy
        command: [make, deploy]
  b:
    calls:
      - name: deploy
        command: [rm, -rf]
apply:
  - path: ./
    resources: [a, b]
"#,
        );
        assert!(matches!(
            resolve(&calls, &fx.request("")),
            Err(ConfigError::CallConflict(ref n)) if n == "deploy"
        ));

        let ports = doc(
            "image: x\nresources:\n  a:\n    ports: [\"8080:80\"]\n  b:\n    ports: [\"8080:81\", \"8080:80\"]\napply:\n  - path: ./\n    resources: [a, b]\n",
        );
        assert!(matches!(
            resolve(&ports, &fx.request("")),
            Err(ConfigError::PortConflict { port: 8080, .. })
        ));
    }

    #[test]
    fn test_invalid_call_pattern_and_domain() {
        let fx = Fixture::new();
        let bad_pattern = doc(
            "image: x\nresources:\n  a:\n    calls:\n      - name: c\n        command: [echo]\n        args: \"(unclosed\"\napply:\n  - path: ./\n    resources: [a]\n",
        );
        assert!(matches!(
            resolve(&bad_pattern, &fx.request("")),
            Err(ConfigError::InvalidCallPattern { .. })
        ));

        let bad_domain = doc(
            "image: x\nresources:\n  a:\n    domains: [\"https://example.com\"]\napply:\n  - path: ./\n    resources: [a]\n",
        );
        assert!(matches!(
            resolve(&bad_domain, &fx.request("")),
            Err(ConfigError::InvalidDomain { .. })
        ));
    }

    #[test]
    fn test_network_baseline() {
        let fx = Fixture::new();
        let default = resolve(&doc("image: x\n"), &fx.request("")).unwrap();
        assert_eq!(default.network_baseline.len(), DEFAULT_BASELINE_DOMAINS.len());

        let custom = resolve(
            &doc("image: x\nnetwork:\n  baseline: [mirror.internal]\n"),
            &fx.request(""),
        )
        .unwrap();
        assert_eq!(custom.network_baseline, vec!["mirror.internal"]);
    }

    #[test]
    fn test_var_substitution_in_image() {
        let fx = Fixture::new();
        let vars = Map::from([("ENV".to_string(), "staging".to_string())]);
        let ctx = TemplateContext::from_host(vars).with_env(Map::new());
        let doc = ConfigLoader::parse_str(
            "image: \"registry/app:${{ vars.ENV }}\"\n",
            ConfigFormat::Yaml,
            &ctx,
        )
        .unwrap();
        assert_eq!(resolve(&doc, &fx.request("")).unwrap().image, "registry/app:staging");

        let empty = TemplateContext::from_host(Map::new()).with_env(Map::new());
        let err = ConfigLoader::parse_str(
            "image: \"registry/app:${{ vars.ENV }}\"\n",
            ConfigFormat::Yaml,
            &empty,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingTemplateKey { ref key, .. } if key == "ENV"
        ));
    }
}
