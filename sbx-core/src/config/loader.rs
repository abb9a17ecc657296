//! Configuration file loading, template evaluation and layer merging

use super::resolver::rule_applies;
use super::sandbox::SandboxConfig;
use super::schema::ConfigDocument;
use super::template::TemplateContext;
use crate::error::ConfigError;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// User the agent runs as when no layer names one
pub const DEFAULT_USER: &str = "agent";

type Result<T> = std::result::Result<T, ConfigError>;

/// Syntax of a configuration file, chosen by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Yaml,
        }
    }
}

/// A parsed but not yet evaluated configuration layer
#[derive(Debug, Clone)]
enum RawLayer {
    Yaml(serde_yaml::Value),
    Toml(toml::Value),
}

impl RawLayer {
    fn parse(contents: &str, format: ConfigFormat, path: &Path) -> Result<Self> {
        let parse_error = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };
        match format {
            ConfigFormat::Yaml => {
                let value: serde_yaml::Value =
                    serde_yaml::from_str(contents).map_err(|e| parse_error(e.to_string()))?;
                // An empty file parses as null
                let value = if value.is_null() {
                    serde_yaml::Value::Mapping(Default::default())
                } else {
                    value
                };
                Ok(RawLayer::Yaml(value))
            }
            ConfigFormat::Toml => Ok(RawLayer::Toml(
                toml::from_str(contents).map_err(|e| parse_error(e.to_string()))?,
            )),
        }
    }

    /// Top-level `user` scalar before evaluation
    fn raw_user(&self) -> Option<&str> {
        match self {
            RawLayer::Yaml(value) => value.get("user").and_then(|v| v.as_str()),
            RawLayer::Toml(value) => value.get("user").and_then(|v| v.as_str()),
        }
    }

    /// `(path, user)` of every apply rule that sets a user, in declaration order
    fn raw_rule_users(&self) -> Vec<(&str, &str)> {
        match self {
            RawLayer::Yaml(value) => value
                .get("apply")
                .and_then(|v| v.as_sequence())
                .map(|rules| {
                    rules
                        .iter()
                        .filter_map(|r| Some((r.get("path")?.as_str()?, r.get("user")?.as_str()?)))
                        .collect()
                })
                .unwrap_or_default(),
            RawLayer::Toml(value) => value
                .get("apply")
                .and_then(|v| v.as_array())
                .map(|rules| {
                    rules
                        .iter()
                        .filter_map(|r| Some((r.get("path")?.as_str()?, r.get("user")?.as_str()?)))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    fn evaluate(self, ctx: &TemplateContext, path: &Path) -> Result<ConfigDocument> {
        let parse_error = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };
        match self {
            RawLayer::Yaml(mut value) => {
                ctx.expand_yaml(&mut value)?;
                serde_yaml::from_value(value).map_err(|e| parse_error(e.to_string()))
            }
            RawLayer::Toml(mut value) => {
                ctx.expand_toml(&mut value)?;
                value.try_into().map_err(|e: toml::de::Error| parse_error(e.to_string()))
            }
        }
    }
}

/// The merged configuration and the files it came from
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub document: ConfigDocument,
    pub sources: Vec<PathBuf>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Find user config by checking environment and standard locations
    pub fn find_user_config() -> Option<PathBuf> {
        // 1. $SBX_CONFIG
        if let Ok(path) = env::var("SBX_CONFIG") {
            let p = PathBuf::from(path);
            if p.exists() {
                return Some(p);
            }
        }

        // 2. $XDG_CONFIG_HOME/sbx/config.yaml
        if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
            let p = PathBuf::from(xdg).join("sbx/config.yaml");
            if p.exists() {
                return Some(p);
            }
        }

        // 3. ~/.config/sbx/config.yaml
        if let Ok(home) = env::var("HOME") {
            let p = PathBuf::from(home).join(".config/sbx/config.yaml");
            if p.exists() {
                return Some(p);
            }
        }

        None
    }

    /// Load the user and project layers for an invocation
    /// Priority: user < project
    pub fn load(config: &SandboxConfig) -> Result<LoadedConfig> {
        let mut paths = Vec::new();
        if let Some(user_path) = Self::find_user_config() {
            paths.push(user_path);
        }
        if config.config_path.is_file() {
            paths.push(config.config_path.clone());
        } else {
            tracing::debug!(
                "Project config not found at {:?}, using user layer only",
                config.config_path
            );
        }

        let ctx = TemplateContext::from_host(config.vars.clone());
        Self::load_layers(&paths, config, ctx)
    }

    /// Load explicit layers, lowest priority first
    pub fn load_layers(
        paths: &[PathBuf],
        config: &SandboxConfig,
        mut ctx: TemplateContext,
    ) -> Result<LoadedConfig> {
        let mut layers = Vec::with_capacity(paths.len());
        for path in paths {
            tracing::debug!("Loading config layer from {:?}", path);
            let contents = fs::read_to_string(path).map_err(|source| ConfigError::Load {
                path: path.clone(),
                source,
            })?;
            layers.push(RawLayer::parse(&contents, ConfigFormat::for_path(path), path)?);
        }

        // conf.user is computed from the raw layers, so it is expanded without
        // the conf scope in place. Same precedence as the resolver: CLI, then
        // the last matching apply rule, then the top level.
        let rel_path = config.workspace_rel_path()?;
        let rule_user = layers
            .iter()
            .rev()
            .flat_map(|layer| layer.raw_rule_users().into_iter().rev())
            .find(|(path, _)| rule_applies(path, &rel_path))
            .map(|(_, user)| user);
        let user = match (&config.user, rule_user) {
            (Some(user), _) => user.clone(),
            (None, Some(raw)) => ctx.expand(raw)?,
            (None, None) => match layers.iter().rev().find_map(RawLayer::raw_user) {
                Some(raw) => ctx.expand(raw)?,
                None => DEFAULT_USER.to_string(),
            },
        };
        let home = container_home(&user);
        ctx.set_conf("user", user)
            .set_conf("home", home)
            .set_conf("uid", config.host.uid.to_string())
            .set_conf("gid", config.host.gid.to_string())
            .set_conf("workspace", config.workspace_root.display().to_string())
            .set_conf("workdir", config.working_dir.display().to_string());

        let document = layers
            .into_iter()
            .zip(paths)
            .map(|(layer, path)| layer.evaluate(&ctx, path))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .reduce(Self::merge)
            .unwrap_or_default();

        Ok(LoadedConfig {
            document,
            sources: paths.to_vec(),
        })
    }

    /// Parse and evaluate a single document held in memory
    pub fn parse_str(
        contents: &str,
        format: ConfigFormat,
        ctx: &TemplateContext,
    ) -> Result<ConfigDocument> {
        let path = Path::new("<inline>");
        RawLayer::parse(contents, format, path)?.evaluate(ctx, path)
    }

    /// Merge a higher-priority layer on top of a base layer
    /// Resource sets are replaced by name, apply rules are appended and
    /// scalars override when set
    pub fn merge(mut base: ConfigDocument, override_cfg: ConfigDocument) -> ConfigDocument {
        if override_cfg.image.is_some() {
            base.image = override_cfg.image;
        }
        if override_cfg.user.is_some() {
            base.user = override_cfg.user;
        }
        if override_cfg.network.baseline.is_some() {
            base.network.baseline = override_cfg.network.baseline;
        }
        if !override_cfg.network.enforcer.is_empty() {
            base.network.enforcer = override_cfg.network.enforcer;
        }

        for (name, set) in override_cfg.resources {
            base.resources.insert(name, set);
        }

        base.apply.extend(override_cfg.apply);

        base
    }
}

/// Home directory of `user` inside the container
pub fn container_home(user: &str) -> String {
    if user == "root" {
        "/root".to_string()
    } else {
        format!("/home/{}", user)
    }
}
