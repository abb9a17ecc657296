//! Common CLI argument structure for sbx subcommands

use crate::config::{parse_var, ExecSpec, SandboxOptions};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Arguments shared by every subcommand that resolves a sandbox
#[derive(Parser, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Working directory (default: current directory)
    #[arg(long, value_name = "PATH")]
    pub dir: Option<PathBuf>,

    /// Workspace root (default: the directory holding .sbx/)
    #[arg(long, value_name = "PATH")]
    pub workspace: Option<PathBuf>,

    /// Project configuration file (default: .sbx/config.yaml, searched upward)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Template variable available as ${{ vars.KEY }} (can be used multiple times)
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,

    /// Mount a workspace path read-write (can be used multiple times)
    #[arg(long = "rw", visible_alias = "allow-rw", value_name = "PATH")]
    pub rw_paths: Vec<PathBuf>,

    /// Activate resource sets in addition to the matching apply rules
    #[arg(long, value_name = "NAME", value_delimiter = ',')]
    pub resources: Vec<String>,

    /// Container image, overriding the configuration
    #[arg(long)]
    pub image: Option<String>,

    /// Container user, overriding the configuration
    #[arg(long)]
    pub user: Option<String>,

    /// Log the resolved policy and driver commands to stderr
    #[arg(long, short)]
    pub verbose: bool,

    /// Seconds between the graceful stop signal and the kill
    #[arg(long, value_name = "SECS")]
    pub stop_timeout: Option<u64>,

    /// Command to run (use -- to separate from sbx options). Without one an
    /// interactive shell is started.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl CommonArgs {
    /// Convert to sandbox options. `tty` applies to the command, or to the
    /// interactive shell when there is none.
    pub fn into_options(self, tty: bool) -> SandboxOptions {
        let exec = self
            .command
            .split_first()
            .map(|(command, args)| ExecSpec::new(command.as_str()).args(args.iter().cloned()).tty(tty));

        SandboxOptions {
            working_dir: self.dir,
            workspace_root: self.workspace,
            config_path: self.config,
            vars: self.vars.into_iter().collect(),
            read_write: self.rw_paths,
            resource_sets: self.resources,
            image: self.image,
            user: self.user,
            verbose: self.verbose,
            exec,
            tty,
            stop_timeout: self.stop_timeout.map(Duration::from_secs),
            ..Default::default()
        }
    }
}
