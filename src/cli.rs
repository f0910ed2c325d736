//! CLI surface: `up`, `down`, and the hidden `exec` re-exec
//! target, plus the top-level argument parsing and exit-code mapping.

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "devup", version, about = "Turn a Kubernetes workload into a live development environment")]
pub struct Cli {
    /// Increase log verbosity; repeatable (-v info, -vv debug, -vvv trace).
    #[arg(long = "verbose", action = ArgAction::Count, global = true)]
    pub verbosity: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Activate dev mode for the workload described by the manifest.
    Up(UpArgs),
    /// Deactivate dev mode and restore the workload's original spec.
    Down(DownArgs),
    /// Run the interactive session against an already-located pod.
    #[command(hide = true)]
    Exec(ExecArgs),
}

#[derive(clap::Args)]
pub struct UpArgs {
    /// Path to the manifest file; defaults to ./devup.yml or ./devup.yaml.
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,

    /// Namespace to operate in; overrides the manifest and kube context.
    #[arg(short = 'n', long = "namespace")]
    pub namespace: Option<String>,
}

#[derive(clap::Args)]
pub struct DownArgs {
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,

    #[arg(short = 'n', long = "namespace")]
    pub namespace: Option<String>,

    /// Also delete the persistent volumes owned by this environment.
    #[arg(short = 'v', long = "volumes")]
    pub volumes: bool,

    /// Best-effort: don't stop at the first failed cleanup step.
    #[arg(long)]
    pub force: bool,
}

#[derive(clap::Args)]
pub struct ExecArgs {
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,

    #[arg(short = 'n', long = "namespace")]
    pub namespace: Option<String>,

    /// The pod located by the `up` activation loop.
    #[arg(short = 'p', long = "pod")]
    pub pod: String,

    /// Command and arguments to run interactively, after `--`.
    #[arg(last = true)]
    pub cmd: Vec<String>,
}

/// Exit codes: 0 clean exit, 1 generic fatal
/// error, 2 `AlreadyRunning` — distinguishable so scripts can tell "someone
/// else has this" from "it broke".
pub fn exit_code_for(err: &crate::error::DevError) -> i32 {
    match err {
        crate::error::DevError::AlreadyRunning(_) => 2,
        crate::error::DevError::Cancelled => 0,
        _ => 1,
    }
}
