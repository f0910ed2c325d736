use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;

use devup::cli::{self, Cli, Command, DownArgs, ExecArgs, UpArgs};
use devup::error::DevError;
use devup::k8s::{self, resolve_namespace, K8sClient};
use devup::manifest::{ManifestLoader, TargetWorkload};
use devup::{controller, logging, runtime};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_home = runtime::config_home();
    let runtime_config = match runtime::load_runtime_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load runtime config: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init_logging(&runtime_config.logging, &config_home, cli.verbosity) {
        eprintln!("failed to initialize logging: {e:#}");
    }

    let code = match cli.command {
        Command::Up(args) => run_up(args, config_home, runtime_config).await,
        Command::Down(args) => run_down(args, config_home, runtime_config).await,
        Command::Exec(args) => run_exec(args).await,
    };

    std::process::exit(code);
}

async fn run_up(args: UpArgs, config_home: PathBuf, runtime_config: runtime::RuntimeConfig) -> i32 {
    let loader = ManifestLoader::new(args.file.as_deref());
    let (dev, manifest_path) = match loader.load_with_path() {
        Ok(v) => v,
        Err(e) => {
            error!("{e:#}");
            return 1;
        }
    };

    let namespace = resolve_namespace(args.namespace.as_deref(), dev.namespace.as_deref());

    let target = TargetWorkload {
        namespace,
        name: dev.name.clone(),
        container: dev.container.clone(),
    };

    let client = match K8sClient::new().await {
        Ok(c) => c.client,
        Err(e) => {
            error!("{e:#}");
            return 1;
        }
    };

    let mut controller = controller::ActivationController::new(
        client,
        target,
        dev,
        manifest_path.to_string_lossy().to_string(),
        config_home,
        runtime_config,
    );

    let cancel = controller.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    match controller.run().await {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            cli::exit_code_for(&e)
        }
    }
}

async fn run_down(args: DownArgs, config_home: PathBuf, runtime_config: runtime::RuntimeConfig) -> i32 {
    let loader = ManifestLoader::new(args.file.as_deref());
    let (dev, manifest_path) = match loader.load_with_path() {
        Ok(v) => v,
        Err(e) => {
            error!("{e:#}");
            return 1;
        }
    };

    let namespace = resolve_namespace(args.namespace.as_deref(), dev.namespace.as_deref());

    let target = TargetWorkload {
        namespace,
        name: dev.name.clone(),
        container: dev.container.clone(),
    };

    let client = match K8sClient::new().await {
        Ok(c) => c.client,
        Err(e) => {
            error!("{e:#}");
            return 1;
        }
    };

    let mut controller = controller::ActivationController::new(
        client,
        target,
        dev,
        manifest_path.to_string_lossy().to_string(),
        config_home,
        runtime_config,
    );

    match controller.down(args.volumes, args.force).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{e:#}");
            1
        }
    }
}

/// The hidden re-exec target: the Activation Controller forks this as a
/// child process once the environment is up, so the interactive session can
/// be killed independently of the supervisor tree driving it.
async fn run_exec(args: ExecArgs) -> i32 {
    let loader = ManifestLoader::new(args.file.as_deref());
    let dev = match loader.load() {
        Ok(v) => v,
        Err(e) => {
            error!("{e:#}");
            return 1;
        }
    };

    let namespace = resolve_namespace(args.namespace.as_deref(), dev.namespace.as_deref());

    let client = match K8sClient::new().await {
        Ok(c) => c.client,
        Err(e) => {
            error!("{e:#}");
            return 1;
        }
    };

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_for_signal.cancel();
        }
    });

    let container = dev.container.as_deref();
    let cmd = if args.cmd.is_empty() { dev.command.clone() } else { args.cmd };

    match k8s::session::run_session(client, &namespace, &args.pod, container, cmd, &cancel).await {
        Ok(k8s::session::SessionOutcome::Clean) => 0,
        Ok(k8s::session::SessionOutcome::Cancelled) => 0,
        Ok(k8s::session::SessionOutcome::CommandFailed(msg)) => {
            error!("{msg}");
            map_exit(&DevError::CommandFailed(msg))
        }
        Err(e) => {
            error!("{e:#}");
            1
        }
    }
}

fn map_exit(err: &DevError) -> i32 {
    cli::exit_code_for(err)
}
