//! Session Runner: runs the interactive remote command over the
//! exec channel, wiring stdio through to the user's terminal.
//!
//! Raw-mode terminal handling via a `Drop`-guarded `RawGuard`, `TerminalSize`
//! updates on SIGWINCH, a blocking stdin-reader thread feeding an async
//! writer task, and `ReaderStream` pumps for stdout/stderr.

use anyhow::{anyhow, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{AttachParams, Api, TerminalSize};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Outcome of a completed interactive session: a clean exit, a failed
/// remote command, or external cancellation.
#[derive(Debug)]
pub enum SessionOutcome {
    Clean,
    CommandFailed(String),
    Cancelled,
}

struct RawGuard;

impl Drop for RawGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

/// Runs `cmd` inside `container` of `pod`, with stdio wired through to the
/// current process's terminal. No retries: retry policy lives in the
/// Activation Controller.
pub async fn run_session(
    client: kube::Client,
    namespace: &str,
    pod: &str,
    container: Option<&str>,
    cmd: Vec<String>,
    cancel: &CancellationToken,
) -> Result<SessionOutcome> {
    let api: Api<Pod> = Api::namespaced(client, namespace);

    let mut ap = AttachParams::interactive_tty().stderr(false);
    if let Some(c) = container {
        ap = ap.container(c);
    }

    let mut attached = api
        .exec(pod, cmd, &ap)
        .await
        .map_err(|e| anyhow!("failed to start exec session: {e}"))?;

    let _ = crossterm::terminal::enable_raw_mode();
    let _raw_guard = RawGuard;

    let mut resize_task = None;
    if let Some(mut size_tx) = attached.terminal_size() {
        let (w, h) = crossterm::terminal::size().unwrap_or((80, 24));
        let _ = size_tx.send(TerminalSize { height: h, width: w }).await;

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            if let Ok(mut sig) = signal(SignalKind::window_change()) {
                resize_task = Some(tokio::spawn(async move {
                    while sig.recv().await.is_some() {
                        if let Ok((w, h)) = crossterm::terminal::size() {
                            let _ = size_tx.send(TerminalSize { height: h, width: w }).await;
                        }
                    }
                }));
            }
        }
    }

    let stdin_task = attached.stdin().map(|mut writer| {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(32);
        std::thread::spawn(move || {
            use std::io::Read;
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 1024];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => {
                        let _ = tx.blocking_send(Vec::new());
                        break;
                    }
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        let _ = tx.blocking_send(Vec::new());
                        break;
                    }
                }
            }
        });
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if chunk.is_empty() || writer.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        })
    });

    let stdout_task = attached.stdout().map(|reader| {
        let mut stream = tokio_util::io::ReaderStream::new(reader);
        tokio::spawn(async move {
            while let Some(Ok(bytes)) = stream.next().await {
                print!("{}", String::from_utf8_lossy(&bytes));
            }
        })
    });

    let outcome = tokio::select! {
        status = attached.join() => {
            match status {
                Ok(()) => SessionOutcome::Clean,
                Err(e) => SessionOutcome::CommandFailed(e.to_string()),
            }
        }
        _ = cancel.cancelled() => SessionOutcome::Cancelled,
    };

    if let Some(t) = stdin_task {
        t.abort();
    }
    if let Some(t) = stdout_task {
        let _ = t.await;
    }
    if let Some(t) = resize_task {
        t.abort();
    }

    Ok(outcome)
}
