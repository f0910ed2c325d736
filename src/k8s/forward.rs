//! Forward Supervisor: maintains N local⇄remote port tunnels
//! bound to a single pod.
//!
//! Each tunnel's accept loop binds a local `TcpListener`, bridges accepted
//! connections to `kube::Api<Pod>::portforward`'s stream via
//! `copy_bidirectional`, and reports lifecycle on an mpsc channel.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// One tunnel's lifecycle, reported on the Forward Supervisor's shared
/// error channel. `Ready` carries the bound local address.
#[derive(Debug, Clone)]
pub enum ForwardEvent {
    Ready { local: u16, addr: String },
    Connected { local: u16, peer: String },
    Closed { local: u16 },
    Error { local: u16, message: String },
}

struct PendingTunnel {
    local: u16,
    remote: u16,
}

struct RunningTunnel {
    stop: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

/// Supervises a set of port-forward tunnels against a single pod.
pub struct ForwardSupervisor {
    client: kube::Client,
    namespace: String,
    bind_address: String,
    pending: Vec<PendingTunnel>,
    running: HashMap<u16, RunningTunnel>,
    events_tx: mpsc::Sender<ForwardEvent>,
    pub events_rx: Option<mpsc::Receiver<ForwardEvent>>,
}

impl ForwardSupervisor {
    pub fn new(client: kube::Client, namespace: impl Into<String>, bind_address: impl Into<String>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            client,
            namespace: namespace.into(),
            bind_address: bind_address.into(),
            pending: Vec::new(),
            running: HashMap::new(),
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Registers an intent. Valid only before `start`; rejects duplicate
    /// local ports.
    pub fn add(&mut self, local: u16, remote: u16) -> Result<()> {
        if self.pending.iter().any(|t| t.local == local) || self.running.contains_key(&local) {
            return Err(anyhow!("local port {local} is already registered"));
        }
        self.pending.push(PendingTunnel { local, remote });
        Ok(())
    }

    /// Opens all registered tunnels concurrently against `pod`. Each runs
    /// independently; a setup failure (bind or portforward) on one is
    /// reported on the shared channel and does not prevent the others from
    /// starting.
    pub async fn start(&mut self, pod: &str) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for tunnel in pending {
            if let Err(e) = self
                .spawn_tunnel(pod.to_string(), tunnel.local, tunnel.remote)
                .await
            {
                warn!(local = tunnel.local, error = %e, "tunnel setup failed");
                let _ = self.events_tx.try_send(ForwardEvent::Error {
                    local: tunnel.local,
                    message: e.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn spawn_tunnel(&mut self, pod: String, local: u16, remote: u16) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut pf = api
            .portforward(&pod, &[remote])
            .await
            .map_err(|e| anyhow!("portforward {local}:{remote} failed: {e}"))?;

        let listener = TcpListener::bind((self.bind_address.as_str(), local)).await?;
        let actual = listener.local_addr()?;

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let events_tx = self.events_tx.clone();

        // `try_send`, not `.send(...).await`, everywhere on this channel: a
        // burst of events filling the bounded buffer must never block a
        // tunnel's accept loop waiting for the controller to drain it.
        let _ = events_tx.try_send(ForwardEvent::Ready {
            local,
            addr: actual.to_string(),
        });

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        let _ = events_tx.try_send(ForwardEvent::Closed { local });
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((mut inbound, peer)) => {
                                let _ = events_tx.try_send(ForwardEvent::Connected {
                                    local,
                                    peer: peer.to_string(),
                                });
                                match pf.take_stream(remote) {
                                    Some(mut stream) => {
                                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut stream).await;
                                    }
                                    None => {
                                        let _ = events_tx.try_send(ForwardEvent::Error {
                                            local,
                                            message: "port-forward stream unavailable".to_string(),
                                        });
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(local, error = %e, "forward tunnel accept failed");
                                let _ = events_tx.try_send(ForwardEvent::Error {
                                    local,
                                    message: e.to_string(),
                                });
                                break;
                            }
                        }
                    }
                }
            }
        });

        self.running.insert(local, RunningTunnel { stop: stop_tx, handle });
        Ok(())
    }

    /// Closes all tunnels. Idempotent; safe to call on a partial start.
    pub async fn stop(&mut self) {
        for (_, tunnel) in self.running.drain() {
            let _ = tunnel.stop.send(());
            let _ = tunnel.handle.await;
        }
    }
}
