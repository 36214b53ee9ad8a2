//! The scheduler core loop.
//!
//! One task owns the [`Engine`] for the lifetime of the run. Per iteration
//! it drains a bounded batch of upward commands (bounded fairness between
//! chatty and quiet workers), runs the binder over the ready set, delivers
//! the outbox, and sweeps worker liveness on the handshake interval. Admin
//! commands from the user interface arrive on their own queue.

use std::path::PathBuf;

use anyhow::Result;
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::{
    command::ControllerCommand,
    config::Config,
    error::NimbusError,
    ids::ExitStatus,
    retry::RetryStrategy,
    serializer::Serializer,
    transport::{controller_endpoint, worker_endpoint, BusEndpoint, CommandBus},
};

use super::{Engine, Outbox, WorkerInfo};

/// Operator commands from the admin interface.
#[derive(Debug)]
pub enum AdminCommand {
    WorkerList(oneshot::Sender<Vec<WorkerInfo>>),
    LoadMap(PathBuf),
    Terminate(ExitStatus),
}

/// Drives an [`Engine`] over a command bus.
pub struct Controller<B: CommandBus + Clone> {
    engine: Engine,
    bus: B,
    serializer: Serializer,
}

impl<B: CommandBus + Clone> Controller<B> {
    pub fn new(config: Config, bus: B) -> Self {
        let serializer = Serializer::from(&config);
        Self {
            engine: Engine::new(config),
            bus,
            serializer,
        }
    }

    /// Run until the application terminates (or a fatal invariant violation
    /// forces a nonzero exit). Returns the exit status to propagate.
    pub async fn run(mut self, mut admin: mpsc::Receiver<AdminCommand>) -> Result<ExitStatus> {
        let inbox = self.bus.endpoint(&controller_endpoint()).await?;
        let mut commands = inbox.stream().await?;
        let mut handshake_timer = tokio::time::interval(std::time::Duration::from_millis(
            self.engine.config.handshake_interval_ms,
        ));
        handshake_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; swallow it so workers get a full
        // interval to register.
        handshake_timer.tick().await;

        let batch = self.engine.config.command_batch_size.max(1);
        loop {
            let mut out: Outbox = Vec::new();
            let result = tokio::select! {
                frame = commands.next() => {
                    let Some(frame) = frame else { break };
                    let mut result =
                        self.apply_frame(&frame, &mut out);
                    // Drain whatever else is already queued, up to the batch
                    // bound, without blocking.
                    let mut drained = 1;
                    while result.is_ok() && drained < batch {
                        match commands.next().now_or_never() {
                            Some(Some(frame)) => {
                                result = self.apply_frame(&frame, &mut out);
                                drained += 1;
                            }
                            _ => break,
                        }
                    }
                    result
                }
                Some(admin_command) = admin.recv() => {
                    self.apply_admin(admin_command)
                }
                _ = handshake_timer.tick() => {
                    self.engine.tick_handshakes(&mut out)
                }
            };

            if let Err(err) = result {
                error!(%err, "fatal scheduler error; terminating");
                self.engine.broadcast_terminate(&mut out);
                self.deliver(out).await?;
                return Ok(1);
            }

            if let Err(err) = self.engine.assign_ready_jobs(&mut out) {
                error!(%err, "fatal binder error; terminating");
                self.engine.broadcast_terminate(&mut out);
                self.deliver(out).await?;
                return Ok(1);
            }

            if self.engine.drained() {
                self.engine.broadcast_terminate(&mut out);
                self.deliver(out).await?;
                let status = self.engine.exit_status().unwrap_or(0);
                info!(status, "termination complete");
                return Ok(status);
            }
            self.deliver(out).await?;
        }
        Ok(self.engine.exit_status().unwrap_or(0))
    }

    fn apply_frame(&mut self, frame: &[u8], out: &mut Outbox) -> crate::Result<()> {
        let command = match ControllerCommand::from_frame(frame, self.serializer) {
            Ok(command) => command,
            Err(err) => {
                warn!(%err, "dropping undecodable frame");
                return Ok(());
            }
        };
        self.engine.process_command(None, command, out)
    }

    fn apply_admin(&mut self, command: AdminCommand) -> crate::Result<()> {
        match command {
            AdminCommand::WorkerList(reply) => {
                let _ = reply.send(self.engine.workers().cloned().collect());
                Ok(())
            }
            AdminCommand::LoadMap(path) => {
                match std::fs::read_to_string(&path) {
                    Ok(text) => {
                        let loaded = self.engine.load_cluster_map(&text);
                        info!(?path, loaded, "cluster map loaded");
                    }
                    Err(err) => warn!(?path, %err, "could not read cluster map"),
                }
                Ok(())
            }
            AdminCommand::Terminate(status) => {
                info!(status, "operator requested termination");
                self.engine.request_terminate(status);
                Ok(())
            }
        }
    }

    /// Deliver the outbox, retrying each send through transient
    /// backpressure.
    async fn deliver(&self, out: Outbox) -> Result<()> {
        for (worker, command) in out {
            let endpoint = self.bus.endpoint(&worker_endpoint(worker)).await?;
            let endpoint = &endpoint;
            let frame = command.to_frame(self.serializer)?;
            let sent = RetryStrategy::default()
                .retry(|| {
                    let frame = frame.clone();
                    async move { endpoint.try_publish(frame) }
                })
                .await;
            if let Err(err) = sent {
                // Persistent backpressure counts as a transport failure.
                warn!(worker, %err, "send failed after retries");
                if matches!(err, NimbusError::Backpressure { .. }) {
                    continue;
                }
            }
        }
        Ok(())
    }
}
