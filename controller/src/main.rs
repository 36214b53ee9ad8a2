use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use nimbus_core::{
    config::Config,
    controller::{AdminCommand, Controller},
    kernel::{KernelRegistry, NoopKernel},
    transport::InMemoryBus,
    worker::WorkerRuntime,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::{mpsc, oneshot},
};
use tracing::{info, warn};

mod init;

#[derive(Parser, Debug)]
#[command(name = "nimbus-controller", about = "Nimbus simulation controller")]
pub struct Cli {
    #[command(flatten)]
    pub options: Config,

    /// Number of in-process workers to emulate on the in-memory bus.
    /// Defaults to the minimum worker count.
    #[arg(long)]
    pub emulate_workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init::tracing();
    let args = Cli::parse();

    let bus = InMemoryBus::new();

    // The bundled transport is in-memory, so workers are emulated in this
    // process (one runtime per worker, all sharing the bus).
    let emulated = args.emulate_workers.unwrap_or(args.options.min_workers);
    let mut worker_handles = Vec::new();
    for index in 0..emulated {
        let kernels = KernelRegistry::new().with(Arc::new(NoopKernel));
        let worker = WorkerRuntime::new(
            index as u32 + 1,
            args.options.clone(),
            bus.clone(),
            kernels,
        );
        worker_handles.push(tokio::spawn(worker.main_loop()));
    }

    let (admin_tx, admin_rx) = mpsc::channel(16);
    tokio::spawn(admin_interface(args.options.port, admin_tx));

    info!(port = args.options.port, workers = emulated, "controller starting");
    let controller = Controller::new(args.options, bus);
    let status = controller.run(admin_rx).await?;

    for handle in worker_handles {
        handle.abort();
    }
    std::process::exit(status);
}

/// The operator interface: a line protocol on the listening port.
/// Commands: `worker-list`, `load-map <file>`, `terminate <exit-status>`.
async fn admin_interface(port: u16, admin: mpsc::Sender<AdminCommand>) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            warn!(port, %err, "admin interface unavailable");
            return;
        }
    };
    loop {
        let Ok((socket, peer)) = listener.accept().await else {
            continue;
        };
        info!(%peer, "admin connection");
        let admin = admin.clone();
        tokio::spawn(async move {
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let reply = handle_admin_line(line.trim(), &admin).await;
                if write.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
    }
}

async fn handle_admin_line(line: &str, admin: &mpsc::Sender<AdminCommand>) -> String {
    let mut fields = line.split_whitespace();
    match fields.next() {
        Some("worker-list") => {
            let (reply_tx, reply_rx) = oneshot::channel();
            if admin.send(AdminCommand::WorkerList(reply_tx)).await.is_err() {
                return "error: controller stopped\n".into();
            }
            match reply_rx.await {
                Ok(workers) => {
                    let mut reply = String::new();
                    for worker in workers {
                        reply.push_str(&format!(
                            "{} {}:{} alive={} queue={}\n",
                            worker.id, worker.address, worker.port, worker.alive, worker.queue_depth
                        ));
                    }
                    if reply.is_empty() {
                        reply.push_str("no workers\n");
                    }
                    reply
                }
                Err(_) => "error: controller stopped\n".into(),
            }
        }
        Some("load-map") => match fields.next() {
            Some(path) => {
                let _ = admin.send(AdminCommand::LoadMap(path.into())).await;
                "ok\n".into()
            }
            None => "usage: load-map <file>\n".into(),
        },
        Some("terminate") => {
            let status = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let _ = admin.send(AdminCommand::Terminate(status)).await;
            "ok\n".into()
        }
        Some(other) => format!("unknown command {other:?}\n"),
        None => String::new(),
    }
}
