use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use nimbus_core::{config::Config, transport::InMemoryBus, worker::WorkerRuntime};
use tokio::sync::mpsc;
use tracing::info;

mod init;
mod kernels;

#[derive(Parser, Debug)]
#[command(name = "nimbus-worker", about = "Nimbus simulation worker")]
pub struct Cli {
    #[command(flatten)]
    pub options: Config,

    /// This worker's id, unique within the cluster.
    #[arg(long, default_value_t = 1)]
    pub worker_id: u32,

    /// Co-host a controller in this process. The bundled transport is
    /// in-memory, so this is the single-process way to run a live cluster.
    #[arg(long, default_value_t = false)]
    pub standalone: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init::tracing();
    let args = Cli::parse();

    let bus = InMemoryBus::new();
    if args.standalone {
        use nimbus_core::controller::Controller;
        let (_admin_tx, admin_rx) = mpsc::channel(16);
        let controller = Controller::new(args.options.clone(), bus.clone());
        tokio::spawn(controller.run(admin_rx));
        info!("standalone controller co-hosted");
    }

    let worker = WorkerRuntime::new(args.worker_id, args.options, bus, kernels::registry());
    let status = worker.main_loop().await?;
    std::process::exit(status);
}
