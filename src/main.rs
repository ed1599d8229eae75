use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use broadcast_stack::app::coordinator::{Coordinator, NoCoordinator, TcpCoordinator};
use broadcast_stack::app::hosts::read_hosts_file;
use broadcast_stack::app::output::OutputLog;
use broadcast_stack::app::run_config::RunConfig;
use broadcast_stack::broadcast::{causal_stack, fifo_stack, Broadcaster};
use broadcast_stack::config::LinkConfig;
use broadcast_stack::link::host::{HostId, HostResolver};
use broadcast_stack::link::perfect_link::PerfectLink;
use broadcast_stack::payload::Payload;
use clap::{Parser, ValueEnum};
use clap_derive::{Parser, ValueEnum};
use tokio::select;
use tracing::{error, info, Level};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Fifo,
    Causal,
}

#[derive(Parser)]
struct Args {
    #[clap(long)]
    id: u32,

    #[clap(long)]
    hosts: PathBuf,

    #[clap(long)]
    output: PathBuf,

    #[clap(long)]
    config: PathBuf,

    #[clap(long, value_enum, default_value_t = Mode::Fifo)]
    mode: Mode,

    #[clap(long)]
    barrier: Option<SocketAddr>,

    #[clap(long)]
    signal: Option<SocketAddr>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let myself = HostId::new(args.id);
    let resolver = Arc::new(HostResolver::new(myself, read_hosts_file(&args.hosts).await?)?);
    let run_config = RunConfig::read_file(&args.config).await?;
    run_config.validate(resolver.num_hosts())?;

    let coordinator: Box<dyn Coordinator> = match (args.barrier, args.signal) {
        (None, None) => Box::new(NoCoordinator),
        (barrier, signal) => Box::new(TcpCoordinator::new(myself, barrier, signal)),
    };

    let (link, deliveries) = PerfectLink::bind(Arc::new(LinkConfig::default()), resolver).await?;
    let (stack, events) = match args.mode {
        Mode::Fifo => {
            let (fifo, events) = fifo_stack(link, deliveries);
            (Arc::new(fifo) as Arc<dyn Broadcaster>, events)
        }
        Mode::Causal => {
            let (causal, events) = causal_stack(link, deliveries, run_config.dependencies_of(myself));
            (Arc::new(causal) as Arc<dyn Broadcaster>, events)
        }
    };
    info!("process {} started in {:?} mode", myself, args.mode);

    let output = Arc::new(OutputLog::new(args.output));
    let output_task = tokio::spawn(output.clone().consume(events));

    let run = async {
        coordinator.wait_on_barrier().await?;
        for _ in 0..run_config.num_messages {
            stack.broadcast(Payload::raw()).await?;
        }
        info!("broadcast {} messages", run_config.num_messages);
        coordinator.finished_broadcasting().await?;
        std::future::pending::<anyhow::Result<()>>().await
    };

    let result = select! {
        result = run => result,
        result = shutdown_signal() => {
            info!("shutting down");
            result
        }
        failure = stack.failed() => Err(anyhow!("link failed: {}", failure)),
    };

    // stopping drops the stack's event senders, closing the output's channel
    stack.stop().await;
    output.drain_and_flush(output_task, Duration::from_secs(1)).await?;

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
