use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use celestial::netem::ebpf::EbpfBackend;
use celestial::netem::tc::TcBackend;
use celestial::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Traffic-control hierarchy and packet-filter chains.
    Tc,
    /// eBPF egress program with earliest-departure-time pacing.
    Ebpf,
}

/// Per-host emulation orchestration engine.
#[derive(Debug, Parser)]
#[command(name = "celestial", version)]
struct Cli {
    /// Port the control RPC binds to.
    #[arg(long, default_value_t = 1969)]
    port: u16,

    /// Port the DNS service binds to.
    #[arg(long, default_value_t = 53)]
    dns_service_port: u16,

    /// Port the info server binds to.
    #[arg(long, default_value_t = 80)]
    info_server_port: u16,

    /// Name of the main network interface.
    #[arg(long, default_value = "ens4")]
    network_interface: String,

    /// Network emulation backend.
    #[arg(long, value_enum, default_value_t = Backend::Tc)]
    backend: Backend,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(if cli.debug { "debug" } else { "info" })
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .log_internal_errors(true)
                .with_target(false)
                .flatten_event(true)
                .with_span_list(false),
        )
        .init();

    let config = EngineConfig {
        port: cli.port,
        dns_port: cli.dns_service_port,
        info_port: cli.info_server_port,
        host_interface: cli.network_interface.clone(),
    };

    let result = match cli.backend {
        Backend::Tc => celestial::run(config, TcBackend::new()).await,
        Backend::Ebpf => celestial::run(config, EbpfBackend::new()).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "engine failed");
        std::process::exit(1);
    }
}
