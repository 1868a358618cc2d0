//! CLI entry point. Grounded on the teacher's `collector/src/main.rs`
//! (`clap::Parser`, Unix signal handling via `tokio::signal::unix::signal`,
//! an `AtomicBool`-guarded shutdown), generalized to the positional port
//! surface and exit-code contract of `spec.md` §6.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use jn_lineage_proxy::config::ConfigBuilder;
use jn_lineage_proxy::provenance::Builder as ProvenanceBuilderInput;
use jn_lineage_proxy::session::{NetworkEndpoint, Ports, Session};
use tokio::signal::unix::{signal, SignalKind};

/// Default bind address for the HTTPS MITM listener when a cert directory
/// is supplied but no explicit address is configured. `spec.md` §6 does not
/// expose this as a positional argument, only whether a cert directory is
/// present at all.
const DEFAULT_HTTP_PROXY_ADDR: &str = "127.0.0.1:8080";

#[derive(Parser, Debug)]
#[command(name = "jn-lineage-proxy", about = "Jupyter lineage recording proxy")]
struct Cli {
    src_ip: IpAddr,
    src_shell: u16,
    src_stdin: u16,
    src_iopub: u16,
    src_control: u16,
    src_heartbeat: u16,

    dst_ip: IpAddr,
    dst_shell: u16,
    dst_stdin: u16,
    dst_iopub: u16,
    dst_control: u16,
    dst_heartbeat: u16,

    repo_dir: Option<PathBuf>,
    cert_dir: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to start async runtime");
            std::process::exit(2);
        }
    };

    let exit_code = runtime.block_on(run(cli));
    std::process::exit(exit_code);
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = if quiet {
        tracing::Level::WARN
    } else {
        match verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

async fn run(cli: Cli) -> i32 {
    let src = NetworkEndpoint {
        ip: cli.src_ip,
        ports: Ports {
            shell: cli.src_shell,
            stdin: cli.src_stdin,
            iopub: cli.src_iopub,
            control: cli.src_control,
            heartbeat: cli.src_heartbeat,
        },
    };
    let dst = NetworkEndpoint {
        ip: cli.dst_ip,
        ports: Ports {
            shell: cli.dst_shell,
            stdin: cli.dst_stdin,
            iopub: cli.dst_iopub,
            control: cli.dst_control,
            heartbeat: cli.dst_heartbeat,
        },
    };

    let mut builder = ConfigBuilder::new().src(src).dst(dst);
    if let Some(dir) = &cli.repo_dir {
        builder = builder.repository_dir(dir.clone());
    }
    if let Some(cert_dir) = &cli.cert_dir {
        let addr: SocketAddr = DEFAULT_HTTP_PROXY_ADDR.parse().expect("valid default address");
        builder = builder.cert_dir(cert_dir.clone()).http_listen_addr(addr).with_builtin_handlers();
    }

    let config = match builder.build() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return 1;
        }
    };
    let repo_dir = config.repository_dir.clone();

    let session = match Session::new(config.src, config.dst, config.repository, config.ca, config.http_listen_addr, config.handlers) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!(error = %e, "failed to construct session");
            return 2;
        }
    };

    if let Err(e) = session.start().await {
        tracing::error!(error = %e, "failed to start session");
        return 2;
    }
    tracing::info!("session started");

    if let Err(e) = wait_for_shutdown_signal().await {
        tracing::error!(error = %e, "failed to install signal handlers");
        return 2;
    }
    tracing::info!("shutdown signal received");

    if let Err(e) = session.stop().await {
        tracing::error!(error = %e, "failed to stop session cleanly");
        return 2;
    }

    let builder_info = ProvenanceBuilderInput {
        id: "jn-lineage-proxy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    match session.provenance(builder_info, Vec::new(), repo_dir.display().to_string()) {
        Ok(statement) => match serde_json::to_vec_pretty(&statement) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(repo_dir.join("prov.json"), bytes) {
                    tracing::error!(error = %e, "failed to write prov.json");
                    return 2;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize provenance");
                return 2;
            }
        },
        Err(e) => {
            tracing::error!(error = %e, "failed to build provenance");
            return 2;
        }
    }

    0
}

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}
