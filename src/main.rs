#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use janus_proxy::config::ProxyConfig;
use janus_proxy::error::ProxyError;
use janus_proxy::server;
use std::path::PathBuf;

const EXIT_CONFIG: i32 = 1;
const EXIT_STARTUP: i32 = 2;

#[derive(Parser)]
#[command(name = "janus-proxy", about = "TLS-intercepting HTTP/HTTPS forward proxy")]
struct Cli {
    /// Path to proxy config file
    #[arg(short, long, default_value = "janus.toml")]
    config: PathBuf,

    /// Bind address override
    #[arg(long)]
    hostname: Option<String>,

    /// TCP port override (0 = OS-assigned)
    #[arg(long)]
    port: Option<u16>,

    /// Listen on a Unix socket instead of TCP
    #[arg(long)]
    unix_socket_path: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let mut config = match ProxyConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("janus-proxy: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };
    if let Some(hostname) = cli.hostname {
        config.hostname = hostname;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(path) = cli.unix_socket_path {
        config.unix_socket_path = Some(path);
    }
    if let Err(e) = config.validate() {
        eprintln!("janus-proxy: {}", e);
        std::process::exit(EXIT_CONFIG);
    }

    // Cooperative mode multiplexes every work on one thread; threaded mode
    // sizes the pool from config or the cgroup CPU quota.
    let runtime = if config.threaded {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(server::runtime::worker_threads(&config))
            .enable_all()
            .build()
    } else {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
    };
    let runtime = match runtime {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("janus-proxy: {}", e);
            std::process::exit(EXIT_STARTUP);
        }
    };

    if let Err(e) = runtime.block_on(server::bootstrap::run(config)) {
        eprintln!("janus-proxy: {}", e);
        let code = match e.downcast_ref::<ProxyError>() {
            Some(ProxyError::Config(_)) => EXIT_CONFIG,
            _ => EXIT_STARTUP,
        };
        std::process::exit(code);
    }
}
