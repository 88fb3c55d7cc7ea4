//! tunneld: reverse-tunnel server daemon
//!
//! ```bash
//! sudo tunneld --conf /etc/tunneld/tunneld.yaml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use tunneld::config::{load_config, Config};
use tunneld::forward::socket::is_root;
use tunneld::forward::{TcpForward, UdpForward};
use tunneld::plugin;
use tunneld::resolver::Resolver;
use tunneld::session::{run_tun_reader, SessionRegistry, TunnelServer};
use tunneld::tun::TunDevice;
use tunneld::vip::VipPool;

/// Command-line arguments
struct Args {
    /// Configuration file path
    conf: PathBuf,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut conf = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--conf" => {
                    if let Some(path) = args.next() {
                        conf = Some(PathBuf::from(path));
                    }
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("tunneld v{}", tunneld::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        let Some(conf) = conf else {
            eprintln!("Missing required --conf <path>");
            print_help();
            std::process::exit(1);
        };

        Self { conf }
    }
}

fn print_help() {
    println!(
        r#"tunneld v{}

Server side of a reverse-tunneling daemon.

USAGE:
    tunneld --conf <PATH>

OPTIONS:
    --conf <PATH>    Configuration file (YAML)
    -h, --help       Print help information
    -v, --version    Print version information

REQUIREMENTS:
    - Linux kernel with TPROXY support
    - CAP_NET_ADMIN and CAP_NET_RAW (or root)
    - iptables TPROXY rules steering public traffic to the forwarder ports
    - The dhcp gateway IP configured on the TUN interface"#,
        tunneld::VERSION
    );
}

/// Initialize logging from the config level; `RUST_LOG` overrides it.
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().expect("static directive"))
        .add_directive("tokio=warn".parse().expect("static directive"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.conf)
        .with_context(|| format!("loading configuration from {:?}", args.conf))?;
    init_logging(&config);
    info!("tunneld v{} starting", tunneld::VERSION);

    if !is_root() {
        warn!("not running as root; transparent sockets and TUN need CAP_NET_ADMIN/CAP_NET_RAW");
    }

    // VIP pool for dialed-in clients; the gateway address stays out of it
    let vip_pool = Arc::new(
        VipPool::new(&config.dhcp.cidr, config.dhcp.ip).context("building VIP pool")?,
    );
    info!(
        "VIP pool {} ready ({} addresses)",
        vip_pool.cidr(),
        vip_pool.free_count()
    );

    // Plugins are registered and set up before any client can attach
    plugin::register_builtin();
    plugin::setup_all(&config.plugin)
        .await
        .context("plugin setup")?;

    let resolver = if config.resolver.enabled() {
        let resolver = Resolver::connect(&config.resolver.etcd_endpoints)
            .await
            .context("connecting resolver")?;
        Some(Arc::new(resolver))
    } else {
        info!("resolver disabled (no etcd endpoints configured)");
        None
    };

    let public_ip = tunneld::public_ip::discover()
        .await
        .context("discovering public IP")?;
    info!("public IP {}", public_ip);

    let tun = Arc::new(TunDevice::open(&config.tun).context("opening TUN device")?);
    let registry = Arc::new(SessionRegistry::new());

    // Transparent forwarders: bind before serving so startup failures are
    // fatal rather than logged from a task
    let tcp_forward = Arc::new(TcpForward::new(&config.tcpforward, registry.clone()));
    let tcp_listener = tcp_forward.listen().context("transparent TCP listen")?;
    tokio::spawn(tcp_forward.serve(tcp_listener));

    let udp_forward = Arc::new(
        UdpForward::new(&config.udpforward, registry.clone()).context("UDP forwarder setup")?,
    );
    let udp_socket = udp_forward.listen().context("transparent UDP listen")?;
    tokio::spawn(udp_forward.serve(udp_socket));

    tokio::spawn(run_tun_reader(tun.clone(), registry.clone()));

    let server = Arc::new(TunnelServer::new(
        &config.server,
        public_ip,
        vip_pool,
        resolver,
        registry,
        tun,
    ));

    tokio::select! {
        result = server.run() => {
            result.context("control-channel server")?;
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}
