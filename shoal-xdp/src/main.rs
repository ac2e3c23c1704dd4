//! shoal-xdp daemon: virtual LAN switch control plane.

use anyhow::{Context, anyhow};
use clap::Parser;
use nix::sys::resource::{RLIM_INFINITY, Resource, setrlimit};
use shoal_xdp::audit::create_audit_logger;
use shoal_xdp::config::Args;
use shoal_xdp::ebpf_loader::EbpfLoader;
use shoal_xdp::endpoint::Endpoint;
use shoal_xdp::fatal::{FatalSignal, fatal};
use shoal_xdp::grpc::proto::shoal_service_server::ShoalServiceServer;
use shoal_xdp::grpc::{ShoalServiceImpl, watch_switch_changes};
use shoal_xdp::ifinfo;
use shoal_xdp::mirror::ForwardingMirror;
use shoal_xdp::pool::{ReceivePath, SocketPool};
use shoal_xdp::remote::RemoteRegistry;
use shoal_xdp::switch::{SwitchIdentity, SwitchTracker};
use shoal_xdp::xsk::XskOpener;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    // Initialize logging with h2 filtered to warn level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("h2=warn".parse().unwrap());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(interface = %args.interface, "shoal-xdp starting...");

    if let Err(e) = run(args).await {
        fatal("shoal-xdp", &format!("{e:#}"));
    }

    info!("shoal-xdp stopped");
}

async fn run(args: Args) -> anyhow::Result<()> {
    let audit = create_audit_logger(&args.log_file)
        .with_context(|| format!("Failed to open structural log {}", args.log_file.display()))?;

    // Kernels before 5.11 charge BPF maps against RLIMIT_MEMLOCK.
    if let Err(e) = setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY) {
        warn!(error = %e, "Failed to raise RLIMIT_MEMLOCK");
    }

    let uplink = ifinfo::discover(&args.interface)
        .await
        .with_context(|| format!("Failed to inspect interface {}", args.interface))?;

    let endpoint = Arc::new(
        Endpoint::bind(&uplink.name, uplink.ip).context("Failed to bind endpoint socket")?,
    );
    let vpn_port = endpoint.port();
    let public_port = match args.stun_server() {
        Some(server) => match endpoint.discover_public_addr(server) {
            Ok(public) => {
                info!(%public, "Public endpoint resolved");
                Some(public.port()).filter(|port| *port != vpn_port)
            }
            Err(e) => {
                warn!(server, error = %e, "STUN discovery failed");
                None
            }
        },
        None => None,
    };
    audit.endpoint_resolved(vpn_port, public_port);

    // Switch identity and gateway policy
    let initial = SwitchIdentity {
        mac: args.switch_mac.unwrap_or_default(),
        ip: args.switch_ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
    };
    let switch = Arc::new(SwitchTracker::with_identity(
        ForwardingMirror::new(uplink.subnet_mask),
        initial,
    ));
    switch
        .set_fake_gateway_ip(args.fake_gateway)
        .context("Failed to set fake gateway")?;
    let changes = watch_switch_changes(&switch);

    let registry = Arc::new(RemoteRegistry::new(
        Arc::clone(&switch),
        endpoint.clone(),
        Arc::clone(&audit),
    ));

    // Bring up the packet path; dropping the pool on any error tears it down.
    let fatal_signal = Arc::new(FatalSignal::new());
    let mut pool = SocketPool::new(&uplink.name, Arc::clone(&audit), Arc::clone(&fatal_signal));
    pool.load_and_attach(
        &EbpfLoader::new(&args.program),
        &switch,
        &registry,
        uplink.static_identity(vpn_port),
    )
    .with_context(|| format!("Failed to attach {}", args.program.display()))?;
    let slots = pool
        .open_socket_pool(&XskOpener, args.socket_slots())
        .context("Failed to open socket pool")?;
    pool.start(Arc::new(ReceivePath::new(
        Arc::clone(&switch),
        Arc::clone(&registry),
    )))
    .context("Failed to start receive threads")?;
    info!(slots, vpn_port, "Packet path running");

    let service = ShoalServiceImpl::new(
        switch,
        registry,
        changes,
        Arc::clone(&fatal_signal),
        slots as u32,
    );

    // Setup signal handlers
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    info!(addr = %args.grpc_addr, "Starting gRPC server");
    let served = Server::builder()
        .add_service(ShoalServiceServer::new(service))
        .serve_with_shutdown(args.grpc_addr, async {
            tokio::select! {
                _ = sigint.recv() => { info!("Received SIGINT"); }
                _ = sigterm.recv() => { info!("Received SIGTERM"); }
                reason = fatal_signal.wait() => { info!(%reason, "Stopping after fatal error"); }
            }
        })
        .await;

    info!("Shutting down...");
    pool.teardown();

    served.context("gRPC server error")?;
    match fatal_signal.reason() {
        Some(reason) => Err(anyhow!(reason)),
        None => Ok(()),
    }
}
