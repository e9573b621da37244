use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinSet;

use crate::access::file::{CreateTokenOptions, FileAccessManager};
use crate::proxy::pool::RawSocketFactory;
use crate::server::{Server, ServerOptions};
use crate::session::server::ServerSessionOptions;
use crate::{config, logging, net};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let located = config::locate_config(config_path)?;
    let wrote_template = config::ensure_config_file(&located.path)?;
    let cfg = config::load_config(&located.path)
        .with_context(|| format!("load config: {}", located.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;
    if wrote_template {
        tracing::warn!(
            origin = located.origin.describe(),
            "config: no file at {}, wrote the default template",
            located.path.display()
        );
    }

    let Some(server_cfg) = cfg.server.clone() else {
        anyhow::bail!("config: nothing to run (add a [server] section)");
    };

    let access = Arc::new(
        FileAccessManager::new(&server_cfg.storage_dir)
            .with_context(|| format!("open token storage {}", server_cfg.storage_dir.display()))?,
    );

    let listen_addr: SocketAddr = net::normalize_bind_addr(&server_cfg.listen_addr)
        .parse()
        .with_context(|| format!("invalid listen_addr: {}", server_cfg.listen_addr))?;
    let udp_listen_addr = if server_cfg.enable_udp_channel {
        Some(
            net::normalize_bind_addr(&server_cfg.udp_listen_addr)
                .parse()
                .with_context(|| format!("invalid udp_listen_addr: {}", server_cfg.udp_listen_addr))?,
        )
    } else {
        None
    };

    let opts = ServerOptions {
        listen_addr,
        udp_listen_addr,
        cert_file: server_cfg.cert_file.clone(),
        key_file: server_cfg.key_file.clone(),
        host_name: server_cfg.host_name.clone(),
        gateway_ip_v4: server_cfg.gateway_ip_v4,
        gateway_ip_v6: server_cfg.gateway_ip_v6,
        mtu: server_cfg.mtu,
        is_ipv6_supported: server_cfg.is_ipv6_supported,
        dns_servers: server_cfg.dns_servers.clone(),
        redirect_to: server_cfg.redirect_to.clone(),
        cleanup_interval: server_cfg.cleanup_interval,
        usage_sync_interval: server_cfg.usage_sync_interval,
        connect_timeout: Duration::from_secs(10),
        session: ServerSessionOptions {
            max_packet_channel_count: server_cfg.max_packet_channel_count,
            max_tcp_channel_count: server_cfg.max_tcp_channel_count,
            max_tcp_connect_wait_count: server_cfg.max_tcp_connect_wait_count,
            net_scan_limit: server_cfg.net_scan_limit,
            net_scan_window: server_cfg.net_scan_window,
            blocked_ip_ranges: server_cfg.blocked_ip_ranges.clone(),
            blocked_domains: server_cfg.blocked_domains.clone(),
            ..ServerSessionOptions::default()
        },
    };

    // The TUN adapter and raw-socket factory are injected by platform
    // glue; the bare daemon serves NAT-for-UDP and in-place gateway echo.
    let server = Server::bind(opts, access, None, Arc::new(NoRawSockets)).await?;

    tracing::info!(
        config = %located.path.display(),
        listen = %server.local_addr(),
        udp_port = ?server.udp_port(),
        storage = %server_cfg.storage_dir.display(),
        "shroud: starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();
    {
        let server = server.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server.run(shutdown).await });
    }

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain with a hard cap so service managers never hang on stop.
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
    Ok(())
}

/// Mints a token against the configured storage directory and prints it as
/// JSON for out-of-band distribution.
pub async fn create_token(
    config_path: Option<PathBuf>,
    name: Option<String>,
    max_traffic: Option<u64>,
    max_client_count: Option<u32>,
    public_endpoint: Option<SocketAddr>,
) -> anyhow::Result<()> {
    let located = config::locate_config(config_path)?;
    config::ensure_config_file(&located.path)?;
    let cfg = config::load_config(&located.path)?;
    let server_cfg = cfg.server.context("config: [server] section required")?;

    let access = FileAccessManager::new(&server_cfg.storage_dir)?;

    // The pinned hash comes from the server identity, generating it first
    // if this is a fresh install.
    let listen_addr: SocketAddr = net::normalize_bind_addr(&server_cfg.listen_addr)
        .parse()
        .with_context(|| format!("invalid listen_addr: {}", server_cfg.listen_addr))?;
    let cert_hash = crate::server::identity_cert_hash(
        &server_cfg.cert_file,
        &server_cfg.key_file,
        &server_cfg.host_name,
    )?;

    let endpoint = public_endpoint.unwrap_or(listen_addr);
    let token = access
        .create_token(CreateTokenOptions {
            name,
            max_traffic,
            max_client_count,
            server_endpoints: vec![endpoint],
            host_name: server_cfg.host_name.clone(),
            cert_hash,
            ..CreateTokenOptions::default()
        })
        .await?;

    println!("{}", serde_json::to_string_pretty(&token)?);
    Ok(())
}

/// Raw ICMP needs privileges and a platform factory; the bare daemon
/// declines instead.
struct NoRawSockets;

#[async_trait::async_trait]
impl RawSocketFactory for NoRawSockets {
    async fn open_icmp(
        &self,
        _v6: bool,
    ) -> std::io::Result<Arc<dyn crate::proxy::pool::IcmpHandle>> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "no raw socket factory configured",
        ))
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
