use std::{
    net::SocketAddr,
    sync::{Arc, atomic::AtomicUsize},
    time::Duration,
};

use color_eyre::eyre::WrapErr;
use russh::server::Config;
use tokio::{net::TcpStream, pin, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    ApplicationConfig, BurrowServer,
    buffer_pool::BufferPool,
    keys::{load_authorized_keys, load_host_key},
    registry::TunnelRegistry,
    ssh::Server,
    tcp_listener::bind_listener,
    tls::insecure_connector,
};

const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_CAP: Duration = Duration::from_secs(1);

// Main entrypoint of the application.
pub async fn entrypoint(config: ApplicationConfig) -> color_eyre::Result<()> {
    info!("Starting burrow...");
    // Initialize crypto and credentials.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let key = load_host_key(&config.host_key_file).await?;
    let authorized_keys = load_authorized_keys(&config.authorized_keys_file).await?;

    // Clients that miss two keepalive replies in a row are disconnected.
    let ssh_config = Arc::new(Config {
        auth_rejection_time: Duration::from_secs(2),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        inactivity_timeout: Some(Duration::from_secs(3_600)),
        keepalive_interval: Some(Duration::from_secs(5)),
        keepalive_max: 2,
        keys: vec![key],
        ..Default::default()
    });

    let cancellation_token = CancellationToken::new();
    let mut server = Arc::new(BurrowServer {
        registry: TunnelRegistry::new(),
        buffer_pool: Arc::new(BufferPool::new()),
        domain: config.domain.clone(),
        authorized_keys,
        session_counter: AtomicUsize::new(0),
        cancellation_token: cancellation_token.clone(),
        tls: insecure_connector(),
    });

    let ssh_listener = bind_listener(SocketAddr::new(config.listen_address, config.ssh_port))
        .wrap_err("Error listening to SSH port")?;
    info!(port = config.ssh_port, "Listening for SSH connections.");
    info!(domain = %config.domain.raw, "burrow is now running.");

    let signal_handler = wait_for_signal();
    pin!(signal_handler);
    let mut backoff = Duration::ZERO;
    loop {
        tokio::select! {
            conn = ssh_listener.accept() => {
                let (stream, address) = match conn {
                    Ok(conn) => {
                        backoff = Duration::ZERO;
                        conn
                    }
                    Err(error) => {
                        // Transient accept errors retry with capped backoff.
                        warn!(%error, "Error accepting SSH connection.");
                        backoff = if backoff.is_zero() {
                            ACCEPT_BACKOFF_INITIAL
                        } else {
                            (backoff * 2).min(ACCEPT_BACKOFF_CAP)
                        };
                        sleep(backoff).await;
                        continue;
                    }
                };
                if let Err(error) = stream.set_nodelay(true) {
                    warn!(%error, %address, "Error setting nodelay.");
                }
                handle_ssh_connection(stream, address, Arc::clone(&ssh_config), &mut server);
            }
            _ = &mut signal_handler => {
                break;
            }
        }
    }
    info!("burrow is shutting down.");
    cancellation_token.cancel();
    Ok(())
}

fn handle_ssh_connection(
    stream: TcpStream,
    address: SocketAddr,
    config: Arc<Config>,
    server: &mut Arc<BurrowServer>,
) {
    // Process shutdown cancels the per-connection token as well.
    let cancellation_token = server.cancellation_token.child_token();
    let handler = server.new_client(address, cancellation_token.clone());
    tokio::spawn(async move {
        let mut session = match russh::server::run_stream(config, stream, handler).await {
            Ok(session) => session,
            Err(error) => {
                warn!(%error, "Connection setup failed.");
                return;
            }
        };
        tokio::select! {
            result = &mut session => {
                if let Err(error) = result {
                    warn!(%error, %address, "Connection closed.");
                }
            }
            _ = cancellation_token.cancelled() => {
                info!(%address, "Disconnecting client...");
                let _ = session
                    .handle()
                    .disconnect(russh::Disconnect::ByApplication, "".into(), "English".into())
                    .await;
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut signal_terminate = signal(SignalKind::terminate()).unwrap();
    let mut signal_interrupt = signal(SignalKind::interrupt()).unwrap();

    tokio::select! {
        _ = signal_terminate.recv() => debug!("Received SIGTERM."),
        _ = signal_interrupt.recv() => debug!("Received SIGINT."),
    };
}

#[cfg(windows)]
async fn wait_for_signal() {
    use tokio::signal::windows;

    let mut signal_c = windows::ctrl_c().unwrap();
    let mut signal_break = windows::ctrl_break().unwrap();
    let mut signal_close = windows::ctrl_close().unwrap();
    let mut signal_shutdown = windows::ctrl_shutdown().unwrap();

    tokio::select! {
        _ = signal_c.recv() => debug!("Received CTRL_C."),
        _ = signal_break.recv() => debug!("Received CTRL_BREAK."),
        _ = signal_close.recv() => debug!("Received CTRL_CLOSE."),
        _ = signal_shutdown.recv() => debug!("Received CTRL_SHUTDOWN."),
    };
}
