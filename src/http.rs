use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    BurrowServer,
    addressing::{extract_subdomain, extract_tunnel_name_from_url_path, replace_request_url},
    droppable_handle::DroppableHandle,
    http_processor::HttpProcessor,
    registry::ConnectionKind,
};

// Tunneled requests always target the service's HTTP port on the far side.
const HTTP_BIND_PORT: u32 = 80;

const BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const BACKOFF_CAP: Duration = Duration::from_secs(1);

// Literal 400 responses expected by clients of the public endpoint.
const BAD_REQUEST_HOST: &str =
    "HTTP/1.1 400 Bad Request\r\nContent-Type:text/html\r\n\r\nCould not find a valid Host.";
const BAD_REQUEST_PATH: &str =
    "HTTP/1.1 400 Bad Request\r\nContent-Type:text/html\r\n\r\nCould not find a valid URL path.";
const BAD_REQUEST_CONTENT_LENGTH: &str =
    "HTTP/1.1 400 Bad Request\r\nContent-Type:text/html\r\n\r\nInvalid Content-Length header.";
const BAD_REQUEST_NO_LISTENERS: &str =
    "HTTP/1.1 400 Bad Request\r\nContent-Type:text/html\r\n\r\nNo listeners found.";

// Accept public HTTP connections on the shared listener, retrying with a
// capped exponential backoff on transient accept errors.
pub(crate) fn spawn_http_acceptor(
    server: Arc<BurrowServer>,
    addr: String,
    listener: TcpListener,
) -> DroppableHandle<()> {
    let label = format!("HTTP acceptor for {addr}");
    let task = tokio::spawn(async move {
        let cancellation_token = server.cancellation_token.clone();
        let mut backoff = Duration::ZERO;
        loop {
            let (stream, address) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => {
                        backoff = Duration::ZERO;
                        accepted
                    }
                    Err(error) => {
                        warn!(%addr, %error, "Error accepting HTTP connection.");
                        backoff = if backoff.is_zero() {
                            BACKOFF_INITIAL
                        } else {
                            (backoff * 2).min(BACKOFF_CAP)
                        };
                        sleep(backoff).await;
                        continue;
                    }
                },
                _ = cancellation_token.cancelled() => {
                    debug!(%addr, "HTTP listener: cancellation requested.");
                    return;
                }
            };
            if let Err(error) = stream.set_nodelay(true) {
                warn!(%error, %address, "Error setting nodelay.");
            }
            let server = Arc::clone(&server);
            let addr = addr.clone();
            tokio::spawn(handle_http_connection(stream, address, addr, server));
        }
    });
    DroppableHandle::new(task, label)
}

// Serve sequential HTTP requests from one public connection: identify the
// target tunnel from the request prefix, rewrite headers/URI where the
// tenant asked for it, then splice bytes through a forwarded-tcpip channel.
pub(crate) async fn handle_http_connection(
    stream: TcpStream,
    peer: SocketAddr,
    addr: String,
    server: Arc<BurrowServer>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut had_previous_requests = false;
    loop {
        debug!(%peer, "Waiting for an HTTP request on the public connection.");
        let mut processor = HttpProcessor::new(&mut read_half, server.buffer_pool.get());

        let name = if server.domain.path_mode {
            match processor.get_url_path().await {
                Ok(path) => match extract_tunnel_name_from_url_path(&path, &server.domain.path) {
                    Ok(name) => name,
                    Err(error) => {
                        debug!(%peer, %error, "Could not find a tunnel name in the URL path.");
                        respond_bad_request(&mut write_half, BAD_REQUEST_PATH).await;
                        return;
                    }
                },
                Err(error) => {
                    if had_previous_requests && is_connection_end(&error) {
                        debug!(%peer, "Public connection terminated.");
                        return;
                    }
                    debug!(%peer, %error, "Could not find a URL path.");
                    respond_bad_request(&mut write_half, BAD_REQUEST_PATH).await;
                    return;
                }
            }
        } else {
            match processor.get_host().await {
                Ok(host) => match extract_subdomain(&host, &server.domain.host) {
                    Ok(name) => name,
                    Err(error) => {
                        debug!(%peer, %error, "Could not find a subdomain in the Host header.");
                        respond_bad_request(&mut write_half, BAD_REQUEST_HOST).await;
                        return;
                    }
                },
                Err(error) => {
                    if had_previous_requests && is_connection_end(&error) {
                        debug!(%peer, "Public connection terminated.");
                        return;
                    }
                    debug!(%peer, %error, "Could not find a Host header.");
                    respond_bad_request(&mut write_half, BAD_REQUEST_HOST).await;
                    return;
                }
            }
        };
        had_previous_requests = true;

        if !processor.get_content_length().1 {
            respond_bad_request(&mut write_half, BAD_REQUEST_CONTENT_LENGTH).await;
            return;
        }

        info!(%peer, %name, "Incoming HTTP request.");
        let Some(tunnel) = server.registry.get_http(&addr, &name) else {
            info!(%name, "No listeners found for tunnel name.");
            respond_bad_request(&mut write_half, BAD_REQUEST_NO_LISTENERS).await;
            return;
        };
        tunnel
            .tx
            .send_line(format!("Received http request from {peer}"));

        if let Some(host_header) = &tunnel.host_header {
            debug!(host = %host_header, "Overriding Host header.");
            processor.set_host_header(host_header, &server.domain.raw).await;
        }
        if processor.is_request()
            && let Some(raw_uri) = processor.raw_uri().map(str::to_string)
        {
            let strip_prefix = if server.domain.path_mode {
                format!("{}/{}", server.domain.path, name)
            } else {
                String::new()
            };
            if let Ok(new_url) =
                replace_request_url(&raw_uri, tunnel.host_header.as_deref(), &strip_prefix)
                && new_url != raw_uri
            {
                debug!(from = %raw_uri, to = %new_url, "Adjusting request URL.");
                processor.replace_request_url(&new_url).await;
            }
        }

        let channel = match tunnel
            .handle
            .channel_open_forwarded_tcpip(
                tunnel.bind_addr.clone(),
                HTTP_BIND_PORT,
                peer.ip().to_canonical().to_string(),
                peer.port().into(),
            )
            .await
        {
            Ok(channel) => channel,
            Err(error) => {
                warn!(%error, "Error opening forwarded-tcpip channel.");
                return;
            }
        };

        // Tenants that terminate TLS themselves get a client handshake with
        // certificate verification disabled; self-signed services are the
        // common case and the tenant asked for this explicitly.
        let tenant_closed = if tunnel.kind == ConnectionKind::Https {
            let server_name = tls_server_name(tunnel.host_header.as_deref());
            match server.tls.connect(server_name, channel.into_stream()).await {
                Ok(tls_stream) => {
                    splice_request(&server, processor, tls_stream, &mut write_half).await
                }
                Err(error) => {
                    warn!(%error, "TLS handshake with the tunneled service failed.");
                    return;
                }
            }
        } else {
            splice_request(&server, processor, channel.into_stream(), &mut write_half).await
        };

        debug!(%peer, "HTTP request ended.");
        if tenant_closed {
            // The destination closed its end; stop waiting for further
            // requests on this public connection.
            debug!(%peer, "Tunneled service closed the connection.");
            return;
        }
    }
}

// Copy the framed request to the tenant and the framed response back to the
// public socket, concurrently. Returns whether the tenant side reached EOF.
async fn splice_request<R, T>(
    server: &Arc<BurrowServer>,
    mut processor: HttpProcessor<R>,
    tenant: T,
    public_write: &mut OwnedWriteHalf,
) -> bool
where
    R: AsyncRead + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let request_method = processor.request_method().map(str::to_string);
    let (mut tenant_read, mut tenant_write) = tokio::io::split(tenant);

    let upstream = async {
        let mut body = processor.body_reader().await?;
        let mut buf = server.buffer_pool.get();
        loop {
            let n = body.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            tenant_write.write_all(&buf[..n]).await?;
        }
        tenant_write.flush().await?;
        Ok::<(), io::Error>(())
    };
    let downstream = async {
        let mut response = HttpProcessor::new(&mut tenant_read, server.buffer_pool.get())
            .with_request_method(request_method);
        let eof = {
            let mut body = response.body_reader().await?;
            let mut buf = server.buffer_pool.get();
            loop {
                let n = body.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                public_write.write_all(&buf[..n]).await?;
            }
            body.saw_eof()
        };
        public_write.flush().await?;
        Ok::<bool, io::Error>(eof)
    };

    let (up, down) = tokio::join!(upstream, downstream);
    if let Err(error) = up {
        debug!(%error, "Error copying the request to the tunneled service.");
    }
    match down {
        Ok(eof) => eof,
        Err(error) => {
            debug!(%error, "Error copying the response from the tunneled service.");
            true
        }
    }
}

async fn respond_bad_request(write_half: &mut OwnedWriteHalf, response: &str) {
    let _ = write_half.write_all(response.as_bytes()).await;
    let _ = write_half.shutdown().await;
}

fn is_connection_end(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

fn tls_server_name(host_header: Option<&str>) -> ServerName<'static> {
    host_header
        .and_then(|host| ServerName::try_from(host.to_string()).ok())
        .unwrap_or_else(|| ServerName::try_from("localhost").expect("static name is valid"))
}
