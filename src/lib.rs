use std::sync::{Arc, atomic::AtomicUsize};

use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

pub(crate) mod addressing;
pub(crate) mod buffer_pool;
pub(crate) mod chunked;
pub mod config;
pub(crate) mod droppable_handle;
mod entrypoint;
pub(crate) mod error;
pub(crate) mod forwarding;
pub(crate) mod http;
pub(crate) mod http_processor;
pub(crate) mod keys;
pub(crate) mod registry;
pub(crate) mod ssh;
pub(crate) mod tcp_listener;
pub(crate) mod tls;

pub use config::ApplicationConfig;
pub use entrypoint::entrypoint;

use crate::{
    buffer_pool::BufferPool, config::Domain, keys::AuthorizedKeys, registry::TunnelRegistry,
};

// Data shared by all tasks of the running server.
pub(crate) struct BurrowServer {
    // The two tunnel tables.
    pub(crate) registry: TunnelRegistry,
    // Pool of 32 KiB buffers for parsing and splicing.
    pub(crate) buffer_pool: Arc<BufferPool>,
    pub(crate) domain: Domain,
    pub(crate) authorized_keys: AuthorizedKeys,
    // Counter behind per-session hex identifiers.
    pub(crate) session_counter: AtomicUsize,
    // Process-level cancellation, propagated to every acceptor.
    pub(crate) cancellation_token: CancellationToken,
    // TLS connector for tenants that expect TLS on their side.
    pub(crate) tls: TlsConnector,
}
