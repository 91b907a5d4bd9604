#[derive(thiserror::Error, Debug)]
pub(crate) enum ServerError {
    #[error("Missing Host header")]
    MissingHostHeader,
    #[error("Missing URL path")]
    MissingUrlPath,
    #[error("Headers too large for the parse buffer")]
    HeadersTooLarge,
    #[error("Subdomain not found in Host header")]
    SubdomainNotInHost,
    #[error("Tunnel name not found in request path")]
    TunnelNameNotInPath,
}
