use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
};

use http::Uri;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::error::ServerError;

const TUNNEL_NAME_LENGTH: usize = 4;
const NAME_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

// Returns true if the name can be used as a tunnel name: shorter than 50
// characters, lowercase alphanumerics and dashes only, no leading/trailing
// dash, no consecutive dashes.
pub(crate) fn tunnel_name_valid(name: &str) -> bool {
    if name.is_empty() || name.len() >= 50 {
        return false;
    }
    let name = name.to_ascii_lowercase();
    let bytes = name.as_bytes();
    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return false;
    }
    for (index, &byte) in bytes.iter().enumerate() {
        match byte {
            b'a'..=b'z' | b'0'..=b'9' => (),
            b'-' => {
                if bytes.get(index + 1) == Some(&b'-') {
                    return false;
                }
            }
            _ => return false,
        }
    }
    true
}

// Generate a random 4-character tunnel name from OS entropy. Each byte maps
// onto [0-9a-z] modulo 36.
pub(crate) fn generate_random_name() -> String {
    let bytes: [u8; TUNNEL_NAME_LENGTH] = ChaCha20Rng::from_os_rng().random();
    bytes
        .iter()
        .map(|byte| NAME_ALPHABET[*byte as usize % NAME_ALPHABET.len()] as char)
        .collect()
}

// Extract the subdomain from a Host header value, given the server's public
// domain host. The domain must appear after at least one subdomain byte and
// its separator.
pub(crate) fn extract_subdomain(host: &str, domain_host: &str) -> Result<String, ServerError> {
    match host.find(domain_host) {
        Some(index) if index > 0 => Ok(host[..index - 1].trim().to_string()),
        _ => Err(ServerError::SubdomainNotInHost),
    }
}

// Extract the tunnel name from a request path, skipping the public domain's
// own path prefix first. Accepts paths with or without a leading slash.
pub(crate) fn extract_tunnel_name_from_url_path(
    path: &str,
    domain_path: &str,
) -> Result<String, ServerError> {
    let prefix = match domain_path.find('/') {
        None => {
            if path.starts_with('/') {
                "/"
            } else {
                ""
            }
        }
        Some(index) => {
            if path.starts_with('/') {
                &domain_path[index..]
            } else {
                &domain_path[index + 1..]
            }
        }
    };
    let trimmed = path
        .strip_prefix(prefix)
        .ok_or(ServerError::TunnelNameNotInPath)?;
    let trimmed = trimmed.strip_prefix('/').unwrap_or(trimmed);
    let name = trimmed
        .split('/')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    if name.is_empty() {
        return Err(ServerError::TunnelNameNotInPath);
    }
    Ok(name)
}

// Resolve the bind host of a forward request into a socket address. SSH
// clients spell "listen everywhere" as an empty host or "*"; both map onto
// the dual-stack any-address.
pub(crate) fn resolve_bind_addr(host: &str, port: u16) -> io::Result<SocketAddr> {
    let host = match host {
        "" | "*" => "::",
        host => host,
    };
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "could not resolve bind address",
        )
    })
}

// Rewrite a request-URI: replace the authority with `new_host` when the URI
// is absolute, and strip `strip_prefix` (with or without its leading slash)
// from the path. Relative results always keep a leading slash.
pub(crate) fn replace_request_url(
    request_url: &str,
    new_host: Option<&str>,
    strip_prefix: &str,
) -> Result<String, http::uri::InvalidUri> {
    let uri: Uri = request_url.parse()?;
    let absolute = uri.scheme_str().is_some();

    let mut path = uri.path().to_string();
    if !strip_prefix.is_empty() {
        let bare_path = path.strip_prefix('/').unwrap_or(&path);
        let bare_prefix = strip_prefix.strip_prefix('/').unwrap_or(strip_prefix);
        path = bare_path
            .strip_prefix(bare_prefix)
            .unwrap_or(bare_path)
            .to_string();
    }

    let query = uri
        .query()
        .map(|query| format!("?{query}"))
        .unwrap_or_default();
    if absolute {
        let authority = match new_host {
            Some(host) => host.to_string(),
            None => uri
                .authority()
                .map(|authority| authority.to_string())
                .unwrap_or_default(),
        };
        if !path.is_empty() && !path.starts_with('/') {
            path.insert(0, '/');
        }
        Ok(format!(
            "{}://{}{}{}",
            uri.scheme_str().unwrap_or("http"),
            authority,
            path,
            query
        ))
    } else {
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Ok(format!("{path}{query}"))
    }
}
