use std::{
    net::{IpAddr, Ipv6Addr},
    path::PathBuf,
    str::FromStr,
};

use clap::Parser;

// The server's public domain. A bare host ("domain.io") runs in host mode,
// where the tunnel name travels as a subdomain; a domain with a path
// ("domain.io/tunnels") runs in path mode, where the name is the first path
// segment after the domain's own prefix. An optional scheme only affects
// the address announced to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    // The domain as configured, without the scheme.
    pub raw: String,
    pub scheme: String,
    pub host: String,
    // The domain's own path prefix ("" in host mode).
    pub path: String,
    pub path_mode: bool,
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = match value.split_once("://") {
            Some((scheme, rest)) => (scheme.to_string(), rest),
            None => ("https".to_string(), value),
        };
        let rest = rest.trim_end_matches('/');
        let (host, path) = match rest.split_once('/') {
            Some((host, path)) => (host.to_string(), format!("/{path}")),
            None => (rest.to_string(), String::new()),
        };
        if host.is_empty() {
            return Err("domain host must not be empty".to_string());
        }
        Ok(Domain {
            raw: rest.to_string(),
            scheme,
            path_mode: !path.is_empty(),
            host,
            path,
        })
    }
}

// CLI configuration for burrow.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// DNS domain (e.g. domain.io) that points to this server. Append a
    /// path (e.g. domain.io/tunnels) to convey tunnel names in the URL
    /// path instead of the hostname.
    #[arg(long, value_name = "DOMAIN")]
    pub domain: Domain,

    /// Address to listen on for SSH and public connections.
    #[arg(
        long,
        default_value_t = IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        value_name = "ADDRESS"
    )]
    pub listen_address: IpAddr,

    /// Port to listen on for SSH connections.
    #[arg(long, default_value_t = 5223, value_name = "PORT")]
    pub ssh_port: u16,

    /// File containing the server's SSH host key. The BURROW_HOST_KEY_B64
    /// environment variable (base64 of the key file) takes precedence.
    #[arg(long, default_value_os = "./ssh_host_key", value_name = "FILE")]
    pub host_key_file: PathBuf,

    /// File containing the public keys allowed to open tunnels, one per
    /// line. The BURROW_AUTHORIZED_KEYS_B64 environment variable (base64 of
    /// the file) takes precedence.
    #[arg(long, default_value_os = "./authorized_keys", value_name = "FILE")]
    pub authorized_keys_file: PathBuf,

    /// Log level: trace, debug, info, warn, or error.
    #[arg(long, default_value = "info", value_name = "LEVEL")]
    pub log: String,
}

#[cfg(test)]
mod tests {
    use super::Domain;

    #[test]
    fn parses_a_bare_host() {
        let domain: Domain = "domain.io".parse().unwrap();
        assert_eq!(domain.raw, "domain.io");
        assert_eq!(domain.scheme, "https");
        assert_eq!(domain.host, "domain.io");
        assert_eq!(domain.path, "");
        assert!(!domain.path_mode);
    }

    #[test]
    fn parses_a_domain_with_a_path() {
        let domain: Domain = "domain.io/tunnels".parse().unwrap();
        assert_eq!(domain.raw, "domain.io/tunnels");
        assert_eq!(domain.host, "domain.io");
        assert_eq!(domain.path, "/tunnels");
        assert!(domain.path_mode);
    }

    #[test]
    fn keeps_an_explicit_scheme() {
        let domain: Domain = "http://domain.io".parse().unwrap();
        assert_eq!(domain.scheme, "http");
        assert_eq!(domain.raw, "domain.io");
    }

    #[test]
    fn ignores_a_trailing_slash() {
        let domain: Domain = "domain.io/".parse().unwrap();
        assert!(!domain.path_mode);
        assert_eq!(domain.raw, "domain.io");
    }

    #[test]
    fn rejects_an_empty_host() {
        assert!("".parse::<Domain>().is_err());
        assert!("https://".parse::<Domain>().is_err());
    }
}
