use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

use crate::DEFAULT_PORT;

/// Command-line surface. Unknown flags exit non-zero with a usage line
/// (clap's default behavior).
#[derive(Parser, Debug)]
#[command(name = "legion", version, about = "Small static-content HTTPS server")]
pub struct Args {
    /// IP address to bind; omit for the dual-stack wildcard
    #[arg(short = 'i', long = "ip")]
    pub ip: Option<IpAddr>,

    /// TCP port to listen on
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Directory holding the files to serve
    #[arg(short = 'a', long = "assets", default_value = "assets")]
    pub asset_root: PathBuf,

    /// Detach from the terminal and run in the background
    #[arg(short = 'd', long = "daemon")]
    pub daemon: bool,

    /// PEM certificate chain
    #[arg(short = 'c', long = "cert", default_value = "certs/server.crt")]
    pub cert: PathBuf,

    /// PEM private key
    #[arg(short = 'k', long = "key", default_value = "certs/server.key")]
    pub key: PathBuf,
}

impl Args {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            ip: self.ip,
            port: self.port,
            asset_root: self.asset_root.clone(),
            cert: self.cert.clone(),
            key: self.key.clone(),
        }
    }
}

/// Resolved settings the server is built from, independent of the CLI.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub asset_root: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl ServerConfig {
    /// The bind address: an explicit literal, or the IPv6 wildcard which is
    /// opened dual-stack.
    pub fn socket_addr(&self) -> SocketAddr {
        let ip = self.ip.unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.port)
    }
}
