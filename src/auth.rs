pub mod password;

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

/// Byte stream handed to an [`AuthProvider`]; usually a `TcpStream`.
pub trait AuthStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AuthStream for T {}

/// Identity established by a successful authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authenticated {
    pub address: Ipv4Addr,
    /// Explicit end of the authorization; the connection handler applies its default when absent
    pub expiry: Option<Instant>,
}

#[derive(Debug, Error)]
pub enum AuthFailure {
    #[error("Credential rejected")]
    Rejected,

    #[error("Authentication timed out")]
    Timeout,

    #[error("I/O error during authentication: {0}")]
    Io(#[from] std::io::Error),
}

pub trait AuthProvider: Send + Sync {
    /// Name of the authentication mode, for logging
    fn name(&self) -> &'static str;

    /// Authenticates the peer at `peer_address` over `stream`.
    ///
    /// Implementations should not write error responses to the peer. The caller enforces the time
    /// budget and closes the stream afterwards.
    fn authenticate<'a>(
        &'a self,
        stream: &'a mut dyn AuthStream,
        peer_address: SocketAddr,
    ) -> Pin<Box<dyn Future<Output = Result<Authenticated, AuthFailure>> + Send + 'a>>;
}

/// Reduces an endpoint to the IPv4 host identity used for authorization. The port is ignored.
pub fn authorization_address(peer_address: SocketAddr) -> Option<Ipv4Addr> {
    match peer_address.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn port_is_ignored() {
        let a = SocketAddr::from_str("192.168.1.24:40000").unwrap();
        let b = SocketAddr::from_str("192.168.1.24:40001").unwrap();

        assert_eq!(authorization_address(a), authorization_address(b));
        assert_eq!(
            authorization_address(a),
            Some(Ipv4Addr::new(192, 168, 1, 24))
        );
    }

    #[test]
    fn ipv4_mapped_ipv6_peer() {
        let mapped = SocketAddr::from_str("[::ffff:10.0.0.1]:22").unwrap();
        let native = SocketAddr::from_str("[2001:db8::1]:22").unwrap();

        assert_eq!(
            authorization_address(mapped),
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert_eq!(authorization_address(native), None);
    }
}
