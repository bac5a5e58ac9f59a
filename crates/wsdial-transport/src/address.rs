//! Multiaddr to WebSocket URL translation.
//!
//! Accepts addresses of the form
//!
//! ```text
//! /(ip4|ip6|dns|dns4|dns6)/<host>/tcp/<port>/(ws|wss|x-parity-ws/<path>|x-parity-wss/<path>)[/p2p/<id>]
//! ```
//!
//! and turns them into a [`ConnectionTarget`]. DNS names are passed through
//! to the host socket unresolved.

use crate::transport::{TransportError, TransportResult};
use percent_encoding::percent_decode_str;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// WebSocket URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plaintext WebSocket
    Ws,
    /// WebSocket over TLS
    Wss,
}

impl Scheme {
    /// Map a multiaddr protocol token to a scheme.
    ///
    /// Anything not explicitly plaintext selects `Wss`.
    fn from_protocol(token: &str) -> Self {
        match token {
            "ws" | "x-parity-ws" => Self::Ws,
            _ => Self::Wss,
        }
    }

    /// URL scheme string
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }

    /// Whether the scheme is TLS-protected
    #[must_use]
    pub const fn is_secure(self) -> bool {
        matches!(self, Self::Wss)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a dial should connect to.
///
/// `host` is already in URL form: IPv6 literals are bracketed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    /// URL scheme
    pub scheme: Scheme,
    /// Host as it appears in the URL
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Decoded request path, empty for the root
    pub path: String,
}

impl ConnectionTarget {
    /// Parse a multiaddr string into a connection target.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::UnsupportedAddress` carrying the original
    /// string when `addr` doesn't match the accepted grammar.
    ///
    /// # Examples
    ///
    /// ```
    /// use wsdial_transport::address::{ConnectionTarget, Scheme};
    ///
    /// let target = ConnectionTarget::from_multiaddr("/ip6/::1/tcp/443/wss").unwrap();
    /// assert_eq!(target.scheme, Scheme::Wss);
    /// assert_eq!(target.url(), "wss://[::1]:443");
    /// ```
    pub fn from_multiaddr(addr: &str) -> TransportResult<Self> {
        parse(addr).ok_or_else(|| TransportError::UnsupportedAddress(addr.to_string()))
    }

    /// Render the target as a URL string: `scheme://host:port[path]`.
    #[must_use]
    pub fn url(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }
}

/// Translate a multiaddr string into a connection target.
///
/// # Errors
///
/// See [`ConnectionTarget::from_multiaddr`].
pub fn translate(addr: &str) -> TransportResult<ConnectionTarget> {
    ConnectionTarget::from_multiaddr(addr)
}

/// Whether `addr` would translate successfully.
#[must_use]
pub fn is_dialable(addr: &str) -> bool {
    parse(addr).is_some()
}

fn parse(addr: &str) -> Option<ConnectionTarget> {
    let mut segments = addr.strip_prefix('/')?.split('/');

    let family = segments.next()?;
    let raw_host = segments.next()?;
    let host = match family {
        "ip4" => raw_host.parse::<Ipv4Addr>().ok()?.to_string(),
        "ip6" => format!("[{}]", raw_host.parse::<Ipv6Addr>().ok()?),
        "dns" | "dns4" | "dns6" if !raw_host.is_empty() => raw_host.to_string(),
        _ => return None,
    };

    if segments.next()? != "tcp" {
        return None;
    }
    let port = segments.next()?.parse::<u16>().ok()?;

    let protocol = segments.next()?;
    let path = match protocol {
        "ws" | "wss" => String::new(),
        "x-parity-ws" | "x-parity-wss" => decode_path(segments.next()?)?,
        _ => return None,
    };
    let scheme = Scheme::from_protocol(protocol);

    // Peer identity is handled further up the stack.
    match (segments.next(), segments.next()) {
        (None, _) => {}
        (Some("p2p" | "ipfs"), Some(id)) if !id.is_empty() => {}
        _ => return None,
    }
    if segments.next().is_some() {
        return None;
    }

    Some(ConnectionTarget {
        scheme,
        host,
        port,
        path,
    })
}

fn decode_path(encoded: &str) -> Option<String> {
    let decoded = percent_decode_str(encoded).decode_utf8().ok()?;
    if decoded.is_empty() || decoded.starts_with('/') {
        Some(decoded.into_owned())
    } else {
        Some(format!("/{decoded}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(addr: &str) -> String {
        translate(addr).unwrap().url()
    }

    #[test]
    fn test_ip4_ws() {
        let target = translate("/ip4/127.0.0.1/tcp/9000/ws").unwrap();
        assert_eq!(target.scheme, Scheme::Ws);
        assert_eq!(target.host, "127.0.0.1");
        assert_eq!(target.port, 9000);
        assert_eq!(target.path, "");
        assert_eq!(target.url(), "ws://127.0.0.1:9000");
    }

    #[test]
    fn test_ip6_wss_is_bracketed() {
        assert_eq!(url("/ip6/::1/tcp/443/wss"), "wss://[::1]:443");
        assert_eq!(
            url("/ip6/2001:db8::1/tcp/8080/ws"),
            "ws://[2001:db8::1]:8080"
        );
    }

    #[test]
    fn test_x_parity_path_is_decoded() {
        assert_eq!(
            url("/ip4/1.2.3.4/tcp/80/x-parity-ws/%2Ffoo"),
            "ws://1.2.3.4:80/foo"
        );
        assert_eq!(
            url("/dns4/relay.example.org/tcp/443/x-parity-wss/%2Fapi%2Fv1"),
            "wss://relay.example.org:443/api/v1"
        );
    }

    #[test]
    fn test_x_parity_path_without_leading_slash() {
        assert_eq!(url("/ip4/1.2.3.4/tcp/80/x-parity-ws/foo"), "ws://1.2.3.4:80/foo");
    }

    #[test]
    fn test_x_parity_requires_path_segment() {
        assert!(translate("/ip4/1.2.3.4/tcp/80/x-parity-ws").is_err());
    }

    #[test]
    fn test_dns_hosts_pass_through() {
        assert_eq!(url("/dns4/example.com/tcp/80/ws"), "ws://example.com:80");
        assert_eq!(url("/dns6/example.com/tcp/443/wss"), "wss://example.com:443");
        assert_eq!(url("/dns/example.com/tcp/443/wss"), "wss://example.com:443");
    }

    #[test]
    fn test_unrecognized_trailing_token_rejected() {
        let err = translate("/dns4/example.com/tcp/80/tcp").unwrap_err();
        match err {
            TransportError::UnsupportedAddress(addr) => {
                assert_eq!(addr, "/dns4/example.com/tcp/80/tcp");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_addresses_rejected() {
        for addr in [
            "",
            "/",
            "ip4/127.0.0.1/tcp/80/ws",
            "/ip4/127.0.0.1/tcp/80",
            "/ip4/127.0.0.1/udp/80/ws",
            "/ip4/127.0.0.1/tcp/70000/ws",
            "/ip4/127.0.0.1/tcp/port/ws",
            "/ip4/::1/tcp/80/ws",
            "/ip6/127.0.0.1/tcp/80/ws",
            "/ip4/999.0.0.1/tcp/80/ws",
            "/dns4//tcp/80/ws",
            "/unix/tmp/tcp/80/ws",
            "/ip4/127.0.0.1/tcp/80/ws/",
            "/ip4/127.0.0.1/tcp/80/ws/extra",
            "/ip4/127.0.0.1/tcp/80/x-parity-ws/%FF",
        ] {
            assert!(translate(addr).is_err(), "{addr} should be rejected");
            assert!(!is_dialable(addr));
        }
    }

    #[test]
    fn test_trailing_peer_id_ignored() {
        let addr = "/ip4/10.0.0.1/tcp/4001/wss/p2p/QmYyQSo1c1Ym7orWxLYvCrM2EmxFTANf8wXmmE7DWjhx5N";
        assert_eq!(url(addr), "wss://10.0.0.1:4001");
        assert!(translate("/ip4/10.0.0.1/tcp/4001/wss/p2p").is_err());
        assert!(translate("/ip4/10.0.0.1/tcp/4001/wss/p2p/Qm/extra").is_err());
    }

    #[test]
    fn test_scheme_selection() {
        assert_eq!(Scheme::from_protocol("ws"), Scheme::Ws);
        assert_eq!(Scheme::from_protocol("x-parity-ws"), Scheme::Ws);
        assert_eq!(Scheme::from_protocol("wss"), Scheme::Wss);
        assert_eq!(Scheme::from_protocol("x-parity-wss"), Scheme::Wss);
        assert_eq!(Scheme::from_protocol("anything-else"), Scheme::Wss);
        assert!(Scheme::Wss.is_secure());
        assert!(!Scheme::Ws.is_secure());
    }
}
