//! WebSocket dialer.
//!
//! [`WebSocketTransport`] turns a multiaddr into a URL, asks the host
//! [`SocketConnector`] for a socket, and resolves once the socket reports
//! open (or fails). Listening is not available in this environment.

use crate::TransportConfig;
use crate::address::{self, ConnectionTarget};
use crate::connection::{Connection, ConnectionShared, DrainPolicy};
use crate::socket::{MessageSocket, SocketConnector, SocketEvents};
use crate::transport::{Transport, TransportError, TransportResult};
use async_trait::async_trait;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::debug;

/// Dial-only transport over host message sockets.
///
/// # Examples
///
/// ```no_run
/// use wsdial_transport::{Transport, TransportConfig};
/// use wsdial_transport::testing::MockConnector;
/// use wsdial_transport::websocket::WebSocketTransport;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = TransportConfig::default().with_dial_timeout(Duration::from_secs(10));
/// let transport = WebSocketTransport::with_config(MockConnector::auto_open(), config)?;
///
/// let conn = transport.dial("/dns4/example.com/tcp/443/wss").await?;
/// assert_eq!(conn.remote_url(), "wss://example.com:443");
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct WebSocketTransport<C> {
    connector: C,
    config: TransportConfig,
}

impl<C: SocketConnector> WebSocketTransport<C> {
    /// Create a transport with the default configuration
    #[must_use]
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            config: TransportConfig::default(),
        }
    }

    /// Create a transport with a custom configuration.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidConfig` if `config` fails validation.
    pub fn with_config(connector: C, config: TransportConfig) -> TransportResult<Self> {
        config.validate()?;
        Ok(Self { connector, config })
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Underlying socket connector
    #[must_use]
    pub fn connector(&self) -> &C {
        &self.connector
    }

    async fn dial_target(
        &self,
        target: ConnectionTarget,
    ) -> TransportResult<Connection<C::Socket>> {
        let url = target.url();
        debug!("Dialing {}", url);

        let (shared, opened) = ConnectionShared::new(self.config.read_buffer_warn_threshold);
        let socket = self
            .connector
            .connect(&url, SocketEvents::new(Arc::clone(&shared)))
            .map_err(|e| {
                debug!("Connector failed for {}: {}", url, e);
                TransportError::SocketError(e.to_string())
            })?;

        let guard = DialGuard {
            shared: &shared,
            socket: &socket,
            armed: true,
        };

        let outcome = match self.config.dial_timeout() {
            Some(limit) => match tokio::time::timeout(limit, opened).await {
                Ok(result) => result,
                Err(_) => {
                    debug!("Dial to {} timed out after {:?}", url, limit);
                    return Err(TransportError::DialTimeout(limit));
                }
            },
            None => opened.await,
        };

        match outcome {
            Ok(Ok(())) => {
                guard.disarm();
                debug!("Connected to {}", url);
                let drain = DrainPolicy {
                    grace: self.config.drain_grace(),
                    poll_interval: self.config.drain_poll_interval(),
                };
                Ok(Connection::new(socket, shared, url, drain))
            }
            Ok(Err(e)) => {
                debug!("Dial to {} failed: {}", url, e);
                Err(e)
            }
            // Sender dropped without an outcome; shouldn't happen while `shared` lives
            Err(_) => Err(TransportError::SocketError(
                "socket dropped before reporting open".to_string(),
            )),
        }
    }
}

/// Closes the socket of a dial that never produced a `Connection`, including
/// one whose future was dropped mid-flight.
struct DialGuard<'a, S: MessageSocket> {
    shared: &'a ConnectionShared,
    socket: &'a S,
    armed: bool,
}

impl<S: MessageSocket> DialGuard<'_, S> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<S: MessageSocket> Drop for DialGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.fail_dial();
            self.socket.close();
        }
    }
}

#[async_trait]
impl<C: SocketConnector> Transport for WebSocketTransport<C> {
    type Output = Connection<C::Socket>;
    type Listener = Infallible;

    async fn dial(&self, addr: &str) -> TransportResult<Self::Output> {
        let target = address::translate(addr)?;
        self.dial_target(target).await
    }

    fn listen_on(&self, _addr: &str) -> TransportResult<Infallible> {
        Err(TransportError::NotSupported("listen"))
    }

    fn can_dial(&self, addr: &str) -> bool {
        address::is_dialable(addr)
    }
}
