use crate::auth::{AuthFailure, AuthProvider, AuthStream};
use crate::authorization::Event;
use crate::program_config::KnockServerConfig;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Duration, Instant};

/// Pause after a failed accept, e.g. while out of file descriptors
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Authenticates a single connection and reports the outcome to the authorization reactor.
///
/// Nothing is ever written back to the client: a knock either works or silently does not.
pub struct ConnectionHandler {
    auth_provider: Box<dyn AuthProvider>,
    timeout: Duration,
    grant_time: Duration,
    events: mpsc::Sender<Event>,
}

impl ConnectionHandler {
    pub fn new(
        auth_provider: Box<dyn AuthProvider>,
        timeout: Duration,
        grant_time: Duration,
        events: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            auth_provider,
            timeout,
            grant_time,
            events,
        }
    }

    pub async fn handle(&self, stream: &mut dyn AuthStream, peer_address: SocketAddr) {
        let result = timeout(
            self.timeout,
            self.auth_provider.authenticate(stream, peer_address),
        )
        .await
        .unwrap_or(Err(AuthFailure::Timeout));

        let authenticated = match result {
            Ok(authenticated) => authenticated,
            Err(e) => {
                log::info!("Authentication of {} failed: {}", peer_address, e);
                return;
            }
        };

        let address = authenticated.address;
        let expiry = authenticated
            .expiry
            .unwrap_or_else(|| Instant::now() + self.grant_time);
        log::info!("Authenticated {} until {}", address, wall_clock(expiry));

        // Waits while the queue is full, so a busy reactor slows down the knock server
        if self
            .events
            .send(Event::Authenticated { address, expiry })
            .await
            .is_err()
        {
            log::warn!("Dropping authorization of {}: reactor has stopped", address);
        }
    }
}

fn wall_clock(instant: Instant) -> String {
    let remaining = chrono::Duration::from_std(instant.saturating_duration_since(Instant::now()))
        .unwrap_or_else(|_| chrono::Duration::zero());
    (chrono::Local::now() + remaining).to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
}

pub struct KnockServer {
    tcp_listener: TcpListener,
    processing_limit: Arc<Semaphore>,
    handler: ConnectionHandler,
}

impl KnockServer {
    pub async fn new(
        settings: KnockServerConfig,
        handler: ConnectionHandler,
    ) -> anyhow::Result<Arc<Self>> {
        let bind_socket_addr = SocketAddr::new(settings.bind.into(), settings.port);

        let tcp_listener = TcpListener::bind(bind_socket_addr)
            .await
            .with_context(|| format!("Failed to bind TCP server socket at {}", bind_socket_addr))?;

        Ok(Arc::new(Self {
            tcp_listener,
            processing_limit: Arc::new(Semaphore::new(settings.max_connections as usize)),
            handler,
        }))
    }

    /// The port actually listened on, which differs from the configured one if that was 0
    pub fn local_port(&self) -> anyhow::Result<u16> {
        let local_addr = self
            .tcp_listener
            .local_addr()
            .context("Failed to query local address of TCP server socket")?;
        Ok(local_addr.port())
    }

    /// Only returns on error
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            let connection_permit = self
                .processing_limit
                .clone()
                .acquire_owned()
                .await
                .context("Connection limit semaphore closed")?;

            // Accept connection
            let (stream, client_address) = match self.tcp_listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            // Process connection; a panicking handler only loses its own connection
            let server = self.clone();
            let connection = tokio::spawn(async move {
                server
                    .process_tcp_connection(connection_permit, stream, client_address)
                    .await
            });
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    log::error!("Connection handler for {} failed: {}", client_address, e);
                }
            });
        }
    }

    async fn process_tcp_connection(
        &self,
        _connection_permit: OwnedSemaphorePermit,
        mut stream: TcpStream,
        client_address: SocketAddr,
    ) {
        log::debug!("Connection from {}", client_address);
        self.handler.handle(&mut stream, client_address).await;
    }
}
