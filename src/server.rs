//! FastAGI connection listener

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::{
    constants::DEFAULT_FASTAGI_ADDR,
    error::{AgiError, AgiResult},
    session::{AgiSession, AgiSessionOptions},
};

/// FastAGI listener configuration.
#[derive(Debug, Clone)]
pub struct FastAgiConfig {
    /// Address to bind. Default: `localhost:4573`.
    pub address: String,
    /// Options applied to every accepted session.
    pub session: AgiSessionOptions,
}

impl Default for FastAgiConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_FASTAGI_ADDR.to_string(),
            session: AgiSessionOptions::default(),
        }
    }
}

impl FastAgiConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }
}

/// FastAGI server: accepts connections from Asterisk's `AGI(agi://...)` and
/// hands each one to a handler as an [`AgiSession`].
///
/// ```rust,no_run
/// use asterisk_agi_tokio::{AgiError, FastAgiConfig, FastAgiServer};
///
/// #[tokio::main]
/// async fn main() -> Result<(), AgiError> {
///     let server = FastAgiServer::bind(FastAgiConfig::new("0.0.0.0:4573")).await?;
///     server
///         .serve(|session| async move {
///             let _ = session.answer().await;
///             let _ = session.stream_file("hello-world", "").await;
///             let _ = session.hangup(None).await;
///         })
///         .await
/// }
/// ```
#[derive(Debug)]
pub struct FastAgiServer {
    listener: TcpListener,
    options: AgiSessionOptions,
}

impl FastAgiServer {
    /// Bind the listening socket.
    pub async fn bind(config: FastAgiConfig) -> AgiResult<Self> {
        let listener = TcpListener::bind(&config.address)
            .await
            .map_err(|source| AgiError::Bind {
                addr: config
                    .address
                    .clone(),
                source,
            })?;
        info!(
            "FastAGI server listening on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or(config.address)
        );
        Ok(Self::from_listener(listener, config.session))
    }

    /// Wrap an already bound listener.
    pub fn from_listener(listener: TcpListener, options: AgiSessionOptions) -> Self {
        Self { listener, options }
    }

    pub fn local_addr(&self) -> AgiResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(AgiError::Io)
    }

    /// Accept connections forever, running `handler` on its own task for
    /// each session. Returns only when accepting fails.
    pub async fn serve<F, Fut>(self, handler: F) -> AgiResult<()>
    where
        F: Fn(AgiSession) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.serve_with_shutdown(handler, std::future::pending())
            .await
    }

    /// Like [`serve`](Self::serve), stopping when `shutdown` completes.
    ///
    /// Sessions already handed to the handler keep running.
    pub async fn serve_with_shutdown<F, Fut, S>(self, handler: F, shutdown: S) -> AgiResult<()>
    where
        F: Fn(AgiSession) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        S: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        tokio::pin!(shutdown);

        loop {
            let (stream, addr) = tokio::select! {
                _ = &mut shutdown => {
                    info!("FastAGI server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted.map_err(AgiError::Accept)?,
            };

            info!("Accepted FastAGI connection from {}", addr);
            tokio::spawn(handle_connection(
                stream,
                addr,
                self.options
                    .clone(),
                Arc::clone(&handler),
            ));
        }
    }
}

/// Run the handshake on the connection's own task, then the handler.
async fn handle_connection<F, Fut>(
    stream: TcpStream,
    addr: SocketAddr,
    options: AgiSessionOptions,
    handler: Arc<F>,
) where
    F: Fn(AgiSession) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let session = match AgiSession::from_tcp(stream, options).await {
        Ok(session) => session,
        Err(e) => {
            warn!("FastAGI handshake from {} failed: {}", addr, e);
            return;
        }
    };

    debug!(
        "FastAGI session from {} for {}",
        addr,
        session
            .request()
            .unwrap_or("?")
    );
    handler(session.clone()).await;

    if let Err(e) = session
        .close()
        .await
    {
        debug!("Closing FastAGI session from {}: {}", addr, e);
    }
}

/// Bind `address` (default `localhost:4573`) and serve forever.
pub async fn listen<F, Fut>(address: Option<&str>, handler: F) -> AgiResult<()>
where
    F: Fn(AgiSession) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let config = FastAgiConfig::new(address.unwrap_or(DEFAULT_FASTAGI_ADDR));
    FastAgiServer::bind(config)
        .await?
        .serve(handler)
        .await
}
