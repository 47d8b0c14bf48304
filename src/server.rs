//! TCP listener, accept loop, and shutdown orchestration.
//!
//! The server owns the listening socket and wires the shared pieces
//! together: one generator task, one reporter task, and per accepted
//! connection a handler task plus a supervisor that force-closes the
//! connection when shutdown fires. There is no graceful drain; shutdown
//! aborts whatever each handler is doing, including a blocked write.

use crate::config::Config;
use crate::connection::{handle_connection, HandlerContext};
use crate::events::{Event, EventSink};
use crate::generator::{LineFeed, LineGenerator};
use crate::registry::PeerRegistry;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How often the reporter publishes the distinct-address count.
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Server instance
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    config: Config,
    registry: Arc<PeerRegistry>,
    events: Arc<dyn EventSink>,
    shutdown: CancellationToken,
}

impl Server {
    /// Bind the listening socket. A bind failure is fatal to the process.
    pub async fn bind(
        config: Config,
        events: Arc<dyn EventSink>,
        shutdown: CancellationToken,
    ) -> Result<Self, ServerError> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Server {
            listener,
            config,
            registry: Arc::new(PeerRegistry::new()),
            events,
            shutdown,
        })
    }

    /// Address the listener actually bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop until it fails or shutdown fires.
    ///
    /// Always returns an error: either a genuine accept failure or
    /// [`ServerError::ListenerClosed`] once shutdown closes the listener.
    /// Both end the process; callers decide how loudly to report them.
    pub async fn run(self) -> Result<(), ServerError> {
        let (generator, feed) = LineGenerator::new(self.config.max_line_length);
        tokio::spawn(generator.run());

        tokio::spawn(report_distinct_addrs(
            Arc::clone(&self.registry),
            Arc::clone(&self.events),
            self.shutdown.clone(),
            REPORT_INTERVAL,
        ));

        let conn_count = Arc::new(AtomicU64::new(0));

        loop {
            let (stream, addr) = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(ServerError::ListenerClosed),
                res = self.listener.accept() => res.map_err(ServerError::Accept)?,
            };
            debug!(peer = %addr, "accepted connection");

            let ctx = HandlerContext {
                delay: self.config.delay,
                feed: LineFeed::clone(&feed),
                registry: Arc::clone(&self.registry),
                events: Arc::clone(&self.events),
                conn_count: Arc::clone(&conn_count),
                shutdown: self.shutdown.clone(),
            };
            let handler = tokio::spawn(handle_connection(stream, addr, ctx));
            tokio::spawn(supervise(handler, self.shutdown.clone()));
        }
    }
}

/// Force-close one connection when shutdown fires.
///
/// The handler reacts to the shutdown token at its own wait points; aborting
/// it here additionally unblocks a pending socket write. Cleanup still runs
/// because the handler's guard is dropped with the task, and the resulting
/// double close of the socket is harmless.
async fn supervise(mut handler: JoinHandle<()>, shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {
            handler.abort();
            let _ = handler.await;
        }
        _ = &mut handler => {}
    }
}

/// Publish the distinct-address count on a fixed interval until shutdown.
async fn report_distinct_addrs(
    registry: Arc<PeerRegistry>,
    events: Arc<dyn EventSink>,
    shutdown: CancellationToken,
    interval: Duration,
) {
    loop {
        let nb_addrs = registry.distinct();
        info!(nb_addrs, "number of distinct remote addresses");
        events.emit(Event::DistinctAddrs { nb_addrs });
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Fatal server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(std::io::Error),
    #[error("listener closed by shutdown")]
    ListenerClosed,
}

impl ServerError {
    /// True when the accept loop ended because shutdown was requested,
    /// which operators should treat as a normal exit.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, ServerError::ListenerClosed)
    }
}
