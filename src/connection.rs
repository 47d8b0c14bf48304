//! Per-connection stall loop.
//!
//! Each accepted connection runs one handler task: wait half the configured
//! delay, then repeat "write one garbage line, wait the full delay" until
//! the peer gives up, the write fails, or shutdown is requested. The initial
//! half-delay decorrelates write timing across connections opened at the
//! same instant, so probes cannot observe a synchronized cadence.

use crate::events::{Event, EventSink};
use crate::generator::LineFeed;
use crate::registry::PeerRegistry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Everything a handler needs besides the socket itself.
#[derive(Clone)]
pub struct HandlerContext {
    pub delay: Duration,
    pub feed: LineFeed,
    pub registry: Arc<PeerRegistry>,
    pub events: Arc<dyn EventSink>,
    pub conn_count: Arc<AtomicU64>,
    pub shutdown: CancellationToken,
}

/// RAII guard so bookkeeping and the "connection closed" event run exactly
/// once on every exit path, including a supervisory task abort.
struct ConnectionGuard {
    registry: Arc<PeerRegistry>,
    events: Arc<dyn EventSink>,
    conn_count: Arc<AtomicU64>,
    remote: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.conn_count.fetch_sub(1, Ordering::Relaxed);
        self.registry.sub(&self.remote);
        info!(addr = %self.remote, "connection closed");
        self.events.emit(Event::ConnectionClosed {
            addr: self.remote.clone(),
        });
    }
}

/// Run the stall loop for one accepted connection.
///
/// Never returns an error: write failures and shutdown both just end this
/// connection. The socket closes when the stream drops.
pub async fn handle_connection(mut stream: TcpStream, addr: SocketAddr, ctx: HandlerContext) {
    let remote = addr.ip().to_string();
    ctx.registry.add(&remote);
    let nb_connections = ctx.conn_count.fetch_add(1, Ordering::Relaxed) + 1;
    info!(addr = %remote, nb_connections, "new connection");
    ctx.events.emit(Event::NewConnection {
        addr: remote.clone(),
        nb_connections,
    });

    let _guard = ConnectionGuard {
        registry: Arc::clone(&ctx.registry),
        events: Arc::clone(&ctx.events),
        conn_count: Arc::clone(&ctx.conn_count),
        remote: remote.clone(),
    };

    tokio::select! {
        _ = ctx.shutdown.cancelled() => return,
        _ = tokio::time::sleep(ctx.delay / 2) => {}
    }

    loop {
        // A missing generator means the process is tearing down.
        let Some(line) = ctx.feed.next_line().await else {
            return;
        };
        // The write itself is not raced against shutdown; the server's
        // supervisor aborts this task if it stays blocked here.
        if let Err(e) = stream.write_all(&line).await {
            debug!(addr = %remote, error = %e, "write failed, dropping connection");
            return;
        }
        tokio::select! {
            _ = ctx.shutdown.cancelled() => return,
            _ = tokio::time::sleep(ctx.delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::generator::LineGenerator;
    use std::time::Instant;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    struct Fixture {
        ctx: HandlerContext,
        events: Arc<RecordingSink>,
    }

    fn fixture(delay: Duration) -> Fixture {
        let (generator, feed) = LineGenerator::with_seed(10, 99);
        tokio::spawn(generator.run());
        let events = Arc::new(RecordingSink::default());
        Fixture {
            ctx: HandlerContext {
                delay,
                feed,
                registry: Arc::new(PeerRegistry::new()),
                events: Arc::clone(&events) as Arc<dyn EventSink>,
                conn_count: Arc::new(AtomicU64::new(0)),
                shutdown: CancellationToken::new(),
            },
            events,
        }
    }

    /// Accept one connection and hand it to a spawned handler, returning
    /// the client side of the socket and the handler's join handle.
    async fn connect_pair(ctx: HandlerContext) -> (TcpStream, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let client = TcpStream::connect(local).await.unwrap();
        let (stream, addr) = listener.accept().await.unwrap();
        let handle = tokio::spawn(handle_connection(stream, addr, ctx));
        (client, handle)
    }

    #[tokio::test]
    async fn test_lines_arrive_on_the_configured_cadence() {
        let delay = Duration::from_millis(200);
        let fx = fixture(delay);
        let (mut client, _handle) = connect_pair(fx.ctx.clone()).await;

        let start = Instant::now();
        let mut buf = [0u8; 256];

        let n = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let first = start.elapsed();
        assert!(n >= 3, "short read: {n}");
        assert_eq!(&buf[n - 2..n], b"\r\n");
        assert!(first >= delay / 2, "first line too early: {first:?}");

        let n = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let second = start.elapsed();
        assert!(n >= 3);
        assert!(second - first >= delay, "lines spaced too closely");

        assert_eq!(fx.ctx.registry.distinct(), 1);
        assert_eq!(fx.ctx.conn_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_cancellation_closes_the_connection() {
        let fx = fixture(Duration::from_secs(60));
        let (mut client, handle) = connect_pair(fx.ctx.clone()).await;

        // Let the handler settle into its initial wait.
        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.ctx.shutdown.cancel();

        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0, "expected EOF after cancellation");

        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(fx.ctx.registry.distinct(), 0);
        assert_eq!(fx.ctx.conn_count.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_peer_reset_cleans_up_exactly_once() {
        let fx = fixture(Duration::from_millis(20));
        let (client, handle) = connect_pair(fx.ctx.clone()).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(client);

        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(fx.ctx.registry.distinct(), 0);
        assert_eq!(fx.ctx.conn_count.load(Ordering::Relaxed), 0);

        let events = fx.events.events();
        let closed = events
            .iter()
            .filter(|e| matches!(e, Event::ConnectionClosed { .. }))
            .count();
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn test_abort_still_runs_cleanup() {
        let fx = fixture(Duration::from_secs(60));
        let (_client, handle) = connect_pair(fx.ctx.clone()).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.ctx.conn_count.load(Ordering::Relaxed), 1);

        handle.abort();
        let err = timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_cancelled());

        assert_eq!(fx.ctx.registry.distinct(), 0);
        assert_eq!(fx.ctx.conn_count.load(Ordering::Relaxed), 0);
        let events = fx.events.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::ConnectionClosed { .. })));
    }

    #[tokio::test]
    async fn test_new_connection_event_carries_count() {
        let fx = fixture(Duration::from_secs(60));
        let (_client_a, _a) = connect_pair(fx.ctx.clone()).await;
        let (_client_b, _b) = connect_pair(fx.ctx.clone()).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = fx.events.events();
        let counts: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                Event::NewConnection { nb_connections, .. } => Some(*nb_connections),
                _ => None,
            })
            .collect();
        assert_eq!(counts.len(), 2);
        assert!(counts.contains(&1) && counts.contains(&2));
    }
}
