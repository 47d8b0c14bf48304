//! Garbage banner line generation.
//!
//! One long-lived task owns the RNG and produces lines on demand. Delivery
//! is a rendezvous: a consumer sends a reply slot through `LineFeed` and the
//! generator fills it, so line production is serialized across the whole
//! process and each line reaches exactly one connection. Under N concurrent
//! connections the feed is a shared resource, not per-connection buffering.

use crate::config::MIN_LINE_LENGTH;
use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot};

/// A real SSH client would lock onto this prefix as an identification
/// banner, ending the stall early. Generated lines must never start with it.
const BANNER_PREFIX: &[u8] = b"SSH-";

/// The service task that produces garbage lines.
pub struct LineGenerator {
    requests: mpsc::Receiver<oneshot::Sender<Bytes>>,
    rng: SmallRng,
    max_line_length: u8,
}

/// Cloneable handle for pulling lines out of the generator.
#[derive(Clone)]
pub struct LineFeed {
    requests: mpsc::Sender<oneshot::Sender<Bytes>>,
}

impl LineGenerator {
    /// Create a generator seeded from OS entropy.
    ///
    /// `max_line_length` must already be clamped to `[3, 255]` by the
    /// configuration layer.
    pub fn new(max_line_length: u8) -> (Self, LineFeed) {
        Self::with_rng(max_line_length, SmallRng::from_entropy())
    }

    /// Create a generator with a fixed seed, for reproducible output.
    #[cfg(test)]
    pub fn with_seed(max_line_length: u8, seed: u64) -> (Self, LineFeed) {
        Self::with_rng(max_line_length, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(max_line_length: u8, rng: SmallRng) -> (Self, LineFeed) {
        let (tx, rx) = mpsc::channel(1);
        (
            Self {
                requests: rx,
                rng,
                max_line_length: max_line_length.max(MIN_LINE_LENGTH),
            },
            LineFeed { requests: tx },
        )
    }

    /// Serve line requests until every `LineFeed` handle is gone.
    ///
    /// Never errors; a consumer that went away before receiving its line
    /// just discards it.
    pub async fn run(mut self) {
        while let Some(reply) = self.requests.recv().await {
            let line = random_line(&mut self.rng, self.max_line_length);
            let _ = reply.send(line);
        }
    }
}

impl LineFeed {
    /// Wait for the next generated line.
    ///
    /// Returns `None` only if the generator task is gone, which handlers
    /// treat like any other reason to end the connection.
    pub async fn next_line(&self) -> Option<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.requests.send(tx).await.ok()?;
        rx.await.ok()
    }
}

/// Produce one line: random length in `[3, max_len]`, printable ASCII body,
/// CR LF terminator.
fn random_line(rng: &mut SmallRng, max_len: u8) -> Bytes {
    let len = rng.gen_range(usize::from(MIN_LINE_LENGTH)..=usize::from(max_len));
    let mut line = vec![0u8; len];
    for byte in &mut line[..len - 2] {
        *byte = rng.gen_range(32..=126);
    }
    line[len - 2] = b'\r';
    line[len - 1] = b'\n';
    scrub_banner_prefix(&mut line);
    Bytes::from(line)
}

/// If the line happens to start with the SSH identification prefix,
/// overwrite the first byte so it no longer matches.
fn scrub_banner_prefix(line: &mut [u8]) {
    if line.starts_with(BANNER_PREFIX) {
        line[0] = b'X';
    }
}
