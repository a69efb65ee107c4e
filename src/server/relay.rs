//! Per-session relay loop
//!
//! One task per admitted link, pumping encoder output to the consumer and
//! interleaving heartbeat PINGs, until the link closes, the encoder goes
//! away, or the loop is torn down by the heartbeat scanner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::media::{MediaProcess, PipeRead};
use crate::protocol::control;
use crate::transport::{Link, LinkStatus};

use super::registry::SessionRegistry;

/// Pause before retrying when the pipe momentarily has no data but the
/// encoder is still alive.
const EMPTY_READ_BACKOFF: Duration = Duration::from_millis(5);

/// Spawn the relay loop for one admitted session.
pub(crate) fn spawn(
    registry: Arc<SessionRegistry>,
    link: Arc<dyn Link>,
    encoder: Arc<MediaProcess>,
    bytes_sent: Arc<AtomicU64>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        relay_loop(&registry, &link, &encoder, &bytes_sent).await;

        // Unconditional and idempotent; session and encoder cleanup happen
        // in the registry's link-closed handler, never here.
        link.teardown();
        tracing::debug!(link = %link.id(), "Relay loop ended");
    })
}

async fn relay_loop(
    registry: &SessionRegistry,
    link: &Arc<dyn Link>,
    encoder: &MediaProcess,
    bytes_sent: &AtomicU64,
) {
    let heartbeat_interval = registry.config().settings.heartbeat_interval;
    let poll_interval = registry.config().poll_interval;
    let expected_pid = encoder.pid();
    let mut buf = vec![0u8; registry.config().chunk_size];
    let mut last_ping_sent = Instant::now();

    tracing::info!(link = %link.id(), encoder_pid = expected_pid, "Relay loop started");

    loop {
        if link.status() != LinkStatus::Active {
            tracing::debug!(link = %link.id(), "Link no longer active, stopping relay");
            return;
        }

        if last_ping_sent.elapsed() > heartbeat_interval {
            tracing::trace!(link = %link.id(), "Sending PING");
            if let Err(e) = link.send(control::ping()) {
                tracing::debug!(link = %link.id(), error = %e, "Failed to send PING");
                return;
            }
            last_ping_sent = Instant::now();
        }

        // The registry may have restarted the encoder out from under this
        // session; a loop must never pump a pipe it was not started with.
        if !registry.encoder_matches(expected_pid).await {
            tracing::warn!(
                link = %link.id(),
                encoder_pid = expected_pid,
                "Encoder stopped or replaced, ending relay"
            );
            return;
        }

        match encoder.read_chunk(&mut buf, poll_interval).await {
            Ok(PipeRead::Data(n)) => {
                if let Err(e) = link.send(Bytes::copy_from_slice(&buf[..n])) {
                    tracing::debug!(link = %link.id(), error = %e, "Failed to send media chunk");
                    return;
                }
                bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
            }
            Ok(PipeRead::Empty) => {
                // Bounded wait elapsed; loop around to refresh the
                // heartbeat and liveness checks
            }
            Ok(PipeRead::Eof) => {
                if !encoder.is_alive().await {
                    tracing::info!(
                        link = %link.id(),
                        encoder_pid = expected_pid,
                        "Encoder ended mid-stream, stopping relay"
                    );
                    return;
                }
                // EOF-looking read with the process still up: give the
                // pipe a moment
                tokio::time::sleep(EMPTY_READ_BACKOFF).await;
            }
            Err(e) => {
                tracing::warn!(link = %link.id(), error = %e, "Encoder pipe read failed");
                return;
            }
        }
    }
}
