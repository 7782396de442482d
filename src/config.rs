//! Session configuration.

use std::time::Duration;

/// Tunables for a multiplexer session.
///
/// Queue capacities are protocol-visible: together with the receive timeout
/// they are the only backpressure mechanism, so changing them changes how
/// much data a peer can have in flight before its writes stall.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Largest payload accepted in a single frame. Inbound frames above
    /// this terminate the session; outbound writes are split to fit.
    /// Default: 1 MiB.
    pub max_message_size: usize,

    /// How long the reader task will wait to hand an inbound payload to a
    /// stream's queue before resetting that stream. Guards the whole
    /// session against one slow consumer.
    /// Default: 5s.
    pub receive_timeout: Duration,

    /// How long `new_stream` may wait for space on the write queue.
    /// Default: 60s.
    pub new_stream_timeout: Duration,

    /// How long stream close/reset may wait for space on the write queue.
    /// Default: 120s.
    pub reset_stream_timeout: Duration,

    /// Capacity of the accept queue. Default: 16.
    pub accept_backlog: usize,

    /// Capacity of the outbound frame queue. Default: 16.
    pub write_backlog: usize,

    /// Capacity of each stream's inbound payload queue. Default: 8.
    pub stream_backlog: usize,

    /// When true, the writer task copies adjacent queued frames into one
    /// carrier write. Frame order and boundaries are preserved. Off by
    /// default to keep one frame per carrier write.
    pub write_coalescing: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_message_size: 1 << 20,
            receive_timeout: Duration::from_secs(5),
            new_stream_timeout: Duration::from_secs(60),
            reset_stream_timeout: Duration::from_secs(120),
            accept_backlog: 16,
            write_backlog: 16,
            stream_backlog: 8,
            write_coalescing: false,
        }
    }
}
