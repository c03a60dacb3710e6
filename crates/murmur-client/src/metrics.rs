//! Client metrics.
//!
//! Uses the `metrics` facade; installing an exporter is up to the host
//! application. Without one every call is a no-op.

use metrics::{counter, gauge, histogram};
use murmur_protocol::FrameKind;
use std::time::Duration;
use tracing::debug;

/// Metric names.
pub mod names {
    pub const FRAMES_SENT: &str = "murmur_frames_sent_total";
    pub const FRAMES_RECEIVED: &str = "murmur_frames_received_total";
    pub const FRAMES_DROPPED: &str = "murmur_frames_dropped_total";
    pub const RECONNECT_ATTEMPTS: &str = "murmur_reconnect_attempts_total";
    pub const RPC_CALLS: &str = "murmur_rpc_calls_total";
    pub const RPC_PENDING: &str = "murmur_rpc_pending";
    pub const RPC_LATENCY_SECONDS: &str = "murmur_rpc_latency_seconds";
}

/// Describe every client metric to the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(names::FRAMES_SENT, "Frames written to the socket");
    metrics::describe_counter!(names::FRAMES_RECEIVED, "Frames decoded from the socket");
    metrics::describe_counter!(
        names::FRAMES_DROPPED,
        "Frames dropped: undecodable, queue overflow or submitted while offline"
    );
    metrics::describe_counter!(names::RECONNECT_ATTEMPTS, "Scheduled reconnect attempts");
    metrics::describe_counter!(names::RPC_CALLS, "Completed RPC calls by outcome");
    metrics::describe_gauge!(names::RPC_PENDING, "RPC calls awaiting a response");
    metrics::describe_histogram!(
        names::RPC_LATENCY_SECONDS,
        "Time from request to response in seconds"
    );

    debug!("Client metrics described");
}

pub fn record_frame_sent(kind: FrameKind) {
    counter!(names::FRAMES_SENT, "kind" => kind.as_tag()).increment(1);
}

pub fn record_frame_received(kind: FrameKind) {
    counter!(names::FRAMES_RECEIVED, "kind" => kind.as_tag()).increment(1);
}

/// `reason` is one of `decode`, `encode`, `queue_full`, `offline`.
pub fn record_frame_dropped(reason: &'static str) {
    record_frames_dropped(reason, 1);
}

pub fn record_frames_dropped(reason: &'static str, count: u64) {
    counter!(names::FRAMES_DROPPED, "reason" => reason).increment(count);
}

pub fn record_reconnect_attempt() {
    counter!(names::RECONNECT_ATTEMPTS).increment(1);
}

/// `outcome` is one of `ok`, `error`, `timeout`, `connection_lost`.
pub fn record_rpc_outcome(outcome: &'static str) {
    counter!(names::RPC_CALLS, "outcome" => outcome).increment(1);
}

pub fn record_rpc_latency(elapsed: Duration) {
    histogram!(names::RPC_LATENCY_SECONDS).record(elapsed.as_secs_f64());
}

pub fn set_pending_calls(count: usize) {
    gauge!(names::RPC_PENDING).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        // No recorder installed: everything is a no-op
        describe_metrics();
        record_frame_sent(FrameKind::Ping);
        record_frame_dropped("queue_full");
        record_rpc_outcome("ok");
        record_rpc_latency(Duration::from_millis(12));
        set_pending_calls(3);
    }
}
