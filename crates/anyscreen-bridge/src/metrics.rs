use crate::batch::InvalidateReason;
use anyscreen_proto::RequestType;
use core::time::Duration;
use metrics::{counter, gauge, histogram};

pub fn observe_request(kind: RequestType, bytes: usize, dur: Duration) {
    let ns = dur.as_nanos().min(u64::MAX as u128) as u64;
    counter!("anyscreen_requests_total", "kind" => kind.as_str()).increment(1);
    counter!("anyscreen_request_bytes", "kind" => kind.as_str()).increment(bytes as u64);
    histogram!("anyscreen_request_latency_ns", "kind" => kind.as_str()).record(ns as f64);
}

pub fn observe_transfer(kind: RequestType, bytes: usize, dur: Duration) {
    let ns = dur.as_nanos().min(u64::MAX as u128) as u64;
    counter!("anyscreen_transfers_total", "kind" => kind.as_str()).increment(1);
    counter!("anyscreen_transfer_bytes", "kind" => kind.as_str()).increment(bytes as u64);
    histogram!("anyscreen_transfer_latency_ns", "kind" => kind.as_str()).record(ns as f64);
}

pub fn record_queue_depth(count: usize) {
    gauge!("anyscreen_queue_depth").set(count as f64);
}

pub fn batch_refilled() {
    counter!("anyscreen_batch_refills_total").increment(1);
}

pub fn batch_invalidated(reason: InvalidateReason) {
    counter!("anyscreen_batch_invalidations_total", "reason" => reason.as_str()).increment(1);
}

pub fn session_aborted(pending: usize) {
    counter!("anyscreen_sessions_aborted_total").increment(1);
    gauge!("anyscreen_requests_dropped_on_abort").set(pending as f64);
}
