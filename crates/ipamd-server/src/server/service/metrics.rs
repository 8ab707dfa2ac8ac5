use crate::server::telemetry::{increment_add_ip_requests, increment_del_ip_requests};
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use std::collections::HashMap;

/// Distinct release reasons tracked before new ones are folded into
/// [`OTHER_REASON`]. The plugin sends a small fixed set, but the field is
/// free-form.
pub const MAX_DEL_REASONS: usize = 32;

/// Label used for reasons beyond [`MAX_DEL_REASONS`].
pub const OTHER_REASON: &str = "other";

/// Request counters for the `CNIBackend` service.
///
/// Every increment is also forwarded to the OpenTelemetry counters when the
/// `metrics` feature is enabled. Release counts are keyed by reason, with at
/// most [`MAX_DEL_REASONS`] distinct keys plus [`OTHER_REASON`].
#[derive(Debug, Default)]
pub struct RpcMetrics {
    add_ip_requests: AtomicU64,
    del_ip_requests: Mutex<HashMap<String, u64>>,
}

impl RpcMetrics {
    pub fn record_add(&self) {
        self.add_ip_requests.fetch_add(1, Ordering::Relaxed);
        increment_add_ip_requests();
    }

    pub fn record_del(&self, reason: &str) {
        let mut counts = self.del_ip_requests.lock();
        let label = if counts.contains_key(reason) || counts.len() < MAX_DEL_REASONS {
            reason
        } else {
            OTHER_REASON
        };
        *counts.entry(label.to_owned()).or_default() += 1;
        drop(counts);
        increment_del_ip_requests(label);
    }

    pub fn add_ip_requests(&self) -> u64 {
        self.add_ip_requests.load(Ordering::Relaxed)
    }

    /// Number of release requests seen with `reason`.
    #[cfg(test)]
    pub fn del_ip_requests(&self, reason: &str) -> u64 {
        self.del_ip_requests
            .lock()
            .get(reason)
            .copied()
            .unwrap_or_default()
    }

    /// Release requests across all reasons.
    pub fn del_ip_requests_total(&self) -> u64 {
        self.del_ip_requests.lock().values().sum()
    }
}
