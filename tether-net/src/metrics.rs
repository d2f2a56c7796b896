// SPDX-License-Identifier: MIT
//
// Tether: Secure Network Transport and Protocol Layer
// Copyright (c) 2025 Tether Contributors
//
// https://github.com/yourusername/tether

//! Metrics collection and reporting

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared counters for every connection created by one runtime
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    start_time: Instant,

    // HTTP request metrics
    requests_total: AtomicU64,
    requests_failed: AtomicU64,
    bytes_received: AtomicU64,

    // Handshake metrics
    handshakes_completed: AtomicU64,
    handshakes_failed: AtomicU64,

    // WebSocket metrics
    frames_sent: AtomicU64,
    frames_received: AtomicU64,

    // Task pool metrics
    pool_saturated: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("requests_total", &self.requests_total())
            .field("handshakes_completed", &self.handshakes_completed())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                start_time: Instant::now(),
                requests_total: AtomicU64::new(0),
                requests_failed: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                handshakes_completed: AtomicU64::new(0),
                handshakes_failed: AtomicU64::new(0),
                frames_sent: AtomicU64::new(0),
                frames_received: AtomicU64::new(0),
                pool_saturated: AtomicU64::new(0),
            }),
        }
    }

    // Request metrics
    pub fn record_request(&self, bytes: usize) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_request_failure(&self) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
        self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_total(&self) -> u64 {
        self.inner.requests_total.load(Ordering::Relaxed)
    }

    pub fn requests_failed(&self) -> u64 {
        self.inner.requests_failed.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::Relaxed)
    }

    // Handshake metrics
    pub fn record_handshake(&self, ok: bool) {
        if ok {
            self.inner.handshakes_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.handshakes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn handshakes_completed(&self) -> u64 {
        self.inner.handshakes_completed.load(Ordering::Relaxed)
    }

    pub fn handshakes_failed(&self) -> u64 {
        self.inner.handshakes_failed.load(Ordering::Relaxed)
    }

    // WebSocket metrics
    pub fn record_frame_sent(&self) {
        self.inner.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_received(&self) {
        self.inner.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_sent(&self) -> u64 {
        self.inner.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.inner.frames_received.load(Ordering::Relaxed)
    }

    // Pool metrics
    pub fn record_pool_saturated(&self) {
        self.inner.pool_saturated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pool_saturated(&self) -> u64 {
        self.inner.pool_saturated.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn prometheus_format(&self) -> String {
        let mut output = String::new();

        let counters = [
            ("tether_requests_total", "Total number of HTTP requests", self.requests_total()),
            ("tether_requests_failed", "Total number of failed HTTP requests", self.requests_failed()),
            ("tether_bytes_received", "Total HTTP body bytes received", self.bytes_received()),
            ("tether_handshakes_completed", "Completed TLS/DTLS handshakes", self.handshakes_completed()),
            ("tether_handshakes_failed", "Failed TLS/DTLS handshakes", self.handshakes_failed()),
            ("tether_ws_frames_sent", "WebSocket frames written", self.frames_sent()),
            ("tether_ws_frames_received", "WebSocket frames read", self.frames_received()),
            ("tether_pool_saturated", "Dispatches refused because every slot was busy", self.pool_saturated()),
        ];

        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, value));
        }

        output.push_str("# HELP tether_uptime_seconds Runtime uptime in seconds\n");
        output.push_str("# TYPE tether_uptime_seconds gauge\n");
        output.push_str(&format!("tether_uptime_seconds {}\n", self.uptime_seconds()));

        output
    }
}
