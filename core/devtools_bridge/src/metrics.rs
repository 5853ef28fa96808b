//! Lightweight Prometheus-compatible metrics for the bridge.
//!
//! Uses atomic counters for lock-free instrumentation from the signaling
//! thread, socket workers and tunnel writers. Renders metrics in Prometheus
//! text exposition format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lightweight Prometheus-compatible metrics for the bridge.
#[derive(Debug)]
pub struct Metrics {
    /// Sessions currently registered (gauge)
    pub active_sessions: AtomicU64,
    /// Total sessions created by the registry (counter)
    pub sessions_started_total: AtomicU64,
    /// Total sessions stopped for any reason (counter)
    pub sessions_closed_total: AtomicU64,
    /// Total tunnel connections acknowledged (counter)
    pub tunnel_connections_total: AtomicU64,
    /// Total local socket connect failures (counter)
    pub connect_failures_total: AtomicU64,
    /// Total local socket read/write errors (counter)
    pub socket_errors_total: AtomicU64,
    /// Total tunnel protocol errors, each closing a data channel (counter)
    pub protocol_errors_total: AtomicU64,
    /// Total bytes written to local sockets (counter)
    pub bytes_to_socket_total: AtomicU64,
    /// Total bytes relayed from local sockets to data channels (counter)
    pub bytes_to_channel_total: AtomicU64,
    /// Creation time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            active_sessions: AtomicU64::new(0),
            sessions_started_total: AtomicU64::new(0),
            sessions_closed_total: AtomicU64::new(0),
            tunnel_connections_total: AtomicU64::new(0),
            connect_failures_total: AtomicU64::new(0),
            socket_errors_total: AtomicU64::new(0),
            protocol_errors_total: AtomicU64::new(0),
            bytes_to_socket_total: AtomicU64::new(0),
            bytes_to_channel_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP devtools_bridge_active_sessions Current number of registered sessions\n\
             # TYPE devtools_bridge_active_sessions gauge\n\
             devtools_bridge_active_sessions {}\n\
             # HELP devtools_bridge_sessions_started_total Total sessions created\n\
             # TYPE devtools_bridge_sessions_started_total counter\n\
             devtools_bridge_sessions_started_total {}\n\
             # HELP devtools_bridge_sessions_closed_total Total sessions stopped\n\
             # TYPE devtools_bridge_sessions_closed_total counter\n\
             devtools_bridge_sessions_closed_total {}\n\
             # HELP devtools_bridge_tunnel_connections_total Total tunnel connections acknowledged\n\
             # TYPE devtools_bridge_tunnel_connections_total counter\n\
             devtools_bridge_tunnel_connections_total {}\n\
             # HELP devtools_bridge_connect_failures_total Total local socket connect failures\n\
             # TYPE devtools_bridge_connect_failures_total counter\n\
             devtools_bridge_connect_failures_total {}\n\
             # HELP devtools_bridge_socket_errors_total Total local socket I/O errors\n\
             # TYPE devtools_bridge_socket_errors_total counter\n\
             devtools_bridge_socket_errors_total {}\n\
             # HELP devtools_bridge_protocol_errors_total Total tunnel protocol errors\n\
             # TYPE devtools_bridge_protocol_errors_total counter\n\
             devtools_bridge_protocol_errors_total {}\n\
             # HELP devtools_bridge_bytes_to_socket_total Total bytes written to local sockets\n\
             # TYPE devtools_bridge_bytes_to_socket_total counter\n\
             devtools_bridge_bytes_to_socket_total {}\n\
             # HELP devtools_bridge_bytes_to_channel_total Total bytes sent on data channels\n\
             # TYPE devtools_bridge_bytes_to_channel_total counter\n\
             devtools_bridge_bytes_to_channel_total {}\n\
             # HELP devtools_bridge_uptime_seconds Uptime in seconds\n\
             # TYPE devtools_bridge_uptime_seconds gauge\n\
             devtools_bridge_uptime_seconds {}\n",
            self.active_sessions.load(Ordering::Relaxed),
            self.sessions_started_total.load(Ordering::Relaxed),
            self.sessions_closed_total.load(Ordering::Relaxed),
            self.tunnel_connections_total.load(Ordering::Relaxed),
            self.connect_failures_total.load(Ordering::Relaxed),
            self.socket_errors_total.load(Ordering::Relaxed),
            self.protocol_errors_total.load(Ordering::Relaxed),
            self.bytes_to_socket_total.load(Ordering::Relaxed),
            self.bytes_to_channel_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_format() {
        let m = Metrics::new();
        m.sessions_started_total.fetch_add(5, Ordering::Relaxed);
        m.bytes_to_socket_total.fetch_add(1024, Ordering::Relaxed);
        let output = m.render();
        assert!(output.contains("devtools_bridge_sessions_started_total 5"));
        assert!(output.contains("devtools_bridge_bytes_to_socket_total 1024"));
        assert!(output.contains("devtools_bridge_active_sessions 0"));
        assert!(output.contains("# TYPE devtools_bridge_uptime_seconds gauge"));
    }

    #[test]
    fn test_metrics_default_zero() {
        let m = Metrics::default();
        assert_eq!(m.active_sessions.load(Ordering::Relaxed), 0);
        assert_eq!(m.protocol_errors_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.connect_failures_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.bytes_to_channel_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_metrics_every_series_has_help_and_type() {
        let output = Metrics::new().render();
        let series = output
            .lines()
            .filter(|line| !line.starts_with('#'))
            .count();
        assert_eq!(series, 10);
        assert_eq!(output.matches("# HELP ").count(), series);
        assert_eq!(output.matches("# TYPE ").count(), series);
    }
}
