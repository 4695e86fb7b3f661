use std::sync::atomic::{AtomicU64, Ordering};

static REQUESTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static ERRORS_TOTAL: AtomicU64 = AtomicU64::new(0);
static PANICS_TOTAL: AtomicU64 = AtomicU64::new(0);
static STATUS_2XX: AtomicU64 = AtomicU64::new(0);
static STATUS_3XX: AtomicU64 = AtomicU64::new(0);
static STATUS_4XX: AtomicU64 = AtomicU64::new(0);
static STATUS_5XX: AtomicU64 = AtomicU64::new(0);
static ALL_DEAD_TOTAL: AtomicU64 = AtomicU64::new(0);
static BACKEND_MARKED_DEAD_TOTAL: AtomicU64 = AtomicU64::new(0);
static ACTIVE_PROBE_TASKS: AtomicU64 = AtomicU64::new(0);
static LEASE_ACQUIRED_TOTAL: AtomicU64 = AtomicU64::new(0);
static WS_UPGRADES_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Adds to the total request counter.
pub fn add_requests(value: u64) {
    REQUESTS_TOTAL.fetch_add(value, Ordering::Relaxed);
}

/// Adds to the error counter (transport/proxy failures, not HTTP 5xx from upstreams).
pub fn add_errors(value: u64) {
    ERRORS_TOTAL.fetch_add(value, Ordering::Relaxed);
}

/// Adds to the panic counter.
pub fn add_panics(value: u64) {
    PANICS_TOTAL.fetch_add(value, Ordering::Relaxed);
}

/// Records a response status code bucket.
pub fn record_status(code: u16) {
    match code {
        200..=299 => STATUS_2XX.fetch_add(1, Ordering::Relaxed),
        300..=399 => STATUS_3XX.fetch_add(1, Ordering::Relaxed),
        400..=499 => STATUS_4XX.fetch_add(1, Ordering::Relaxed),
        _ => STATUS_5XX.fetch_add(1, Ordering::Relaxed),
    };
}

/// Counts a request that found no live backend for its virtual host.
pub fn add_all_dead(value: u64) {
    ALL_DEAD_TOTAL.fetch_add(value, Ordering::Relaxed);
}

/// Counts a backend being marked dead after a failed delivery.
pub fn add_backend_marked_dead(value: u64) {
    BACKEND_MARKED_DEAD_TOTAL.fetch_add(value, Ordering::Relaxed);
}

/// Adjusts the gauge of currently-running probe tasks.
pub fn inc_active_probe_tasks() {
    ACTIVE_PROBE_TASKS.fetch_add(1, Ordering::Relaxed);
}

/// See [`inc_active_probe_tasks`].
pub fn dec_active_probe_tasks() {
    ACTIVE_PROBE_TASKS.fetch_sub(1, Ordering::Relaxed);
}

/// Counts a successful exclusive probe lease acquisition.
pub fn add_lease_acquired(value: u64) {
    LEASE_ACQUIRED_TOTAL.fetch_add(value, Ordering::Relaxed);
}

/// Counts a WebSocket upgrade handled via the raw passthrough path.
pub fn add_ws_upgrades(value: u64) {
    WS_UPGRADES_TOTAL.fetch_add(value, Ordering::Relaxed);
}

/// Renders the current counters as Prometheus text exposition format.
pub fn render() -> String {
    let mut out = String::new();

    out.push_str("# HELP roxxy_requests_total Total requests accepted by the proxy.\n");
    out.push_str("# TYPE roxxy_requests_total counter\n");
    out.push_str(&format!(
        "roxxy_requests_total {}\n",
        REQUESTS_TOTAL.load(Ordering::Relaxed)
    ));

    out.push_str("# HELP roxxy_errors_total Total transport/proxy errors.\n");
    out.push_str("# TYPE roxxy_errors_total counter\n");
    out.push_str(&format!(
        "roxxy_errors_total {}\n",
        ERRORS_TOTAL.load(Ordering::Relaxed)
    ));

    out.push_str("# HELP roxxy_panics_total Total recovered request-handler panics.\n");
    out.push_str("# TYPE roxxy_panics_total counter\n");
    out.push_str(&format!(
        "roxxy_panics_total {}\n",
        PANICS_TOTAL.load(Ordering::Relaxed)
    ));

    out.push_str("# HELP roxxy_responses_total Responses by status class.\n");
    out.push_str("# TYPE roxxy_responses_total counter\n");
    out.push_str(&format!(
        "roxxy_responses_total{{class=\"2xx\"}} {}\n",
        STATUS_2XX.load(Ordering::Relaxed)
    ));
    out.push_str(&format!(
        "roxxy_responses_total{{class=\"3xx\"}} {}\n",
        STATUS_3XX.load(Ordering::Relaxed)
    ));
    out.push_str(&format!(
        "roxxy_responses_total{{class=\"4xx\"}} {}\n",
        STATUS_4XX.load(Ordering::Relaxed)
    ));
    out.push_str(&format!(
        "roxxy_responses_total{{class=\"5xx\"}} {}\n",
        STATUS_5XX.load(Ordering::Relaxed)
    ));

    out.push_str("# HELP roxxy_all_dead_total Requests with no live backend for their host.\n");
    out.push_str("# TYPE roxxy_all_dead_total counter\n");
    out.push_str(&format!(
        "roxxy_all_dead_total {}\n",
        ALL_DEAD_TOTAL.load(Ordering::Relaxed)
    ));

    out.push_str("# HELP roxxy_backend_marked_dead_total Backends marked dead after a failed delivery.\n");
    out.push_str("# TYPE roxxy_backend_marked_dead_total counter\n");
    out.push_str(&format!(
        "roxxy_backend_marked_dead_total {}\n",
        BACKEND_MARKED_DEAD_TOTAL.load(Ordering::Relaxed)
    ));

    out.push_str("# HELP roxxy_active_probe_tasks Currently running backend health probes.\n");
    out.push_str("# TYPE roxxy_active_probe_tasks gauge\n");
    out.push_str(&format!(
        "roxxy_active_probe_tasks {}\n",
        ACTIVE_PROBE_TASKS.load(Ordering::Relaxed)
    ));

    out.push_str("# HELP roxxy_lease_acquired_total Exclusive probe leases acquired across the fleet.\n");
    out.push_str("# TYPE roxxy_lease_acquired_total counter\n");
    out.push_str(&format!(
        "roxxy_lease_acquired_total {}\n",
        LEASE_ACQUIRED_TOTAL.load(Ordering::Relaxed)
    ));

    out.push_str("# HELP roxxy_ws_upgrades_total WebSocket connections passed through.\n");
    out.push_str("# TYPE roxxy_ws_upgrades_total counter\n");
    out.push_str(&format!(
        "roxxy_ws_upgrades_total {}\n",
        WS_UPGRADES_TOTAL.load(Ordering::Relaxed)
    ));

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_all_metric_families() {
        add_requests(1);
        add_errors(1);
        add_panics(1);
        record_status(200);
        record_status(503);
        add_all_dead(1);
        add_backend_marked_dead(1);
        inc_active_probe_tasks();
        dec_active_probe_tasks();
        add_lease_acquired(1);
        add_ws_upgrades(1);

        let text = render();
        assert!(text.contains("roxxy_requests_total"));
        assert!(text.contains("roxxy_responses_total{class=\"2xx\"}"));
        assert!(text.contains("roxxy_responses_total{class=\"5xx\"}"));
        assert!(text.contains("roxxy_all_dead_total"));
        assert!(text.contains("roxxy_lease_acquired_total"));
        assert!(text.contains("roxxy_ws_upgrades_total"));
    }
}
