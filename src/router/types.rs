use std::time::Instant;

/// Produced by the selector, consumed by transport and the outcome recorder.
/// Immutable after creation.
#[derive(Debug, Clone)]
pub struct RequestDecision {
    pub host_used: String,
    pub backend_key: String,
    pub backend_list_len: usize,
    pub chosen_index: Option<u32>,
    pub chosen_url: Option<String>,
    pub start_time: Instant,
    pub all_dead: bool,
}

impl RequestDecision {
    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no such route")]
    NoRegisteredBackends,
    /// Carries the decision object anyway (label + list_len populated)
    /// so the outcome recorder can still produce a log line.
    #[error("all backends are dead")]
    AllBackendsDead(Box<RequestDecision>),
    #[error("store transport error: {0}")]
    StoreTransport(#[from] crate::store::StoreError),
}

/// Strips a trailing `:port` suffix from a host header value, if present.
/// Returns `None` when there is no port suffix to strip.
pub fn strip_port(host: &str) -> Option<&str> {
    // IPv6 literals carry colons in the address itself; only strip a port
    // that trails a `]` (bracketed literal) or a bare host with exactly one colon.
    if let Some(bracket_end) = host.rfind(']') {
        return host[bracket_end + 1..]
            .starts_with(':')
            .then(|| &host[..=bracket_end]);
    }
    let colon = host.rfind(':')?;
    if host[..colon].contains(':') {
        // Unbracketed IPv6 literal; nothing sane to strip.
        return None;
    }
    Some(&host[..colon])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_plain_port() {
        assert_eq!(strip_port("example.com:8080"), Some("example.com"));
    }

    #[test]
    fn leaves_bare_host_alone() {
        assert_eq!(strip_port("example.com"), None);
    }

    #[test]
    fn strips_bracketed_ipv6_port() {
        assert_eq!(strip_port("[::1]:8080"), Some("[::1]"));
    }
}
