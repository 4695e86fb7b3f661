//! Background-task access log writer. Mirrors the ambient stack's
//! deduplicated-error-logger channel-plus-flush shape, but every record is
//! significant here (unlike repeated identical errors), so nothing is
//! deduplicated — only dropped under sustained backpressure.

use chrono::Utc;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

const CHANNEL_CAPACITY: usize = 10_000;
const DROP_NOTICE_COOLDOWN_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub remote_addr: String,
    pub method: String,
    pub path: String,
    pub proto: String,
    pub status: u16,
    pub content_length: u64,
    pub referer: String,
    pub user_agent: String,
    pub request_id_header: String,
    pub request_id: String,
    pub backend_key: String,
    pub forwarded_for: String,
    pub total_duration: std::time::Duration,
    pub backend_duration: std::time::Duration,
}

impl LogRecord {
    fn render(&self) -> String {
        format!(
            "{} - - [{}] \"{} {} {}\" {} {} \"{}\" \"{}\" \"{}:{}\" \"{}\" \"{}\" {:.3} {:.3}",
            client_ip(&self.remote_addr),
            Utc::now().timestamp(),
            self.method,
            self.path,
            self.proto,
            self.status,
            self.content_length,
            self.referer,
            self.user_agent,
            self.request_id_header,
            self.request_id,
            self.backend_key,
            self.forwarded_for,
            self.total_duration.as_secs_f64(),
            self.backend_duration.as_secs_f64(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub host: String,
    pub backend: Option<String>,
    pub path: String,
    pub request_id: String,
    pub message: String,
}

impl ErrorRecord {
    fn render(&self) -> String {
        format!(
            "ERROR in {} -> {} - {} - {} - {}",
            self.host,
            self.backend.as_deref().unwrap_or("?"),
            self.path,
            self.request_id,
            self.message,
        )
    }
}

/// Strips the port from a socket address string and prepends the
/// `::ffff:` IPv4-mapped prefix when the bare address isn't already IPv6,
/// so every log line carries a consistently-shaped client IP.
fn client_ip(remote_addr: &str) -> String {
    let without_port = crate::router::strip_port(remote_addr).unwrap_or(remote_addr);
    if without_port.starts_with("::") {
        without_port.to_string()
    } else {
        format!("::ffff:{}", without_port)
    }
}

enum Entry {
    Log(LogRecord),
    Error(ErrorRecord),
}

enum Destination {
    None,
    Stdout,
    File(String),
}

fn parse_destination(path: Option<&str>) -> Destination {
    match path {
        None | Some("none") | Some("") => Destination::None,
        Some("stdout") => Destination::Stdout,
        Some(p) => Destination::File(p.to_string()),
    }
}

pub struct LogSink {
    tx: Option<mpsc::Sender<Entry>>,
    enabled: bool,
    last_drop_notice: AtomicI64,
    dropped_since_notice: AtomicBool,
}

impl LogSink {
    /// Spawns the background writer and returns the sink handle.
    pub fn start(destination: Option<&str>, shutdown: CancellationToken) -> Arc<Self> {
        let destination = parse_destination(destination);
        let enabled = !matches!(destination, Destination::None);

        if !enabled {
            return Arc::new(Self {
                tx: None,
                enabled: false,
                last_drop_notice: AtomicI64::new(0),
                dropped_since_notice: AtomicBool::new(false),
            });
        }

        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut writer = open_writer(destination).await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        rx.close();
                        while let Some(entry) = rx.recv().await {
                            write_entry(&mut writer, &entry).await;
                        }
                        break;
                    }
                    entry = rx.recv() => {
                        match entry {
                            Some(entry) => write_entry(&mut writer, &entry).await,
                            None => break,
                        }
                    }
                }
            }
        });

        Arc::new(Self {
            tx: Some(tx),
            enabled: true,
            last_drop_notice: AtomicI64::new(0),
            dropped_since_notice: AtomicBool::new(false),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn submit(&self, record: LogRecord) {
        self.send(Entry::Log(record));
    }

    pub fn submit_error(&self, record: ErrorRecord) {
        self.send(Entry::Error(record));
    }

    fn send(&self, entry: Entry) {
        let Some(tx) = &self.tx else { return };
        if tx.try_send(entry).is_err() {
            self.note_dropped();
        }
    }

    fn note_dropped(&self) {
        let now = Utc::now().timestamp();
        let last = self.last_drop_notice.load(Ordering::Relaxed);
        if now - last >= DROP_NOTICE_COOLDOWN_SECS {
            self.last_drop_notice.store(now, Ordering::Relaxed);
            warn!(
                component = "accesslog",
                event = "records_dropped",
                "access log channel full; one or more records were dropped"
            );
        }
        self.dropped_since_notice.store(true, Ordering::Relaxed);
    }
}

enum Writer {
    Stdout,
    File(tokio::fs::File),
    Discard,
}

async fn open_writer(destination: Destination) -> Writer {
    match destination {
        Destination::None => Writer::Discard,
        Destination::Stdout => Writer::Stdout,
        Destination::File(path) => match OpenOptions::new().create(true).append(true).open(&path).await {
            Ok(f) => Writer::File(f),
            Err(e) => {
                error!(
                    component = "accesslog",
                    event = "open_failed",
                    path = %path,
                    error = %e,
                    "failed to open access log file, discarding records"
                );
                Writer::Discard
            }
        },
    }
}

async fn write_entry(writer: &mut Writer, entry: &Entry) {
    let line = match entry {
        Entry::Log(r) => r.render(),
        Entry::Error(r) => r.render(),
    };
    match writer {
        Writer::Discard => {}
        Writer::Stdout => {
            let mut stdout = std::io::stdout();
            let _ = writeln!(stdout, "{}", line);
        }
        Writer::File(f) => {
            let _ = f.write_all(line.as_bytes()).await;
            let _ = f.write_all(b"\n").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_strips_port_and_prepends_v4_mapped_prefix() {
        assert_eq!(client_ip("203.0.113.4:54321"), "::ffff:203.0.113.4");
        assert_eq!(client_ip("::1"), "::1");
    }

    #[test]
    fn log_record_renders_extended_common_log_shape() {
        let record = LogRecord {
            remote_addr: "203.0.113.4:54321".to_string(),
            method: "GET".to_string(),
            path: "/".to_string(),
            proto: "HTTP/1.1".to_string(),
            status: 200,
            content_length: 512,
            referer: "-".to_string(),
            user_agent: "curl/8.0".to_string(),
            request_id_header: "X-Request-Id".to_string(),
            request_id: "abc-123".to_string(),
            backend_key: "example".to_string(),
            forwarded_for: "203.0.113.4".to_string(),
            total_duration: std::time::Duration::from_millis(12),
            backend_duration: std::time::Duration::from_millis(10),
        };
        let line = record.render();
        assert!(line.starts_with("::ffff:203.0.113.4 - - ["));
        assert!(line.contains("\"GET / HTTP/1.1\""));
        assert!(line.contains("200 512"));
    }

    #[test]
    fn error_record_renders_fixed_shape() {
        let record = ErrorRecord {
            host: "example.com".to_string(),
            backend: None,
            path: "/".to_string(),
            request_id: "abc-123".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(record.render(), "ERROR in example.com -> ? - / - abc-123 - boom");
    }
}
