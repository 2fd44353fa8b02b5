//! Readiness detection for freshly spawned dev servers.

use regex::Regex;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Banner lines printed by common dev servers once they accept connections.
pub const DEFAULT_READY_PATTERN: &str = r"(?i)(\bready\b|local:\s+https?://|listening on|compiled successfully|started server on)";

/// Interval between HTTP probes.
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 500;
/// Per-request timeout for a single HTTP probe.
const PROBE_REQUEST_TIMEOUT_MS: u64 = 2000;

/// How a session decides that its dev server is up.
#[derive(Debug, Clone)]
pub enum ReadinessProbe {
    /// A captured output line matches the pattern.
    LogPattern(Regex),
    /// An HTTP request to the assigned port gets any response.
    Http { path: String, interval: Duration },
}

impl ReadinessProbe {
    pub fn log_pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::LogPattern(Regex::new(pattern)?))
    }

    pub fn http(path: &str) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Self::Http {
            path,
            interval: Duration::from_millis(DEFAULT_PROBE_INTERVAL_MS),
        }
    }

    /// True if `line` signals readiness. Always false for HTTP probes.
    pub fn matches_line(&self, line: &str) -> bool {
        match self {
            Self::LogPattern(re) => re.is_match(line),
            Self::Http { .. } => false,
        }
    }

    /// Poll interval, if this probe polls at all.
    pub fn poll_interval(&self) -> Option<Duration> {
        match self {
            Self::LogPattern(_) => None,
            Self::Http { interval, .. } => Some(*interval),
        }
    }

    pub fn probe_url(&self, port: u16) -> Option<String> {
        match self {
            Self::LogPattern(_) => None,
            Self::Http { path, .. } => Some(format!("http://127.0.0.1:{port}{path}")),
        }
    }
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        // Falls back to polling `/` if the built-in pattern fails to compile.
        Regex::new(DEFAULT_READY_PATTERN)
            .map(Self::LogPattern)
            .unwrap_or_else(|_| Self::http("/"))
    }
}

/// HTTP prober shared by all sessions.
#[derive(Clone)]
pub struct HttpProber {
    client: Client,
}

impl HttpProber {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(PROBE_REQUEST_TIMEOUT_MS))
            .no_proxy()
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    /// Any response (even 4xx/5xx) means the server is up.
    pub async fn is_up(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(resp) => {
                debug!(url, status = %resp.status(), "Readiness probe answered");
                true
            }
            Err(e) => {
                debug!(url, error = %e, "Readiness probe not answered yet");
                false
            }
        }
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_probe_watches_output() {
        assert!(matches!(ReadinessProbe::default(), ReadinessProbe::LogPattern(_)));
        assert!(ReadinessProbe::default().probe_url(3002).is_none());
    }

    #[test]
    fn default_pattern_matches_common_banners() {
        let probe = ReadinessProbe::default();
        assert!(probe.matches_line("  VITE v5.0.0  ready in 312 ms"));
        assert!(probe.matches_line("  ➜  Local:   http://localhost:3002/"));
        assert!(probe.matches_line("ready - started server on 0.0.0.0:3002"));
        assert!(probe.matches_line("Server listening on port 3002"));
        assert!(probe.matches_line("webpack compiled successfully"));
        assert!(!probe.matches_line("npm WARN deprecated glob@7.2.3"));
        assert!(!probe.matches_line("already installed"));
    }

    #[test]
    fn custom_pattern() {
        let probe = ReadinessProbe::log_pattern("^UP$").unwrap();
        assert!(probe.matches_line("UP"));
        assert!(!probe.matches_line("UP!"));
        assert!(probe.poll_interval().is_none());
        assert!(probe.probe_url(3002).is_none());
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(ReadinessProbe::log_pattern("(unclosed").is_err());
    }

    #[test]
    fn http_probe_url() {
        let probe = ReadinessProbe::http("health");
        assert_eq!(
            probe.probe_url(3004).as_deref(),
            Some("http://127.0.0.1:3004/health")
        );
        assert!(!probe.matches_line("ready"));
        assert!(probe.poll_interval().is_some());
    }

    #[tokio::test]
    async fn http_prober_detects_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
                    .await;
            }
        });

        let prober = HttpProber::new();
        let url = ReadinessProbe::http("/").probe_url(port).unwrap();
        assert!(prober.is_up(&url).await);
    }
}
