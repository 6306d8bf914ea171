//! Readiness probe for the container HEALTHCHECK
//!
//! Polls the application's listen address until a TCP connection
//! succeeds and, when an HTTP path is configured, until a GET on it
//! returns anything below 500. A 404 still proves the WSGI server is up
//! and routing; a 502/503 means it is not ready yet.

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpStream;

use crate::config::ListenAddr;

/// Default startup window
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default delay between attempts
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{target} not ready after {elapsed:?} ({attempts} attempts): {last}")]
    NotReady {
        target: String,
        elapsed: Duration,
        attempts: u32,
        last: String,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub host: String,
    pub port: u16,
    /// GET this path once the port accepts connections
    pub http_path: Option<String>,
    /// Overall window
    pub timeout: Duration,
    pub interval: Duration,
}

impl ProbeOptions {
    /// Probe the address the application was told to bind.
    /// Wildcard binds are probed over loopback.
    pub fn for_listen(listen: &ListenAddr) -> Self {
        let host = match listen.host.as_str() {
            "0.0.0.0" | "" => "127.0.0.1".to_string(),
            "::" | "[::]" => "::1".to_string(),
            other => other.trim_matches(|c| c == '[' || c == ']').to_string(),
        };
        Self {
            host,
            port: listen.port,
            http_path: None,
            timeout: DEFAULT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
        }
    }

    fn target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn url(&self, path: &str) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        format!("http://{}{}", self.target(), path)
    }
}

/// Successful probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub attempts: u32,
    pub elapsed: Duration,
    /// HTTP status when an HTTP check was made
    pub status: Option<u16>,
}

/// Poll until ready or the window closes
pub async fn wait_ready(options: &ProbeOptions) -> Result<ProbeOutcome, ProbeError> {
    let start = Instant::now();
    let target = options.target();
    let client = match &options.http_path {
        Some(_) => Some(
            reqwest::Client::builder()
                .no_proxy()
                .timeout(options.interval.max(Duration::from_secs(1)))
                .build()?,
        ),
        None => None,
    };

    let mut attempts = 0u32;
    loop {
        attempts += 1;

        let remaining = options.timeout.saturating_sub(start.elapsed());
        let last = match attempt(options, &target, client.as_ref(), remaining).await {
            Ok(status) => {
                tracing::debug!(addr = %target, attempts, ?status, "probe succeeded");
                return Ok(ProbeOutcome {
                    attempts,
                    elapsed: start.elapsed(),
                    status,
                });
            }
            Err(reason) => reason,
        };

        tracing::debug!(addr = %target, attempts, reason = %last, "not ready");

        if start.elapsed() + options.interval >= options.timeout {
            return Err(ProbeError::NotReady {
                target,
                elapsed: start.elapsed(),
                attempts,
                last,
            });
        }

        tokio::time::sleep(options.interval).await;
    }
}

/// One attempt; Err carries a human-readable reason
async fn attempt(
    options: &ProbeOptions,
    target: &str,
    client: Option<&reqwest::Client>,
    remaining: Duration,
) -> Result<Option<u16>, String> {
    let connect_window = remaining.max(Duration::from_millis(100));
    match tokio::time::timeout(connect_window, TcpStream::connect(target)).await {
        Ok(Ok(_stream)) => {}
        Ok(Err(e)) => return Err(format!("connect: {}", e)),
        Err(_) => return Err("connect: timed out".to_string()),
    }

    let (Some(client), Some(path)) = (client, options.http_path.as_deref()) else {
        return Ok(None);
    };

    let response = client
        .get(options.url(path))
        .send()
        .await
        .map_err(|e| format!("http: {}", e))?;

    let status = response.status();
    if status.is_server_error() {
        Err(format!("http: status {}", status.as_u16()))
    } else {
        Ok(Some(status.as_u16()))
    }
}

/// Run the probe on a private current-thread runtime
pub fn wait_ready_blocking(options: &ProbeOptions) -> Result<ProbeOutcome, ProbeError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(wait_ready(options))
}
