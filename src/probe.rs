use std::time::{Duration, Instant};

use log::debug;

use crate::network::ProbeOutcome;

/// HTTP reachability probe with a hard upper bound on how long it can take.
///
/// Any response, whatever the status, counts as reachable; the latency is
/// the time to response headers. Timeouts, DNS failures and refused
/// connections all come back as `ProbeOutcome::Failed`, never as an error.
pub struct ConnectivityProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl ConnectivityProbe {
    pub fn new(url: &str, timeout_secs: f64) -> Self {
        let timeout = Duration::from_secs_f64(timeout_secs.max(0.1));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("drive-guard/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        ConnectivityProbe {
            client,
            url: url.to_string(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn measure(&self) -> ProbeOutcome {
        let start = Instant::now();
        let request = self.client.head(&self.url).send();
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(_response)) => ProbeOutcome::Latency {
                ms: start.elapsed().as_secs_f64() * 1000.0,
            },
            Ok(Err(e)) => {
                debug!("Probe to {} failed: {}", self.url, e);
                ProbeOutcome::Failed
            }
            Err(_) => {
                debug!("Probe to {} timed out after {:?}", self.url, self.timeout);
                ProbeOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_host_is_a_failed_sample() {
        // Port 9 on loopback: refused immediately on any sane host
        let probe = ConnectivityProbe::new("http://127.0.0.1:9/", 1.0);
        assert_eq!(probe.measure().await, ProbeOutcome::Failed);
    }

    #[tokio::test]
    async fn test_local_server_reports_latency() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                    .await;
            }
        });

        let probe = ConnectivityProbe::new(&format!("http://{}/generate_204", addr), 5.0);
        match probe.measure().await {
            ProbeOutcome::Latency { ms } => assert!(ms >= 0.0 && ms < 5000.0),
            ProbeOutcome::Failed => panic!("local probe should succeed"),
        }
    }
}
