//! HTTP reachability probe.

use super::ProbeError;

use reqwest::redirect::Policy;
use std::time::{Duration, Instant};

/// Send a `HEAD` request and time the response headers, in nanoseconds.
///
/// Any status code counts as reachable: a 503 from a captive portal or an
/// overloaded server still proves packets made the round trip.
pub async fn run_http_probe(address: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let url = probe_url(address);
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .redirect(Policy::none())
        .build()
        .map_err(|e| ProbeError::Config(format!("cannot build HTTP client: {}", e)))?;

    let start = Instant::now();
    let response = client.head(&url).send().await.map_err(|e| classify(e, timeout))?;
    let elapsed = start.elapsed();

    tracing::trace!("HEAD {} -> {} in {:?}", url, response.status(), elapsed);
    Ok(elapsed.as_nanos() as f64)
}

fn classify(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(timeout)
    } else if e.is_builder() {
        ProbeError::Config(e.to_string())
    } else {
        ProbeError::Network(e.to_string())
    }
}

/// Bare hosts are probed over plain HTTP.
fn probe_url(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}/", address.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_probe_url() {
        assert_eq!(probe_url("example.com"), "http://example.com/");
        assert_eq!(probe_url("10.0.0.1:8080/"), "http://10.0.0.1:8080/");
        assert_eq!(probe_url("https://example.com/health"), "https://example.com/health");
    }

    #[tokio::test]
    async fn test_error_status_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let latency = run_http_probe(&addr.to_string(), Duration::from_secs(5)).await.unwrap();
        assert!(latency > 0.0);

        let request = server.await.unwrap();
        assert!(request.starts_with("HEAD / HTTP/1.1"), "{}", request);
    }

    #[tokio::test]
    async fn test_unroutable_host_fails() {
        let result = run_http_probe("http://256.256.256.256", Duration::from_millis(100)).await;
        assert!(result.is_err());
    }
}
