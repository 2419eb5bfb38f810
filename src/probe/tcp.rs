//! TCP connect probe.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpSocket, TcpStream};

use super::ProbeError;

const DEFAULT_PORT: u16 = 80;

/// Run a TCP probe: a successful three-way handshake means reachable.
///
/// Returns connect latency in nanoseconds.
pub async fn run_tcp_probe(
    address: &str,
    timeout: Duration,
    interface: Option<&str>,
) -> Result<f64, ProbeError> {
    let (host, port) = split_host_port(address)?;
    let addr = resolve(&host, port).await?;

    let start = Instant::now();
    let stream = tokio::time::timeout(timeout, connect(addr, interface))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("connect to {} failed: {}", addr, e)))?;
    let elapsed = start.elapsed().as_nanos() as f64;

    drop(stream);
    Ok(elapsed)
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ProbeError> {
    if let Ok(ip) = host.parse() {
        return Ok(SocketAddr::new(ip, port));
    }

    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", host)))
}

async fn connect(addr: SocketAddr, interface: Option<&str>) -> std::io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    if let Some(iface) = interface {
        socket.bind_device(Some(iface.as_bytes()))?;
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    if interface.is_some() {
        tracing::debug!("Interface binding is not supported on this platform, ignoring");
    }

    let std_stream: std::net::TcpStream = socket.into();
    TcpSocket::from_std_stream(std_stream).connect(addr).await
}

/// Split `host:port`, `[v6]:port`, bare host or bare IPv6 literal.
fn split_host_port(address: &str) -> Result<(String, u16), ProbeError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(ProbeError::Config("empty TCP address".to_string()));
    }

    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ProbeError::Config(format!("unterminated IPv6 literal: {}", address)))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => parse_port(p, address)?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(ProbeError::Config(format!("invalid address: {}", address))),
        };
        return Ok((host.to_string(), port));
    }

    match address.rsplit_once(':') {
        // More than one colon without brackets: a bare IPv6 literal
        Some((host, _)) if host.contains(':') => Ok((address.to_string(), DEFAULT_PORT)),
        Some((host, port)) => Ok((host.to_string(), parse_port(port, address)?)),
        None => Ok((address.to_string(), DEFAULT_PORT)),
    }
}

fn parse_port(port: &str, address: &str) -> Result<u16, ProbeError> {
    port.parse()
        .map_err(|_| ProbeError::Config(format!("invalid port in {}", address)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("1.1.1.1:53").unwrap(), ("1.1.1.1".to_string(), 53));
        assert_eq!(split_host_port("example.com").unwrap(), ("example.com".to_string(), 80));
        assert_eq!(split_host_port("[::1]:8443").unwrap(), ("::1".to_string(), 8443));
        assert_eq!(split_host_port("[::1]").unwrap(), ("::1".to_string(), 80));
        assert_eq!(split_host_port("fe80::1").unwrap(), ("fe80::1".to_string(), 80));
        assert!(split_host_port("host:http").is_err());
        assert!(split_host_port("[::1").is_err());
        assert!(split_host_port("").is_err());
    }

    #[tokio::test]
    async fn test_tcp_probe_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let latency = run_tcp_probe(&addr.to_string(), Duration::from_secs(2), None)
            .await
            .unwrap();
        assert!(latency > 0.0);
    }

    #[tokio::test]
    async fn test_tcp_probe_refused() {
        // Bind then drop to get a port that is very likely closed
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = run_tcp_probe(&addr.to_string(), Duration::from_secs(2), None).await;
        assert!(result.is_err());
    }
}
