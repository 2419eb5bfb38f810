//! Ping probe implementation using the system `ping` command.

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;

use super::ProbeError;

/// Run a ping probe against the given address.
///
/// Sends a single echo request, optionally through a specific interface, and
/// returns latency in nanoseconds.
pub async fn run_ping_probe(
    address: &str,
    timeout: Duration,
    interface: Option<&str>,
) -> Result<f64, ProbeError> {
    let args = ping_args(address, timeout, interface);

    let output = Command::new("ping")
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_packet_loss(&stdout, &stderr) {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!(
            "ping exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    parse_ping_output(&stdout)
}

/// Build the argument list for a single echo request.
fn ping_args(address: &str, timeout: Duration, interface: Option<&str>) -> Vec<String> {
    // -W takes whole seconds on Linux
    let timeout_secs = timeout.as_secs().max(1);

    let mut args = vec![
        "-c".to_string(),
        "1".to_string(),
        "-W".to_string(),
        timeout_secs.to_string(),
    ];
    if let Some(iface) = interface {
        args.push("-I".to_string());
        args.push(iface.to_string());
    }
    args.push(address.to_string());
    args
}

fn is_packet_loss(stdout: &str, stderr: &str) -> bool {
    stderr.contains("timeout")
        || stdout.contains("100% packet loss")
        || stdout.contains("100.0% packet loss")
        || stdout.contains(" 0 received")
        || stdout.contains(" 0 packets received")
}

/// Parse ping command output for latency.
fn parse_ping_output(output: &str) -> Result<f64, ProbeError> {
    // Per-packet reply "time=X.XXX ms" (Linux, macOS, busybox)
    static REPLY: OnceLock<Regex> = OnceLock::new();
    let reply = REPLY.get_or_init(|| {
        Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").expect("valid reply regex")
    });

    if let Some(ms) = reply
        .captures(output)
        .and_then(|caps| caps.name("val"))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return Ok(ms * 1_000_000.0);
    }

    // Summary line, average is the second field:
    // "round-trip min/avg/max/stddev = a/b/c/d ms" (macOS, busybox)
    // "rtt min/avg/max/mdev = a/b/c/d ms" (Linux)
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:round-trip|rtt)\s+min/avg/max(?:/(?:stddev|mdev))?\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)")
            .expect("valid summary regex")
    });

    if let Some(ms) = summary
        .captures(output)
        .and_then(|caps| caps.get(2))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return Ok(ms * 1_000_000.0);
    }

    Err(ProbeError::Command(format!(
        "failed to parse ping output: {}",
        output.trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_args_with_interface() {
        let args = ping_args("192.168.1.99", Duration::from_secs(3), Some("eth0"));
        assert_eq!(args, vec!["-c", "1", "-W", "3", "-I", "eth0", "192.168.1.99"]);
    }

    #[test]
    fn test_ping_args_sub_second_timeout() {
        let args = ping_args("8.8.8.8", Duration::from_millis(300), None);
        assert_eq!(args, vec!["-c", "1", "-W", "1", "8.8.8.8"]);
    }

    #[test]
    fn test_parse_ping_output_linux() {
        let output = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        let latency = parse_ping_output(output).unwrap();
        assert!((latency - 12_345_000.0).abs() < 1.0);
    }

    #[test]
    fn test_parse_ping_output_sub_millisecond() {
        let output = "64 bytes from 192.168.1.1: icmp_seq=1 ttl=64 time<1 ms";
        let latency = parse_ping_output(output).unwrap();
        assert!((latency - 1_000_000.0).abs() < 1.0);
    }

    #[test]
    fn test_parse_ping_output_busybox_summary() {
        let output = r#"PING 192.168.1.1 (192.168.1.1): 56 data bytes

--- 192.168.1.1 ping statistics ---
1 packets transmitted, 1 packets received, 0% packet loss
round-trip min/avg/max = 0.612/0.612/0.612 ms"#;
        let latency = parse_ping_output(output).unwrap();
        assert!((latency - 612_000.0).abs() < 1.0);
    }

    #[test]
    fn test_parse_ping_output_macos_summary() {
        let output = r#"--- google.com ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        let latency = parse_ping_output(output).unwrap();
        assert!((latency - 17_906_000.0).abs() < 1.0);
    }

    #[test]
    fn test_parse_ping_output_garbage() {
        assert!(parse_ping_output("ping: unknown host nowhere.invalid").is_err());
    }

    #[test]
    fn test_packet_loss_detection() {
        assert!(is_packet_loss(
            "1 packets transmitted, 0 received, 100% packet loss, time 0ms",
            ""
        ));
        assert!(!is_packet_loss(
            "1 packets transmitted, 1 received, 0% packet loss, time 0ms",
            ""
        ));
    }
}
