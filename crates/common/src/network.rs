// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

// Network helpers shared by the daemon and the CLI

use std::net::{IpAddr, SocketAddr};

/// Check if a host is a loopback address.
/// Accepts IPv4 127/8, IPv6 ::1 and the name "localhost".
pub fn is_loopback_address(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback(),
        // Unparseable hosts are treated as remote
        Err(_) => false,
    }
}

/// Join host and port, bracketing IPv6 literals
pub fn format_host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => SocketAddr::from((v6, port)).to_string(),
        _ => format!("{}:{}", host, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_loopback_address() {
        assert!(is_loopback_address("127.0.0.1"));
        assert!(is_loopback_address("127.10.0.3"));
        assert!(is_loopback_address("::1"));
        assert!(is_loopback_address("LocalHost"));

        assert!(!is_loopback_address("0.0.0.0"));
        assert!(!is_loopback_address("10.0.0.2"));
        assert!(!is_loopback_address("vpn.example.com"));
        assert!(!is_loopback_address("::"));
    }

    #[test]
    fn test_format_host_port() {
        assert_eq!(format_host_port("example.com", 22), "example.com:22");
        assert_eq!(format_host_port("10.0.0.1", 443), "10.0.0.1:443");
        assert_eq!(format_host_port("::1", 1080), "[::1]:1080");
    }
}
