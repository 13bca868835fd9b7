// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

// Configuration model for Maccaronia Tunnel
//
// The on-disk form is a flat JSON document whose keys match the export files
// produced by the mobile app (`sshConfig.sshHost`, `protocol: "SSH"`, ...).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Transport protocol driving the packet dispatch path
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[default]
    #[serde(rename = "CUSTOM_UDP")]
    CustomUdp,
    #[serde(rename = "V2RAY")]
    V2Ray,
    #[serde(rename = "SSH")]
    Ssh,
    #[serde(rename = "SOCKS5")]
    Socks5,
    #[serde(rename = "HTTP")]
    Http,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::CustomUdp,
        Protocol::V2Ray,
        Protocol::Ssh,
        Protocol::Socks5,
        Protocol::Http,
    ];

    /// Whether a session on this protocol needs the SSH supervisor
    pub fn requires_ssh_tunnel(&self) -> bool {
        matches!(self, Protocol::Ssh)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::CustomUdp => "custom-udp",
            Protocol::V2Ray => "v2ray",
            Protocol::Ssh => "ssh",
            Protocol::Socks5 => "socks5",
            Protocol::Http => "http",
        };
        f.write_str(name)
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "custom-udp" | "udp" => Ok(Protocol::CustomUdp),
            "v2ray" => Ok(Protocol::V2Ray),
            "ssh" => Ok(Protocol::Ssh),
            "socks5" | "socks" => Ok(Protocol::Socks5),
            "http" => Ok(Protocol::Http),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// How the SSH process forwards traffic
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SshTunnelMethod {
    /// Forward straight to the configured server endpoint
    #[serde(rename = "DIRECT")]
    Direct,
    /// Dynamic SOCKS proxy (ssh -D)
    #[default]
    #[serde(rename = "DYNAMIC")]
    DynamicSocks,
    /// Local port forwarding (ssh -L)
    #[serde(rename = "LOCAL_FORWARDING")]
    LocalForward,
    /// Remote port forwarding (ssh -R)
    #[serde(rename = "REMOTE_FORWARDING")]
    RemoteForward,
}

impl SshTunnelMethod {
    /// Conventional local port when switching to this method
    pub fn default_local_port(&self) -> Option<u16> {
        match self {
            SshTunnelMethod::DynamicSocks => Some(1080),
            SshTunnelMethod::LocalForward => Some(8080),
            SshTunnelMethod::Direct | SshTunnelMethod::RemoteForward => None,
        }
    }

    /// Whether connections on the local listener speak SOCKS5
    pub fn speaks_socks(&self) -> bool {
        matches!(
            self,
            SshTunnelMethod::DynamicSocks | SshTunnelMethod::RemoteForward
        )
    }
}

impl fmt::Display for SshTunnelMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SshTunnelMethod::Direct => "direct",
            SshTunnelMethod::DynamicSocks => "dynamic",
            SshTunnelMethod::LocalForward => "local",
            SshTunnelMethod::RemoteForward => "remote",
        };
        f.write_str(name)
    }
}

impl FromStr for SshTunnelMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "direct" => Ok(SshTunnelMethod::Direct),
            "dynamic" | "dynamic-socks" | "socks" => Ok(SshTunnelMethod::DynamicSocks),
            "local" | "local-forward" | "local-forwarding" => Ok(SshTunnelMethod::LocalForward),
            "remote" | "remote-forward" | "remote-forwarding" => {
                Ok(SshTunnelMethod::RemoteForward)
            }
            other => Err(format!("unknown tunnel method '{}'", other)),
        }
    }
}

/// Complete tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub protocol: Protocol,
    /// Generic endpoint used by the non-SSH protocols
    #[serde(rename = "serverAddress")]
    pub server_address: String,
    #[serde(rename = "serverPort")]
    pub server_port: u16,
    #[serde(rename = "customUDPConfig")]
    pub custom_udp: CustomUdpConfig,
    #[serde(rename = "v2rayConfig")]
    pub v2ray: V2RayConfig,
    #[serde(rename = "sshConfig")]
    pub ssh: SshConfig,
    #[serde(rename = "dnsConfig")]
    pub dns: DnsConfig,
    #[serde(rename = "sniConfig")]
    pub sni: SniConfig,
    #[serde(rename = "payloadConfig")]
    pub payload: PayloadConfig,
    /// Top-level keys this version does not know, written back untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            server_address: String::new(),
            server_port: 0,
            custom_udp: CustomUdpConfig::default(),
            v2ray: V2RayConfig::default(),
            ssh: SshConfig::default(),
            dns: DnsConfig::default(),
            sni: SniConfig::default(),
            payload: PayloadConfig::default(),
            extra: Map::new(),
        }
    }
}

/// SSH tunnel parameters.
///
/// `zeroize()` wipes the credentials and leaves everything else intact.
#[derive(Clone, Serialize, Deserialize, PartialEq, Zeroize)]
#[serde(default)]
pub struct SshConfig {
    #[serde(rename = "enableSSH")]
    #[zeroize(skip)]
    pub enabled: bool,
    #[serde(rename = "sshHost")]
    #[zeroize(skip)]
    pub host: String,
    #[serde(rename = "sshPort")]
    #[zeroize(skip)]
    pub port: u16,
    #[serde(rename = "sshUsername")]
    #[zeroize(skip)]
    pub username: String,
    #[serde(rename = "sshPassword")]
    pub password: String,
    /// Path to a private key file, or the PEM text itself
    #[serde(rename = "sshPrivateKey")]
    pub private_key: String,
    #[serde(rename = "sshKeyPassphrase")]
    pub key_passphrase: String,
    #[serde(rename = "sshTunnelMethod")]
    #[zeroize(skip)]
    pub tunnel_method: SshTunnelMethod,
    #[serde(rename = "sshLocalPort")]
    #[zeroize(skip)]
    pub local_port: u16,
    #[serde(rename = "sshRemotePort")]
    #[zeroize(skip)]
    pub remote_port: u16,
    #[serde(rename = "sshCompression")]
    #[zeroize(skip)]
    pub compression: bool,
    /// ServerAliveInterval in seconds
    #[serde(rename = "sshKeepAlive")]
    #[zeroize(skip)]
    pub keep_alive_secs: u32,
}

// Default value functions
fn default_ssh_port() -> u16 {
    22
}

fn default_local_port() -> u16 {
    1080
}

fn default_remote_port() -> u16 {
    8080
}

fn default_keepalive() -> u32 {
    60
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: default_ssh_port(),
            username: String::new(),
            password: String::new(),
            private_key: String::new(),
            key_passphrase: String::new(),
            tunnel_method: SshTunnelMethod::default(),
            local_port: default_local_port(),
            remote_port: default_remote_port(),
            compression: true,
            keep_alive_secs: default_keepalive(),
        }
    }
}

// Manual Debug impl so credentials never reach the logs
impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("has_password", &!self.password.is_empty())
            .field("has_private_key", &!self.private_key.is_empty())
            .field("tunnel_method", &self.tunnel_method)
            .field("local_port", &self.local_port)
            .field("remote_port", &self.remote_port)
            .field("compression", &self.compression)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .finish()
    }
}

impl SshConfig {
    /// Key authentication takes precedence when both credentials are present
    pub fn uses_key_auth(&self) -> bool {
        !self.private_key.is_empty()
    }

    /// True when the private key field holds PEM text rather than a path
    pub fn private_key_is_inline(&self) -> bool {
        self.private_key.trim_start().starts_with("-----BEGIN")
    }
}

/// Custom-UDP codec parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CustomUdpConfig {
    #[serde(rename = "encryptionKey")]
    pub encryption_key: String,
    #[serde(rename = "packetSize")]
    pub packet_size: u32,
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,
}

impl Default for CustomUdpConfig {
    fn default() -> Self {
        Self {
            encryption_key: String::new(),
            packet_size: 1400,
            timeout_ms: 5000,
        }
    }
}

/// V2Ray routing parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct V2RayConfig {
    #[serde(rename = "inboundTag")]
    pub inbound_tag: String,
    #[serde(rename = "outboundTag")]
    pub outbound_tag: String,
    #[serde(rename = "routingRules")]
    pub routing_rules: String,
}

impl Default for V2RayConfig {
    fn default() -> Self {
        Self {
            inbound_tag: "proxy".to_string(),
            outbound_tag: "direct".to_string(),
            routing_rules: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DnsConfig {
    #[serde(rename = "primaryDNS")]
    pub primary: String,
    #[serde(rename = "secondaryDNS")]
    pub secondary: String,
    #[serde(rename = "dohServer")]
    pub doh_server: String,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            primary: "8.8.8.8".to_string(),
            secondary: "1.1.1.1".to_string(),
            doh_server: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SniConfig {
    pub hostname: String,
    #[serde(rename = "enableSNI")]
    pub enabled: bool,
}

impl Default for SniConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PayloadConfig {
    #[serde(rename = "customPayload")]
    pub custom_payload: String,
    #[serde(rename = "enablePayload")]
    pub enabled: bool,
}

/// A single missing or invalid setting found by [`validate`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigIssue {
    /// Dotted path of the offending field, e.g. `sshConfig.sshHost`
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    fn new(field: &str, message: &str) -> Self {
        Self {
            field: field.to_string(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl Config {
    /// Configuration for the given protocol with every other field defaulted
    pub fn for_protocol(protocol: Protocol) -> Self {
        Self {
            protocol,
            ..Default::default()
        }
    }

    /// Restore the SSH section to its defaults
    pub fn reset_ssh(&mut self) {
        self.ssh = SshConfig::default();
    }

    /// Validate the configuration for its active protocol
    pub fn validate(&self) -> Vec<ConfigIssue> {
        validate(self)
    }

    /// Validate and turn a non-empty issue list into `Error::Config`
    pub fn ensure_valid(&self) -> Result<()> {
        let issues = self.validate();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(issues))
        }
    }
}

/// Collect every missing or invalid field for the active protocol.
///
/// Never fails; an empty list means the configuration can start a session.
pub fn validate(config: &Config) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();

    match config.protocol {
        Protocol::Ssh => {
            let ssh = &config.ssh;
            if !ssh.enabled {
                issues.push(ConfigIssue::new(
                    "sshConfig.enableSSH",
                    "SSH must be enabled for the SSH protocol",
                ));
            }
            if ssh.host.trim().is_empty() {
                issues.push(ConfigIssue::new("sshConfig.sshHost", "Host cannot be empty"));
            }
            if ssh.username.trim().is_empty() {
                issues.push(ConfigIssue::new(
                    "sshConfig.sshUsername",
                    "Username cannot be empty",
                ));
            }
            if ssh.password.is_empty() && ssh.private_key.is_empty() {
                issues.push(ConfigIssue::new(
                    "sshConfig.sshPassword",
                    "Either a password or a private key is required",
                ));
            }
        }
        // Passthrough and the codecs start from defaults
        Protocol::CustomUdp | Protocol::V2Ray | Protocol::Socks5 | Protocol::Http => {}
    }

    issues
}

/// Serialize a configuration to its flat text form
pub fn serialize(config: &Config) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(config)?)
}

/// Parse a configuration from its flat text form.
///
/// Missing keys take their defaults; unknown top-level keys are kept in
/// [`Config::extra`].
pub fn deserialize(bytes: &[u8]) -> Result<Config> {
    Ok(serde_json::from_slice(bytes)?)
}
