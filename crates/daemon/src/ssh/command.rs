// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

// Argument construction for the external ssh client

use std::path::{Path, PathBuf};

use maccaronia_common::{SshConfig, SshTunnelMethod};

/// Forwarding requested from the ssh process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Forwarding {
    /// `-D 127.0.0.1:<port>`: ssh serves SOCKS5 on a private loopback port
    Dynamic { port: u16 },
    /// `-L 127.0.0.1:<port>:<host>:<host_port>`
    Local {
        port: u16,
        target_host: String,
        target_port: u16,
    },
    /// `-R <remote_port>:127.0.0.1:<local_port>`
    Remote { remote_port: u16, local_port: u16 },
}

impl Forwarding {
    /// Plan the forwarding for the configured method.
    ///
    /// `forward_port` is the private loopback port ssh listens on; the
    /// supervisor's own listener keeps `local_port`.
    pub fn for_method(
        ssh: &SshConfig,
        forward_port: u16,
        server_address: &str,
        server_port: u16,
    ) -> Self {
        match ssh.tunnel_method {
            SshTunnelMethod::DynamicSocks => Forwarding::Dynamic { port: forward_port },
            SshTunnelMethod::Direct => Forwarding::Local {
                port: forward_port,
                target_host: server_address.to_string(),
                target_port: server_port,
            },
            SshTunnelMethod::LocalForward => Forwarding::Local {
                port: forward_port,
                target_host: "127.0.0.1".to_string(),
                target_port: ssh.remote_port,
            },
            SshTunnelMethod::RemoteForward => Forwarding::Remote {
                remote_port: ssh.remote_port,
                local_port: ssh.local_port,
            },
        }
    }

    /// Loopback port on which ssh accepts connections from the supervisor
    pub fn relay_port(&self) -> Option<u16> {
        match self {
            Forwarding::Dynamic { port } | Forwarding::Local { port, .. } => Some(*port),
            Forwarding::Remote { .. } => None,
        }
    }

    fn push_args(&self, args: &mut Vec<String>) {
        match self {
            Forwarding::Dynamic { port } => {
                args.push("-D".to_string());
                args.push(format!("127.0.0.1:{}", port));
            }
            Forwarding::Local {
                port,
                target_host,
                target_port,
            } => {
                args.push("-L".to_string());
                args.push(format!(
                    "127.0.0.1:{}:{}:{}",
                    port,
                    bracket_ipv6(target_host),
                    target_port
                ));
            }
            Forwarding::Remote {
                remote_port,
                local_port,
            } => {
                args.push("-R".to_string());
                args.push(format!("{}:127.0.0.1:{}", remote_port, local_port));
            }
        }
    }
}

/// A fully specified ssh invocation
#[derive(Clone, PartialEq, Eq)]
pub struct SshCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

// Env values can point at secrets; keep them out of the logs
impl std::fmt::Debug for SshCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .finish()
    }
}

impl SshCommand {
    /// Build the invocation. `identity` overrides the configured key path
    /// (used when the key was supplied inline and written to a temp file).
    pub fn from_config(
        program: &str,
        ssh: &SshConfig,
        forwarding: &Forwarding,
        identity: Option<&Path>,
    ) -> Self {
        let mut args = vec![
            "-N".to_string(),
            "-p".to_string(),
            ssh.port.to_string(),
        ];

        if let Some(key) = identity
            .map(Path::to_path_buf)
            .or_else(|| configured_key_path(ssh))
        {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().to_string());
        }

        if ssh.compression {
            args.push("-C".to_string());
        }

        for option in [
            format!("ServerAliveInterval={}", ssh.keep_alive_secs),
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
        ] {
            args.push("-o".to_string());
            args.push(option);
        }

        forwarding.push_args(&mut args);
        args.push(format!("{}@{}", ssh.username, ssh.host));

        Self {
            program: program.to_string(),
            args,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }
}

/// Key path from the config, with a leading `~/` expanded
fn configured_key_path(ssh: &SshConfig) -> Option<PathBuf> {
    if !ssh.uses_key_auth() || ssh.private_key_is_inline() {
        return None;
    }
    let key = ssh.private_key.trim();
    match (key.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => Some(home.join(rest)),
        _ => Some(PathBuf::from(key)),
    }
}

fn bracket_ipv6(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}
