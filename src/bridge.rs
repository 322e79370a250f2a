//! Launching bridges, locally and over a secure shell
//!
//! Only connection establishment lives here; the bridge program itself is
//! an external collaborator that speaks the framed protocol on its stdio.
//! A remote bridge runs over `ssh` on a pseudo-terminal, and its documented
//! exit codes (5, 6, 127, 255) reach the session through the transport's
//! close reason.

use std::path::PathBuf;

use crate::{pipe::Pipe, transport::PipeTransport};

const DEFAULT_BRIDGE_PROGRAM: &str = "cockpit-bridge";
const DEFAULT_SSH_PROGRAM: &str = "ssh";

/// Where and how to launch a session's bridge.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    program: String,
    ssh_program: String,
    known_hosts_file: Option<PathBuf>,
    ssh_port: Option<u16>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_BRIDGE_PROGRAM.into(),
            ssh_program: DEFAULT_SSH_PROGRAM.into(),
            known_hosts_file: None,
            ssh_port: None,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bridge executable, resolved against `PATH` when not a path.
    ///
    /// Default: `cockpit-bridge`
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// The secure-shell client used to reach remote hosts.
    ///
    /// Default: `ssh`
    pub fn with_ssh_program(mut self, program: impl Into<String>) -> Self {
        self.ssh_program = program.into();
        self
    }

    /// Acceptable peer keys for remote hosts. A host whose key is absent
    /// from this file surfaces as an `unknown-hostkey` close.
    pub fn with_known_hosts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_file = Some(path.into());
        self
    }

    /// Overrides the secure-shell port for remote hosts.
    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = Some(port);
        self
    }

    /// Launches a bridge: locally over its stdio, or on `host` over a
    /// secure shell with a tty (the shell may need to prompt).
    pub fn launch(&self, host: Option<&str>) -> PipeTransport {
        let pipe = match host {
            None => Pipe::spawn(&[self.program.clone()], None, None),
            Some(host) => Pipe::pty(&self.remote_argv(host), None, None),
        };
        PipeTransport::new(pipe)
    }

    fn remote_argv(&self, host: &str) -> Vec<String> {
        let mut argv = vec![self.ssh_program.clone()];
        if let Some(port) = self.ssh_port {
            argv.push("-p".into());
            argv.push(port.to_string());
        }
        if let Some(known_hosts) = &self.known_hosts_file {
            argv.push("-o".into());
            argv.push(format!("UserKnownHostsFile={}", known_hosts.display()));
        }
        argv.push("-o".into());
        argv.push("StrictHostKeyChecking=yes".into());
        argv.push(host.into());
        argv.push(self.program.clone());
        argv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_defaults_to_the_installed_bridge() {
        let config = BridgeConfig::default();

        assert_eq!(config.program, "cockpit-bridge");
        assert_eq!(config.ssh_program, "ssh");
        assert!(config.known_hosts_file.is_none());
        assert!(config.ssh_port.is_none());
    }

    #[test]
    fn it_builds_remote_command_lines() {
        let argv = BridgeConfig::new()
            .with_known_hosts_file("/etc/gateway/known_hosts")
            .with_ssh_port(2222)
            .remote_argv("admin@machine2");

        assert_eq!(
            argv,
            [
                "ssh",
                "-p",
                "2222",
                "-o",
                "UserKnownHostsFile=/etc/gateway/known_hosts",
                "-o",
                "StrictHostKeyChecking=yes",
                "admin@machine2",
                "cockpit-bridge",
            ]
        );
    }
}
