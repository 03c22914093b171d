use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, warn};

/// ssh-agent handle for builds that fetch over ssh.
///
/// Without explicit keys the ambient `SSH_AUTH_SOCK` is inherited. With
/// `--ssh-key` files a private agent is spawned, the keys are added to it,
/// and the agent is terminated on shutdown.
#[derive(Debug, Default)]
pub struct SshAgent {
    auth_sock: Option<String>,
    agent_pid: Option<i32>,
}

impl SshAgent {
    /// Initialize the agent once per Conveyor lifetime.
    pub async fn init(ssh_keys: &[PathBuf]) -> Result<Self> {
        if ssh_keys.is_empty() {
            let auth_sock = std::env::var("SSH_AUTH_SOCK").ok().filter(|s| !s.is_empty());
            return Ok(Self {
                auth_sock,
                agent_pid: None,
            });
        }

        let output = Command::new("ssh-agent")
            .arg("-s")
            .output()
            .await
            .context("spawning ssh-agent")?;
        if !output.status.success() {
            bail!("ssh-agent failed: {}", String::from_utf8_lossy(&output.stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let auth_sock = parse_agent_var(&stdout, "SSH_AUTH_SOCK")
            .context("ssh-agent output is missing SSH_AUTH_SOCK")?;
        let agent_pid = parse_agent_var(&stdout, "SSH_AGENT_PID")
            .and_then(|p| p.parse::<i32>().ok())
            .context("ssh-agent output is missing SSH_AGENT_PID")?;
        debug!(pid = agent_pid, sock = %auth_sock, "started private ssh-agent");

        for key in ssh_keys {
            let status = Command::new("ssh-add")
                .env("SSH_AUTH_SOCK", &auth_sock)
                .arg(key)
                .status()
                .await
                .with_context(|| format!("adding ssh key {}", key.display()))?;
            if !status.success() {
                bail!("ssh-add failed for key {}", key.display());
            }
        }

        Ok(Self {
            auth_sock: Some(auth_sock),
            agent_pid: Some(agent_pid),
        })
    }

    /// Socket path to expose to build containers, when one is available.
    pub fn auth_sock(&self) -> Option<&str> {
        self.auth_sock.as_deref()
    }

    /// Terminate a private agent. Inherited agents are left untouched.
    /// Termination failure is a warning, never fatal.
    pub fn terminate(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.agent_pid.take() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                warn!(pid, error = %e, "ssh agent termination failed");
            }
        }
        #[cfg(not(unix))]
        {
            self.agent_pid = None;
        }
    }
}

fn parse_agent_var(output: &str, var: &str) -> Option<String> {
    // `ssh-agent -s` emits lines like `SSH_AUTH_SOCK=/tmp/...; export SSH_AUTH_SOCK;`
    for line in output.lines() {
        if let Some(rest) = line.trim().strip_prefix(&format!("{var}=")) {
            let value = rest.split(';').next()?.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_agent_output() {
        let out = "SSH_AUTH_SOCK=/tmp/ssh-XXXX/agent.123; export SSH_AUTH_SOCK;\n\
                   SSH_AGENT_PID=124; export SSH_AGENT_PID;\n\
                   echo Agent pid 124;\n";
        assert_eq!(
            parse_agent_var(out, "SSH_AUTH_SOCK").as_deref(),
            Some("/tmp/ssh-XXXX/agent.123")
        );
        assert_eq!(parse_agent_var(out, "SSH_AGENT_PID").as_deref(), Some("124"));
    }

    #[test]
    fn missing_var_is_none() {
        assert_eq!(parse_agent_var("echo hello", "SSH_AUTH_SOCK"), None);
    }
}
