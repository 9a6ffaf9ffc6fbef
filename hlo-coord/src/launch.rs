//! Starting node processes on their slot hosts.

use std::net::SocketAddr;
use std::process::Stdio;

use tracing::debug;

use hlo_core::{NodeRecord, Result};

/// Starts the node process for a slot.
///
/// Implementations only have to get the process going; the
/// coordinator verifies liveness afterwards with a ping.
pub trait NodeLauncher: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the launch itself cannot be issued.
    /// A launch that was issued but produced a dead node is caught by
    /// the coordinator's ping, not here.
    fn launch(&self, record: &NodeRecord, report_addr: SocketAddr) -> Result<()>;
}

/// Launches nodes over ssh, detached with `nohup`.
///
/// The ssh invocation returns as soon as the remote shell forks the
/// node into the background; it says nothing about whether the node
/// actually came up.
pub struct SshLauncher {
    remote_bin: String,
    remote_dir: Option<String>,
}

impl SshLauncher {
    #[must_use]
    pub fn new(remote_bin: String, remote_dir: Option<String>) -> Self {
        Self {
            remote_bin,
            remote_dir,
        }
    }

    fn remote_command(&self, record: &NodeRecord, report_addr: SocketAddr) -> String {
        let run = format!(
            "nohup {} --ip {} --port {} --cache-capacity {} --policy {} --report-addr {} >/dev/null 2>&1 &",
            self.remote_bin,
            record.addr.ip,
            record.addr.port,
            record.cache_capacity,
            record.policy,
            report_addr,
        );
        match &self.remote_dir {
            Some(dir) => format!("cd {dir} && {run}"),
            None => run,
        }
    }
}

impl NodeLauncher for SshLauncher {
    fn launch(&self, record: &NodeRecord, report_addr: SocketAddr) -> Result<()> {
        let command = self.remote_command(record, report_addr);
        debug!(
            target: "halo::launch",
            host = %record.addr.ip,
            command = %command,
            "Launching node over ssh"
        );
        // -n keeps ssh off our stdin; the child is left to run on its
        // own and is never waited on.
        tokio::process::Command::new("ssh")
            .arg("-n")
            .arg(record.addr.ip.to_string())
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(())
    }
}
