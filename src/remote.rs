//! Remote shell and file transfer through the OpenSSH command line clients.
//!
//! Password logins go through `sshpass`. Key logins use `identity_file`, or the
//! user's ssh agent when neither is configured.

use std::{path::Path, time::Duration};

use crate::{
    error::Error,
    settings::VmSettings,
    utils::{path_to_string, syscommand_timeout, SyscommandOutput, SyscommandSettings},
    vm::{Connector, RemoteSession},
};

const MAX_REMOTE_OUTPUT: usize = 1024 * 1024;

/// ssh exits with 255 when the connection itself failed.
const SSH_CONNECTION_ERROR: i32 = 255;

#[derive(Debug, Clone)]
struct Endpoint {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    identity_file: Option<String>,
    connect_timeout: u64,
    transfer_timeout: Duration,
}

impl Endpoint {
    fn from_settings(vm: &VmSettings) -> Self {
        Endpoint {
            host: vm.host.clone(),
            port: vm.port,
            user: vm.user.clone(),
            password: vm.password.clone(),
            identity_file: vm.identity_file.clone(),
            connect_timeout: vm.connect_timeout,
            transfer_timeout: Duration::from_secs(vm.transfer_timeout),
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// `program` with authentication and connection options. `port_flag` is
    /// `-p` for ssh and `-P` for scp.
    fn command(&self, program: &str, port_flag: &str) -> Vec<String> {
        let mut cmd: Vec<String> = vec![];
        if let Some(pw) = &self.password {
            cmd.extend(["sshpass".to_string(), "-p".to_string(), pw.clone()]);
        }
        cmd.extend([
            program.to_string(),
            port_flag.to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout),
        ]);
        if self.password.is_none() {
            cmd.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }
        if let Some(key) = &self.identity_file {
            cmd.extend(["-i".to_string(), key.clone()]);
        }
        cmd
    }

    fn ssh(&self, remote_cmd: &str, timeout: Duration) -> Result<SyscommandOutput, Error> {
        let mut cmd = self.command("ssh", "-p");
        cmd.push(self.destination());
        cmd.push(remote_cmd.to_string());
        syscommand_timeout(
            &cmd,
            SyscommandSettings {
                timeout,
                max_stdout_length: Some(MAX_REMOTE_OUTPUT),
                max_stderr_length: Some(MAX_REMOTE_OUTPUT),
                ..Default::default()
            },
        )
    }

    fn scp(&self, from: String, to: String) -> Result<(), Error> {
        let mut cmd = self.command("scp", "-P");
        cmd.extend(["-q".to_string(), from.clone(), to.clone()]);
        let output = syscommand_timeout(
            &cmd,
            SyscommandSettings {
                timeout: self.transfer_timeout,
                max_stdout_length: Some(64 * 1024),
                max_stderr_length: Some(64 * 1024),
                ..Default::default()
            },
        )?;
        if output.code != 0 {
            return Err(Error::from(format!(
                "Error code {} when copying {from} to {to}: {}",
                output.code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}

pub struct SshConnector {
    endpoint: Endpoint,
}

impl SshConnector {
    pub fn new(vm: &VmSettings) -> Self {
        SshConnector {
            endpoint: Endpoint::from_settings(vm),
        }
    }
}

impl Connector for SshConnector {
    fn connect(&mut self) -> Result<Box<dyn RemoteSession>, Error> {
        let timeout = Duration::from_secs(self.endpoint.connect_timeout + 5);
        let output = self.endpoint.ssh("true", timeout)?;
        if output.code != 0 {
            return Err(Error::from(format!(
                "Could not connect to {}:{} (code {}): {}",
                self.endpoint.host,
                self.endpoint.port,
                output.code,
                output.stderr.trim()
            )));
        }
        Ok(Box::new(SshSession {
            endpoint: self.endpoint.clone(),
        }))
    }
}

/// OpenSSH has no persistent session here, every call opens a connection.
pub struct SshSession {
    endpoint: Endpoint,
}

impl RemoteSession for SshSession {
    fn exec(&mut self, command: &str, timeout: Duration) -> Result<SyscommandOutput, Error> {
        log::debug!("Remote: {command}");
        let output = self.endpoint.ssh(command, timeout)?;
        if output.code == SSH_CONNECTION_ERROR {
            log::warn!("Connection lost while running \"{command}\"");
        }
        Ok(output)
    }

    fn push(&mut self, local: &Path, remote: &str) -> Result<(), Error> {
        log::debug!("Pushing {} to {remote}", local.display());
        let to = format!("{}:{remote}", self.endpoint.destination());
        self.endpoint.scp(path_to_string(local)?, to)
    }

    fn pull(&mut self, remote: &str, local: &Path) -> Result<(), Error> {
        log::debug!("Fetching {remote} to {}", local.display());
        let from = format!("{}:{remote}", self.endpoint.destination());
        self.endpoint.scp(from, path_to_string(local)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::tests::vm_settings;
    use asserting::prelude::*;

    #[test]
    fn test_key_login_command() {
        let mut vm = vm_settings(Path::new("/tmp"));
        vm.identity_file = Some("/keys/id_ed25519".to_string());
        vm.port = 2222;
        let e = Endpoint::from_settings(&vm);
        let cmd = e.command("ssh", "-p");
        assert_that!(cmd[0].as_str()).is_equal_to("ssh");
        assert_that!(cmd[1..3].to_vec()).is_equal_to(vec!["-p".to_string(), "2222".to_string()]);
        assert_that!(cmd.contains(&"BatchMode=yes".to_string())).is_true();
        assert_that!(cmd.ends_with(&["-i".to_string(), "/keys/id_ed25519".to_string()])).is_true();
        assert_that!(e.destination()).is_equal_to("reptilian@127.0.0.1".to_string());
    }

    #[test]
    fn test_password_login_uses_sshpass() {
        let mut vm = vm_settings(Path::new("/tmp"));
        vm.password = Some("hunter2".to_string());
        let cmd = Endpoint::from_settings(&vm).command("scp", "-P");
        assert_that!(cmd[..4].to_vec()).is_equal_to(
            ["sshpass", "-p", "hunter2", "scp"]
                .map(String::from)
                .to_vec(),
        );
        assert_that!(cmd.contains(&"-P".to_string())).is_true();
        assert_that!(cmd.contains(&"BatchMode=yes".to_string())).is_false();
    }
}
