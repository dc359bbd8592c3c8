//! Building and testing a submission on a remote virtual machine.
//!
//! One cycle per submission: boot, connect, stage, build, reboot, reconnect,
//! test, power off. The machine is powered off on every path out of a cycle.

use derive_more::derive::Display;
use std::{
    collections::BTreeMap,
    path::Path,
    time::Duration,
};

use crate::error::Error;
use crate::logging::write_transcript;
use crate::settings::{HypervisorSettings, VmSettings};
use crate::template;
use crate::utils::{syscommand_timeout, SyscommandOutput, SyscommandSettings};

pub const STAGING_LOG_ERR: &str = "staging.log.err";
pub const BUILD_LOG: &str = "build.log";
pub const BUILD_LOG_ERR: &str = "build.log.err";
pub const RUN_LOG_ERR: &str = "run.log.err";

pub trait Hypervisor: Send {
    fn revert_snapshot(&mut self, snapshot: &str) -> Result<(), Error>;
    fn power_on(&mut self) -> Result<(), Error>;
    fn power_off(&mut self) -> Result<(), Error>;
}

/// An open remote shell with file transfer.
pub trait RemoteSession {
    /// Runs `command` remotely. A timeout is returned as
    /// `Error::SyscommandTimeoutError`.
    fn exec(&mut self, command: &str, timeout: Duration) -> Result<SyscommandOutput, Error>;
    fn push(&mut self, local: &Path, remote: &str) -> Result<(), Error>;
    fn pull(&mut self, remote: &str, local: &Path) -> Result<(), Error>;
}

pub trait Connector: Send {
    /// A single connection attempt.
    fn connect(&mut self) -> Result<Box<dyn RemoteSession>, Error>;
}

/// Drives a hypervisor through the configured command lines.
pub struct CommandHypervisor {
    settings: HypervisorSettings,
    values: BTreeMap<String, String>,
}

impl CommandHypervisor {
    pub fn new(vm: &VmSettings) -> Self {
        let mut values = BTreeMap::from([("vm_name".to_string(), vm.name.clone())]);
        if let Some(snapshot) = &vm.snapshot {
            values.insert("snapshot".to_string(), snapshot.clone());
        }
        CommandHypervisor {
            settings: vm.hypervisor.clone(),
            values,
        }
    }

    fn run(&self, what: &str, cmd: &[String]) -> Result<(), Error> {
        if cmd.is_empty() {
            return Ok(());
        }
        let args = template::substitute_all(cmd, &self.values)
            .map_err(|e| Error::from(format!("hypervisor {what} command: {e}")))?;
        log::debug!("Hypervisor {what}: {}", args.join(" "));
        syscommand_timeout(
            &args,
            SyscommandSettings {
                timeout: Duration::from_secs(self.settings.timeout),
                expected_code: Some(0),
                max_stdout_length: Some(64 * 1024),
                max_stderr_length: Some(64 * 1024),
                ..Default::default()
            },
        )
        .map(|_| ())
        .map_err(|e| Error::from(format!("hypervisor {what} failed: {e}")))
    }
}

impl Hypervisor for CommandHypervisor {
    fn revert_snapshot(&mut self, snapshot: &str) -> Result<(), Error> {
        self.values.insert("snapshot".to_string(), snapshot.to_string());
        let cmd = self.settings.revert.clone();
        self.run("revert", &cmd)
    }
    fn power_on(&mut self) -> Result<(), Error> {
        let cmd = self.settings.power_on.clone();
        self.run("power on", &cmd)
    }
    fn power_off(&mut self) -> Result<(), Error> {
        let cmd = self.settings.power_off.clone();
        self.run("power off", &cmd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum VmState {
    Idle,
    Booted,
    Connected,
    Staged,
    Built,
    Rebooted,
    Tested,
    PoweredOff,
}

/// How a cycle ended. Script errors are kept in the phase transcripts and
/// never stop the cycle; only an unreachable machine does.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Every phase ran without errors.
    Completed,
    /// Staging or building reported an error. Testing still ran.
    BuildFailed(String),
    /// The test script failed or timed out.
    RunFailed(String),
    /// The machine could not be booted or reached.
    Unreachable(String),
}

pub struct VmBackend {
    settings: VmSettings,
    hypervisor: Box<dyn Hypervisor>,
    connector: Box<dyn Connector>,
    settle: Duration,
    state: VmState,
}

impl VmBackend {
    pub fn new(
        settings: VmSettings,
        hypervisor: Box<dyn Hypervisor>,
        connector: Box<dyn Connector>,
    ) -> Self {
        let settle = Duration::from_secs(settings.boot_time);
        VmBackend {
            settings,
            hypervisor,
            connector,
            settle,
            state: VmState::Idle,
        }
    }

    /// Backend using the hypervisor command templates and OpenSSH.
    pub fn from_settings(settings: &VmSettings) -> Self {
        Self::new(
            settings.clone(),
            Box::new(CommandHypervisor::new(settings)),
            Box::new(crate::remote::SshConnector::new(settings)),
        )
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    /// Runs a full cycle for the working tree `workspace`. Logs and fetched
    /// files go to `output_dir`.
    pub fn run_cycle(&mut self, workspace: &Path, output_dir: &Path) -> CycleOutcome {
        self.state = VmState::Idle;
        if let Err(e) = std::fs::create_dir_all(output_dir) {
            return CycleOutcome::Unreachable(format!(
                "could not create {}: {e}",
                output_dir.display()
            ));
        }

        let outcome = self
            .cycle(workspace, output_dir)
            .unwrap_or_else(CycleOutcome::Unreachable);

        log::info!("Shutting down VM...");
        if let Err(e) = self.hypervisor.power_off() {
            log::error!("Could not power off {}: {e}", self.settings.name);
        }
        self.state = VmState::PoweredOff;
        outcome
    }

    /// Returns the reason the machine became unreachable as the error.
    fn cycle(&mut self, workspace: &Path, out: &Path) -> Result<CycleOutcome, String> {
        self.boot().map_err(|e| e.to_string())?;

        let mut session = self.connect()?;
        let staged = self.stage(session.as_mut(), out);
        let built = self.build(session.as_mut(), workspace, out);

        log::info!("Rebooting post build...");
        let reboot = self.remote_script(&self.settings.reboot_cmd);
        let timeout = Duration::from_secs(self.settings.reboot_timeout);
        if let Err(e) = session.exec(&reboot, timeout) {
            // The connection usually drops while the machine goes down.
            log::debug!("Reboot command returned: {e}");
        }
        drop(session);
        std::thread::sleep(self.settle);
        self.state = VmState::Rebooted;

        let mut session = self.connect()?;
        let ran = self.test(session.as_mut(), out);
        self.state = VmState::Tested;
        Ok(match (staged.or(built), ran) {
            (Some(reason), _) => CycleOutcome::BuildFailed(reason),
            (None, Some(reason)) => CycleOutcome::RunFailed(reason),
            (None, None) => CycleOutcome::Completed,
        })
    }

    fn boot(&mut self) -> Result<(), Error> {
        if let Some(snapshot) = self.settings.snapshot.clone() {
            log::debug!("Reverting {} to snapshot {snapshot}", self.settings.name);
            self.hypervisor.revert_snapshot(&snapshot)?;
        }
        self.hypervisor.power_on()?;
        std::thread::sleep(self.settle);
        self.state = VmState::Booted;
        Ok(())
    }

    /// Connects with a bounded number of attempts and no delay in between.
    fn connect(&mut self) -> Result<Box<dyn RemoteSession>, String> {
        let max = self.settings.max_retries;
        for attempt in 1..=max {
            match self.connector.connect() {
                Ok(session) => {
                    log::debug!("Connected to {} on attempt {attempt}", self.settings.name);
                    self.state = VmState::Connected;
                    return Ok(session);
                }
                Err(e) => log::warn!("Error connecting (attempt {attempt}/{max}): {e}"),
            }
        }
        Err(format!(
            "could not connect to {}: retries exceeded ({max})",
            self.settings.name
        ))
    }

    fn remote_script(&self, name: &str) -> String {
        format!("{}/{}", self.settings.remote_staging_dir, name)
    }

    /// Returns the first error of the phase, if any.
    fn stage(&mut self, session: &mut dyn RemoteSession, out: &Path) -> Option<String> {
        log::info!("Setting the stage for the payload...");
        let log_path = out.join(STAGING_LOG_ERR);
        let timeout = Duration::from_secs(self.settings.stage_timeout);
        let mut transcript = Transcript::new(&log_path);

        transcript.exec(
            session,
            &format!("mkdir -p {}", self.settings.remote_staging_dir),
            timeout,
        );
        for file in self.settings.staging_files.iter() {
            let local = Path::new(&self.settings.staging_dir).join(file);
            if !local.is_file() {
                log::warn!("File {file} does not exist in the staging area. Skipping.");
                continue;
            }
            let remote = self.remote_script(file);
            transcript.transfer(session.push(&local, &remote), &format!("push {file}"));
        }
        let script = self.remote_script(&self.settings.stage_cmd);
        transcript.exec(session, &format!("chmod +x {script}"), timeout);
        transcript.exec(session, &script, timeout);
        self.state = VmState::Staged;
        transcript.finish()
    }

    fn build(
        &mut self,
        session: &mut dyn RemoteSession,
        workspace: &Path,
        out: &Path,
    ) -> Option<String> {
        log::info!("Beginning build cycle...");
        let log_path = out.join(BUILD_LOG_ERR);
        let short = Duration::from_secs(self.settings.stage_timeout);
        let timeout = Duration::from_secs(self.settings.build_timeout);
        let mut transcript = Transcript::new(&log_path);

        transcript.exec(
            session,
            &format!("mkdir -p {}", self.settings.remote_payload_dir),
            short,
        );
        for file in self.settings.payload_files.iter() {
            let local = workspace.join(file);
            if !local.is_file() {
                log::warn!("File {file} does not exist in the payload. Skipping.");
                continue;
            }
            let remote = format!("{}/{}", self.settings.remote_payload_dir, file);
            transcript.transfer(session.push(&local, &remote), &format!("push {file}"));
        }
        let script = self.remote_script(&self.settings.build_cmd);
        transcript.exec(session, &format!("chmod +x {script}"), short);
        transcript.exec(session, &script, timeout);

        log::info!("Build complete. Fetching logs.");
        let remote_log = format!("{}/{}", self.settings.remote_result_dir, BUILD_LOG);
        if let Err(e) = session.pull(&remote_log, &out.join(BUILD_LOG)) {
            log::warn!("Could not fetch {BUILD_LOG}: {e}");
        }
        self.state = VmState::Built;
        transcript.finish()
    }

    /// Runs the test script and fetches the result files. Returns the reason
    /// when the script did not finish successfully; whatever it left behind
    /// is fetched anyway.
    fn test(&mut self, session: &mut dyn RemoteSession, out: &Path) -> Option<String> {
        log::info!("Beginning test cycle...");
        let log_path = out.join(RUN_LOG_ERR);
        let timeout = Duration::from_secs(self.settings.run_timeout);
        let mut transcript = Transcript::new(&log_path);

        let script = self.remote_script(&self.settings.run_cmd);
        transcript.exec(session, &script, timeout);

        log::info!("Tests complete. Fetching results.");
        for file in self.settings.result_files.iter() {
            let remote = format!("{}/{}", self.settings.remote_result_dir, file);
            if let Err(e) = session.pull(&remote, &out.join(file)) {
                log::error!("Could not grab {file}: {e}. Skipping.");
            }
        }
        transcript.finish()
    }
}

/// Collects the stderr and errors of a phase and writes them to its log file.
struct Transcript<'a> {
    path: &'a Path,
    text: String,
    failure: Option<String>,
}

impl<'a> Transcript<'a> {
    fn new(path: &'a Path) -> Self {
        Transcript {
            path,
            text: String::new(),
            failure: None,
        }
    }

    fn exec(&mut self, session: &mut dyn RemoteSession, command: &str, timeout: Duration) {
        match session.exec(command, timeout) {
            Ok(output) => {
                self.text.push_str(&output.stderr);
                if output.code != 0 {
                    self.fail(format!("\"{command}\" exited with code {}", output.code));
                }
            }
            Err(Error::SyscommandTimeoutError { stdout, stderr }) => {
                self.text.push_str(stdout.as_deref().unwrap_or(""));
                self.text.push_str(stderr.as_deref().unwrap_or(""));
                self.fail(format!(
                    "\"{command}\" timed out after {} seconds",
                    timeout.as_secs()
                ));
            }
            Err(e) => self.fail(format!("\"{command}\" failed: {e}")),
        }
    }

    fn transfer(&mut self, res: Result<(), Error>, what: &str) {
        if let Err(e) = res {
            self.fail(format!("{what} failed: {e}"));
        }
    }

    fn fail(&mut self, reason: String) {
        log::error!("{reason}");
        self.text.push_str(&reason);
        self.text.push('\n');
        self.failure.get_or_insert(reason);
    }

    /// Writes the log file and returns the first error of the phase.
    fn finish(self) -> Option<String> {
        if let Err(e) = write_transcript(self.path, &self.text) {
            log::warn!("Could not write {}: {e}", self.path.display());
        }
        self.failure
    }
}
