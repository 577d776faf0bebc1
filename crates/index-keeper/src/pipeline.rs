use crate::index_state::SnapshotRecord;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Whatever the pipeline chooses to report; only success/failure is
/// interpreted by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractedGraphSummary {
    pub files: usize,
    pub entities: usize,
    pub relationships: usize,
}

/// The external graph/vector extraction process.
pub trait IndexingPipeline: Send + Sync {
    /// Blocks until the repository at `repo_root` has been indexed.
    fn run(&self, repo_root: &Path) -> anyhow::Result<ExtractedGraphSummary>;

    /// Removes the data a snapshot left in the backing stores.
    fn delete_snapshot(&self, snapshot: &SnapshotRecord) -> anyhow::Result<()>;
}

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Runs `program [args..] <repo_root>`; an optional delete command receives
/// `<snapshot_id> <repo_key>`.
#[derive(Debug, Clone)]
pub struct CommandPipeline {
    program: OsString,
    args: Vec<OsString>,
    delete: Option<(OsString, Vec<OsString>)>,
    timeout: Duration,
}

impl CommandPipeline {
    pub fn new(program: impl Into<OsString>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            delete: None,
            timeout,
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn delete_command<I, S>(mut self, program: impl Into<OsString>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.delete = Some((program.into(), args.into_iter().map(Into::into).collect()));
        self
    }

    fn run_command(&self, mut command: Command, what: &str) -> anyhow::Result<Vec<u8>> {
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {what}"))?;

        let stdout = drain_in_background(child.stdout.take());
        let stderr = drain_in_background(child.stderr.take());

        let status = wait_or_kill(&mut child, self.timeout, what)?;

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        if !status.success() {
            bail!(
                "{what} exited with {status}: {}",
                String::from_utf8_lossy(&stderr).trim()
            );
        }
        Ok(stdout)
    }
}

impl IndexingPipeline for CommandPipeline {
    fn run(&self, repo_root: &Path) -> anyhow::Result<ExtractedGraphSummary> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(repo_root);
        let stdout = self.run_command(command, "indexing pipeline")?;

        // stdout is optional and free-form; a JSON summary is used when present
        Ok(serde_json::from_slice(&stdout).unwrap_or_default())
    }

    fn delete_snapshot(&self, snapshot: &SnapshotRecord) -> anyhow::Result<()> {
        let Some((program, args)) = &self.delete else {
            return Ok(());
        };
        let mut command = Command::new(program);
        command
            .args(args)
            .arg(&snapshot.snapshot_id)
            .arg(&snapshot.repo_key);
        self.run_command(command, "snapshot delete command")?;
        Ok(())
    }
}

fn drain_in_background<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// The parts of [`Child`] the wait loop needs.
trait ChildProcess {
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;
    fn kill(&mut self) -> io::Result<()>;
    fn wait(&mut self) -> io::Result<ExitStatus>;
}

impl ChildProcess for Child {
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        Child::try_wait(self)
    }

    fn kill(&mut self) -> io::Result<()> {
        Child::kill(self)
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        Child::wait(self)
    }
}

/// Any outcome other than a clean exit kills and reaps the child.
fn wait_or_kill(
    child: &mut impl ChildProcess,
    timeout: Duration,
    what: &str,
) -> anyhow::Result<ExitStatus> {
    match wait_with_timeout(child, timeout) {
        Ok(Some(status)) => Ok(status),
        Ok(None) => {
            reap(child);
            bail!("{what} timed out after {timeout:?}");
        }
        Err(err) => {
            reap(child);
            Err(anyhow::Error::new(err).context(format!("failed waiting for {what}")))
        }
    }
}

fn reap(child: &mut impl ChildProcess) {
    let _ = child.kill();
    let _ = child.wait();
}

/// `Ok(None)` when the deadline passed first.
fn wait_with_timeout(
    child: &mut impl ChildProcess,
    timeout: Duration,
) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}
