use crate::context::{Cancelled, Context};
use crate::RuntimeError;
use brig_schema::NO_EXIT_CODE;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const RUNTIME_CANDIDATES: &[&str] = &["crun", "runc", "youki"];

/// How long output pipes are drained after the exec'd process exits. Anything
/// still holding them open afterwards (a backgrounded child) is abandoned.
const OUTPUT_GRACE: Duration = Duration::from_millis(250);

const CREATE_STDERR_FILE: &str = "create.stderr";

fn responds_to_version(binary: &OsStr) -> bool {
    std::process::Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

/// Resolve the OCI runtime binary: the configured path if given, otherwise the
/// first of crun, runc and youki that answers `--version`.
pub fn find_runtime(configured: Option<&Path>) -> Result<PathBuf, RuntimeError> {
    if let Some(path) = configured {
        if responds_to_version(path.as_os_str()) {
            return Ok(path.to_path_buf());
        }
        return Err(RuntimeError::RuntimeUnusable(path.to_path_buf()));
    }
    for candidate in RUNTIME_CANDIDATES {
        if responds_to_version(OsStr::new(candidate)) {
            return Ok(PathBuf::from(candidate));
        }
    }
    Err(RuntimeError::RuntimeNotFound)
}

/// Output of `<runtime> state <id>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeState {
    #[serde(rename = "ociVersion", default)]
    pub oci_version: String,
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub pid: Option<i32>,
    #[serde(default)]
    pub bundle: String,
}

/// Stdio wiring for one exec. Missing sinks mean "capture".
#[derive(Default)]
pub struct ExecStdio {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl std::fmt::Debug for ExecStdio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecStdio")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Captured result of an exec. Streams that went to a sink are empty here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => NO_EXIT_CODE,
    }
}

fn mentions_missing_container(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("does not exist") || lower.contains("not found") || lower.contains("no such container")
}

/// Driver for an external OCI runtime binary. Every invocation passes
/// `--root <root>` and is killed if the caller's context finishes first.
#[derive(Debug, Clone)]
pub struct OciRuntime {
    binary: PathBuf,
    root: PathBuf,
}

impl OciRuntime {
    pub fn new(binary: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn command<S: AsRef<OsStr>>(&self, args: &[S]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--root").arg(&self.root).args(args);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        debug!(
            "{} --root {} {}",
            self.binary.display(),
            self.root.display(),
            args.iter()
                .map(|a| a.as_ref().to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );
        cmd
    }

    async fn invoke<S: AsRef<OsStr>>(
        &self,
        ctx: &Context,
        op: &'static str,
        args: &[S],
    ) -> Result<String, RuntimeError> {
        let child = self
            .command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        // Dropping the future on cancellation drops the child, which kills it.
        let output = ctx.run(child.wait_with_output()).await??;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        Err(RuntimeError::CommandFailed {
            op,
            code: exit_code(output.status),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }

    /// `create --bundle <bundle> --pid-file <bundle>/init.pid <id>`.
    ///
    /// The init process inherits the runtime's stdio, so stderr goes to a file
    /// in the bundle instead of a pipe that would stay open for its lifetime.
    pub async fn create(&self, ctx: &Context, id: &str, bundle: &Path) -> Result<(), RuntimeError> {
        let stderr_path = bundle.join(CREATE_STDERR_FILE);
        let stderr_file = std::fs::File::create(&stderr_path)?;
        let pid_file = bundle.join("init.pid");

        let mut cmd = self.command(&[
            OsStr::new("create"),
            OsStr::new("--bundle"),
            bundle.as_os_str(),
            OsStr::new("--pid-file"),
            pid_file.as_os_str(),
            OsStr::new(id),
        ]);
        cmd.current_dir(bundle)
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_file));
        let mut child = cmd.spawn()?;
        let status = ctx.run(child.wait()).await??;

        if status.success() {
            info!("container {id} created");
            return Ok(());
        }
        let stderr = std::fs::read_to_string(&stderr_path).unwrap_or_default();
        Err(RuntimeError::CommandFailed {
            op: "create",
            code: exit_code(status),
            stderr: stderr.trim().to_owned(),
        })
    }

    pub async fn start(&self, ctx: &Context, id: &str) -> Result<(), RuntimeError> {
        self.invoke(ctx, "start", &["start", id]).await?;
        debug!("container {id} started");
        Ok(())
    }

    pub async fn pause(&self, ctx: &Context, id: &str) -> Result<(), RuntimeError> {
        self.invoke(ctx, "pause", &["pause", id]).await?;
        debug!("container {id} paused");
        Ok(())
    }

    pub async fn resume(&self, ctx: &Context, id: &str) -> Result<(), RuntimeError> {
        self.invoke(ctx, "resume", &["resume", id]).await?;
        debug!("container {id} resumed");
        Ok(())
    }

    /// Signal the container. A container that is already gone or stopped is
    /// not an error.
    pub async fn kill(
        &self,
        ctx: &Context,
        id: &str,
        signal: &str,
        all: bool,
    ) -> Result<(), RuntimeError> {
        let args: Vec<&str> = if all {
            vec!["kill", "--all", id, signal]
        } else {
            vec!["kill", id, signal]
        };
        match self.invoke(ctx, "kill", &args).await {
            Ok(_) => Ok(()),
            Err(RuntimeError::CommandFailed { stderr, .. })
                if mentions_missing_container(&stderr)
                    || stderr.contains("not running")
                    || stderr.to_lowercase().contains("no such process") =>
            {
                debug!("kill {id}: {stderr}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the runtime's record of the container. Missing records map to
    /// [`RuntimeError::ContainerNotFound`].
    pub async fn delete(&self, ctx: &Context, id: &str, force: bool) -> Result<(), RuntimeError> {
        let args: Vec<&str> = if force {
            vec!["delete", "--force", id]
        } else {
            vec!["delete", id]
        };
        match self.invoke(ctx, "delete", &args).await {
            Ok(_) => {
                debug!("container {id} deleted");
                Ok(())
            }
            Err(RuntimeError::CommandFailed { stderr, .. }) if mentions_missing_container(&stderr) => {
                Err(RuntimeError::ContainerNotFound(id.to_owned()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn state(&self, ctx: &Context, id: &str) -> Result<RuntimeState, RuntimeError> {
        match self.invoke(ctx, "state", &["state", id]).await {
            Ok(stdout) => Ok(serde_json::from_str(&stdout)?),
            Err(RuntimeError::CommandFailed { stderr, .. }) if mentions_missing_container(&stderr) => {
                Err(RuntimeError::ContainerNotFound(id.to_owned()))
            }
            Err(e) => Err(e),
        }
    }

    /// `exec --process <process_file> <id>`, wired to `stdio`.
    ///
    /// A non-zero exit is reported through [`ExecOutput::exit_code`]. On
    /// cancellation the runtime's exec process is killed; processes it started
    /// inside the container are left to the caller's teardown.
    pub async fn exec(
        &self,
        ctx: &Context,
        id: &str,
        process_file: &Path,
        stdio: ExecStdio,
    ) -> Result<ExecOutput, RuntimeError> {
        let ExecStdio {
            stdin,
            stdout: stdout_sink,
            stderr: stderr_sink,
        } = stdio;

        let mut cmd = self.command(&[
            OsStr::new("exec"),
            OsStr::new("--process"),
            process_file.as_os_str(),
            OsStr::new(id),
        ]);
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        if let (Some(mut input), Some(mut child_stdin)) = (stdin, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = tokio::io::copy(&mut input, &mut child_stdin).await {
                    debug!("stdin copy ended: {e}");
                }
                // Dropping child_stdin closes the pipe and delivers EOF.
            });
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let mut out_pump = child.stdout.take().map(|r| tokio::spawn(pump(r, out_tx)));
        let mut err_pump = child.stderr.take().map(|r| tokio::spawn(pump(r, err_tx)));
        let aborts: Vec<_> = out_pump
            .iter()
            .chain(err_pump.iter())
            .map(tokio::task::JoinHandle::abort_handle)
            .collect();

        let wait = async {
            let status = child.wait().await?;
            let pumps = async {
                if let Some(h) = out_pump.as_mut() {
                    let _ = h.await;
                }
                if let Some(h) = err_pump.as_mut() {
                    let _ = h.await;
                }
            };
            if tokio::time::timeout(OUTPUT_GRACE, pumps).await.is_err() {
                debug!("exec in {id}: output still held open after exit, abandoning pipes");
                for abort in &aborts {
                    abort.abort();
                }
            }
            Ok::<_, std::io::Error>(status)
        };
        let drains = async {
            tokio::join!(drain(out_rx, stdout_sink), drain(err_rx, stderr_sink))
        };

        let outcome = ctx.run(async { tokio::join!(wait, drains) }).await;
        let (status, (stdout, stderr)) = match outcome {
            Ok(done) => done,
            Err(Cancelled) => {
                for abort in &aborts {
                    abort.abort();
                }
                warn!("exec in {id} cancelled");
                return Err(Cancelled.into());
            }
        };
        let status = status?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: exit_code(status),
        })
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>) {
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

/// Forward chunks to `sink`, or collect them when there is none. Completes
/// once every sender is gone.
async fn drain(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut sink: Option<Box<dyn AsyncWrite + Send + Unpin>>,
) -> Vec<u8> {
    let mut captured = Vec::new();
    while let Some(chunk) = rx.recv().await {
        match sink.as_mut() {
            Some(w) => {
                if let Err(e) = w.write_all(&chunk).await {
                    warn!("failed to forward exec output: {e}");
                    sink = None;
                }
            }
            None => captured.extend_from_slice(&chunk),
        }
    }
    if let Some(w) = sink.as_mut() {
        let _ = w.flush().await;
    }
    captured
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_container_messages() {
        assert!(mentions_missing_container("container \"c1\" does not exist"));
        assert!(mentions_missing_container("Error: container not found"));
        assert!(mentions_missing_container("no such container c1"));
        assert!(!mentions_missing_container("permission denied"));
    }

    #[test]
    fn runtime_state_parses_runc_output() {
        let json = r#"{
            "ociVersion": "1.0.2",
            "id": "c1",
            "pid": 4242,
            "status": "running",
            "bundle": "/b/c1",
            "rootfs": "/b/c1/rootfs",
            "created": "2024-01-01T00:00:00Z",
            "owner": ""
        }"#;
        let state: RuntimeState = serde_json::from_str(json).unwrap();
        assert_eq!(state.status, "running");
        assert_eq!(state.pid, Some(4242));
    }

    #[test]
    fn configured_runtime_must_answer_version() {
        let err = find_runtime(Some(Path::new("/nonexistent/runtime"))).unwrap_err();
        assert!(matches!(err, RuntimeError::RuntimeUnusable(_)));
    }

    #[test]
    fn exit_code_of_signalled_process() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
    }

    #[tokio::test]
    async fn drain_collects_until_senders_drop() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(b"Hello ".to_vec()).unwrap();
        tx.send(b"world!\n".to_vec()).unwrap();
        drop(tx);
        assert_eq!(drain(rx, None).await, b"Hello world!\n");
    }
}
