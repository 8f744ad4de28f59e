//! Worker Process Handle (spec.md §4.1): a uniform façade over one spawned
//! build or install child, with buffered non-blocking reads and a terminal
//! drain.
//!
//! Grounded on the teacher's `run.rs::supervise` (piped stdio read by a
//! background thread, byte-chunked not line-chunked so partial lines are
//! still visible before EOF) and `kill.rs` (signal dispatch / tree kill).

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{ExecError, Result};

/// Signals a [`WorkerProcess`] can be asked to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

/// Uniform façade over one spawned child (spec.md §4.1).
pub trait WorkerProcess: Send {
    fn is_alive(&mut self) -> bool;

    /// Non-blocking read of up to `n` bytes currently buffered from stdout.
    fn read_output(&mut self, n: usize) -> Vec<u8>;
    /// Non-blocking read of up to `n` bytes currently buffered from stderr.
    fn read_error(&mut self, n: usize) -> Vec<u8>;

    /// Terminal drain of all remaining buffered stdout. Valid only after exit.
    fn read_all_output(&mut self) -> Vec<u8>;
    /// Terminal drain of all remaining buffered stderr. Valid only after exit.
    fn read_all_error(&mut self) -> Vec<u8>;

    /// True while the child's stdout pipe still holds unread data, even
    /// after the child has exited.
    fn has_incomplete_output(&self) -> bool;
    /// True while the child's stderr pipe still holds unread data, even
    /// after the child has exited.
    fn has_incomplete_error(&self) -> bool;

    /// True if stdout currently holds bytes ready to read right now. Unlike
    /// `has_incomplete_output`, this says nothing about EOF — it is the
    /// poller's readiness signal, not the terminal-drain predicate.
    fn has_buffered_output(&self) -> bool;
    /// Stderr counterpart of `has_buffered_output`.
    fn has_buffered_error(&self) -> bool;

    /// Valid only post-exit.
    fn exit_status(&self) -> Option<i32>;

    /// Build handles only: path to the produced binary archive. Valid only
    /// post-exit on success.
    fn get_built_file(&self) -> Result<PathBuf>;

    fn signal(&mut self, sig: Signal);
    fn kill_tree(&mut self);

    /// Block up to `ms` milliseconds for the child to exit; returns whether
    /// it had exited by the deadline.
    fn wait(&mut self, ms: u64) -> bool;

    /// True once stdout and stderr have both reached the "finished" state
    /// described by spec.md §4.4 step 3: the child is no longer alive and
    /// neither pipe still holds unread data.
    fn is_ready_to_finish(&mut self) -> bool {
        !self.is_alive() && !self.has_incomplete_output() && !self.has_incomplete_error()
    }
}

/// Shared, mutex-guarded byte buffer fed by a background reader thread — the
/// same shape as the teacher's per-stream logging threads, minus the
/// file-writing side effect.
#[derive(Default)]
struct PipeBuffer {
    bytes: Mutex<Vec<u8>>,
    eof: AtomicBool,
}

impl PipeBuffer {
    fn spawn_reader<R: Read + Send + 'static>(stream: R, buf: Arc<PipeBuffer>) {
        std::thread::spawn(move || {
            let mut stream = stream;
            let mut chunk = [0u8; 8192];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Ok(mut guard) = buf.bytes.lock() {
                            guard.extend_from_slice(&chunk[..n]);
                        }
                    }
                    Err(_) => break,
                }
            }
            buf.eof.store(true, Ordering::Release);
        });
    }

    fn take(&self, n: usize) -> Vec<u8> {
        let mut guard = self.bytes.lock().expect("pipe buffer mutex poisoned");
        let take_n = n.min(guard.len());
        guard.drain(..take_n).collect()
    }

    fn drain_all(&self) -> Vec<u8> {
        let mut guard = self.bytes.lock().expect("pipe buffer mutex poisoned");
        std::mem::take(&mut guard)
    }

    fn has_incomplete(&self) -> bool {
        // Data remains unread either because the reader thread is still
        // filling the buffer (pipe not at EOF) or because bytes are queued
        // that nobody has drained yet.
        !self.eof.load(Ordering::Acquire) || !self.bytes.lock().is_ok_and(|g| g.is_empty())
    }

    /// Whether bytes are sitting in the buffer right now, ready to read.
    /// Unlike `has_incomplete`, this does not consult `eof` — a live,
    /// silent child correctly reports `false` here.
    fn has_data(&self) -> bool {
        !self.bytes.lock().is_ok_and(|g| g.is_empty())
    }
}

/// What kind of task this handle was spawned for — governs whether
/// [`WorkerProcess::get_built_file`] is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Build,
    Install,
}

/// Concrete [`WorkerProcess`] backed by `std::process::Child`.
pub struct ChildWorker {
    kind: WorkerKind,
    child: Child,
    stdout_buf: Arc<PipeBuffer>,
    stderr_buf: Arc<PipeBuffer>,
    exit_status: Option<i32>,
    built_file: Option<PathBuf>,
    /// Build-only: directory the build collaborator was told to place the
    /// produced archive into; used to resolve `get_built_file` if the
    /// collaborator doesn't hand back an explicit path.
    tmp_dir: Option<PathBuf>,
}

impl ChildWorker {
    /// Spawn `cmd` with piped stdout/stderr and a background reader thread per
    /// pipe. `built_file` is the path the archive will exist at once the
    /// build succeeds (build workers only).
    pub fn spawn(
        kind: WorkerKind,
        mut cmd: Command,
        built_file: Option<PathBuf>,
        tmp_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecError::SpawnFailure {
                kind: match kind {
                    WorkerKind::Build => "build",
                    WorkerKind::Install => "install",
                },
                package: built_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                source,
            })?;

        let stdout = child.stdout.take().expect("child stdout piped");
        let stderr = child.stderr.take().expect("child stderr piped");

        let stdout_buf = Arc::new(PipeBuffer::default());
        let stderr_buf = Arc::new(PipeBuffer::default());
        PipeBuffer::spawn_reader(stdout, Arc::clone(&stdout_buf));
        PipeBuffer::spawn_reader(stderr, Arc::clone(&stderr_buf));

        Ok(ChildWorker {
            kind,
            child,
            stdout_buf,
            stderr_buf,
            exit_status: None,
            built_file,
            tmp_dir,
        })
    }

    fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking poll of the child's exit status without reaping zombies
    /// more than once.
    fn refresh_exit_status(&mut self) {
        if self.exit_status.is_some() {
            return;
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            self.exit_status = Some(status.code().unwrap_or(-1));
        }
    }
}

impl WorkerProcess for ChildWorker {
    fn is_alive(&mut self) -> bool {
        self.refresh_exit_status();
        self.exit_status.is_none()
    }

    fn read_output(&mut self, n: usize) -> Vec<u8> {
        self.stdout_buf.take(n)
    }

    fn read_error(&mut self, n: usize) -> Vec<u8> {
        self.stderr_buf.take(n)
    }

    fn read_all_output(&mut self) -> Vec<u8> {
        self.stdout_buf.drain_all()
    }

    fn read_all_error(&mut self) -> Vec<u8> {
        self.stderr_buf.drain_all()
    }

    fn has_incomplete_output(&self) -> bool {
        self.stdout_buf.has_incomplete()
    }

    fn has_incomplete_error(&self) -> bool {
        self.stderr_buf.has_incomplete()
    }

    fn has_buffered_output(&self) -> bool {
        self.stdout_buf.has_data()
    }

    fn has_buffered_error(&self) -> bool {
        self.stderr_buf.has_data()
    }

    fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    fn get_built_file(&self) -> Result<PathBuf> {
        if self.kind != WorkerKind::Build {
            return Err(ExecError::CompletionAccessorFailure {
                package: String::new(),
                reason: "get_built_file called on a non-build worker".to_string(),
            });
        }
        match &self.built_file {
            Some(path) if path.exists() => Ok(path.clone()),
            Some(path) => Err(ExecError::CompletionAccessorFailure {
                package: path.display().to_string(),
                reason: format!("expected archive at {} was not produced", path.display()),
            }),
            None => Err(ExecError::CompletionAccessorFailure {
                package: self
                    .tmp_dir
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                reason: "no built-file path configured for this worker".to_string(),
            }),
        }
    }

    fn signal(&mut self, sig: Signal) {
        send_signal(self.pid(), sig);
    }

    fn kill_tree(&mut self) {
        kill_process_tree(self.pid());
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    fn wait(&mut self, ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(ms);
        loop {
            if !self.is_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, sig: Signal) {
    let signum = match sig {
        Signal::Interrupt => libc::SIGINT,
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) is safe to call with any pid and a valid signal number;
    // ESRCH (already gone) is not an error worth surfacing here.
    unsafe {
        libc::kill(pid as libc::pid_t, signum);
    }
}

#[cfg(windows)]
fn send_signal(pid: u32, _sig: Signal) {
    // Windows has no SIGTERM/SIGINT equivalent for arbitrary processes;
    // every signal maps to termination, consistent with the teacher's
    // `kill.rs` Windows path.
    kill_process_tree(pid);
}

#[cfg(not(any(unix, windows)))]
fn send_signal(_pid: u32, _sig: Signal) {}

#[cfg(unix)]
fn kill_process_tree(pid: u32) {
    // SAFETY: kill(2) with a negative pid targets the process group; the
    // worker is spawned into its own group via `process_group(0)` so this
    // reaches descendants without affecting the scheduler itself.
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
    }
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(windows)]
fn kill_process_tree(pid: u32) {
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, TerminateJobObject,
    };
    use windows::Win32::System::Threading::{OpenProcess, PROCESS_SET_QUOTA, PROCESS_TERMINATE};

    unsafe {
        let Ok(proc_handle) = OpenProcess(PROCESS_TERMINATE | PROCESS_SET_QUOTA, false, pid)
        else {
            return;
        };
        let Ok(job) = CreateJobObjectW(None, None) else {
            let _ = CloseHandle(proc_handle);
            return;
        };
        if AssignProcessToJobObject(job, proc_handle).is_ok() {
            let _ = TerminateJobObject(job, 1);
        }
        let _ = CloseHandle(proc_handle);
        let _ = CloseHandle(job);
    }
}

#[cfg(not(any(unix, windows)))]
fn kill_process_tree(_pid: u32) {}

/// Extend a [`Command`] so its child starts a new process group on Unix
/// (needed for [`kill_process_tree`] to reach descendants via `killpg`).
pub fn new_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

/// Build a `Command` from a shell-style template, substituting the given
/// placeholders (`{source}`, `{tmp_dir}`, `{lib}`, `{archive}`, ...).
pub fn command_from_template(template: &str, substitutions: &[(&str, &str)]) -> Command {
    let mut rendered = template.to_string();
    for (key, value) in substitutions {
        rendered = rendered.replace(&format!("{{{key}}}"), value);
    }
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(rendered);
    new_process_group(&mut cmd);
    cmd
}

/// Turn a completed worker's captured byte streams into lines, the way
/// spec.md §4.4 step 4 describes: line terminators normalized, a trailing
/// partial line retained as a final element.
pub fn split_lines(bytes: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(bytes);
    if text.is_empty() {
        return Vec::new();
    }
    let ends_with_newline = text.ends_with('\n');
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    if ends_with_newline {
        // `str::lines` already drops the trailing empty element after a
        // final newline; nothing further to retain.
    }
    if lines.is_empty() && !text.is_empty() {
        lines.push(text.into_owned());
    }
    lines
}
