//! Prompt-framed debugger session.
//!
//! A [`FramedSession`] owns one debugger process and turns its free-text
//! console into a request/response channel: a command is written, then output
//! is accumulated until it ends with the idle prompt. Commands are serialized
//! through a single channel lock, and a command that outlives its timeout
//! poisons the session for good.

use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::process::ExitStatus;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr},
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::timeout,
};

use crate::transcript::{Direction, Transcript};
use crate::{LldbConfig, LldbError, Result};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared handle handed out by the registry.
pub type SessionHandle = Arc<FramedSession>;

const READ_CHUNK_SIZE: usize = 4096;
const MAX_PARTIAL_OUTPUT_CHARS: usize = 2000;
const MAX_UNSOLICITED_CHUNKS: usize = 256;
const MAX_STDERR_LINES: usize = 32;
const QUIT_COMMAND: &str = "quit";

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub prompt: String,
    pub command_timeout: Duration,
    pub terminate_grace: Duration,
}

impl SessionOptions {
    pub fn from_config(config: &LldbConfig) -> Self {
        Self {
            prompt: config.prompt.clone(),
            command_timeout: config.command_timeout,
            terminate_grace: config.terminate_grace,
        }
    }

    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }
}

/// Command slot. Holding this lock is what makes a command "in flight".
struct Channel {
    writer: BoxedWriter,
    output: mpsc::UnboundedReceiver<Vec<u8>>,
    unsolicited: VecDeque<String>,
}

struct DebuggerProcess {
    child: Child,
    primary: OwnedFd,
    stderr_task: Option<JoinHandle<()>>,
}

enum FrameEnd {
    Prompt,
    Closed,
}

pub struct FramedSession {
    channel: Mutex<Channel>,
    process: Mutex<Option<DebuggerProcess>>,
    reader_task: JoinHandle<()>,
    stream_closed: Arc<AtomicBool>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    transcript: Option<Transcript>,
    options: SessionOptions,
    command_timeout_ms: AtomicU64,
    target_pid: AtomicU32,
    poisoned: AtomicBool,
    terminated: AtomicBool,
}

impl FramedSession {
    /// Wraps an already-connected debugger console. Must be called from
    /// inside a tokio runtime; the output reader starts immediately.
    pub fn from_transport(reader: BoxedReader, writer: BoxedWriter, options: SessionOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream_closed = Arc::new(AtomicBool::new(false));
        let reader_task = tokio::spawn(reader_loop(reader, tx, stream_closed.clone()));

        Self {
            channel: Mutex::new(Channel {
                writer,
                output: rx,
                unsolicited: VecDeque::new(),
            }),
            process: Mutex::new(None),
            reader_task,
            stream_closed,
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
            transcript: None,
            command_timeout_ms: AtomicU64::new(duration_millis(options.command_timeout)),
            options,
            target_pid: AtomicU32::new(0),
            poisoned: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    /// Hands ownership of the debugger process and the pty primary to the
    /// session. The caller must already have closed its replica.
    pub fn attach_process(&mut self, mut child: Child, primary: OwnedFd) {
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(stderr_loop(stderr, self.stderr_tail.clone())));

        self.process = Mutex::new(Some(DebuggerProcess {
            child,
            primary,
            stderr_task,
        }));
    }

    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = Some(transcript);
        self
    }

    pub fn target_pid(&self) -> Option<u32> {
        match self.target_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn set_target_pid(&self, pid: u32) {
        self.target_pid.store(pid, Ordering::SeqCst);
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.load(Ordering::SeqCst))
    }

    /// Applies to every command issued after the call.
    pub fn set_command_timeout(&self, command_timeout: Duration) {
        self.command_timeout_ms
            .store(duration_millis(command_timeout), Ordering::SeqCst);
    }

    pub fn prompt(&self) -> &str {
        &self.options.prompt
    }

    pub fn transcript_path(&self) -> Option<&std::path::Path> {
        self.transcript.as_ref().map(Transcript::path)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Running and not poisoned. Re-evaluated on every call.
    pub async fn is_alive(&self) -> bool {
        if self.is_poisoned()
            || self.terminated.load(Ordering::SeqCst)
            || self.stream_closed.load(Ordering::SeqCst)
        {
            return false;
        }

        let mut process = self.process.lock().await;
        match process.as_mut() {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// Waits up to `limit` for the debugger process to exit. `None` while it
    /// is still running, or when the session has no process attached.
    pub async fn wait_for_exit(&self, limit: Duration) -> Option<ExitStatus> {
        let mut process = self.process.lock().await;
        let process = process.as_mut()?;
        match timeout(limit, process.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => None,
        }
    }

    /// Last lines the debugger wrote to stderr, oldest first.
    pub async fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().await.iter().cloned().collect()
    }

    /// Writes `command` and waits for the prompt that follows its output.
    pub async fn send_command(&self, command: &str) -> Result<String> {
        validate_command(command)?;
        self.ensure_usable()?;

        let mut channel = self.channel.lock().await;
        // The previous holder may have poisoned the session while we waited.
        self.ensure_usable()?;

        self.drain_unsolicited(&mut channel).await;
        self.write_command(&mut channel, command).await?;
        self.read_response(&mut channel).await
    }

    /// Writes `command` without arming the prompt wait. Used for commands
    /// that resume the target, after which the debugger stays silent until
    /// the target stops again.
    pub async fn send_command_no_wait(&self, command: &str) -> Result<()> {
        validate_command(command)?;
        self.ensure_usable()?;

        let mut channel = self.channel.lock().await;
        self.ensure_usable()?;

        self.drain_unsolicited(&mut channel).await;
        self.write_command(&mut channel, command).await
    }

    /// Waits for the next prompt without writing anything first.
    pub async fn await_prompt(&self) -> Result<String> {
        self.ensure_usable()?;

        let mut channel = self.channel.lock().await;
        self.ensure_usable()?;

        self.read_response(&mut channel).await
    }

    /// Returns and clears output the debugger printed while idle, such as
    /// stop notifications that follow a resume.
    pub async fn take_unsolicited_output(&self) -> Result<String> {
        self.ensure_usable()?;

        let mut channel = self.channel.lock().await;
        self.drain_unsolicited(&mut channel).await;
        Ok(channel.unsolicited.drain(..).collect())
    }

    /// Asks the debugger to quit, kills it if it is still running after the
    /// grace period, then releases the pty. Safe to call more than once.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!(pid = ?self.target_pid(), "Terminating debugger session");
        self.record(Direction::Internal, "terminate").await;

        // A command stuck in flight keeps the channel locked; skip straight to the kill.
        if let Ok(mut channel) = self.channel.try_lock() {
            let quit = format!("{QUIT_COMMAND}\n");
            let _ = channel.writer.write_all(quit.as_bytes()).await;
            let _ = channel.writer.flush().await;
        }

        let process = self.process.lock().await.take();
        if let Some(mut process) = process {
            match timeout(self.options.terminate_grace, process.child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!("Debugger exited with status {status}");
                }
                _ => {
                    tracing::warn!(
                        "Debugger did not quit within {:?}; killing it",
                        self.options.terminate_grace
                    );
                    if let Err(e) = process.child.kill().await {
                        tracing::warn!("Failed to kill debugger process: {e}");
                    }
                }
            }

            if let Some(task) = process.stderr_task.take() {
                task.abort();
            }
            drop(process.primary);
        }

        self.reader_task.abort();
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(LldbError::Poisoned {
                pid: self.target_pid(),
            });
        }
        if self.terminated.load(Ordering::SeqCst) {
            return Err(match self.target_pid() {
                Some(pid) => LldbError::no_session_for_pid(pid),
                None => LldbError::NoActiveSession("a terminated session".to_string()),
            });
        }
        Ok(())
    }

    fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
        tracing::warn!(pid = ?self.target_pid(), "Debugger session poisoned");
    }

    async fn write_command(&self, channel: &mut Channel, command: &str) -> Result<()> {
        tracing::debug!(pid = ?self.target_pid(), "-> {command}");

        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(b'\n');

        channel.writer.write_all(&line).await?;
        channel.writer.flush().await?;

        self.record(Direction::Outbound, command).await;
        Ok(())
    }

    async fn read_response(&self, channel: &mut Channel) -> Result<String> {
        let wait = self.command_timeout();
        let prompt = self.options.prompt.as_bytes();
        let mut accumulated = Vec::new();

        let outcome = timeout(
            wait,
            read_until_prompt(&mut channel.output, &mut accumulated, prompt),
        )
        .await;

        match outcome {
            Ok(FrameEnd::Prompt) => {
                let response = normalize_output(&accumulated);
                tracing::debug!(pid = ?self.target_pid(), "<- {} bytes", response.len());
                self.record(Direction::Inbound, &response).await;
                Ok(response)
            }
            Ok(FrameEnd::Closed) => {
                let response = normalize_output(&accumulated);
                tracing::warn!(
                    pid = ?self.target_pid(),
                    "Debugger output closed before the prompt; returning partial response"
                );
                self.record(Direction::Inbound, &response).await;
                Ok(response)
            }
            Err(_) => {
                // The reader keeps running; the output channel is never read again.
                self.poison();
                let partial = bounded_tail(&normalize_output(&accumulated), MAX_PARTIAL_OUTPUT_CHARS);
                self.record(
                    Direction::Internal,
                    &format!("timeout after {wait:?}; session poisoned"),
                )
                .await;
                Err(LldbError::Timeout {
                    timeout: wait,
                    partial,
                })
            }
        }
    }

    async fn drain_unsolicited(&self, channel: &mut Channel) {
        let mut drained = Vec::new();
        while let Ok(chunk) = channel.output.try_recv() {
            drained.extend_from_slice(&chunk);
        }
        if drained.is_empty() {
            return;
        }

        let text = normalize_output(&drained);
        tracing::debug!(pid = ?self.target_pid(), "Drained {} bytes of unsolicited output", text.len());
        self.record(Direction::Internal, &format!("unsolicited: {text}"))
            .await;
        push_unsolicited(&mut channel.unsolicited, text);
    }

    async fn record(&self, direction: Direction, text: &str) {
        if let Some(transcript) = &self.transcript {
            transcript.record(direction, text).await;
        }
    }
}

impl Drop for FramedSession {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn reader_loop(
    mut reader: BoxedReader,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    stream_closed: Arc<AtomicBool>,
) {
    let mut buf = vec![0_u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) => {
                // A pty primary reports EIO once the replica side is gone.
                tracing::debug!("Debugger output stream ended: {e}");
                break;
            }
        }
    }
    stream_closed.store(true, Ordering::SeqCst);
}

async fn stderr_loop(stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::warn!("lldb stderr: {line}");
                let mut tail = tail.lock().await;
                tail.push_back(line);
                while tail.len() > MAX_STDERR_LINES {
                    tail.pop_front();
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Debugger stderr closed: {e}");
                break;
            }
        }
    }
}

async fn read_until_prompt(
    output: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    accumulated: &mut Vec<u8>,
    prompt: &[u8],
) -> FrameEnd {
    loop {
        if !prompt.is_empty() && accumulated.ends_with(prompt) {
            accumulated.truncate(accumulated.len() - prompt.len());
            return FrameEnd::Prompt;
        }
        match output.recv().await {
            Some(chunk) => accumulated.extend_from_slice(&chunk),
            None => return FrameEnd::Closed,
        }
    }
}

fn validate_command(command: &str) -> Result<()> {
    if command.contains(['\n', '\r']) {
        return Err(LldbError::InvalidParameter(format!(
            "debugger commands must be a single line: {command:?}"
        )));
    }
    Ok(())
}

fn push_unsolicited(buffer: &mut VecDeque<String>, text: String) {
    buffer.push_back(text);
    while buffer.len() > MAX_UNSOLICITED_CHUNKS {
        buffer.pop_front();
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn normalize_output(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).replace("\r\n", "\n")
}

fn bounded_tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - max_chars).collect();
    format!("...{tail}")
}
