//! In-process stand-in for an LLDB console, speaking the prompt protocol over
//! an in-memory duplex stream.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::registry::{Connector, SessionRegistry};
use crate::session::{FramedSession, SessionOptions};
use crate::types::{LaunchRequest, OpenAndAttachRequest};
use crate::{LldbError, Result};

pub(crate) const MOCK_PROMPT: &str = "(lldb) ";

/// How the mock answers one command line.
pub(crate) enum Reply {
    /// Text followed by the prompt, in one write.
    Text(String),
    /// Text followed by the prompt, split into chunks of the given size.
    Fragmented(String, usize),
    /// Text followed by the prompt after a delay.
    Delayed(Duration, String),
    /// Text with no prompt afterwards.
    NoPrompt(String),
    /// Nothing at all.
    Silent,
    /// Text, then the console closes as if the debugger exited.
    CloseAfter(String),
}

enum Event {
    Emit(String),
    Close,
}

pub(crate) struct MockDebugger {
    received: Arc<StdMutex<Vec<String>>>,
    events: mpsc::UnboundedSender<Event>,
}

impl MockDebugger {
    /// Every command line the mock has read, in order.
    pub(crate) fn received(&self) -> Vec<String> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Writes raw text to the console as if the debugger printed it unprompted.
    pub(crate) fn emit(&self, text: impl Into<String>) {
        let _ = self.events.send(Event::Emit(text.into()));
    }

    /// Closes the console as if the debugger process died.
    pub(crate) fn close(&self) {
        let _ = self.events.send(Event::Close);
    }
}

pub(crate) fn test_options(command_timeout: Duration) -> SessionOptions {
    SessionOptions {
        prompt: MOCK_PROMPT.to_string(),
        command_timeout,
        terminate_grace: Duration::from_millis(50),
    }
}

/// Starts a mock console, wraps it in a session and consumes the startup
/// prompt, mirroring what the real spawn path does.
pub(crate) async fn mock_session<F>(script: F, options: SessionOptions) -> (FramedSession, MockDebugger)
where
    F: FnMut(&str) -> Reply + Send + 'static,
{
    let (session, mock) = mock_console(script, options);
    session
        .await_prompt()
        .await
        .expect("mock startup prompt should frame");
    (session, mock)
}

/// Same as [`mock_session`] without consuming the startup prompt.
pub(crate) fn mock_console<F>(mut script: F, options: SessionOptions) -> (FramedSession, MockDebugger)
where
    F: FnMut(&str) -> Reply + Send + 'static,
{
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, mut server_write) = tokio::io::split(server);

    let received = Arc::new(StdMutex::new(Vec::new()));
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let prompt = options.prompt.clone();

    let log = received.clone();
    tokio::spawn(async move {
        if server_write.write_all(prompt.as_bytes()).await.is_err() {
            return;
        }
        let mut lines = BufReader::new(server_read).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Ok(Some(line)) = line else { break };
                    if let Ok(mut log) = log.lock() {
                        log.push(line.clone());
                    }
                    let keep_open = match script(&line) {
                        Reply::Text(text) => write(&mut server_write, &format!("{text}{prompt}")).await,
                        Reply::Fragmented(text, size) => {
                            let payload = format!("{text}{prompt}");
                            let mut ok = true;
                            for chunk in payload.as_bytes().chunks(size.max(1)) {
                                if server_write.write_all(chunk).await.is_err() {
                                    ok = false;
                                    break;
                                }
                                let _ = server_write.flush().await;
                                tokio::time::sleep(Duration::from_millis(1)).await;
                            }
                            ok
                        }
                        Reply::Delayed(delay, text) => {
                            tokio::time::sleep(delay).await;
                            write(&mut server_write, &format!("{text}{prompt}")).await
                        }
                        Reply::NoPrompt(text) => write(&mut server_write, &text).await,
                        Reply::Silent => true,
                        Reply::CloseAfter(text) => {
                            let _ = write(&mut server_write, &text).await;
                            false
                        }
                    };
                    if !keep_open {
                        break;
                    }
                }
                event = events_rx.recv() => match event {
                    Some(Event::Emit(text)) => {
                        if !write(&mut server_write, &text).await {
                            break;
                        }
                    }
                    Some(Event::Close) | None => break,
                },
            }
        }
    });

    let session = FramedSession::from_transport(Box::new(client_read), Box::new(client_write), options);
    (
        session,
        MockDebugger {
            received,
            events: events_tx,
        },
    )
}

async fn write<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> bool {
    writer.write_all(text.as_bytes()).await.is_ok() && writer.flush().await.is_ok()
}

/// Connector that hands out mock consoles instead of spawning LLDB. Every
/// session it creates answers with the same script.
pub(crate) struct MockConnector {
    script: fn(&str) -> Reply,
    command_timeout: Duration,
    next_launch_pid: AtomicU32,
    consoles: StdMutex<Vec<MockDebugger>>,
    fail_with: StdMutex<Option<String>>,
    creation_delay: StdMutex<Duration>,
}

impl MockConnector {
    pub(crate) fn new(script: fn(&str) -> Reply) -> Self {
        Self::with_timeout(script, Duration::from_secs(2))
    }

    pub(crate) fn with_timeout(script: fn(&str) -> Reply, command_timeout: Duration) -> Self {
        Self {
            script,
            command_timeout,
            next_launch_pid: AtomicU32::new(9000),
            consoles: StdMutex::new(Vec::new()),
            fail_with: StdMutex::new(None),
            creation_delay: StdMutex::new(Duration::ZERO),
        }
    }

    /// Number of sessions created so far, across every strategy.
    pub(crate) fn created(&self) -> usize {
        self.consoles.lock().map(|c| c.len()).unwrap_or_default()
    }

    pub(crate) fn received(&self, index: usize) -> Vec<String> {
        self.with_console(index, MockDebugger::received)
    }

    pub(crate) fn emit(&self, index: usize, text: &str) {
        self.with_console(index, |console| console.emit(text))
    }

    pub(crate) fn close(&self, index: usize) {
        self.with_console(index, MockDebugger::close)
    }

    /// Makes the next creation fail with a command failure carrying `output`.
    pub(crate) fn fail_next(&self, output: &str) {
        if let Ok(mut fail) = self.fail_with.lock() {
            *fail = Some(output.to_string());
        }
    }

    /// Makes every later creation take at least `delay`, like a debugger
    /// waiting on a slow attach.
    pub(crate) fn set_creation_delay(&self, delay: Duration) {
        if let Ok(mut current) = self.creation_delay.lock() {
            *current = delay;
        }
    }

    fn with_console<T>(&self, index: usize, f: impl FnOnce(&MockDebugger) -> T) -> T {
        let consoles = self.consoles.lock().expect("console list lock");
        f(consoles.get(index).expect("no console at that index"))
    }

    async fn create(&self, pid: u32, command: &str) -> Result<FramedSession> {
        let delay = self.creation_delay.lock().map(|d| *d).unwrap_or_default();
        tokio::time::sleep(delay).await;
        if let Some(output) = self.fail_with.lock().ok().and_then(|mut f| f.take()) {
            return Err(LldbError::command_failed(command, output));
        }
        let (session, console) = mock_session(self.script, test_options(self.command_timeout)).await;
        session.set_target_pid(pid);
        if let Ok(mut consoles) = self.consoles.lock() {
            consoles.push(console);
        }
        Ok(session)
    }
}

impl Connector for MockConnector {
    async fn attach(&self, pid: u32) -> Result<FramedSession> {
        self.create(pid, &format!("process attach --pid {pid}")).await
    }

    async fn launch(&self, _request: &LaunchRequest) -> Result<FramedSession> {
        let pid = self.next_launch_pid.fetch_add(1, Ordering::SeqCst);
        self.create(pid, "process launch").await
    }

    async fn launch_via_open(&self, _request: &OpenAndAttachRequest) -> Result<FramedSession> {
        let pid = self.next_launch_pid.fetch_add(1, Ordering::SeqCst);
        self.create(pid, "process attach --waitfor").await
    }
}

pub(crate) fn mock_registry(script: fn(&str) -> Reply) -> SessionRegistry<MockConnector> {
    SessionRegistry::new(MockConnector::new(script))
}

/// Answers every command with a line naming it, so tests can check which
/// template reached the debugger.
pub(crate) fn echo_script(command: &str) -> Reply {
    Reply::Text(format!("ran: {command}\n"))
}
