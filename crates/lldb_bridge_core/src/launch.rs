//! Ways of bringing a [`FramedSession`] to the ready, attached state.
//!
//! All three strategies leave the session with its target pid set and the
//! prompt consumed, so ordinary commands can follow.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;

use crate::ops::{check_response, quote_arg, require_non_empty};
use crate::pty::PtyBridge;
use crate::registry::Connector;
use crate::session::{FramedSession, SessionOptions};
use crate::transcript::Transcript;
use crate::types::{LaunchRequest, OpenAndAttachRequest};
use crate::{LldbConfig, LldbError, Result};

static LAUNCHED_PID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Process (\d+) launched").expect("valid regex"));
static ATTACHED_PID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Process (\d+) stopped").expect("valid regex"));

const AUTO_CONFIRM_COMMAND: &str = "settings set auto-confirm true";
const RESUME_COMMAND: &str = "process continue";
// Transcript label for sessions whose target pid is not known yet.
const PENDING_LABEL: &str = "pending";

/// OS services used by the open-and-attach strategy.
pub trait AppLauncher: Send + Sync + 'static {
    /// Kills running processes whose command line matches `path`.
    fn terminate_matching(&self, path: &str) -> impl Future<Output = Result<()>> + Send;

    /// Starts the bundle through the normal application launch path.
    fn open_app(
        &self,
        bundle_path: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// `open` and `pkill` from the base system.
#[derive(Debug, Clone)]
pub struct SystemLauncher {
    pub open_path: PathBuf,
    pub pkill_path: PathBuf,
}

impl Default for SystemLauncher {
    fn default() -> Self {
        Self {
            open_path: PathBuf::from("/usr/bin/open"),
            pkill_path: PathBuf::from("/usr/bin/pkill"),
        }
    }
}

impl AppLauncher for SystemLauncher {
    async fn terminate_matching(&self, path: &str) -> Result<()> {
        let output = Command::new(&self.pkill_path)
            .args(["-f", path])
            .output()
            .await
            .map_err(|source| LldbError::ProcessStart {
                path: self.pkill_path.clone(),
                source,
            })?;

        // pkill exits with 1 when nothing matched.
        match output.status.code() {
            Some(0) | Some(1) => Ok(()),
            _ => Err(LldbError::command_failed(
                format!("pkill -f {path}"),
                String::from_utf8_lossy(&output.stderr),
            )),
        }
    }

    async fn open_app(
        &self,
        bundle_path: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        let open_args = open_command_args(bundle_path, args, env);
        tracing::info!("Launching {bundle_path} through the OS launch service");

        let output = Command::new(&self.open_path)
            .args(&open_args)
            .output()
            .await
            .map_err(|source| LldbError::ProcessStart {
                path: self.open_path.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(LldbError::command_failed(
                format!("open {}", open_args.join(" ")),
                String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(())
    }
}

fn open_command_args(bundle_path: &str, args: &[String], env: &BTreeMap<String, String>) -> Vec<String> {
    let mut open_args = Vec::with_capacity(2 + env.len() * 2 + args.len() + 1);
    for (key, value) in env {
        open_args.push("--env".to_string());
        open_args.push(format!("{key}={value}"));
    }
    open_args.push(bundle_path.to_string());
    if !args.is_empty() {
        open_args.push("--args".to_string());
        open_args.extend(args.iter().cloned());
    }
    open_args
}

/// Spawns real LLDB processes behind a pseudo-terminal.
#[derive(Debug, Clone, Default)]
pub struct LldbConnector<L = SystemLauncher> {
    config: LldbConfig,
    launcher: L,
}

impl LldbConnector<SystemLauncher> {
    pub fn new(config: LldbConfig) -> Self {
        Self {
            config,
            launcher: SystemLauncher::default(),
        }
    }
}

impl<L: AppLauncher> LldbConnector<L> {
    pub fn with_launcher(config: LldbConfig, launcher: L) -> Self {
        Self { config, launcher }
    }

    pub fn config(&self) -> &LldbConfig {
        &self.config
    }
}

impl<L: AppLauncher> Connector for LldbConnector<L> {
    async fn attach(&self, pid: u32) -> Result<FramedSession> {
        let session =
            spawn_debugger(&self.config, self.config.command_timeout, &pid.to_string()).await?;
        if let Err(e) = attach_by_pid(&session, pid).await {
            session.terminate().await;
            return Err(e);
        }
        Ok(session)
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<FramedSession> {
        let session = spawn_debugger(&self.config, self.config.command_timeout, PENDING_LABEL).await?;
        if let Err(e) = launch_process(&session, request).await {
            session.terminate().await;
            return Err(e);
        }
        Ok(session)
    }

    async fn launch_via_open(&self, request: &OpenAndAttachRequest) -> Result<FramedSession> {
        let session = spawn_debugger(&self.config, self.config.attach_timeout, PENDING_LABEL).await?;
        let attached = open_and_attach(
            &session,
            &self.launcher,
            request,
            self.config.launch_settle_delay,
            self.config.command_timeout,
        )
        .await;
        if let Err(e) = attached {
            session.terminate().await;
            return Err(e);
        }
        Ok(session)
    }
}

/// Starts the debugger on a fresh pty, consumes its startup prompt and turns
/// off interactive confirmations.
pub async fn spawn_debugger(
    config: &LldbConfig,
    command_timeout: Duration,
    label: &str,
) -> Result<FramedSession> {
    let bridge = PtyBridge::open()?;

    let child = Command::new(&config.lldb_path)
        .arg("--no-use-colors")
        .stdin(bridge.replica_stdio()?)
        .stdout(bridge.replica_stdio()?)
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| LldbError::ProcessStart {
            path: config.lldb_path.clone(),
            source,
        })?;

    tracing::info!(pid = child.id(), "Started {}", config.lldb_path.display());

    let reader = bridge.primary_file()?;
    let writer = bridge.primary_file()?;
    let options = SessionOptions::from_config(config).with_command_timeout(command_timeout);
    let mut session = FramedSession::from_transport(Box::new(reader), Box::new(writer), options);
    session.attach_process(child, bridge.into_primary());

    if let Some(dir) = &config.transcript_dir {
        match Transcript::create(dir, label).await {
            Ok(transcript) => session = session.with_transcript(transcript),
            Err(e) => tracing::warn!("Transcript disabled for this session: {e}"),
        }
    }

    let prepared = prepare(&session).await;
    if prepared.is_ok() && session.is_alive().await {
        return Ok(session);
    }

    // A debugger that dies on startup closes the pty, which reads as an empty
    // but successful response; its exit status is the useful signal.
    let exit = session.wait_for_exit(config.terminate_grace).await;
    let stderr = session.stderr_tail().await;
    session.terminate().await;
    Err(startup_error(config, prepared.err(), exit, &stderr))
}

fn startup_error(
    config: &LldbConfig,
    err: Option<LldbError>,
    exit: Option<ExitStatus>,
    stderr: &[String],
) -> LldbError {
    if let Some(status) = exit {
        let mut message = format!("debugger exited during startup with {status}");
        if !stderr.is_empty() {
            message.push_str(&format!("\n[stderr]\n{}", stderr.join("\n")));
        }
        return LldbError::ProcessStart {
            path: config.lldb_path.clone(),
            source: std::io::Error::other(message),
        };
    }
    match err {
        Some(err) => with_stderr(err, stderr),
        None => LldbError::UnexpectedOutput(
            "debugger output closed during startup".to_string(),
        ),
    }
}

async fn prepare(session: &FramedSession) -> Result<()> {
    session.await_prompt().await?;
    let response = session.send_command(AUTO_CONFIRM_COMMAND).await?;
    check_response(AUTO_CONFIRM_COMMAND, response)?;
    Ok(())
}

fn with_stderr(err: LldbError, stderr: &[String]) -> LldbError {
    if stderr.is_empty() {
        return err;
    }
    match err {
        LldbError::Timeout { timeout, partial } => LldbError::Timeout {
            timeout,
            partial: format!("{partial}\n[stderr]\n{}", stderr.join("\n")),
        },
        LldbError::CommandFailed { command, output } => LldbError::CommandFailed {
            command,
            output: format!("{output}\n[stderr]\n{}", stderr.join("\n")),
        },
        other => other,
    }
}

/// Attach-by-pid strategy.
pub async fn attach_by_pid(session: &FramedSession, pid: u32) -> Result<()> {
    let command = format!("process attach --pid {pid}");
    let response = session.send_command(&command).await?;
    check_response(&command, response).map_err(map_attach_error)?;
    session.set_target_pid(pid);
    tracing::info!(pid, "Debugger attached");
    Ok(())
}

/// Launch strategy: create the target, set its environment, launch it and
/// read the new pid from the launch confirmation.
pub async fn launch_process(session: &FramedSession, request: &LaunchRequest) -> Result<u32> {
    let executable = require_non_empty("executable_path", &request.executable_path)?;

    let command = format!("target create {}", quote_arg(executable));
    check_response(&command, session.send_command(&command).await?)?;

    for (key, value) in &request.env {
        let command = format!(
            "settings append target.env-vars {}",
            quote_arg(&format!("{key}={value}"))
        );
        check_response(&command, session.send_command(&command).await?)?;
    }

    let command = launch_command(&request.args, request.stop_at_entry);
    let response = check_response(&command, session.send_command(&command).await?)?;
    let pid = parse_pid(&LAUNCHED_PID, &response)?;

    session.set_target_pid(pid);
    tracing::info!(pid, "Launched {executable} under the debugger");
    Ok(pid)
}

fn launch_command(args: &[String], stop_at_entry: bool) -> String {
    let mut command = String::from("process launch");
    if stop_at_entry {
        command.push_str(" --stop-at-entry");
    }
    if !args.is_empty() {
        command.push_str(" --");
        for arg in args {
            command.push(' ');
            command.push_str(&quote_arg(arg));
        }
    }
    command
}

/// Open-and-attach strategy for signed, sandboxed bundles. The debugger
/// waits for the process by name while the OS launches it normally, so the
/// loader and code-signing setup of the regular launch path still apply.
pub async fn open_and_attach<L: AppLauncher>(
    session: &FramedSession,
    launcher: &L,
    request: &OpenAndAttachRequest,
    settle_delay: Duration,
    command_timeout: Duration,
) -> Result<u32> {
    let bundle_path = require_non_empty("bundle_path", &request.bundle_path)?;
    let name = require_non_empty("executable_name", &request.executable_name)?;

    let attach = format!("process attach --name {} --waitfor", quote_arg(name));
    session.send_command_no_wait(&attach).await?;

    if let Err(e) = launcher.terminate_matching(bundle_path).await {
        tracing::warn!("Could not stop existing instances of {bundle_path}: {e}");
    }
    tokio::time::sleep(settle_delay).await;

    launcher
        .open_app(bundle_path, &request.args, &request.env)
        .await?;

    let response = session.await_prompt().await?;
    let response = check_response(&attach, response).map_err(map_attach_error)?;
    let pid = parse_pid(&ATTACHED_PID, &response)?;
    session.set_target_pid(pid);
    // The long wait only covers the launch; later commands use the normal timeout.
    session.set_command_timeout(command_timeout);
    tracing::info!(pid, "Attached to {name} after OS launch");

    if !request.stop_at_entry {
        session.send_command_no_wait(RESUME_COMMAND).await?;
    }
    Ok(pid)
}

fn parse_pid(pattern: &Regex, text: &str) -> Result<u32> {
    pattern
        .captures(text)
        .and_then(|captures| captures.get(1))
        .and_then(|pid| pid.as_str().parse::<u32>().ok())
        .ok_or_else(|| {
            LldbError::UnexpectedOutput(format!(
                "no process id in debugger output: {}",
                text.trim()
            ))
        })
}

fn map_attach_error(err: LldbError) -> LldbError {
    let LldbError::CommandFailed { command, output } = err else {
        return err;
    };
    let lower = output.to_lowercase();
    if lower.contains("not allowed")
        || lower.contains("operation not permitted")
        || lower.contains("attach failed")
    {
        return LldbError::CommandFailed {
            command,
            output: format!(
                "{output}\nhint: attaching needs Developer Mode enabled and a target signed with \
                 get-task-allow (debug builds); system processes are protected by SIP."
            ),
        };
    }
    LldbError::CommandFailed { command, output }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mock_session, test_options, Reply};
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Default, Clone)]
    struct RecordingLauncher {
        calls: Arc<StdMutex<Vec<String>>>,
        fail_open: bool,
    }

    impl AppLauncher for RecordingLauncher {
        async fn terminate_matching(&self, path: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("kill {path}"));
            Ok(())
        }

        async fn open_app(
            &self,
            bundle_path: &str,
            args: &[String],
            _env: &BTreeMap<String, String>,
        ) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("open {bundle_path} {}", args.join(" ")));
            if self.fail_open {
                return Err(LldbError::command_failed("open", "LSOpenURLsWithRole() failed"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn attach_by_pid_sets_target_pid() {
        let (session, mock) = mock_session(
            |_| Reply::Text("Process 4242 stopped\n* thread #1, stop reason = signal SIGSTOP\n".into()),
            test_options(Duration::from_secs(2)),
        )
        .await;

        attach_by_pid(&session, 4242).await.expect("attach should succeed");
        assert_eq!(session.target_pid(), Some(4242));
        assert_eq!(mock.received(), vec!["process attach --pid 4242".to_string()]);
    }

    #[tokio::test]
    async fn attach_failure_carries_permission_hint() {
        let (session, _mock) = mock_session(
            |_| Reply::Text("error: attach failed: Not allowed to attach to process.\n".into()),
            test_options(Duration::from_secs(2)),
        )
        .await;

        let err = attach_by_pid(&session, 1).await.expect_err("attach must fail");
        let message = err.to_string();
        assert!(message.contains("Not allowed to attach"), "unexpected error: {message}");
        assert!(message.contains("get-task-allow"), "unexpected error: {message}");
        assert_eq!(session.target_pid(), None);
    }

    #[tokio::test]
    async fn launch_process_sets_env_and_parses_pid() {
        let (session, mock) = mock_session(
            |command| {
                if command.starts_with("target create") {
                    Reply::Text("Current executable set to '/tmp/My App/app' (arm64).\n".into())
                } else if command.starts_with("process launch") {
                    Reply::Text("Process 5150 launched: '/tmp/My App/app' (arm64)\n".into())
                } else {
                    Reply::Text(String::new())
                }
            },
            test_options(Duration::from_secs(2)),
        )
        .await;

        let request = LaunchRequest {
            executable_path: "/tmp/My App/app".into(),
            args: vec!["--verbose".into(), "two words".into()],
            env: BTreeMap::from([("MODE".to_string(), "debug".to_string())]),
            stop_at_entry: true,
        };

        let pid = launch_process(&session, &request).await.expect("launch should succeed");
        assert_eq!(pid, 5150);
        assert_eq!(session.target_pid(), Some(5150));
        assert_eq!(
            mock.received(),
            vec![
                "target create \"/tmp/My App/app\"".to_string(),
                "settings append target.env-vars MODE=debug".to_string(),
                "process launch --stop-at-entry -- --verbose \"two words\"".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn launch_without_pid_in_output_is_unexpected() {
        let (session, _mock) = mock_session(
            |_| Reply::Text("something else entirely\n".into()),
            test_options(Duration::from_secs(2)),
        )
        .await;

        let request = LaunchRequest {
            executable_path: "/tmp/app".into(),
            ..LaunchRequest::default()
        };
        let err = launch_process(&session, &request).await.expect_err("no pid");
        assert!(matches!(err, LldbError::UnexpectedOutput(_)), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn open_and_attach_waits_for_the_os_launched_process() {
        let launcher = RecordingLauncher::default();
        let (session, mock) = mock_session(|_| Reply::Silent, test_options(Duration::from_secs(2))).await;

        let request = OpenAndAttachRequest {
            bundle_path: "/Apps/Demo.app".into(),
            executable_name: "Demo".into(),
            bundle_id: Some("com.example.demo".into()),
            args: vec!["-reset".into()],
            stop_at_entry: true,
            ..OpenAndAttachRequest::default()
        };

        let handle = {
            let launcher = launcher.clone();
            tokio::spawn(async move {
                let pid =
                    open_and_attach(
                        &session,
                        &launcher,
                        &request,
                        Duration::from_millis(10),
                        Duration::from_millis(750),
                    )
                    .await?;
                Ok::<_, LldbError>((pid, session))
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        mock.emit("Process 777 stopped\n* thread #1, stop reason = signal SIGSTOP\n(lldb) ");

        let (pid, session) = handle.await.expect("join").expect("attach should resolve");
        assert_eq!(pid, 777);
        assert_eq!(session.target_pid(), Some(777));
        assert_eq!(session.command_timeout(), Duration::from_millis(750));
        assert_eq!(
            mock.received(),
            vec!["process attach --name Demo --waitfor".to_string()]
        );
        assert_eq!(
            *launcher.calls.lock().unwrap(),
            vec!["kill /Apps/Demo.app".to_string(), "open /Apps/Demo.app -reset".to_string()]
        );
    }

    #[tokio::test]
    async fn open_and_attach_resumes_when_not_stopping_at_entry() {
        let launcher = RecordingLauncher::default();
        let (session, mock) = mock_session(|_| Reply::Silent, test_options(Duration::from_secs(2))).await;

        let request = OpenAndAttachRequest {
            bundle_path: "/Apps/Demo.app".into(),
            executable_name: "Demo".into(),
            ..OpenAndAttachRequest::default()
        };

        let session = Arc::new(session);
        let task = {
            let session = session.clone();
            tokio::spawn(async move {
                open_and_attach(&*session, &launcher, &request, Duration::ZERO, Duration::from_secs(2)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        mock.emit("Process 31 stopped\n(lldb) ");

        assert_eq!(task.await.expect("join").expect("attach"), 31);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            mock.received(),
            vec![
                "process attach --name Demo --waitfor".to_string(),
                RESUME_COMMAND.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn open_and_attach_surfaces_launch_service_failure() {
        let launcher = RecordingLauncher {
            fail_open: true,
            ..RecordingLauncher::default()
        };
        let (session, _mock) = mock_session(|_| Reply::Silent, test_options(Duration::from_secs(2))).await;

        let request = OpenAndAttachRequest {
            bundle_path: "/Apps/Demo.app".into(),
            executable_name: "Demo".into(),
            ..OpenAndAttachRequest::default()
        };
        let err = open_and_attach(&session, &launcher, &request, Duration::ZERO, Duration::from_secs(2))
            .await
            .expect_err("open failure must surface");
        assert!(err.to_string().contains("LSOpenURLsWithRole"), "unexpected error: {err}");
    }

    #[test]
    fn parse_pid_reads_launch_and_attach_confirmations() {
        assert_eq!(
            parse_pid(&LAUNCHED_PID, "Process 12345 launched: '/tmp/app' (arm64)").unwrap(),
            12345
        );
        assert_eq!(
            parse_pid(&ATTACHED_PID, "Process 88 stopped\n* thread #1").unwrap(),
            88
        );
        assert!(parse_pid(&LAUNCHED_PID, "Process stopped").is_err());
    }

    #[test]
    fn launch_command_quotes_arguments() {
        assert_eq!(launch_command(&[], false), "process launch");
        assert_eq!(
            launch_command(&["a b".to_string(), "c".to_string()], true),
            "process launch --stop-at-entry -- \"a b\" c"
        );
    }

    #[test]
    fn open_command_args_place_env_before_bundle_and_args_after() {
        let env = BTreeMap::from([("A".to_string(), "1".to_string())]);
        assert_eq!(
            open_command_args("/Apps/Demo.app", &["-x".to_string()], &env),
            vec!["--env", "A=1", "/Apps/Demo.app", "--args", "-x"]
        );
        assert_eq!(
            open_command_args("/Apps/Demo.app", &[], &BTreeMap::new()),
            vec!["/Apps/Demo.app"]
        );
    }

    #[test]
    fn with_stderr_appends_tail_to_debugger_failures() {
        let err = with_stderr(
            LldbError::Timeout {
                timeout: Duration::from_secs(1),
                partial: String::new(),
            },
            &["dyld: missing symbol".to_string()],
        );
        assert!(err.to_string().contains("dyld: missing symbol"));

        let err = with_stderr(LldbError::InvalidParameter("x".into()), &["ignored".to_string()]);
        assert!(!err.to_string().contains("ignored"));
    }

    #[tokio::test]
    async fn spawn_reports_missing_debugger_binary() {
        let config = LldbConfig {
            lldb_path: PathBuf::from("/nonexistent/lldb-for-tests"),
            ..LldbConfig::default()
        };
        let err = spawn_debugger(&config, Duration::from_secs(1), "test")
            .await
            .err()
            .expect("missing binary must fail");
        assert!(matches!(err, LldbError::ProcessStart { .. }), "unexpected error: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_reports_debugger_that_exits_during_startup() {
        let config = LldbConfig {
            lldb_path: PathBuf::from("false"),
            terminate_grace: Duration::from_secs(2),
            ..LldbConfig::default()
        };
        let err = spawn_debugger(&config, Duration::from_secs(5), "test")
            .await
            .err()
            .expect("exited debugger must fail");
        match err {
            LldbError::ProcessStart { source, .. } => {
                assert!(source.to_string().contains("exited during startup"), "unexpected source: {source}");
            }
            other => panic!("expected a startup failure, got {other}"),
        }
    }

    #[test]
    fn startup_error_prefers_exit_status_over_framing_error() {
        let config = LldbConfig::default();
        let err = startup_error(
            &config,
            Some(LldbError::Timeout {
                timeout: Duration::from_secs(1),
                partial: String::new(),
            }),
            None,
            &["error: unable to load".to_string()],
        );
        assert!(matches!(err, LldbError::Timeout { .. }));
        assert!(err.to_string().contains("unable to load"));

        let err = startup_error(&config, None, None, &[]);
        assert!(matches!(err, LldbError::UnexpectedOutput(_)), "unexpected error: {err}");
    }
}
