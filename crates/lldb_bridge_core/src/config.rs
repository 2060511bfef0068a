use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_LLDB_PATH: &str = "lldb";
const DEFAULT_PROMPT: &str = "(lldb) ";
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_millis(500);
const DEFAULT_LAUNCH_SETTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct LldbConfig {
    /// Debugger executable; a bare name is resolved through `PATH`.
    pub lldb_path: PathBuf,
    /// Idle prompt the debugger prints when ready for the next command.
    pub prompt: String,
    pub command_timeout: Duration,
    /// Used instead of `command_timeout` while waiting for an app started
    /// through the OS launch service to appear.
    pub attach_timeout: Duration,
    pub terminate_grace: Duration,
    pub launch_settle_delay: Duration,
    pub transcript_dir: Option<PathBuf>,
}

impl Default for LldbConfig {
    fn default() -> Self {
        Self {
            lldb_path: PathBuf::from(DEFAULT_LLDB_PATH),
            prompt: DEFAULT_PROMPT.to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            attach_timeout: DEFAULT_ATTACH_TIMEOUT,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            launch_settle_delay: DEFAULT_LAUNCH_SETTLE_DELAY,
            transcript_dir: None,
        }
    }
}

impl LldbConfig {
    pub fn new(lldb_path: impl Into<PathBuf>, command_timeout: Duration) -> Self {
        Self {
            lldb_path: lldb_path.into(),
            command_timeout,
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();

        let lldb_path = std::env::var("LLDB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.lldb_path);

        let prompt = std::env::var("LLDB_PROMPT")
            .ok()
            .filter(|prompt| !prompt.is_empty())
            .unwrap_or(defaults.prompt);

        let command_timeout =
            duration_from_env("LLDB_COMMAND_TIMEOUT_MS").unwrap_or(defaults.command_timeout);
        let attach_timeout =
            duration_from_env("LLDB_ATTACH_TIMEOUT_MS").unwrap_or(defaults.attach_timeout);

        let transcript_dir = std::env::var("LLDB_TRANSCRIPT_DIR")
            .ok()
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);

        Self {
            lldb_path,
            prompt,
            command_timeout,
            attach_timeout,
            transcript_dir,
            ..defaults
        }
    }
}

fn duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}
