use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::LldbError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub executable_path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub stop_at_entry: bool,
}

/// Start an app bundle through the OS launch service, then attach by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAndAttachRequest {
    pub bundle_path: String,
    /// Process name the debugger waits for, normally the bundle executable.
    pub executable_name: String,
    #[serde(default)]
    pub bundle_id: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub stop_at_entry: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Over,
    Into,
    Out,
    Instruction,
}

impl FromStr for StepKind {
    type Err = LldbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "over" => Ok(Self::Over),
            "into" | "in" => Ok(Self::Into),
            "out" => Ok(Self::Out),
            "instruction" => Ok(Self::Instruction),
            other => Err(LldbError::InvalidParameter(format!(
                "unknown step kind '{other}' (expected over, into, out or instruction)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchKind {
    Read,
    Write,
    ReadWrite,
}

impl WatchKind {
    pub fn as_lldb_arg(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadWrite => "read_write",
        }
    }
}

impl FromStr for WatchKind {
    type Err = LldbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "read_write" | "readwrite" => Ok(Self::ReadWrite),
            other => Err(LldbError::InvalidParameter(format!(
                "unknown watchpoint kind '{other}' (expected read, write or read_write)"
            ))),
        }
    }
}
