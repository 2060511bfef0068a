use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub pid: u32,
    pub command_timeout_ms: u64,
    pub bundle_ids: Vec<String>,
    pub transcript_path: Option<String>,
}
