use crate::registry::{CandidateId, CandidateSelector};

/// Every request the shell can hand to the engine, decoded once from raw
/// callback data or message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Cast { candidate: CandidateId },
    ShowResults,
    /// Voter says they joined the required groups; check again
    Recheck,
    ListCandidates,
    AddCandidate { name: String },
    BeginBulkAdd,
    RemoveCandidate { selector: CandidateSelector },
    BeginRemoveCandidate,
    ListGates,
    AddGate { group_id: String, join_hint: Option<String> },
    BeginAddGate,
    RemoveGate { group_id: String },
    BeginRemoveGate,
    SetTimer { minutes: i64 },
    CloseWindow,
    OpenWindow,
    Reset,
    Export,
    Stats,
    Cancel,
    /// Free text, fed to a pending admin input if there is one
    Text(String),
    Invalid(String),
}

impl Command {
    /// Inline-button payloads: `vote:<id>`, `results`, `recheck`.
    pub fn from_callback(data: &str) -> Command {
        let data = data.trim();
        if let Some(id) = data.strip_prefix("vote:") {
            return match id.parse() {
                Ok(candidate) => Command::Cast { candidate },
                Err(_) => Command::Invalid(format!("bad candidate id: {}", id)),
            };
        }
        match data {
            "results" => Command::ShowResults,
            "recheck" => Command::Recheck,
            other => Command::Invalid(format!("unknown callback: {}", other)),
        }
    }

    pub fn from_text(text: &str) -> Command {
        let text = text.trim();
        if !text.starts_with('/') {
            return Command::Text(text.to_string());
        }
        let (head, rest) = match text.split_once(char::is_whitespace) {
            Some((h, r)) => (h, r.trim()),
            None => (text, ""),
        };
        // "/start@SomeBot" -> "/start"
        let head = head.split('@').next().unwrap_or(head);

        match head {
            "/start" | "/vote" => Command::Start,
            "/results" => Command::ShowResults,
            "/candidates" => Command::ListCandidates,
            "/add" if rest.is_empty() => Command::Invalid("usage: /add <name>".to_string()),
            "/add" => Command::AddCandidate { name: rest.to_string() },
            "/bulk" => Command::BeginBulkAdd,
            "/remove" if rest.is_empty() => Command::BeginRemoveCandidate,
            "/remove" => match CandidateSelector::parse(rest) {
                Some(selector) => Command::RemoveCandidate { selector },
                None => Command::Invalid("usage: /remove <id|#rank|name>".to_string()),
            },
            "/gates" => Command::ListGates,
            "/gate_add" if rest.is_empty() => Command::BeginAddGate,
            "/gate_add" => {
                let mut parts = rest.split_whitespace();
                let group_id = parts.next().unwrap_or_default().to_string();
                let join_hint = parts.next().map(|s| s.to_string());
                Command::AddGate { group_id, join_hint }
            }
            "/gate_remove" if rest.is_empty() => Command::BeginRemoveGate,
            "/gate_remove" => Command::RemoveGate { group_id: rest.to_string() },
            "/timer" => match rest.parse::<i64>() {
                Ok(minutes) if minutes > 0 => Command::SetTimer { minutes },
                _ => Command::Invalid("usage: /timer <minutes>".to_string()),
            },
            "/close" => Command::CloseWindow,
            "/open" => Command::OpenWindow,
            "/reset" => Command::Reset,
            "/export" => Command::Export,
            "/stats" => Command::Stats,
            "/cancel" => Command::Cancel,
            other => Command::Invalid(format!("unknown command: {}", other)),
        }
    }

    /// Short label for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Cast { .. } => "cast",
            Command::ShowResults => "results",
            Command::Recheck => "recheck",
            Command::ListCandidates => "candidates",
            Command::AddCandidate { .. } => "add",
            Command::BeginBulkAdd => "bulk",
            Command::RemoveCandidate { .. } | Command::BeginRemoveCandidate => "remove",
            Command::ListGates => "gates",
            Command::AddGate { .. } | Command::BeginAddGate => "gate_add",
            Command::RemoveGate { .. } | Command::BeginRemoveGate => "gate_remove",
            Command::SetTimer { .. } => "timer",
            Command::CloseWindow => "close",
            Command::OpenWindow => "open",
            Command::Reset => "reset",
            Command::Export => "export",
            Command::Stats => "stats",
            Command::Cancel => "cancel",
            Command::Text(_) => "text",
            Command::Invalid(_) => "invalid",
        }
    }

    pub fn is_admin_only(&self) -> bool {
        !matches!(
            self,
            Command::Start
                | Command::Cast { .. }
                | Command::ShowResults
                | Command::Recheck
                | Command::Text(_)
                | Command::Invalid(_)
        )
    }
}

/// Callback payload for a vote button.
pub fn vote_payload(candidate: CandidateId) -> String {
    format!("vote:{}", candidate)
}
