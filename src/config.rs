use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: Option<String>,
    pub api_base: String,
    pub sqlite_path: String,
    pub admin_ids: HashSet<i64>,
    pub oracle_timeout_ms: u64,
    pub poll_timeout_secs: u64,
    pub admin_input_ttl_secs: u64,
    /// Seed names applied only when the registry is empty
    pub seed_candidates: Vec<String>,
    pub vote_prompt: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: "https://api.telegram.org".to_string(),
            sqlite_path: "./ballotbox.sqlite".to_string(),
            admin_ids: HashSet::new(),
            oracle_timeout_ms: 3000,
            poll_timeout_secs: 30,
            admin_input_ttl_secs: 300,
            seed_candidates: Vec::new(),
            vote_prompt: "Ovoz bering:".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bot_token: std::env::var("BOT_TOKEN").ok().filter(|t| !t.trim().is_empty()),
            api_base: std::env::var("API_BASE").unwrap_or(d.api_base),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or(d.sqlite_path),
            admin_ids: std::env::var("ADMIN_IDS").map(|v| parse_ids(&v)).unwrap_or_default(),
            oracle_timeout_ms: std::env::var("ORACLE_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.oracle_timeout_ms),
            poll_timeout_secs: std::env::var("POLL_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.poll_timeout_secs),
            admin_input_ttl_secs: std::env::var("ADMIN_INPUT_TTL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.admin_input_ttl_secs),
            seed_candidates: std::env::var("CANDIDATES").map(|v| parse_list(&v)).unwrap_or_default(),
            vote_prompt: std::env::var("VOTE_PROMPT").unwrap_or(d.vote_prompt),
        }
    }
}

fn parse_ids(raw: &str) -> HashSet<i64> {
    raw.split(',').filter_map(|s| s.trim().parse().ok()).collect()
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
