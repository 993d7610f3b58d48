//! Long-poll dispatcher and plain-text rendering around the engine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{SecondsFormat, TimeZone, Utc};
use tokio::task::{self, JoinSet};

use crate::ballots::{CastOutcome, ExportRow};
use crate::command::{vote_payload, Command};
use crate::controller::{AdminId, PendingInput, PendingOutcome, SessionController};
use crate::error::EngineError;
use crate::gate::{Eligibility, GateGroup};
use crate::logging::{debug, error, info, obj, v_int, v_str, Domain};
use crate::registry::Candidate;
use crate::retry::{retry_async, RetryConfig};
use crate::tally::Tally;
use crate::telegram::{is_transient, ApiError, BotApi, CallbackQuery, InlineButton, Keyboard, Message, Update};
use crate::window::WindowState;

/// What the shell sends back for an admin command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    /// Voting prompt with the live keyboard
    Ballot,
    Document { file_name: String, bytes: Vec<u8>, caption: String },
}

#[derive(Clone)]
pub struct Dispatcher {
    api: Arc<BotApi>,
    engine: Arc<SessionController>,
    prompt: String,
    poll_timeout_secs: u64,
}

impl Dispatcher {
    pub fn new(api: Arc<BotApi>, engine: Arc<SessionController>, prompt: String, poll_timeout_secs: u64) -> Self {
        Self { api, engine, prompt, poll_timeout_secs }
    }

    /// Poll for updates until `shutdown` resolves or the API rejects the
    /// bot outright (bad token, competing poller). Each update is handled on
    /// its own task; in-flight tasks are drained before returning.
    pub async fn run<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let retry = RetryConfig::default();
        let mut offset = 0i64;
        let mut tasks = JoinSet::new();
        info(Domain::Transport, "polling", obj(&[("timeout_secs", v_int(self.poll_timeout_secs as i64))]));

        let result = loop {
            while let Some(done) = tasks.try_join_next() {
                log_task_exit(done);
            }
            let polled = tokio::select! {
                biased;
                _ = &mut shutdown => break Ok(()),
                polled = retry_async(
                    &retry,
                    "getUpdates",
                    || self.api.get_updates(offset, self.poll_timeout_secs),
                    is_transient,
                ) => polled,
            };
            let updates = match polled {
                Ok(updates) => updates,
                Err(e) => {
                    if let Some(api_err) = e.downcast_ref::<ApiError>() {
                        if !api_err.is_retryable() {
                            break Err(e);
                        }
                    }
                    error(Domain::Transport, "poll_failed", obj(&[("error", v_str(&e.to_string()))]));
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            for update in updates {
                offset = offset.max(update.update_id + 1);
                let this = self.clone();
                tasks.spawn(async move {
                    let update_id = update.update_id;
                    if let Err(e) = this.handle_update(update).await {
                        error(
                            Domain::Transport,
                            "update_failed",
                            obj(&[("update_id", v_int(update_id)), ("error", v_str(&e.to_string()))]),
                        );
                    }
                });
            }
        };

        if !tasks.is_empty() {
            info(Domain::Transport, "draining", obj(&[("in_flight", v_int(tasks.len() as i64))]));
        }
        while let Some(done) = tasks.join_next().await {
            log_task_exit(done);
        }
        result
    }

    /// Swap the keyboard on a ballot message. Telegram rejects an edit that
    /// changes nothing, which happens whenever the counts are unchanged.
    async fn refresh_keyboard(&self, chat: Option<(i64, i64)>, kb: &Keyboard) {
        let Some((chat_id, message_id)) = chat else {
            return;
        };
        if let Err(e) = self.api.edit_reply_markup(chat_id, message_id, kb).await {
            if !is_not_modified(&e) {
                debug(
                    Domain::Transport,
                    "keyboard_edit_failed",
                    obj(&[("chat_id", v_int(chat_id)), ("error", v_str(&e.to_string()))]),
                );
            }
        }
    }

    async fn handle_update(&self, update: Update) -> Result<()> {
        if let Some(cb) = update.callback_query {
            return self.handle_callback(cb).await;
        }
        if let Some(msg) = update.message {
            return self.handle_message(msg).await;
        }
        Ok(())
    }

    async fn handle_callback(&self, cb: CallbackQuery) -> Result<()> {
        let voter = cb.from.id;
        let chat = cb.message.as_ref().map(|m| (m.chat.id, m.message_id));
        match Command::from_callback(cb.data.as_deref().unwrap_or_default()) {
            Command::Cast { candidate } => match self.engine.cast_vote(voter, candidate).await {
                Ok(receipt) => {
                    let note = match receipt.outcome {
                        CastOutcome::Accepted => "✅ Your vote was accepted",
                        CastOutcome::Replaced => "✅ Your vote was updated",
                    };
                    self.api.answer_callback(&cb.id, note, false).await?;
                    self.refresh_keyboard(chat, &voting_keyboard(&receipt.tally, true)).await;
                }
                Err(EngineError::NotEligible) => {
                    self.api.answer_callback(&cb.id, "Join the required groups first", true).await?;
                    let gates = self.engine.gates()?;
                    if let Some((chat_id, _)) = chat {
                        self.api
                            .send_message(chat_id, &gate_text(&gates), Some(&gate_keyboard(&gates)))
                            .await?;
                    }
                }
                Err(EngineError::NoSuchCandidate) => {
                    self.api.answer_callback(&cb.id, "That choice no longer exists", true).await?;
                    let kb = voting_keyboard(&self.engine.results()?, self.engine.window_state()?.is_open());
                    self.refresh_keyboard(chat, &kb).await;
                }
                Err(EngineError::VotingClosed) => {
                    self.api.answer_callback(&cb.id, "Voting is closed", true).await?;
                    self.refresh_keyboard(chat, &voting_keyboard(&self.engine.results()?, false)).await;
                }
                Err(e) => {
                    self.api.answer_callback(&cb.id, "Something went wrong, try again", true).await?;
                    return Err(e.into());
                }
            },
            Command::ShowResults => {
                self.api.answer_callback(&cb.id, "", false).await?;
                if let Some((chat_id, _)) = chat {
                    let text = results_text(&self.engine.results()?, self.engine.window_state()?);
                    self.api.send_message(chat_id, &text, None).await?;
                }
            }
            Command::Recheck => match self.engine.check_eligibility(voter).await? {
                Eligibility::Eligible => {
                    self.api.answer_callback(&cb.id, "✅ You can vote now", false).await?;
                    if let Some((chat_id, _)) = chat {
                        self.send_ballot(chat_id).await?;
                    }
                }
                _ => {
                    self.api.answer_callback(&cb.id, "Still not a member of every required group", true).await?;
                }
            },
            other => {
                debug(Domain::Transport, "ignored_callback", obj(&[("command", v_str(&format!("{:?}", other)))]));
                self.api.answer_callback(&cb.id, "", false).await?;
            }
        }
        Ok(())
    }

    async fn handle_message(&self, msg: Message) -> Result<()> {
        let (Some(from), Some(text)) = (msg.from.as_ref(), msg.text.as_deref()) else {
            return Ok(());
        };
        let chat_id = msg.chat.id;
        let command = Command::from_text(text);

        // Non-admins never learn the admin surface exists.
        if command.is_admin_only() && !self.engine.is_admin(from.id) {
            return Ok(());
        }

        let reply = match command {
            Command::Start => Reply::Ballot,
            Command::ShowResults => Reply::Text(results_text(&self.engine.results()?, self.engine.window_state()?)),
            Command::Text(body) if self.engine.is_admin(from.id) => {
                let (engine, admin) = (self.engine.clone(), from.id);
                match task::spawn_blocking(move || engine.submit_input(admin, &body)).await? {
                    Ok(Some(outcome)) => Reply::Text(pending_outcome_text(&outcome)),
                    Ok(None) => return Ok(()),
                    Err(e) => Reply::Text(error_text(&e)),
                }
            }
            Command::Text(_) | Command::Cast { .. } | Command::Recheck => return Ok(()),
            Command::Invalid(ref reason) if !self.engine.is_admin(from.id) => {
                debug(Domain::Transport, "ignored_text", obj(&[("reason", v_str(reason))]));
                return Ok(());
            }
            admin_cmd => {
                // Admin writes and exports are plain SQLite work; keep them off
                // the runtime threads.
                let (engine, admin) = (self.engine.clone(), from.id);
                match task::spawn_blocking(move || handle_admin(&engine, admin, &admin_cmd)).await? {
                    Ok(reply) => reply,
                    Err(EngineError::Unauthorized) => return Ok(()),
                    Err(e) => Reply::Text(error_text(&e)),
                }
            }
        };

        match reply {
            Reply::Ballot => self.send_ballot(chat_id).await,
            Reply::Text(text) => self.api.send_message(chat_id, &text, None).await.map(|_| ()),
            Reply::Document { file_name, bytes, caption } => {
                self.api.send_document(chat_id, &file_name, bytes, &caption).await.map(|_| ())
            }
        }
    }

    async fn send_ballot(&self, chat_id: i64) -> Result<()> {
        let state = self.engine.window_state()?;
        let tally = self.engine.results()?;
        let text = format!("{}\n{}", self.prompt, window_text(state));
        self.api.send_message(chat_id, &text, Some(&voting_keyboard(&tally, state.is_open()))).await?;
        Ok(())
    }
}

/// Run one command from the admin surface. Anything past `/start` and
/// `/results` is refused with `Unauthorized` for non-admins, including
/// listings and malformed commands.
pub fn handle_admin(engine: &SessionController, admin: AdminId, command: &Command) -> Result<Reply, EngineError> {
    if !matches!(command, Command::Start | Command::ShowResults) {
        engine.authorize(admin, command.name())?;
    }
    let text = match command {
        Command::ListCandidates => candidates_text(&engine.candidates()?),
        Command::AddCandidate { name } => {
            let id = engine.add_candidate(admin, name)?;
            format!("Added \"{}\" (id {})", name.trim(), id)
        }
        Command::BeginBulkAdd => {
            engine.begin_input(admin, PendingInput::BulkCandidates)?;
            "Send candidate names, one per line. /cancel to abort.".to_string()
        }
        Command::RemoveCandidate { selector } => {
            let removed = engine.remove_candidate(admin, selector)?;
            format!("Removed \"{}\" (id {})", removed.name, removed.id)
        }
        Command::BeginRemoveCandidate => {
            engine.begin_input(admin, PendingInput::RemoveCandidate)?;
            format!("{}\n\nSend an id, #rank or name. /cancel to abort.", candidates_text(&engine.candidates()?))
        }
        Command::ListGates => gates_admin_text(&engine.gates()?),
        Command::AddGate { group_id, join_hint } => {
            engine.add_gate(admin, group_id, join_hint.as_deref())?;
            format!("Gate {} added", group_id)
        }
        Command::BeginAddGate => {
            engine.begin_input(admin, PendingInput::AddGate)?;
            "Send the group id (@name or -100...) and optionally a join link.".to_string()
        }
        Command::RemoveGate { group_id } => {
            engine.remove_gate(admin, group_id)?;
            format!("Gate {} removed", group_id)
        }
        Command::BeginRemoveGate => {
            engine.begin_input(admin, PendingInput::RemoveGate)?;
            format!("{}\n\nSend the group id to remove.", gates_admin_text(&engine.gates()?))
        }
        Command::SetTimer { minutes } => {
            engine.set_deadline(admin, *minutes)?;
            format!("Voting closes in {} minute(s)", minutes)
        }
        Command::CloseWindow => {
            engine.force_close(admin)?;
            "Voting closed".to_string()
        }
        Command::OpenWindow => {
            engine.clear_window(admin)?;
            "Voting open with no deadline".to_string()
        }
        Command::Reset => format!("Removed {} ballot(s)", engine.reset_ballots(admin)?),
        Command::Stats => format!("Ballots cast: {}", engine.ballot_count(admin)?),
        Command::Export => {
            let rows = engine.export(admin)?;
            return Ok(Reply::Document {
                file_name: "ballots.csv".to_string(),
                caption: format!("{} ballot(s)", rows.len()),
                bytes: export_csv(&rows).into_bytes(),
            });
        }
        Command::Cancel => {
            if engine.cancel_input(admin) {
                "Cancelled".to_string()
            } else {
                "Nothing to cancel".to_string()
            }
        }
        Command::Invalid(reason) => reason.clone(),
        Command::Start => return Ok(Reply::Ballot),
        Command::ShowResults => results_text(&engine.results()?, engine.window_state()?),
        Command::Cast { .. } | Command::Recheck | Command::Text(_) => {
            return Err(EngineError::InvalidInput("not an admin command".to_string()));
        }
    };
    Ok(Reply::Text(text))
}

// =============================================================================
// Rendering
// =============================================================================

pub fn voting_keyboard(tally: &Tally, open: bool) -> Keyboard {
    let mut rows: Keyboard = tally
        .by_id()
        .iter()
        .map(|row| {
            let lock = if open { "" } else { "🔒 " };
            vec![InlineButton::callback(
                format!("{}{} ({})", lock, row.candidate.name, row.count),
                vote_payload(row.candidate.id),
            )]
        })
        .collect();
    rows.push(vec![InlineButton::callback("📊 Results", "results")]);
    rows
}

pub fn results_text(tally: &Tally, state: WindowState) -> String {
    let mut out = String::from("📊 Results\n\n");
    if tally.by_id().is_empty() {
        out.push_str("No candidates yet\n");
    }
    for (i, row) in tally.by_count().iter().enumerate() {
        out.push_str(&format!(
            "{}. {} - {} ({:.1}%)\n",
            i + 1,
            row.candidate.name,
            row.count,
            tally.percentage(row.count)
        ));
    }
    out.push_str(&format!("\nTotal: {}\n{}", tally.total(), window_text(state)));
    out
}

pub fn window_text(state: WindowState) -> String {
    match state {
        WindowState::Unbounded => "⏳ No deadline".to_string(),
        WindowState::Open(left) => {
            let mins = left.as_secs().div_ceil(60);
            format!("⏳ Time left: {}h {}m", mins / 60, mins % 60)
        }
        WindowState::Closed => "⛔ Voting is closed".to_string(),
    }
}

pub fn candidates_text(candidates: &[Candidate]) -> String {
    if candidates.is_empty() {
        return "No candidates".to_string();
    }
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {} (id {})", i + 1, c.name, c.id))
        .collect::<Vec<_>>()
        .join("\n")
}

fn gate_text(gates: &[GateGroup]) -> String {
    let mut out = String::from("To vote, join these groups and press \"I joined\":\n");
    for g in gates {
        out.push_str(&format!("• {}\n", g.group_id));
    }
    out
}

fn gates_admin_text(gates: &[GateGroup]) -> String {
    if gates.is_empty() {
        return "No required groups".to_string();
    }
    gates
        .iter()
        .enumerate()
        .map(|(i, g)| format!("{}. {} {}", i + 1, g.group_id, g.join_hint.as_deref().unwrap_or("")).trim_end().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn gate_keyboard(gates: &[GateGroup]) -> Keyboard {
    let mut rows: Keyboard = gates
        .iter()
        .filter_map(|g| g.join_hint.as_ref().map(|url| vec![InlineButton::link(format!("➕ {}", g.group_id), url.clone())]))
        .collect();
    rows.push(vec![InlineButton::callback("✅ I joined", "recheck")]);
    rows
}

fn pending_outcome_text(outcome: &PendingOutcome) -> String {
    match outcome {
        PendingOutcome::Bulk(r) => format!("Added {}, skipped {} duplicate(s)", r.added, r.skipped),
        PendingOutcome::Removed(c) => format!("Removed \"{}\" (id {})", c.name, c.id),
        PendingOutcome::GateAdded(g) => format!("Gate {} added", g),
        PendingOutcome::GateRemoved(g) => format!("Gate {} removed", g),
    }
}

fn is_not_modified(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ApiError>()
        .map_or(false, |e| e.description.contains("message is not modified"))
}

fn log_task_exit(done: Result<(), task::JoinError>) {
    if let Err(e) = done {
        error(Domain::Transport, "update_task_panicked", obj(&[("error", v_str(&e.to_string()))]));
    }
}

fn error_text(e: &EngineError) -> String {
    match e {
        EngineError::NotFound => "Not found".to_string(),
        EngineError::EmptyName => "Name is empty".to_string(),
        EngineError::InvalidInput(reason) => reason.clone(),
        other => format!("Failed: {}", other),
    }
}

pub fn export_csv(rows: &[ExportRow]) -> String {
    let mut out = String::from("voter_id,candidate_id,candidate_name,cast_at\n");
    for r in rows {
        let cast_at = Utc
            .timestamp_millis_opt(r.cast_at)
            .single()
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_else(|| r.cast_at.to_string());
        out.push_str(&format!("{},{},{},{}\n", r.voter_id, r.candidate_id, csv_field(&r.candidate_name), cast_at));
    }
    out
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tally::TallyRow;

    fn tally(rows: &[(i64, &str, u64)]) -> Tally {
        Tally::from_rows(
            rows.iter()
                .map(|(id, name, count)| TallyRow {
                    candidate: Candidate { id: *id, name: name.to_string() },
                    count: *count,
                })
                .collect(),
        )
    }

    #[test]
    fn test_voting_keyboard_is_id_ordered() {
        let kb = voting_keyboard(&tally(&[(9, "Vali", 3), (5, "Ali", 1)]), true);
        assert_eq!(kb.len(), 3);
        assert_eq!(kb[0][0].text, "Ali (1)");
        assert_eq!(kb[0][0].callback_data.as_deref(), Some("vote:5"));
        assert_eq!(kb[2][0].callback_data.as_deref(), Some("results"));
    }

    #[test]
    fn test_results_text_leader_first() {
        let text = results_text(&tally(&[(1, "A", 2), (2, "B", 1), (3, "C", 0)]), WindowState::Closed);
        let a = text.find("1. A - 2 (66.7%)").unwrap();
        let b = text.find("2. B - 1 (33.3%)").unwrap();
        assert!(a < b);
        assert!(text.contains("3. C - 0 (0.0%)"));
        assert!(text.contains("Total: 3"));
    }

    #[test]
    fn test_window_text_rounds_up_minutes() {
        assert_eq!(window_text(WindowState::Open(Duration::from_secs(61))), "⏳ Time left: 0h 2m");
        assert_eq!(window_text(WindowState::Open(Duration::from_secs(3600))), "⏳ Time left: 1h 0m");
    }

    #[test]
    fn test_export_csv_escapes() {
        let rows = vec![ExportRow { voter_id: 7, candidate_id: 1, candidate_name: "Ali, \"Jr\"".into(), cast_at: 0 }];
        let csv = export_csv(&rows);
        assert_eq!(
            csv,
            "voter_id,candidate_id,candidate_name,cast_at\n7,1,\"Ali, \"\"Jr\"\"\",1970-01-01T00:00:00Z\n"
        );
    }

    #[test]
    fn test_closed_keyboard_locks_every_choice() {
        let kb = voting_keyboard(&tally(&[(1, "Ali", 2), (2, "Vali", 0)]), false);
        assert_eq!(kb[0][0].text, "🔒 Ali (2)");
        assert_eq!(kb[1][0].text, "🔒 Vali (0)");
        assert_eq!(kb[2][0].callback_data.as_deref(), Some("results"));
    }

    #[test]
    fn test_only_unchanged_markup_is_quiet() {
        let unchanged: anyhow::Error = ApiError {
            method: "editMessageReplyMarkup".into(),
            code: 400,
            description: "Bad Request: message is not modified".into(),
        }
        .into();
        let gone: anyhow::Error = ApiError {
            method: "editMessageReplyMarkup".into(),
            code: 400,
            description: "Bad Request: message to edit not found".into(),
        }
        .into();
        assert!(is_not_modified(&unchanged));
        assert!(!is_not_modified(&gone));
        assert!(!is_not_modified(&anyhow::anyhow!("connection reset")));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        use crate::clock::SystemClock;
        use crate::controller::ControllerSettings;
        use crate::gate::{MembershipOracle, MembershipStatus};
        use crate::store::Store;

        struct Nobody;

        #[async_trait::async_trait]
        impl MembershipOracle for Nobody {
            async fn status(&self, _g: &str, _v: i64) -> Result<MembershipStatus> {
                Ok(MembershipStatus::Left)
            }
        }

        let store = Store::open_in_memory().unwrap();
        store.init().unwrap();
        let engine = Arc::new(SessionController::new(
            store,
            Arc::new(Nobody),
            Arc::new(SystemClock),
            ControllerSettings {
                admins: Default::default(),
                oracle_timeout: Duration::from_millis(50),
                input_ttl: Duration::from_secs(60),
            },
        ));
        // Nothing listens here; shutdown must win before any poll goes out.
        let api = Arc::new(BotApi::new("http://127.0.0.1:9", "t", Duration::from_secs(1)).unwrap());
        let dispatcher = Dispatcher::new(api, engine, "Vote:".into(), 1);

        let res = tokio::time::timeout(Duration::from_secs(5), dispatcher.run(async {})).await;
        assert!(matches!(res, Ok(Ok(()))));
    }

    #[test]
    fn test_gate_keyboard_links_and_recheck() {
        let gates = vec![
            GateGroup { group_id: "@a".into(), join_hint: Some("https://t.me/a".into()) },
            GateGroup { group_id: "@b".into(), join_hint: None },
        ];
        let kb = gate_keyboard(&gates);
        assert_eq!(kb.len(), 2);
        assert_eq!(kb[0][0].url.as_deref(), Some("https://t.me/a"));
        assert_eq!(kb[1][0].callback_data.as_deref(), Some("recheck"));
    }
}
