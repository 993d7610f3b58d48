//! Session Controller: the only entry point that mutates poll state.
//!
//! Voter casts go window -> eligibility -> candidate check -> upsert ->
//! tally. Admin operations skip the window and the gate but are checked
//! against the fixed administrator set first.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::ballots::{BallotStore, CastOutcome, ExportRow, VoterId};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::gate::{Eligibility, EligibilityGate, GateConfig, GateGroup, MembershipOracle};
use crate::logging::{info, obj, v_int, v_str, warn, Domain};
use crate::registry::{BulkAddReport, Candidate, CandidateId, CandidateSelector, Registry};
use crate::store::Store;
use crate::tally::{Tally, TallyEngine};
use crate::window::{SessionWindow, WindowState};

pub type AdminId = i64;

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub admins: HashSet<AdminId>,
    pub oracle_timeout: Duration,
    /// How long a pending admin input stays valid
    pub input_ttl: Duration,
}

impl ControllerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            admins: cfg.admin_ids.clone(),
            oracle_timeout: Duration::from_millis(cfg.oracle_timeout_ms),
            input_ttl: Duration::from_secs(cfg.admin_input_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CastReceipt {
    pub outcome: CastOutcome,
    pub tally: Tally,
}

/// What an administrator's next free-text message will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingInput {
    BulkCandidates,
    RemoveCandidate,
    AddGate,
    RemoveGate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PendingOutcome {
    Bulk(BulkAddReport),
    Removed(Candidate),
    GateAdded(String),
    GateRemoved(String),
}

#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    kind: PendingInput,
    started_ms: i64,
}

pub struct SessionController {
    registry: Registry,
    ballots: BallotStore,
    tally: TallyEngine,
    window: SessionWindow,
    gate: EligibilityGate,
    clock: Arc<dyn Clock>,
    admins: HashSet<AdminId>,
    input_ttl: Duration,
    pending: Mutex<HashMap<AdminId, PendingEntry>>,
}

impl SessionController {
    pub fn new(
        store: Store,
        oracle: Arc<dyn MembershipOracle>,
        clock: Arc<dyn Clock>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            registry: Registry::new(store.clone()),
            ballots: BallotStore::new(store.clone()),
            tally: TallyEngine::new(store.clone()),
            window: SessionWindow::new(store.clone(), clock.clone()),
            gate: EligibilityGate::new(GateConfig::new(store), oracle, settings.oracle_timeout),
            clock,
            admins: settings.admins,
            input_ttl: settings.input_ttl,
            pending: Mutex::new(HashMap::new()),
        }
    }

    // =========================================================================
    // Voter path
    // =========================================================================

    pub async fn cast_vote(&self, voter_id: VoterId, candidate_id: CandidateId) -> EngineResult<CastReceipt> {
        if !self.window.is_open()? {
            return Err(self.reject(voter_id, candidate_id, EngineError::VotingClosed, None));
        }

        match self.gate.check(voter_id).await? {
            Eligibility::Eligible => {}
            Eligibility::NotMember { group_id, .. } => {
                return Err(self.reject(voter_id, candidate_id, EngineError::NotEligible, Some(group_id.as_str())));
            }
            Eligibility::OracleUnavailable { group_id, .. } => {
                return Err(self.reject(
                    voter_id,
                    candidate_id,
                    EngineError::NotEligible,
                    Some(format!("oracle_unavailable:{}", group_id).as_str()),
                ));
            }
        }

        if self.registry.get(candidate_id)?.is_none() {
            return Err(self.reject(voter_id, candidate_id, EngineError::NoSuchCandidate, None));
        }

        // The store re-checks the candidate inside the upsert transaction, so
        // a removal racing with this cast still cannot leave an orphan ballot.
        let outcome = match self.ballots.cast(voter_id, candidate_id, self.clock.now_ms()) {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.reject(voter_id, candidate_id, e, None)),
        };
        info(
            Domain::Vote,
            "cast",
            obj(&[
                ("voter_id", v_int(voter_id)),
                ("candidate_id", v_int(candidate_id)),
                ("outcome", v_str(&format!("{:?}", outcome).to_lowercase())),
            ]),
        );
        Ok(CastReceipt { outcome, tally: self.tally.tally()? })
    }

    fn reject(&self, voter_id: VoterId, candidate_id: CandidateId, err: EngineError, detail: Option<&str>) -> EngineError {
        warn(
            Domain::Vote,
            "rejected",
            obj(&[
                ("voter_id", v_int(voter_id)),
                ("candidate_id", v_int(candidate_id)),
                ("reason", v_str(err.code())),
                ("detail", detail.map(v_str).unwrap_or(serde_json::Value::Null)),
            ]),
        );
        err
    }

    /// Full eligibility verdict, for the "join then re-check" flow.
    pub async fn check_eligibility(&self, voter_id: VoterId) -> EngineResult<Eligibility> {
        self.gate.check(voter_id).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn results(&self) -> EngineResult<Tally> {
        self.tally.tally()
    }

    pub fn candidates(&self) -> EngineResult<Vec<Candidate>> {
        self.registry.list()
    }

    pub fn gates(&self) -> EngineResult<Vec<GateGroup>> {
        self.gate.groups().list()
    }

    pub fn window_state(&self) -> EngineResult<WindowState> {
        self.window.remaining()
    }

    pub fn ballot_of(&self, voter_id: VoterId) -> EngineResult<Option<CandidateId>> {
        Ok(self.ballots.get(voter_id)?.map(|b| b.candidate_id))
    }

    pub fn is_admin(&self, id: AdminId) -> bool {
        self.admins.contains(&id)
    }

    // =========================================================================
    // Admin operations
    // =========================================================================

    /// Logs and refuses anyone outside the administrator set.
    pub fn authorize(&self, admin: AdminId, op: &str) -> EngineResult<()> {
        if self.is_admin(admin) {
            return Ok(());
        }
        warn(Domain::Admin, "unauthorized", obj(&[("admin_id", v_int(admin)), ("op", v_str(op))]));
        Err(EngineError::Unauthorized)
    }

    fn audit(&self, admin: AdminId, op: &str, mut extra: serde_json::Map<String, serde_json::Value>) {
        extra.insert("admin_id".to_string(), v_int(admin));
        extra.insert("op".to_string(), v_str(op));
        info(Domain::Admin, op, extra);
    }

    pub fn add_candidate(&self, admin: AdminId, name: &str) -> EngineResult<CandidateId> {
        self.authorize(admin, "add_candidate")?;
        let id = self.registry.add(name)?;
        self.audit(admin, "add_candidate", obj(&[("candidate_id", v_int(id)), ("name", v_str(name.trim()))]));
        Ok(id)
    }

    pub fn bulk_add_candidates(&self, admin: AdminId, text: &str) -> EngineResult<BulkAddReport> {
        self.authorize(admin, "bulk_add")?;
        let report = self.registry.bulk_add(text)?;
        self.audit(
            admin,
            "bulk_add",
            obj(&[("added", v_int(report.added as i64)), ("skipped", v_int(report.skipped as i64))]),
        );
        Ok(report)
    }

    pub fn remove_candidate(&self, admin: AdminId, selector: &CandidateSelector) -> EngineResult<Candidate> {
        self.authorize(admin, "remove_candidate")?;
        let removed = self.registry.remove(selector)?;
        self.audit(
            admin,
            "remove_candidate",
            obj(&[("candidate_id", v_int(removed.id)), ("name", v_str(&removed.name))]),
        );
        Ok(removed)
    }

    pub fn add_gate(&self, admin: AdminId, group_id: &str, join_hint: Option<&str>) -> EngineResult<()> {
        self.authorize(admin, "add_gate")?;
        self.gate.groups().add(group_id, join_hint)?;
        self.audit(admin, "add_gate", obj(&[("group_id", v_str(group_id.trim()))]));
        Ok(())
    }

    pub fn remove_gate(&self, admin: AdminId, group_id: &str) -> EngineResult<()> {
        self.authorize(admin, "remove_gate")?;
        self.gate.groups().remove(group_id)?;
        self.audit(admin, "remove_gate", obj(&[("group_id", v_str(group_id.trim()))]));
        Ok(())
    }

    pub fn set_deadline(&self, admin: AdminId, minutes: i64) -> EngineResult<i64> {
        self.authorize(admin, "set_deadline")?;
        let deadline = self.window.set_deadline(minutes)?;
        self.audit(admin, "set_deadline", obj(&[("minutes", v_int(minutes)), ("deadline_ms", v_int(deadline))]));
        Ok(deadline)
    }

    pub fn force_close(&self, admin: AdminId) -> EngineResult<()> {
        self.authorize(admin, "force_close")?;
        let at = self.window.force_close()?;
        self.audit(admin, "force_close", obj(&[("deadline_ms", v_int(at))]));
        Ok(())
    }

    pub fn clear_window(&self, admin: AdminId) -> EngineResult<()> {
        self.authorize(admin, "clear_window")?;
        self.window.clear()?;
        self.audit(admin, "clear_window", obj(&[]));
        Ok(())
    }

    pub fn reset_ballots(&self, admin: AdminId) -> EngineResult<usize> {
        self.authorize(admin, "reset")?;
        let removed = self.ballots.truncate()?;
        self.audit(admin, "reset", obj(&[("removed", v_int(removed as i64))]));
        Ok(removed)
    }

    pub fn export(&self, admin: AdminId) -> EngineResult<Vec<ExportRow>> {
        self.authorize(admin, "export")?;
        let rows = self.ballots.export()?;
        self.audit(admin, "export", obj(&[("rows", v_int(rows.len() as i64))]));
        Ok(rows)
    }

    pub fn ballot_count(&self, admin: AdminId) -> EngineResult<u64> {
        self.authorize(admin, "stats")?;
        self.ballots.count()
    }

    /// Seed the registry at startup. Does nothing once any candidate exists.
    pub fn seed_candidates(&self, names: &[String]) -> EngineResult<Option<BulkAddReport>> {
        if names.is_empty() || !self.registry.is_empty()? {
            return Ok(None);
        }
        let report = self.registry.bulk_add(&names.join("\n"))?;
        info(
            Domain::Registry,
            "seeded",
            obj(&[("added", v_int(report.added as i64)), ("skipped", v_int(report.skipped as i64))]),
        );
        Ok(Some(report))
    }

    // =========================================================================
    // Per-admin pending input
    // =========================================================================

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<AdminId, PendingEntry>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn begin_input(&self, admin: AdminId, kind: PendingInput) -> EngineResult<()> {
        self.authorize(admin, "begin_input")?;
        let entry = PendingEntry { kind, started_ms: self.clock.now_ms() };
        self.pending().insert(admin, entry);
        Ok(())
    }

    /// Returns whether anything was pending.
    pub fn cancel_input(&self, admin: AdminId) -> bool {
        self.pending().remove(&admin).is_some()
    }

    /// The admin's pending input, if it has not expired.
    pub fn pending_input(&self, admin: AdminId) -> Option<PendingInput> {
        let now = self.clock.now_ms();
        let mut pending = self.pending();
        let entry = pending.get(&admin).copied()?;
        if self.expired(entry, now) {
            pending.remove(&admin);
            return None;
        }
        Some(entry.kind)
    }

    fn expired(&self, entry: PendingEntry, now_ms: i64) -> bool {
        now_ms.saturating_sub(entry.started_ms) > self.input_ttl.as_millis() as i64
    }

    /// Feed free text to the admin's pending input, consuming it.
    /// `Ok(None)` means nothing was pending (or it had expired).
    pub fn submit_input(&self, admin: AdminId, text: &str) -> EngineResult<Option<PendingOutcome>> {
        let now = self.clock.now_ms();
        let entry = match self.pending().remove(&admin) {
            Some(entry) if !self.expired(entry, now) => entry,
            _ => return Ok(None),
        };
        let outcome = match entry.kind {
            PendingInput::BulkCandidates => PendingOutcome::Bulk(self.bulk_add_candidates(admin, text)?),
            PendingInput::RemoveCandidate => {
                let selector = CandidateSelector::parse(text)
                    .ok_or_else(|| EngineError::InvalidInput("expected id, #rank or name".to_string()))?;
                PendingOutcome::Removed(self.remove_candidate(admin, &selector)?)
            }
            PendingInput::AddGate => {
                let mut parts = text.split_whitespace();
                let group = parts
                    .next()
                    .ok_or_else(|| EngineError::InvalidInput("expected group id".to_string()))?;
                self.add_gate(admin, group, parts.next())?;
                PendingOutcome::GateAdded(group.to_string())
            }
            PendingInput::RemoveGate => {
                self.remove_gate(admin, text)?;
                PendingOutcome::GateRemoved(text.trim().to_string())
            }
        };
        Ok(Some(outcome))
    }
}
