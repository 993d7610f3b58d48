use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::params;
use serde::Serialize;
use tokio::time::timeout;

use crate::ballots::VoterId;
use crate::error::{EngineError, EngineResult};
use crate::logging::{debug, obj, v_int, v_str, warn, Domain};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipStatus {
    Member,
    Left,
    Removed,
}

/// External source of truth for group membership.
///
/// Any `Err` (network failure, no visibility into the group, bad group id)
/// counts against the voter.
#[async_trait]
pub trait MembershipOracle: Send + Sync {
    async fn status(&self, group_id: &str, voter_id: VoterId) -> Result<MembershipStatus>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateGroup {
    pub group_id: String,
    pub join_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    /// Oracle reported the voter as not a member of `group_id`
    NotMember { group_id: String, status: MembershipStatus },
    /// Oracle call failed or timed out for `group_id`
    OracleUnavailable { group_id: String, reason: String },
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// Ordered, unique list of required groups.
#[derive(Clone)]
pub struct GateConfig {
    store: Store,
}

impl GateConfig {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Add a group, or refresh the join hint of one already configured.
    pub fn add(&self, group_id: &str, join_hint: Option<&str>) -> EngineResult<()> {
        let group_id = group_id.trim();
        if group_id.is_empty() {
            return Err(EngineError::InvalidInput("group id is empty".to_string()));
        }
        self.store.write(|tx| {
            tx.execute(
                "INSERT INTO gate_groups (group_id, join_hint) VALUES (?1, ?2)
                 ON CONFLICT(group_id) DO UPDATE SET join_hint = excluded.join_hint",
                params![group_id, join_hint],
            )?;
            Ok(())
        })
    }

    pub fn remove(&self, group_id: &str) -> EngineResult<()> {
        let removed = self.store.write(|tx| {
            Ok(tx.execute("DELETE FROM gate_groups WHERE group_id = ?1", params![group_id.trim()])?)
        })?;
        if removed == 0 {
            return Err(EngineError::NotFound);
        }
        Ok(())
    }

    pub fn list(&self) -> EngineResult<Vec<GateGroup>> {
        self.store.read(|tx| {
            let mut stmt =
                tx.prepare("SELECT group_id, join_hint FROM gate_groups ORDER BY position ASC")?;
            let rows = stmt.query_map([], |r| Ok(GateGroup { group_id: r.get(0)?, join_hint: r.get(1)? }))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}

/// Answers whether a voter may vote, by asking the oracle about every
/// configured group. Nothing is cached.
#[derive(Clone)]
pub struct EligibilityGate {
    groups: GateConfig,
    oracle: Arc<dyn MembershipOracle>,
    oracle_timeout: Duration,
}

impl EligibilityGate {
    pub fn new(groups: GateConfig, oracle: Arc<dyn MembershipOracle>, oracle_timeout: Duration) -> Self {
        Self { groups, oracle, oracle_timeout }
    }

    pub fn groups(&self) -> &GateConfig {
        &self.groups
    }

    /// Stops at the first group that fails. An empty group list admits everyone.
    pub async fn check(&self, voter_id: VoterId) -> EngineResult<Eligibility> {
        for group in self.groups.list()? {
            let verdict = match timeout(self.oracle_timeout, self.oracle.status(&group.group_id, voter_id)).await {
                Ok(Ok(MembershipStatus::Member)) => None,
                Ok(Ok(status)) => Some(Eligibility::NotMember { group_id: group.group_id.clone(), status }),
                Ok(Err(e)) => Some(Eligibility::OracleUnavailable {
                    group_id: group.group_id.clone(),
                    reason: e.to_string(),
                }),
                Err(_) => Some(Eligibility::OracleUnavailable {
                    group_id: group.group_id.clone(),
                    reason: format!("timed out after {:?}", self.oracle_timeout),
                }),
            };
            if let Some(verdict) = verdict {
                log_verdict(voter_id, &verdict);
                return Ok(verdict);
            }
        }
        Ok(Eligibility::Eligible)
    }

    pub async fn is_eligible(&self, voter_id: VoterId) -> EngineResult<bool> {
        Ok(self.check(voter_id).await?.is_eligible())
    }
}

fn log_verdict(voter_id: VoterId, verdict: &Eligibility) {
    match verdict {
        Eligibility::Eligible => {}
        Eligibility::NotMember { group_id, status } => debug(
            Domain::Gate,
            "not_member",
            obj(&[
                ("voter_id", v_int(voter_id)),
                ("group_id", v_str(group_id)),
                ("status", v_str(&format!("{:?}", status))),
            ]),
        ),
        Eligibility::OracleUnavailable { group_id, reason } => warn(
            Domain::Gate,
            "oracle_unavailable",
            obj(&[
                ("voter_id", v_int(voter_id)),
                ("group_id", v_str(group_id)),
                ("reason", v_str(reason)),
            ]),
        ),
    }
}
