//! Peer readiness tracking on the leader.
//!
//! Units announce readiness for a role class over the coordination channels. The leader keeps
//! the reports of every remote unit in arrival order, and once enough of them are known it
//! freezes the class's peer list: its own identity first, followed by the earliest reporters.
//! A frozen list is final. Later reports are ignored and nothing is ever rebalanced.

use anyhow::Result;

use crate::error::AppError;
use crate::facts::{ApplyOutcome, FactStore};
use crate::gateway::Relations;
use hdfs_core::model::{PeerList, RoleClass};

/// The local key prefix under which the reports of a role class are stored.
const PREFIX_REPORTS: &str = "reports/";

/// The leader's registry of peer readiness reports.
#[derive(Clone)]
pub struct PeerRegistry {
    facts: FactStore,
    /// The identity of this unit.
    unit: String,
}

impl PeerRegistry {
    /// Create a new instance.
    pub fn new(facts: FactStore, unit: impl Into<String>) -> Self {
        Self { facts, unit: unit.into() }
    }

    /// Record that the given remote unit is ready for the given role class.
    ///
    /// Returns `true` if the report was newly recorded. Reports are only recorded on the
    /// leader, never for this unit itself, at most once per unit, and never once the class's
    /// list has been frozen.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn report_ready(&self, class: RoleClass, unit: &str, is_leader: bool) -> Result<bool> {
        if !is_leader || unit == self.unit || unit.is_empty() {
            return Ok(false);
        }
        if self.frozen(class)?.is_some() {
            tracing::debug!(%class, unit, "ignoring readiness report, peer list already frozen");
            return Ok(false);
        }
        let mut reports = self.aggregate(class)?;
        if reports.iter().any(|known| known == unit) {
            return Ok(false);
        }
        reports.push(unit.to_string());
        self.facts.put_local(&reports_key(class), &reports)?;
        Ok(true)
    }

    /// The remote units which have reported ready for the given class, in arrival order.
    pub fn aggregate(&self, class: RoleClass) -> Result<Vec<String>> {
        Ok(self.facts.get_local(&reports_key(class))?.unwrap_or_default())
    }

    /// The frozen peer list of the given class, if it has been published.
    pub fn frozen(&self, class: RoleClass) -> Result<Option<PeerList>> {
        self.facts.peer_list(class.fact_key())
    }

    /// Freeze and publish the peer list of the given class, if enough peers are known.
    ///
    /// Must only be called by the leader. Returns the frozen list, which is the already
    /// published list when the class was frozen before, or `None` while too few peers have
    /// reported.
    #[tracing::instrument(level = "debug", skip(self, relations))]
    pub async fn freeze(&self, class: RoleClass, term: u64, relations: &dyn Relations) -> Result<Option<PeerList>> {
        if let Some(list) = self.frozen(class)? {
            return Ok(Some(list));
        }
        let reports = self.aggregate(class)?;
        let needed = class.required() - 1;
        if reports.len() < needed {
            tracing::debug!(%class, known = reports.len(), needed, "too few peers to freeze");
            return Ok(None);
        }

        let mut members = Vec::with_capacity(class.required());
        members.push(self.unit.clone());
        members.extend(reports.into_iter().take(needed));
        let list = PeerList::new(members)?;
        if list.primary() != self.unit {
            return Err(AppError::ProtocolViolation(format!("leader {} must be index 0 of the {} list", self.unit, class)).into());
        }

        let value = serde_json::to_value(&list).map_err(|err| AppError::Ise(err.into()))?;
        match self.facts.publish(relations, term, class.fact_key(), value).await? {
            ApplyOutcome::Rejected(reason) => Err(AppError::ProtocolViolation(format!("frozen {} list was rejected: {}", class, reason)).into()),
            _ => {
                tracing::info!(%class, members = ?list.members(), "peer list frozen");
                Ok(Some(list))
            }
        }
    }
}

fn reports_key(class: RoleClass) -> String {
    format!("{}{}", PREFIX_REPORTS, class)
}
