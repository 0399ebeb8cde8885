//! Automatic voting-configuration evolution.
//!
//! When membership changes or the follower checker retires a persistently
//! unreachable member, the leader asks the [`Reconfigurator`] for a new
//! voting configuration. The proposal then rides an ordinary publication;
//! the transitional state carries both configurations and the publication
//! must satisfy a quorum of each (see `CoordinationState::record_publish_ack`).

use conclave_core::{ConclaveError, Node, NodeId, Result, VotingConfiguration};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// Policy for proposing voting-configuration changes.
///
/// Invariants enforced:
/// - the configuration keeps an odd member count, so a single failure never
///   splits it into two equal halves;
/// - once the cluster has reached `safety_floor` voting members the
///   configuration never shrinks below it, so one further failure can
///   always be tolerated;
/// - the required member (the current leader) is always retained;
/// - live members are preferred over unreachable ones.
#[derive(Debug, Clone)]
pub struct Reconfigurator {
    safety_floor: usize,
}

impl Default for Reconfigurator {
    fn default() -> Self {
        Self { safety_floor: 3 }
    }
}

impl Reconfigurator {
    pub fn new(safety_floor: usize) -> Self {
        Self { safety_floor }
    }

    /// Propose the voting configuration for the given membership picture.
    ///
    /// `current` is the committed configuration; `live` the ids the fault
    /// detector currently reaches (including the local node); `retired`
    /// the ids past their retry budget that should leave the
    /// configuration; `required` the node that must stay (the leader);
    /// `candidates` all known master-eligible nodes.
    ///
    /// Returns the current configuration unchanged when no safe improvement
    /// exists, and `ConfigurationUnsafe` only when the caller proposes the
    /// impossible (for example retiring the required member).
    pub fn reconfigure<'a>(
        &self,
        current: &VotingConfiguration,
        live: &HashSet<NodeId>,
        retired: &HashSet<NodeId>,
        required: NodeId,
        candidates: impl IntoIterator<Item = &'a Node>,
    ) -> Result<VotingConfiguration> {
        if retired.contains(&required) {
            return Err(ConclaveError::configuration_unsafe(format!(
                "cannot retire required member {}",
                required
            )));
        }

        let eligible: BTreeSet<NodeId> = candidates
            .into_iter()
            .filter(|n| n.master_eligible && !retired.contains(&n.id))
            .map(|n| n.id)
            .collect();
        if !eligible.contains(&required) {
            return Err(ConclaveError::configuration_unsafe(format!(
                "required member {} is not an eligible candidate",
                required
            )));
        }

        // preference order: required, live members of the current config,
        // live non-members, then unreachable current members as filler to
        // stay at the safety floor
        let mut preferred: Vec<NodeId> = Vec::new();
        let mut push = |id: NodeId, preferred: &mut Vec<NodeId>| {
            if !preferred.contains(&id) {
                preferred.push(id);
            }
        };
        push(required, &mut preferred);
        for id in &eligible {
            if live.contains(id) && current.contains(id) {
                push(*id, &mut preferred);
            }
        }
        for id in &eligible {
            if live.contains(id) {
                push(*id, &mut preferred);
            }
        }
        for id in &eligible {
            if current.contains(id) {
                push(*id, &mut preferred);
            }
        }

        let live_eligible = eligible.iter().filter(|id| live.contains(id)).count();
        let floor = if current.len() >= self.safety_floor {
            self.safety_floor.min(preferred.len())
        } else {
            1
        };
        // largest odd size not above the live membership, never below floor
        let mut target = live_eligible.max(floor).min(preferred.len());
        if target % 2 == 0 {
            target -= 1;
        }
        let target = target.max(floor.min(preferred.len())).max(1);

        let proposed = VotingConfiguration::of(preferred.into_iter().take(target));

        if current.len() >= self.safety_floor && proposed.len() < self.safety_floor {
            return Err(ConclaveError::configuration_unsafe(format!(
                "proposal would shrink the configuration to {} members, below the floor of {}",
                proposed.len(),
                self.safety_floor
            )));
        }

        if proposed != *current {
            debug!("proposing reconfiguration {} -> {}", current, proposed);
        }
        Ok(proposed)
    }
}
