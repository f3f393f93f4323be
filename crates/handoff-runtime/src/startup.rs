//! Coordinator construction for the CLI.

use anyhow::{Context, Result};
use handoff_coordination::{HandoffCoordinator, HandoffCoordinatorBuilder};
use std::path::Path;

/// Finish `builder`, backing it with RocksDB at `state_path` when one is given.
#[cfg(feature = "heavy-state")]
pub fn build_coordinator(
    state_path: Option<&Path>,
    builder: HandoffCoordinatorBuilder,
) -> Result<HandoffCoordinator> {
    use tracing::info;

    let builder = match state_path {
        Some(path) => {
            let store = handoff_coordination::state::RocksStateStore::open(path)
                .with_context(|| format!("Failed to open state at {}", path.display()))?;
            info!(path = %path.display(), "Using persistent state");
            builder.rocks(store.shared())
        }
        None => builder,
    };
    builder.build().context("Failed to build coordinator")
}

/// Without `heavy-state` every coordinator is in-memory.
#[cfg(not(feature = "heavy-state"))]
pub fn build_coordinator(
    _state_path: Option<&Path>,
    builder: HandoffCoordinatorBuilder,
) -> Result<HandoffCoordinator> {
    builder.build().context("Failed to build coordinator")
}

#[cfg(test)]
mod tests {
    use super::*;
    use handoff_coordination::{ConversationKey, CoordinationConfig};

    #[test]
    fn test_in_memory_without_state_path() {
        let coordinator =
            build_coordinator(None, HandoffCoordinator::builder(CoordinationConfig::default()))
                .unwrap();
        let key = ConversationKey::new("contact-startup");
        assert!(coordinator.ledger().records_for(&key).unwrap().is_empty());
    }

    #[cfg(feature = "heavy-state")]
    #[test]
    fn test_state_path_persists_between_builds() {
        use handoff_coordination::{AgentType, IntentProfile};

        let dir = tempfile::tempdir().unwrap();
        let key = ConversationKey::new("contact-startup");
        {
            let coordinator = build_coordinator(
                Some(dir.path()),
                HandoffCoordinator::builder(CoordinationConfig::default()),
            )
            .unwrap();
            let decision = coordinator
                .evaluate(
                    &key,
                    AgentType::Lead,
                    &IntentProfile::floor().with_confidence(AgentType::Buyer, 0.9),
                    AgentType::Buyer,
                )
                .unwrap();
            assert!(decision.is_approved());
        }

        let reopened = build_coordinator(
            Some(dir.path()),
            HandoffCoordinator::builder(CoordinationConfig::default()),
        )
        .unwrap();
        assert_eq!(reopened.ledger().records_for(&key).unwrap().len(), 1);
    }
}
