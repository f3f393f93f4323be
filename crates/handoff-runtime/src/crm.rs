//! CRM tag-swap transfer.
//!
//! Conversation ownership lives in the CRM as activation tags: each agent
//! only answers contacts carrying its tag. A handoff removes the source
//! agent's tag, adds the target's, and leaves a `Handoff-<Source>-to-<Target>`
//! audit tag behind.

use async_trait::async_trait;
use handoff_coordination::{AgentTransfer, AgentType, ExecutionRequest, Transition, TransferError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

/// One tag mutation on a contact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TagAction {
    AddTag { tag: String },
    RemoveTag { tag: String },
}

impl TagAction {
    pub fn add(tag: impl Into<String>) -> Self {
        TagAction::AddTag { tag: tag.into() }
    }

    pub fn remove(tag: impl Into<String>) -> Self {
        TagAction::RemoveTag { tag: tag.into() }
    }

    pub fn tag(&self) -> &str {
        match self {
            TagAction::AddTag { tag } | TagAction::RemoveTag { tag } => tag,
        }
    }
}

/// Activation tag per agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentTags {
    pub lead: String,
    pub buyer: String,
    pub seller: String,
}

impl Default for AgentTags {
    fn default() -> Self {
        Self {
            lead: "Needs Qualifying".to_string(),
            buyer: "Buyer-Lead".to_string(),
            seller: "Needs Qualifying".to_string(),
        }
    }
}

impl AgentTags {
    pub fn activation(&self, agent: AgentType) -> &str {
        match agent {
            AgentType::Lead => &self.lead,
            AgentType::Buyer => &self.buyer,
            AgentType::Seller => &self.seller,
        }
    }

    /// Audit tag left on the contact after a handoff.
    pub fn handoff_tag(transition: Transition) -> String {
        format!(
            "Handoff-{}-to-{}",
            transition.source.label(),
            transition.target.label()
        )
    }

    /// Tag mutations for a transition, in the order they are applied.
    ///
    /// When both agents share an activation tag the tag is kept rather than
    /// removed and re-added.
    pub fn actions_for(&self, transition: Transition) -> Vec<TagAction> {
        let source = self.activation(transition.source);
        let target = self.activation(transition.target);
        let mut actions = Vec::with_capacity(3);
        if source != target {
            actions.push(TagAction::remove(source));
        }
        actions.push(TagAction::add(target));
        actions.push(TagAction::add(Self::handoff_tag(transition)));
        actions
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContactStoreError {
    #[error("contact {0} not found")]
    NotFound(String),

    #[error("contact store unavailable: {0}")]
    Unavailable(String),
}

/// Where contact tags live.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Apply all actions to one contact. Either every action lands or the
    /// call fails.
    async fn apply_actions(
        &self,
        contact_id: &str,
        actions: &[TagAction],
    ) -> Result<(), ContactStoreError>;
}

/// In-process contact store; contacts are created on first write.
#[derive(Debug, Default)]
pub struct MemoryContactStore {
    contacts: Mutex<HashMap<String, BTreeSet<String>>>,
    log: Mutex<Vec<(String, TagAction)>>,
}

impl MemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contact<I, S>(self, contact_id: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(contact_id.into(), tags.into_iter().map(Into::into).collect());
        self
    }

    /// Current tags, sorted.
    pub fn tags(&self, contact_id: &str) -> Vec<String> {
        self.contacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(contact_id)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every applied action, oldest first.
    pub fn applied(&self) -> Vec<(String, TagAction)> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ContactStore for MemoryContactStore {
    async fn apply_actions(
        &self,
        contact_id: &str,
        actions: &[TagAction],
    ) -> Result<(), ContactStoreError> {
        let mut contacts = self.contacts.lock().unwrap_or_else(PoisonError::into_inner);
        let tags = contacts.entry(contact_id.to_string()).or_default();
        for action in actions {
            match action {
                TagAction::AddTag { tag } => tags.insert(tag.clone()),
                TagAction::RemoveTag { tag } => tags.remove(tag),
            };
        }
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(actions.iter().map(|a| (contact_id.to_string(), a.clone())));
        Ok(())
    }
}

/// [`AgentTransfer`] that swaps activation tags in a [`ContactStore`].
///
/// The conversation key is used as the CRM contact id.
pub struct CrmTagTransfer {
    store: Arc<dyn ContactStore>,
    tags: AgentTags,
}

impl CrmTagTransfer {
    pub fn new(store: Arc<dyn ContactStore>) -> Self {
        Self {
            store,
            tags: AgentTags::default(),
        }
    }

    pub fn with_tags(mut self, tags: AgentTags) -> Self {
        self.tags = tags;
        self
    }

    pub fn tags(&self) -> &AgentTags {
        &self.tags
    }
}

#[async_trait]
impl AgentTransfer for CrmTagTransfer {
    async fn transfer(&self, request: &ExecutionRequest) -> Result<(), TransferError> {
        let actions = self.tags.actions_for(request.transition);
        let contact_id = request.conversation_key.as_str();
        debug!(key = %contact_id, transition = %request.transition, ?actions, "Applying tag swap");

        self.store
            .apply_actions(contact_id, &actions)
            .await
            .map_err(|e| match e {
                ContactStoreError::NotFound(_) => TransferError::Rejected(e.to_string()),
                ContactStoreError::Unavailable(_) => TransferError::Unavailable(e.to_string()),
            })?;

        info!(
            key = %contact_id,
            transition = %request.transition,
            record_id = %request.record_id,
            "Contact tags swapped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use handoff_coordination::{ConversationKey, HandoffId};

    fn request(source: AgentType, target: AgentType) -> ExecutionRequest {
        ExecutionRequest {
            record_id: HandoffId::new_v4(),
            conversation_key: ConversationKey::new("contact-7"),
            transition: Transition::new(source, target),
            confidence: 0.8,
            lease_expires_at: Utc::now(),
        }
    }

    #[test]
    fn test_lead_to_buyer_actions() {
        let actions =
            AgentTags::default().actions_for(Transition::new(AgentType::Lead, AgentType::Buyer));
        assert_eq!(
            actions,
            vec![
                TagAction::remove("Needs Qualifying"),
                TagAction::add("Buyer-Lead"),
                TagAction::add("Handoff-Lead-to-Buyer"),
            ]
        );
    }

    #[test]
    fn test_shared_activation_tag_is_kept() {
        let actions =
            AgentTags::default().actions_for(Transition::new(AgentType::Lead, AgentType::Seller));
        assert!(!actions.iter().any(|a| matches!(a, TagAction::RemoveTag { .. })));
        assert!(actions.contains(&TagAction::add("Handoff-Lead-to-Seller")));
    }

    #[test]
    fn test_tag_action_wire_format() {
        let json = serde_json::to_value(TagAction::remove("Buyer-Lead")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "remove_tag", "tag": "Buyer-Lead"}));
    }

    #[tokio::test]
    async fn test_memory_store_swaps_tags() {
        let store = Arc::new(
            MemoryContactStore::new().with_contact("contact-7", ["Needs Qualifying", "VIP"]),
        );
        let transfer = CrmTagTransfer::new(store.clone());

        transfer
            .transfer(&request(AgentType::Seller, AgentType::Buyer))
            .await
            .unwrap();

        assert_eq!(
            store.tags("contact-7"),
            vec!["Buyer-Lead", "Handoff-Seller-to-Buyer", "VIP"]
        );
        assert_eq!(store.applied().len(), 3);
    }

    #[tokio::test]
    async fn test_store_errors_map_to_transfer_errors() {
        let mut store = MockContactStore::new();
        store
            .expect_apply_actions()
            .withf(|contact, actions| contact.to_string() == "contact-7" && actions.len() == 3)
            .times(1)
            .returning(|_, _| Err(ContactStoreError::Unavailable("503".into())));
        let transfer = CrmTagTransfer::new(Arc::new(store));

        let err = transfer
            .transfer(&request(AgentType::Lead, AgentType::Buyer))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Unavailable(_)));

        let mut store = MockContactStore::new();
        store
            .expect_apply_actions()
            .returning(|id, _| Err(ContactStoreError::NotFound(id.to_string())));
        let transfer = CrmTagTransfer::new(Arc::new(store));
        let err = transfer
            .transfer(&request(AgentType::Lead, AgentType::Buyer))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Rejected(_)));
    }
}
