//! Execution of approved handoffs.
//!
//! The coordination layer never touches the CRM or agent processes itself.
//! A runtime supplies an [`AgentTransfer`] that performs the actual ownership
//! change; [`HandoffExecutor`] runs it within the lease and finalizes the
//! ledger record with the result.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::decision::{ApprovedHandoff, ExecutionRequest};
use crate::state::{HandoffRecord, StoreResult};

/// Reason recorded when the transfer outlives its lease.
pub const TRANSFER_TIMEOUT: &str = "transfer_timeout";

/// Errors from an ownership transfer
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer rejected: {0}")]
    Rejected(String),

    #[error("transfer target unavailable: {0}")]
    Unavailable(String),
}

/// Performs the ownership change for one approved handoff.
#[async_trait]
pub trait AgentTransfer: Send + Sync {
    async fn transfer(&self, request: &ExecutionRequest) -> Result<(), TransferError>;
}

/// Runs transfers and finalizes the ledger.
#[derive(Clone)]
pub struct HandoffExecutor {
    transfer: Arc<dyn AgentTransfer>,
    clock: SharedClock,
}

impl HandoffExecutor {
    pub fn new(transfer: Arc<dyn AgentTransfer>, clock: SharedClock) -> Self {
        Self { transfer, clock }
    }

    /// Execute an approved handoff and return the finalized record.
    ///
    /// The transfer gets whatever is left of the lease. If the future is
    /// dropped mid-transfer the lease is dropped with it and the record is
    /// marked abandoned.
    pub async fn execute(&self, approved: ApprovedHandoff) -> StoreResult<HandoffRecord> {
        let request = approved.request();
        let ApprovedHandoff { lease, .. } = approved;
        let budget = lease
            .remaining(self.clock.now())
            .to_std()
            .unwrap_or_default();

        match tokio::time::timeout(budget, self.transfer.transfer(&request)).await {
            Ok(Ok(())) => {
                info!(record_id = %request.record_id, transition = %request.transition, "Transfer succeeded");
                lease.complete()
            }
            Ok(Err(e)) => {
                warn!(record_id = %request.record_id, error = %e, "Transfer failed");
                lease.fail(e.to_string())
            }
            Err(_) => {
                warn!(record_id = %request.record_id, budget_ms = budget.as_millis() as u64, "Transfer exceeded lease");
                lease.fail(TRANSFER_TIMEOUT)
            }
        }
    }
}
