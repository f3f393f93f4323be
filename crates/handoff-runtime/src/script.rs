//! Scripted replay of conversations through a coordinator.
//!
//! A script is JSON Lines, one [`ScriptStep`] per line. Blank lines and lines
//! starting with `#` are ignored. Time only moves on `advance` steps, so a
//! script replays identically every run.
//!
//! ```text
//! {"type":"message","conversation":"c-1","role":"user","content":"I want to buy, I'm pre-approved"}
//! {"type":"evaluate","conversation":"c-1","target":"buyer"}
//! {"type":"sample","agent":"buyer","latency_ms":900}
//! {"type":"outcome","source":"lead","target":"buyer","confidence":0.8,"result":"converted"}
//! {"type":"advance","secs":3600}
//! {"type":"recalibrate"}
//! ```

use chrono::Duration;
use handoff_coordination::clock::{Clock, ManualClock};
use handoff_coordination::{
    AgentType, AnalyticsSnapshot, CalibrationReport, ConversationKey, CoordinatorError, Decision,
    DecisionSummary, ExecutionOutcome, HandoffCoordinator, Message, OutcomeResult, Role,
    Transition,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::crm::CrmTagTransfer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptStep {
    /// Append a message to a conversation's transcript.
    Message {
        conversation: String,
        #[serde(default = "default_role")]
        role: Role,
        content: String,
    },
    /// Evaluate a handoff for the conversation's current owner.
    ///
    /// Without a `target` the agent the transcript favors is chosen.
    Evaluate {
        conversation: String,
        #[serde(default)]
        source: Option<AgentType>,
        #[serde(default)]
        target: Option<AgentType>,
    },
    Sample {
        agent: AgentType,
        latency_ms: u64,
        #[serde(default = "default_succeeded")]
        succeeded: bool,
    },
    Outcome {
        source: AgentType,
        target: AgentType,
        confidence: f64,
        result: OutcomeResult,
    },
    Advance {
        secs: u64,
    },
    Recalibrate,
    Sweep,
}

fn default_role() -> Role {
    Role::User
}

fn default_succeeded() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("step {step}: {source}")]
    Step {
        step: usize,
        #[source]
        source: CoordinatorError,
    },
}

/// Parse a JSONL script.
pub fn parse_script(raw: &str) -> Result<Vec<ScriptStep>, ScriptError> {
    raw.lines()
        .enumerate()
        .filter(|(_, line)| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|source| ScriptError::Parse {
                line: idx + 1,
                source,
            })
        })
        .collect()
}

/// What one step produced. Steps that only feed state report nothing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepReport {
    Evaluated {
        step: usize,
        conversation: String,
        source: AgentType,
        target: Option<AgentType>,
        decision: Option<DecisionSummary>,
        execution: Option<ExecutionOutcome>,
    },
    Recalibrated {
        step: usize,
        report: CalibrationReport,
    },
    Swept {
        step: usize,
        timed_out: usize,
    },
}

/// Final state after a replay.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub steps: usize,
    pub owners: HashMap<String, AgentType>,
    pub analytics: AnalyticsSnapshot,
}

/// Drives a coordinator from a script on a manual clock.
///
/// Approved handoffs are executed immediately through the CRM transfer, and
/// a completed transfer makes the target the conversation's new owner.
pub struct Simulation {
    coordinator: HandoffCoordinator,
    clock: Arc<ManualClock>,
    transfer: Arc<CrmTagTransfer>,
    transcripts: HashMap<ConversationKey, Vec<Message>>,
    owners: HashMap<ConversationKey, AgentType>,
    initial_owner: AgentType,
}

impl Simulation {
    /// `coordinator` must have been built on `clock`.
    pub fn new(
        coordinator: HandoffCoordinator,
        clock: Arc<ManualClock>,
        transfer: Arc<CrmTagTransfer>,
    ) -> Self {
        Self {
            coordinator,
            clock,
            transfer,
            transcripts: HashMap::new(),
            owners: HashMap::new(),
            initial_owner: AgentType::Lead,
        }
    }

    pub fn coordinator(&self) -> &HandoffCoordinator {
        &self.coordinator
    }

    pub fn owner(&self, conversation: &str) -> AgentType {
        self.owners
            .get(&ConversationKey::new(conversation))
            .copied()
            .unwrap_or(self.initial_owner)
    }

    pub async fn run(&mut self, steps: Vec<ScriptStep>) -> Result<Vec<StepReport>, ScriptError> {
        let mut reports = Vec::new();
        for (idx, step) in steps.into_iter().enumerate() {
            let step_no = idx + 1;
            if let Some(report) = self
                .apply(step_no, step)
                .await
                .map_err(|source| ScriptError::Step {
                    step: step_no,
                    source,
                })?
            {
                reports.push(report);
            }
        }
        info!(
            steps = reports.len(),
            conversations = self.transcripts.len(),
            "Simulation finished"
        );
        Ok(reports)
    }

    pub fn summary(&self, steps: usize) -> SimulationSummary {
        SimulationSummary {
            steps,
            owners: self
                .owners
                .iter()
                .map(|(key, agent)| (key.as_str().to_string(), *agent))
                .collect(),
            analytics: self.coordinator.analytics(),
        }
    }

    async fn apply(
        &mut self,
        step_no: usize,
        step: ScriptStep,
    ) -> Result<Option<StepReport>, CoordinatorError> {
        debug!(step = step_no, ?step, "Replaying step");
        match step {
            ScriptStep::Message {
                conversation,
                role,
                content,
            } => {
                let message = Message {
                    role,
                    content,
                    sent_at: self.clock.now(),
                };
                self.transcripts
                    .entry(ConversationKey::new(conversation))
                    .or_default()
                    .push(message);
                Ok(None)
            }
            ScriptStep::Evaluate {
                conversation,
                source,
                target,
            } => self.evaluate(step_no, conversation, source, target).await.map(Some),
            ScriptStep::Sample {
                agent,
                latency_ms,
                succeeded,
            } => {
                self.coordinator.record_sample(agent, latency_ms, succeeded);
                Ok(None)
            }
            ScriptStep::Outcome {
                source,
                target,
                confidence,
                result,
            } => {
                self.coordinator
                    .record_outcome(Transition::new(source, target), confidence, result)?;
                Ok(None)
            }
            ScriptStep::Advance { secs } => {
                self.clock.advance(Duration::seconds(secs as i64));
                Ok(None)
            }
            ScriptStep::Recalibrate => Ok(Some(StepReport::Recalibrated {
                step: step_no,
                report: self.coordinator.recalibrate(),
            })),
            ScriptStep::Sweep => Ok(Some(StepReport::Swept {
                step: step_no,
                timed_out: self.coordinator.sweep().records_timed_out,
            })),
        }
    }

    async fn evaluate(
        &mut self,
        step_no: usize,
        conversation: String,
        source: Option<AgentType>,
        target: Option<AgentType>,
    ) -> Result<StepReport, CoordinatorError> {
        let key = ConversationKey::new(conversation.as_str());
        let source = source.unwrap_or_else(|| self.owner(&conversation));
        let history = self.transcripts.get(&key).cloned().unwrap_or_default();

        let evaluated = match target {
            Some(target) => Some((
                target,
                self.coordinator
                    .evaluate_history(&key, source, &history, target)?,
            )),
            None => self
                .coordinator
                .evaluate_best_target(&key, source, &history)?,
        };

        let Some((target, decision)) = evaluated else {
            return Ok(StepReport::Evaluated {
                step: step_no,
                conversation,
                source,
                target: None,
                decision: None,
                execution: None,
            });
        };

        let summary = decision.summary();
        let execution = match decision {
            Decision::Approved(approved) => {
                let record = self
                    .coordinator
                    .execute(approved, self.transfer.clone())
                    .await?;
                if record.execution_outcome == Some(ExecutionOutcome::Completed) {
                    self.owners.insert(key, target);
                }
                record.execution_outcome
            }
            _ => None,
        };

        Ok(StepReport::Evaluated {
            step: step_no,
            conversation,
            source,
            target: Some(target),
            decision: Some(summary),
            execution,
        })
    }
}
