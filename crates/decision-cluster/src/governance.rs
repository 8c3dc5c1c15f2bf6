//! # governance
//!
//! why: the default decision state machine agents agree on
//! relations: plugged into DecisionApplier by node.rs and the agent binary
//! what: GovernanceCommand (json, tagged by `op`), GovernanceMachine
//!
//! Commands:
//! - `approve` / `reject` a subject by id; each subject is decided once
//! - `assign` a task to an agent, `release` it again
//! - `remediate` a subject with a named action; every remediation is recorded

use std::collections::BTreeMap;

use decision_core::LogIndex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::applier::{DecisionResult, StateMachine};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GovernanceCommand {
    Approve {
        id: serde_json::Value,
        #[serde(default)]
        by: Option<String>,
    },
    Reject {
        id: serde_json::Value,
        #[serde(default)]
        by: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    Assign { task: String, agent: String },
    Release { task: String },
    Remediate { id: serde_json::Value, action: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub index: LogIndex,
    pub by: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remediation {
    pub index: LogIndex,
    pub subject: String,
    pub action: String,
}

/// Approvals, rejections, task assignments and remediations.
///
/// Subject ids may be JSON strings or numbers; both are keyed by their
/// canonical text so `42` and `"42"` name the same subject.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GovernanceMachine {
    decisions: BTreeMap<String, Decision>,
    assignments: BTreeMap<String, String>,
    remediations: Vec<Remediation>,
}

fn subject_key(id: &serde_json::Value) -> Option<String> {
    match id {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn rejected(reason: impl Into<String>) -> DecisionResult {
    DecisionResult::Rejected { reason: reason.into() }
}

impl GovernanceMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decision(&self, subject: &str) -> Option<&Decision> {
        self.decisions.get(subject)
    }

    pub fn assignee(&self, task: &str) -> Option<&str> {
        self.assignments.get(task).map(String::as_str)
    }

    pub fn remediations(&self) -> &[Remediation] {
        &self.remediations
    }

    pub fn execute(&mut self, index: LogIndex, command: GovernanceCommand) -> DecisionResult {
        match command {
            GovernanceCommand::Approve { id, by } => self.decide(index, &id, Verdict::Approved, by, None),
            GovernanceCommand::Reject { id, by, reason } => {
                self.decide(index, &id, Verdict::Rejected, by, reason)
            }
            GovernanceCommand::Assign { task, agent } => match self.assignments.get(&task) {
                Some(current) if current == &agent => rejected(format!("task {task} already assigned to {agent}")),
                Some(current) => rejected(format!("task {task} is held by {current}")),
                None => {
                    self.assignments.insert(task.clone(), agent.clone());
                    DecisionResult::Accepted { effect: json!({ "assigned": task, "agent": agent }) }
                }
            },
            GovernanceCommand::Release { task } => match self.assignments.remove(&task) {
                Some(agent) => DecisionResult::Accepted { effect: json!({ "released": task, "agent": agent }) },
                None => rejected(format!("task {task} is not assigned")),
            },
            GovernanceCommand::Remediate { id, action } => {
                let Some(subject) = subject_key(&id) else {
                    return rejected("remediate requires a string or numeric id");
                };
                if action.is_empty() {
                    return rejected("remediate requires an action");
                }
                self.remediations.push(Remediation { index, subject: subject.clone(), action: action.clone() });
                DecisionResult::Accepted {
                    effect: json!({ "remediated": subject, "action": action, "count": self.remediations.len() }),
                }
            }
        }
    }

    fn decide(
        &mut self,
        index: LogIndex,
        id: &serde_json::Value,
        verdict: Verdict,
        by: Option<String>,
        reason: Option<String>,
    ) -> DecisionResult {
        let Some(subject) = subject_key(id) else {
            return rejected("decision requires a string or numeric id");
        };
        if let Some(existing) = self.decisions.get(&subject) {
            return rejected(format!(
                "subject {subject} already decided ({:?} at index {})",
                existing.verdict, existing.index
            ));
        }
        self.decisions.insert(subject.clone(), Decision { verdict, index, by, reason });
        DecisionResult::Accepted { effect: json!({ "subject": subject, "verdict": verdict }) }
    }
}

impl StateMachine for GovernanceMachine {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> DecisionResult {
        match serde_json::from_slice::<GovernanceCommand>(command) {
            Ok(command) => self.execute(index, command),
            Err(e) => rejected(format!("malformed command: {e}")),
        }
    }
}
