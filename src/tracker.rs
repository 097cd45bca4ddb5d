//! Client-facing status machine for one in-flight purchase attempt.
//!
//! Purely observational: it knows nothing about chains and is driven by the
//! orchestrator. Never persisted. After an error the tracker is terminal and
//! must be replaced to start a new attempt.

use serde::Serialize;
use thiserror::Error;

pub mod steps {
    pub const CONNECT_WALLET: &str = "connect-wallet";
    pub const PREPARE_TRANSACTION: &str = "prepare-transaction";
    pub const APPROVE_SPEND: &str = "approve-spend";
    pub const SEND_TRANSACTION: &str = "send-transaction";
    pub const VERIFY_TRANSACTION: &str = "verify-transaction";
    pub const RECORD_PURCHASE: &str = "record-purchase";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Active,
    Complete,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: &'static str,
    pub title: &'static str,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackerState {
    NotStarted,
    InProgress,
    AllComplete,
    Errored,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TrackerError {
    #[error("tracker is terminal, reset to start a new attempt")]
    Terminal,

    #[error("unknown step: {0}")]
    UnknownStep(String),

    #[error("cannot move backwards to step {0}")]
    Backwards(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatusTracker {
    steps: Vec<Step>,
    state: TrackerState,
}

impl TransactionStatusTracker {
    /// The fixed purchase sequence. The approval step is only present for
    /// payment methods that need a pre-approval.
    pub fn purchase_flow(requires_approval: bool) -> Self {
        let mut steps = vec![
            (steps::CONNECT_WALLET, "Connect wallet"),
            (steps::PREPARE_TRANSACTION, "Prepare transaction"),
        ];
        if requires_approval {
            steps.push((steps::APPROVE_SPEND, "Approve spending"));
        }
        steps.extend([
            (steps::SEND_TRANSACTION, "Send transaction"),
            (steps::VERIFY_TRANSACTION, "Verify transaction"),
            (steps::RECORD_PURCHASE, "Save allocation"),
        ]);

        Self {
            steps: steps
                .into_iter()
                .map(|(id, title)| Step { id, title, status: StepStatus::Pending, message: None })
                .collect(),
            state: TrackerState::NotStarted,
        }
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == TrackerState::AllComplete
    }

    pub fn is_error(&self) -> bool {
        self.state == TrackerState::Errored
    }

    pub fn current_step_id(&self) -> Option<&'static str> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Active || s.status == StepStatus::Error)
            .map(|s| s.id)
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    fn position(&self, step_id: &str) -> Result<usize, TrackerError> {
        self.steps
            .iter()
            .position(|s| s.id == step_id)
            .ok_or_else(|| TrackerError::UnknownStep(step_id.to_string()))
    }

    /// Marks `step_id` active and every earlier step complete.
    pub fn advance_to(&mut self, step_id: &str) -> Result<(), TrackerError> {
        if self.state == TrackerState::Errored || self.state == TrackerState::AllComplete {
            return Err(TrackerError::Terminal);
        }
        let target = self.position(step_id)?;
        if let Some(active) = self.steps.iter().position(|s| s.status == StepStatus::Active) {
            if target < active {
                return Err(TrackerError::Backwards(step_id.to_string()));
            }
        }

        for (index, step) in self.steps.iter_mut().enumerate() {
            step.status = match index.cmp(&target) {
                std::cmp::Ordering::Less => StepStatus::Complete,
                std::cmp::Ordering::Equal => StepStatus::Active,
                std::cmp::Ordering::Greater => StepStatus::Pending,
            };
        }
        self.state = TrackerState::InProgress;
        Ok(())
    }

    /// Marks `step_id` as the failure point; the tracker becomes terminal.
    pub fn fail(&mut self, step_id: &str, message: impl Into<String>) -> Result<(), TrackerError> {
        if self.state == TrackerState::Errored || self.state == TrackerState::AllComplete {
            return Err(TrackerError::Terminal);
        }
        let target = self.position(step_id)?;
        self.steps[target].status = StepStatus::Error;
        self.steps[target].message = Some(message.into());
        self.state = TrackerState::Errored;
        Ok(())
    }

    /// Marks every step complete and the run finished.
    pub fn complete(&mut self) -> Result<(), TrackerError> {
        if self.state == TrackerState::Errored {
            return Err(TrackerError::Terminal);
        }
        for step in &mut self.steps {
            step.status = StepStatus::Complete;
        }
        self.state = TrackerState::AllComplete;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advancing_completes_all_earlier_steps() {
        let mut tracker = TransactionStatusTracker::purchase_flow(false);
        assert_eq!(tracker.state(), TrackerState::NotStarted);

        tracker.advance_to(steps::VERIFY_TRANSACTION).unwrap();
        assert_eq!(tracker.state(), TrackerState::InProgress);
        assert_eq!(tracker.current_step_id(), Some(steps::VERIFY_TRANSACTION));
        for step in &tracker.steps()[..3] {
            assert_eq!(step.status, StepStatus::Complete);
        }
        assert_eq!(tracker.steps().last().unwrap().status, StepStatus::Pending);
    }

    #[test]
    fn approval_step_only_exists_when_requested() {
        let with = TransactionStatusTracker::purchase_flow(true);
        let without = TransactionStatusTracker::purchase_flow(false);
        assert!(with.steps().iter().any(|s| s.id == steps::APPROVE_SPEND));
        assert!(!without.steps().iter().any(|s| s.id == steps::APPROVE_SPEND));
    }

    #[test]
    fn errored_tracker_rejects_further_advances() {
        let mut tracker = TransactionStatusTracker::purchase_flow(false);
        tracker.advance_to(steps::SEND_TRANSACTION).unwrap();
        tracker.fail(steps::SEND_TRANSACTION, "user rejected signature").unwrap();

        assert!(tracker.is_error());
        assert_eq!(tracker.current_step_id(), Some(steps::SEND_TRANSACTION));
        assert_eq!(
            tracker.advance_to(steps::VERIFY_TRANSACTION),
            Err(TrackerError::Terminal)
        );
        assert_eq!(tracker.complete(), Err(TrackerError::Terminal));
    }

    #[test]
    fn cannot_move_backwards_within_a_run() {
        let mut tracker = TransactionStatusTracker::purchase_flow(false);
        tracker.advance_to(steps::VERIFY_TRANSACTION).unwrap();
        assert_eq!(
            tracker.advance_to(steps::CONNECT_WALLET),
            Err(TrackerError::Backwards(steps::CONNECT_WALLET.to_string()))
        );
    }

    #[test]
    fn unknown_step_is_rejected() {
        let mut tracker = TransactionStatusTracker::purchase_flow(false);
        assert_eq!(
            tracker.advance_to("mint-nft"),
            Err(TrackerError::UnknownStep("mint-nft".to_string()))
        );
    }

    #[test]
    fn complete_marks_every_step_done() {
        let mut tracker = TransactionStatusTracker::purchase_flow(false);
        tracker.advance_to(steps::RECORD_PURCHASE).unwrap();
        tracker.complete().unwrap();
        assert!(tracker.is_complete());
        assert!(tracker.steps().iter().all(|s| s.status == StepStatus::Complete));
    }
}
