use std::{collections::BTreeSet, fmt, time::Duration};

use kube::runtime::controller::Action;

use crate::{osclients, Error, Result};

/// What a reconcile is waiting for to happen to another object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WaitingOn {
    Creation,
    Ready,
    Update,
    Deletion,
}

/// A reason the object has not converged yet
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProgressStatus {
    /// Another orchestrator object must change first. A watch will retrigger us.
    WaitingOnObject {
        kind: String,
        name: String,
        waiting_on: WaitingOn,
    },

    /// A finalizer owned by someone else is still present
    WaitingOnFinalizer(String),

    /// The cloud resource must change first. Nothing will notify us, so poll.
    WaitingOnCloud {
        waiting_on: WaitingOn,
        polling_period: Duration,
    },

    /// The cloud is doing work we can describe, e.g. downloading image content. Poll.
    InProgress {
        message: String,
        polling_period: Duration,
    },

    /// We changed the cloud resource and must re-read it
    NeedsRefresh,
}

impl ProgressStatus {
    pub fn waiting_on_object(kind: impl Into<String>, name: impl Into<String>, waiting_on: WaitingOn) -> Self {
        ProgressStatus::WaitingOnObject {
            kind: kind.into(),
            name: name.into(),
            waiting_on,
        }
    }

    pub fn waiting_on_cloud(waiting_on: WaitingOn, polling_period: Duration) -> Self {
        ProgressStatus::WaitingOnCloud {
            waiting_on,
            polling_period,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ProgressStatus::WaitingOnObject {
                kind,
                name,
                waiting_on,
            } => {
                let outcome = match waiting_on {
                    WaitingOn::Creation => "exist",
                    WaitingOn::Ready => "be available",
                    WaitingOn::Update => "be updated",
                    WaitingOn::Deletion => "be deleted",
                };
                format!("waiting for {kind}/{name} to {outcome}")
            }
            ProgressStatus::WaitingOnFinalizer(finalizer) => {
                format!("waiting for finalizer {finalizer} to be removed")
            }
            ProgressStatus::WaitingOnCloud { waiting_on, .. } => {
                let outcome = match waiting_on {
                    WaitingOn::Creation => "be created externally",
                    WaitingOn::Ready => "be ready",
                    WaitingOn::Update => "be updated",
                    WaitingOn::Deletion => "be deleted",
                };
                format!("waiting for OpenStack resource to {outcome}")
            }
            ProgressStatus::InProgress { message, .. } => message.clone(),
            ProgressStatus::NeedsRefresh => "resource status will be refreshed".to_string(),
        }
    }

    /// How soon to reconcile again, or `None` if an event will retrigger us
    pub fn requeue(&self) -> Option<Duration> {
        match self {
            ProgressStatus::WaitingOnCloud { polling_period, .. }
            | ProgressStatus::InProgress { polling_period, .. } => Some(*polling_period),
            ProgressStatus::NeedsRefresh => Some(Duration::ZERO),
            ProgressStatus::WaitingOnObject { .. } | ProgressStatus::WaitingOnFinalizer(_) => None,
        }
    }

    pub fn is_waiting_on_object(&self) -> bool {
        matches!(self, ProgressStatus::WaitingOnObject { .. })
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// The accumulated outcome of one reconcile: everything still outstanding and every error seen
#[derive(Debug, Default)]
pub struct ReconcileStatus {
    progress: Vec<ProgressStatus>,
    errors: Vec<Error>,
    /// The resource exists but must not be used, e.g. its content failed verification
    unusable: bool,
}

/// Result of a reconcile step which produces a value only once nothing is outstanding
pub type Outcome<T> = std::result::Result<T, ReconcileStatus>;

impl ReconcileStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(mut self, progress: ProgressStatus) -> Self {
        if !self.progress.contains(&progress) {
            self.progress.push(progress);
        }
        self
    }

    pub fn with_error(mut self, error: impl Into<Error>) -> Self {
        self.errors.push(error.into());
        self
    }

    pub fn waiting_on_object(self, kind: impl Into<String>, name: impl Into<String>, waiting_on: WaitingOn) -> Self {
        self.with_progress(ProgressStatus::waiting_on_object(kind, name, waiting_on))
    }

    pub fn waiting_on_cloud(self, waiting_on: WaitingOn, polling_period: Duration) -> Self {
        self.with_progress(ProgressStatus::waiting_on_cloud(waiting_on, polling_period))
    }

    pub fn in_progress(self, message: impl Into<String>, polling_period: Duration) -> Self {
        self.with_progress(ProgressStatus::InProgress {
            message: message.into(),
            polling_period,
        })
    }

    pub fn needs_refresh(self) -> Self {
        self.with_progress(ProgressStatus::NeedsRefresh)
    }

    /// Report `error` and mark the resource unusable, whatever the cloud says about it
    pub fn resource_unusable(mut self, error: impl Into<Error>) -> Self {
        self.unusable = true;
        self.with_error(error)
    }

    pub fn is_resource_unusable(&self) -> bool {
        self.unusable
    }

    pub fn merge(mut self, other: ReconcileStatus) -> Self {
        for progress in other.progress {
            self = self.with_progress(progress);
        }
        self.errors.extend(other.errors);
        self.unusable |= other.unusable;
        self
    }

    /// Nothing outstanding and no errors
    pub fn is_complete(&self) -> bool {
        self.progress.is_empty() && self.errors.is_empty()
    }

    /// True when the object must be reconciled again, either by polling or by backoff
    pub fn needs_reschedule(&self) -> bool {
        self.transient_error().is_some() || self.requeue_after().is_some()
    }

    pub fn progress(&self) -> &[ProgressStatus] {
        &self.progress
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    pub fn terminal_error(&self) -> Option<&Error> {
        self.errors.iter().find(|e| e.is_terminal())
    }

    pub fn transient_error(&self) -> Option<&Error> {
        self.errors.iter().find(|e| !e.is_terminal())
    }

    /// Only waits on other orchestrator objects, which the watches will resolve
    pub fn only_waiting_on_objects(&self) -> bool {
        self.errors.is_empty()
            && !self.progress.is_empty()
            && self.progress.iter().all(ProgressStatus::is_waiting_on_object)
    }

    /// Unique progress messages in lexicographic order
    pub fn messages(&self) -> Vec<String> {
        self.progress
            .iter()
            .map(ProgressStatus::message)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// The shortest polling period of everything outstanding
    pub fn requeue_after(&self) -> Option<Duration> {
        self.progress.iter().filter_map(ProgressStatus::requeue).min()
    }

    /// Collapse into the action returned to the controller runtime
    ///
    /// A transient error is returned so the runtime's error policy applies backoff.
    /// Terminal errors wait for the object to change.
    pub fn into_action(mut self) -> Result<Action> {
        if let Some(i) = self.errors.iter().position(|e| !e.is_terminal()) {
            return Err(self.errors.swap_remove(i));
        }
        if !self.errors.is_empty() {
            return Ok(Action::await_change());
        }
        Ok(self
            .requeue_after()
            .map(Action::requeue)
            .unwrap_or_else(Action::await_change))
    }
}

impl From<ProgressStatus> for ReconcileStatus {
    fn from(progress: ProgressStatus) -> Self {
        ReconcileStatus::new().with_progress(progress)
    }
}

impl From<Error> for ReconcileStatus {
    fn from(error: Error) -> Self {
        ReconcileStatus::new().with_error(error)
    }
}

impl From<osclients::Error> for ReconcileStatus {
    fn from(error: osclients::Error) -> Self {
        ReconcileStatus::new().with_error(error)
    }
}

impl From<kube::Error> for ReconcileStatus {
    fn from(error: kube::Error) -> Self {
        ReconcileStatus::new().with_error(error)
    }
}

/// Turn a step result into a status, discarding the value
pub fn outcome_status<T>(outcome: Outcome<T>) -> ReconcileStatus {
    match outcome {
        Ok(_) => ReconcileStatus::new(),
        Err(status) => status,
    }
}
