use thiserror::Error;

/// Expose all controller components used by main
pub mod config;
pub mod operator;
pub mod reconcilers;
pub mod resources;

/// OpenStack service clients and credential scopes
pub mod osclients;
pub mod scope;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

use resources::ConditionReason;

/// API group shared by every managed kind
pub const ORC_API_GROUP: &str = "openstack.k-orc.cloud";

/// API version shared by every managed kind
pub const ORC_API_VERSION: &str = "v1alpha1";

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YamlError: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("OpenStack error: {0}")]
    OpenStack(#[from] osclients::Error),

    /// An error which will not be resolved by retrying without a spec change
    #[error("{message}")]
    Terminal {
        reason: ConditionReason,
        message: String,
    },

    #[error("invalid cloud credentials: {0}")]
    Credentials(String),

    #[error("creating client scope: {0}")]
    Scope(String),

    #[error("object {0} is missing a name or namespace")]
    MissingObjectKey(String),

    #[error("{0}")]
    ImageContent(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn terminal(reason: ConditionReason, message: impl Into<String>) -> Self {
        Error::Terminal {
            reason,
            message: message.into(),
        }
    }

    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::terminal(ConditionReason::InvalidConfiguration, message)
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::terminal(ConditionReason::UnrecoverableError, message)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Terminal { .. })
    }

    /// The condition reason this error surfaces as
    pub fn reason(&self) -> ConditionReason {
        match self {
            Error::Terminal { reason, .. } => *reason,
            _ => ConditionReason::TransientError,
        }
    }

    /// True when the API server rejected a server-side apply because of a field manager conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(ae)) => ae.code == 409,
            Error::OpenStack(e) => e.is_conflict(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(ae)) => ae.code == 404,
            Error::OpenStack(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn metric_label(&self) -> String {
        match self {
            Error::SerializationError(_) => "serialization".into(),
            Error::YamlError(_) => "yaml".into(),
            Error::KubeError(_) => "kube".into(),
            Error::OpenStack(_) => "openstack".into(),
            Error::Terminal { reason, .. } => reason.to_string().to_lowercase(),
            Error::Credentials(_) => "credentials".into(),
            Error::Scope(_) => "scope".into(),
            Error::MissingObjectKey(_) => "missingobjectkey".into(),
            Error::ImageContent(_) => "imagecontent".into(),
        }
    }
}
