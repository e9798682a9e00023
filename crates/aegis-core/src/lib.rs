use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Risk classification for a concrete action request. Ordering matters:
/// `Low < Medium < High < Critical`, and High/Critical require a
/// confirmation ticket before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Raises the tier one level, saturating at Critical.
    pub fn bump(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High => Self::Critical,
            Self::Critical => Self::Critical,
        }
    }

    pub fn requires_confirmation(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

/// Outcome of a risk assessment: the effective tier plus the ordered
/// reasons that raised it above the registry's base classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub tier: RiskTier,
    pub reasons: Vec<String>,
}

impl RiskAssessment {
    pub fn at_base(tier: RiskTier) -> Self {
        Self {
            tier,
            reasons: Vec::new(),
        }
    }
}

/// A single caller invocation against the orchestrator. Immutable once
/// built; not persisted beyond the request lifetime.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub session_id: String,
    pub resource_id: String,
    pub action: String,
    pub parameters: BTreeMap<String, String>,
    pub confirmation_token: Option<String>,
    pub correlation_id: String,
}

impl ActionRequest {
    pub fn new(
        session_id: impl Into<String>,
        resource_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            resource_id: resource_id.into(),
            action: action.into(),
            parameters: BTreeMap::new(),
            confirmation_token: None,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_confirmation_token(mut self, token: impl Into<String>) -> Self {
        self.confirmation_token = Some(token.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Executed,
    NeedsConfirmation,
    Denied,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Executed => "executed",
            Self::NeedsConfirmation => "needs_confirmation",
            Self::Denied => "denied",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "executed" => Some(Self::Executed),
            "needs_confirmation" => Some(Self::NeedsConfirmation),
            "denied" => Some(Self::Denied),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Terminal error classes surfaced from `submit`. These are values, not
/// panics: no error class escapes the orchestrator as an exception.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("session expired")]
    SessionExpired,
    #[error("session not found")]
    SessionNotFound,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("missing required parameter: {0}")]
    MissingParameter(String),
    #[error("confirmation ticket expired or already used")]
    ConfirmationExpired,
    #[error("confirmation parameters no longer match the warned request")]
    ConfirmationMismatch,
    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),
    #[error("upstream fatal failure: {0}")]
    UpstreamFatal(String),
    #[error("upstream call timed out")]
    Timeout,
}

impl ErrorKind {
    /// True when the caller may safely resubmit a fresh request.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::UpstreamTransient(_) | Self::Timeout)
    }
}

/// Structured result returned to the caller for every `submit`.
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub correlation_id: String,
    pub status: OutcomeStatus,
    pub risk: RiskAssessment,
    pub ticket_id: Option<String>,
    pub upstream: Option<Value>,
    pub error: Option<ErrorKind>,
}

impl ActionOutcome {
    pub fn executed(
        correlation_id: impl Into<String>,
        risk: RiskAssessment,
        upstream: Value,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: OutcomeStatus::Executed,
            risk,
            ticket_id: None,
            upstream: Some(upstream),
            error: None,
        }
    }

    pub fn needs_confirmation(
        correlation_id: impl Into<String>,
        risk: RiskAssessment,
        ticket_id: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: OutcomeStatus::NeedsConfirmation,
            risk,
            ticket_id: Some(ticket_id.into()),
            upstream: None,
            error: None,
        }
    }

    pub fn denied(correlation_id: impl Into<String>, risk: RiskAssessment, error: ErrorKind) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: OutcomeStatus::Denied,
            risk,
            ticket_id: None,
            upstream: None,
            error: Some(error),
        }
    }

    pub fn failed(correlation_id: impl Into<String>, risk: RiskAssessment, error: ErrorKind) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: OutcomeStatus::Failed,
            risk,
            ticket_id: None,
            upstream: None,
            error: Some(error),
        }
    }
}

/// Last-observed state of the remote resource, handed to the risk
/// assessor so it never performs I/O itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Running,
    Starting,
    Stopping,
    Offline,
    Unknown,
}

impl ResourceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
            Self::Offline => "offline",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "starting" => Self::Starting,
            "stopping" => Self::Stopping,
            "offline" => Self::Offline,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub state: ResourceState,
    pub active_players: u32,
}

impl ResourceSnapshot {
    pub fn unknown() -> Self {
        Self {
            state: ResourceState::Unknown,
            active_players: 0,
        }
    }
}

/// One append-only ledger row per `submit`, regardless of outcome.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub correlation_id: String,
    pub session_id: String,
    pub resource_id: String,
    pub action: String,
    pub risk_tier: RiskTier,
    pub ticket_used: Option<String>,
    pub outcome: OutcomeStatus,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        correlation_id: impl Into<String>,
        session_id: impl Into<String>,
        resource_id: impl Into<String>,
        action: impl Into<String>,
        risk_tier: RiskTier,
        outcome: OutcomeStatus,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            session_id: session_id.into(),
            resource_id: resource_id.into(),
            action: action.into(),
            risk_tier,
            ticket_used: None,
            outcome,
            detail: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_ticket(mut self, ticket_id: Option<String>) -> Self {
        self.ticket_used = ticket_id;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}
