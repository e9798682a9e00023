use std::sync::Arc;

use aegis_actions::{ActionRegistry, RiskAssessor};
use aegis_audit::AuditLedger;
use aegis_common::config::AegisConfig;
use aegis_core::{
    ActionOutcome, ActionRequest, AuditEntry, ErrorKind, OutcomeStatus, ResourceSnapshot,
    RiskAssessment, RiskTier,
};
use aegis_exec::ExecutionCoordinator;
use aegis_panel::PanelApi;
use aegis_session::{ConfirmationGate, SessionStore, parameter_digest};
use anyhow::{Context, Result};
use chrono::Duration;

/// Safety pipeline in front of the panel. Every request passes through
/// the same gauntlet: session validation, resource access, action
/// resolution, permission scope, parameter validation, risk assessment,
/// the confirmation gate, and only then execution. Each `submit` writes
/// exactly one audit entry, whatever the outcome.
pub struct Orchestrator {
    sessions: Arc<SessionStore>,
    registry: ActionRegistry,
    gate: ConfirmationGate,
    coordinator: ExecutionCoordinator,
    ledger: Arc<AuditLedger>,
}

impl Orchestrator {
    pub fn new(config: &AegisConfig, panel: Arc<dyn PanelApi>) -> Result<Self> {
        let ledger = Arc::new(
            AuditLedger::open(&config.audit_db_path).context("failed to open the audit ledger")?,
        );
        Ok(Self::from_parts(config, panel, ledger))
    }

    /// Wires the pipeline from pre-built parts. Used by `new` and by
    /// tests that want a ledger in a scratch directory.
    pub fn from_parts(
        config: &AegisConfig,
        panel: Arc<dyn PanelApi>,
        ledger: Arc<AuditLedger>,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new(
            config.session.shards,
            Duration::minutes(config.session.sliding_window_mins as i64),
        ));
        let gate = ConfirmationGate::new(
            config.session.shards,
            Duration::seconds(config.confirmation.ticket_ttl_secs as i64),
        );
        let coordinator = ExecutionCoordinator::new(panel, config.retry.clone());
        Self {
            sessions,
            registry: ActionRegistry::with_defaults(),
            gate,
            coordinator,
            ledger,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn ledger(&self) -> &AuditLedger {
        &self.ledger
    }

    /// Single entry point. Never panics and never returns an error: every
    /// failure mode is a structured outcome.
    pub fn submit(&self, request: ActionRequest) -> ActionOutcome {
        let outcome = self.run_pipeline(&request);
        tracing::info!(
            correlation_id = %outcome.correlation_id,
            action = %request.action,
            resource = %request.resource_id,
            status = outcome.status.as_str(),
            tier = outcome.risk.tier.as_str(),
            "action submitted"
        );
        outcome
    }

    fn run_pipeline(&self, request: &ActionRequest) -> ActionOutcome {
        let session = match self.sessions.validate(&request.session_id) {
            Ok(session) => session,
            Err(err) => {
                return self.deny(request, RiskAssessment::at_base(RiskTier::Low), None, err);
            }
        };

        if !session.has_access(&request.resource_id) {
            return self.deny(
                request,
                RiskAssessment::at_base(RiskTier::Low),
                None,
                ErrorKind::PermissionDenied(format!(
                    "resource {} is outside this session's grant",
                    request.resource_id
                )),
            );
        }

        let definition = match self.registry.resolve(&request.action) {
            Ok(definition) => definition,
            Err(err) => {
                return self.deny(request, RiskAssessment::at_base(RiskTier::Low), None, err);
            }
        };
        let base_risk = RiskAssessment::at_base(definition.base_tier);

        if !session.has_permission(definition.required_scope) {
            return self.deny(
                request,
                base_risk,
                None,
                ErrorKind::PermissionDenied(definition.required_scope.to_string()),
            );
        }

        if let Err(err) = self.registry.validate_parameters(definition, request) {
            return self.deny(request, base_risk, None, err);
        }

        // Live state only influences the assessment of disruptive
        // actions, so the best-effort fetch is skipped everywhere else.
        let snapshot = if definition.disruptive {
            self.coordinator.snapshot(&request.resource_id)
        } else {
            ResourceSnapshot::unknown()
        };
        let assessment = RiskAssessor::assess(definition, request, snapshot);

        let mut ticket_used = None;
        if assessment.tier.requires_confirmation() {
            let digest = parameter_digest(&request.parameters);
            match &request.confirmation_token {
                None => {
                    let ticket = self.gate.issue(
                        &request.session_id,
                        &request.resource_id,
                        &request.action,
                        &digest,
                    );
                    self.audit(
                        request,
                        &assessment,
                        Some(ticket.ticket_id.clone()),
                        OutcomeStatus::NeedsConfirmation,
                        "confirmation required",
                    );
                    return ActionOutcome::needs_confirmation(
                        request.correlation_id.clone(),
                        assessment,
                        ticket.ticket_id,
                    );
                }
                Some(token) => {
                    match self.gate.confirm(
                        &request.session_id,
                        &request.resource_id,
                        &request.action,
                        token,
                        &digest,
                    ) {
                        Ok(ticket) => ticket_used = Some(ticket.ticket_id),
                        Err(err) => return self.fail(request, assessment, None, err),
                    }
                }
            }
        }

        match self.coordinator.execute(definition, request) {
            Ok(result) => {
                self.audit(
                    request,
                    &assessment,
                    ticket_used.clone(),
                    OutcomeStatus::Executed,
                    &format!("completed in {} attempt(s)", result.attempts),
                );
                ActionOutcome::executed(request.correlation_id.clone(), assessment, result.detail)
            }
            Err(err) => self.fail(request, assessment, ticket_used, err),
        }
    }

    fn deny(
        &self,
        request: &ActionRequest,
        risk: RiskAssessment,
        ticket_used: Option<String>,
        err: ErrorKind,
    ) -> ActionOutcome {
        self.audit(
            request,
            &risk,
            ticket_used,
            OutcomeStatus::Denied,
            &err.to_string(),
        );
        ActionOutcome::denied(request.correlation_id.clone(), risk, err)
    }

    fn fail(
        &self,
        request: &ActionRequest,
        risk: RiskAssessment,
        ticket_used: Option<String>,
        err: ErrorKind,
    ) -> ActionOutcome {
        self.audit(
            request,
            &risk,
            ticket_used,
            OutcomeStatus::Failed,
            &err.to_string(),
        );
        ActionOutcome::failed(request.correlation_id.clone(), risk, err)
    }

    fn audit(
        &self,
        request: &ActionRequest,
        risk: &RiskAssessment,
        ticket_used: Option<String>,
        outcome: OutcomeStatus,
        detail: &str,
    ) {
        let entry = AuditEntry::new(
            request.correlation_id.clone(),
            request.session_id.clone(),
            request.resource_id.clone(),
            request.action.clone(),
            risk.tier,
            outcome,
        )
        .with_ticket(ticket_used)
        .with_detail(detail);
        self.ledger.record(&entry);
    }
}
