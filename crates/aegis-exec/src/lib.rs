use std::sync::Arc;
use std::time::Duration;

use aegis_actions::{ActionDefinition, ActionKind};
use aegis_common::config::RetryConfig;
use aegis_core::{ActionRequest, ErrorKind, ResourceSnapshot};
use aegis_panel::{PanelApi, PanelError, PowerSignal, snapshot_from_usage};
use rand::Rng;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub detail: Value,
    pub attempts: u32,
}

/// Dispatches validated requests to the panel and owns the retry policy.
/// Idempotent actions retry transient failures with backoff; everything
/// else gets exactly one attempt so an ambiguous timeout can never turn
/// into a duplicate side effect.
pub struct ExecutionCoordinator {
    panel: Arc<dyn PanelApi>,
    retry: RetryConfig,
}

impl ExecutionCoordinator {
    pub fn new(panel: Arc<dyn PanelApi>, retry: RetryConfig) -> Self {
        Self { panel, retry }
    }

    /// Best-effort state fetch for risk assessment. A panel that cannot
    /// be reached must not block the safety pipeline, so failures
    /// degrade to an unknown snapshot instead of an error.
    pub fn snapshot(&self, resource_id: &str) -> ResourceSnapshot {
        match self.panel.resource_usage(resource_id) {
            Ok(body) => snapshot_from_usage(&body),
            Err(err) => {
                tracing::debug!(%resource_id, error = %err, "snapshot fetch failed, degrading");
                ResourceSnapshot::unknown()
            }
        }
    }

    pub fn execute(
        &self,
        definition: &ActionDefinition,
        request: &ActionRequest,
    ) -> Result<ExecutionResult, ErrorKind> {
        let budget = if definition.idempotent {
            self.retry.max_attempts.max(1)
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.dispatch(definition.kind, request) {
                Ok(detail) => {
                    return Ok(ExecutionResult { detail, attempts: attempt });
                }
                Err(err) if err.retryable() && attempt < budget => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        action = definition.name(),
                        resource = %request.resource_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient upstream failure, retrying"
                    );
                    std::thread::sleep(delay);
                }
                Err(err) => return Err(map_panel_error(err)),
            }
        }
    }

    fn dispatch(&self, kind: ActionKind, request: &ActionRequest) -> Result<Value, PanelError> {
        let resource = request.resource_id.as_str();
        match kind {
            ActionKind::GetStatus => self.panel.resource_usage(resource),
            ActionKind::ListServers => self.panel.list_servers(),
            ActionKind::Start => self.panel.power_action(resource, PowerSignal::Start),
            ActionKind::Stop => self.panel.power_action(resource, PowerSignal::Stop),
            ActionKind::Restart => self.panel.power_action(resource, PowerSignal::Restart),
            ActionKind::Kill => self.panel.power_action(resource, PowerSignal::Kill),
            ActionKind::SendCommand => self
                .panel
                .send_command(resource, parameter(request, "command")?),
            ActionKind::ReadFile => self.panel.read_file(resource, parameter(request, "file")?),
            ActionKind::WriteFile => self.panel.write_file(
                resource,
                parameter(request, "file")?,
                parameter(request, "content")?,
            ),
            ActionKind::DeleteFiles => {
                let files: Vec<String> = parameter(request, "files")?
                    .split(',')
                    .map(|item| item.trim().to_string())
                    .filter(|item| !item.is_empty())
                    .collect();
                self.panel.delete_files(resource, &files)
            }
            ActionKind::CreateBackup => self
                .panel
                .create_backup(resource, request.parameters.get("name").map(String::as_str)),
            ActionKind::RestoreBackup => self
                .panel
                .restore_backup(resource, parameter(request, "backup_id")?),
            ActionKind::CreateDatabase => self
                .panel
                .create_database(resource, parameter(request, "name")?),
            ActionKind::DeleteDatabase => self
                .panel
                .delete_database(resource, parameter(request, "database_id")?),
        }
    }

    /// Exponential backoff with jitter, capped by config. `attempt` is
    /// the 1-based attempt that just failed.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .retry
            .base_delay_ms
            .saturating_mul(1u64 << (attempt - 1).min(16));
        let capped = exp.min(self.retry.max_delay_ms);
        let jitter = rand::rng().random_range(0..=capped / 4);
        Duration::from_millis(capped + jitter)
    }
}

/// Parameters are validated before execution, so a miss here is a
/// pipeline bug rather than a user error; surfaced as fatal either way.
fn parameter<'a>(request: &'a ActionRequest, name: &str) -> Result<&'a str, PanelError> {
    request
        .parameters
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| PanelError::Fatal(format!("missing parameter {name}")))
}

fn map_panel_error(err: PanelError) -> ErrorKind {
    match err {
        PanelError::Unauthorized => {
            ErrorKind::UpstreamFatal("panel rejected the API credentials".to_string())
        }
        PanelError::NotFound => {
            ErrorKind::UpstreamFatal("panel resource not found".to_string())
        }
        PanelError::Transient(detail) => ErrorKind::UpstreamTransient(detail),
        PanelError::Timeout => ErrorKind::Timeout,
        PanelError::Fatal(detail) => ErrorKind::UpstreamFatal(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_actions::ActionRegistry;
    use std::sync::Mutex;

    /// Scripted panel double. Pops one response per call and records
    /// how many calls each method received.
    struct ScriptedPanel {
        responses: Mutex<Vec<Result<Value, PanelError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedPanel {
        fn new(responses: Vec<Result<Value, PanelError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }

        fn next(&self) -> Result<Value, PanelError> {
            *self.calls.lock().unwrap() += 1;
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(serde_json::json!({}))
            } else {
                responses.remove(0)
            }
        }
    }

    impl PanelApi for ScriptedPanel {
        fn list_servers(&self) -> Result<Value, PanelError> {
            self.next()
        }
        fn power_action(&self, _: &str, _: PowerSignal) -> Result<Value, PanelError> {
            self.next()
        }
        fn send_command(&self, _: &str, _: &str) -> Result<Value, PanelError> {
            self.next()
        }
        fn resource_usage(&self, _: &str) -> Result<Value, PanelError> {
            self.next()
        }
        fn read_file(&self, _: &str, _: &str) -> Result<Value, PanelError> {
            self.next()
        }
        fn write_file(&self, _: &str, _: &str, _: &str) -> Result<Value, PanelError> {
            self.next()
        }
        fn delete_files(&self, _: &str, _: &[String]) -> Result<Value, PanelError> {
            self.next()
        }
        fn create_backup(&self, _: &str, _: Option<&str>) -> Result<Value, PanelError> {
            self.next()
        }
        fn restore_backup(&self, _: &str, _: &str) -> Result<Value, PanelError> {
            self.next()
        }
        fn create_database(&self, _: &str, _: &str) -> Result<Value, PanelError> {
            self.next()
        }
        fn delete_database(&self, _: &str, _: &str) -> Result<Value, PanelError> {
            self.next()
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    fn coordinator(panel: Arc<ScriptedPanel>) -> ExecutionCoordinator {
        ExecutionCoordinator::new(panel, fast_retry())
    }

    fn definition(name: &str) -> &'static ActionDefinition {
        let registry: &'static ActionRegistry =
            Box::leak(Box::new(ActionRegistry::with_defaults()));
        registry.resolve(name).expect("known action")
    }

    #[test]
    fn idempotent_action_retries_transient_failures() {
        let panel = Arc::new(ScriptedPanel::new(vec![
            Err(PanelError::Transient("blip".into())),
            Err(PanelError::Transient("blip".into())),
            Ok(serde_json::json!({})),
        ]));
        let result = coordinator(Arc::clone(&panel))
            .execute(
                definition("restart"),
                &ActionRequest::new("s1", "srv1", "restart"),
            )
            .expect("succeeds on third attempt");
        assert_eq!(result.attempts, 3);
        assert_eq!(panel.calls(), 3);
    }

    #[test]
    fn idempotent_action_gives_up_after_the_attempt_budget() {
        let panel = Arc::new(ScriptedPanel::new(vec![
            Err(PanelError::Transient("down".into())),
            Err(PanelError::Transient("down".into())),
            Err(PanelError::Transient("down".into())),
        ]));
        let err = coordinator(Arc::clone(&panel))
            .execute(
                definition("start"),
                &ActionRequest::new("s1", "srv1", "start"),
            )
            .unwrap_err();
        assert!(err.retryable());
        assert_eq!(panel.calls(), 3);
    }

    #[test]
    fn non_idempotent_action_is_attempted_exactly_once() {
        let panel = Arc::new(ScriptedPanel::new(vec![Err(PanelError::Timeout)]));
        let err = coordinator(Arc::clone(&panel))
            .execute(
                definition("send_command"),
                &ActionRequest::new("s1", "srv1", "send_command")
                    .with_parameter("command", "say hi"),
            )
            .unwrap_err();
        // The failure is still reported retryable so the caller can
        // decide whether to resubmit.
        assert_eq!(err, ErrorKind::Timeout);
        assert!(err.retryable());
        assert_eq!(panel.calls(), 1);
    }

    #[test]
    fn fatal_failures_never_retry() {
        let panel = Arc::new(ScriptedPanel::new(vec![Err(PanelError::Fatal(
            "bad request".into(),
        ))]));
        let err = coordinator(Arc::clone(&panel))
            .execute(
                definition("restart"),
                &ActionRequest::new("s1", "srv1", "restart"),
            )
            .unwrap_err();
        assert!(!err.retryable());
        assert_eq!(panel.calls(), 1);
    }

    #[test]
    fn snapshot_degrades_to_unknown_when_the_panel_is_down() {
        let panel = Arc::new(ScriptedPanel::new(vec![Err(PanelError::Transient(
            "down".into(),
        ))]));
        let snapshot = coordinator(panel).snapshot("srv1");
        assert_eq!(snapshot, ResourceSnapshot::unknown());
    }

    #[test]
    fn delete_files_splits_the_file_list() {
        struct CapturingPanel(Mutex<Vec<String>>);
        impl PanelApi for CapturingPanel {
            fn list_servers(&self) -> Result<Value, PanelError> {
                unimplemented!()
            }
            fn power_action(&self, _: &str, _: PowerSignal) -> Result<Value, PanelError> {
                unimplemented!()
            }
            fn send_command(&self, _: &str, _: &str) -> Result<Value, PanelError> {
                unimplemented!()
            }
            fn resource_usage(&self, _: &str) -> Result<Value, PanelError> {
                unimplemented!()
            }
            fn read_file(&self, _: &str, _: &str) -> Result<Value, PanelError> {
                unimplemented!()
            }
            fn write_file(&self, _: &str, _: &str, _: &str) -> Result<Value, PanelError> {
                unimplemented!()
            }
            fn delete_files(&self, _: &str, files: &[String]) -> Result<Value, PanelError> {
                *self.0.lock().unwrap() = files.to_vec();
                Ok(serde_json::json!({}))
            }
            fn create_backup(&self, _: &str, _: Option<&str>) -> Result<Value, PanelError> {
                unimplemented!()
            }
            fn restore_backup(&self, _: &str, _: &str) -> Result<Value, PanelError> {
                unimplemented!()
            }
            fn create_database(&self, _: &str, _: &str) -> Result<Value, PanelError> {
                unimplemented!()
            }
            fn delete_database(&self, _: &str, _: &str) -> Result<Value, PanelError> {
                unimplemented!()
            }
        }

        let panel = Arc::new(CapturingPanel(Mutex::new(Vec::new())));
        ExecutionCoordinator::new(Arc::clone(&panel) as Arc<dyn PanelApi>, fast_retry())
            .execute(
                definition("delete_files"),
                &ActionRequest::new("s1", "srv1", "delete_files")
                    .with_parameter("files", "world_old, logs/latest.log ,"),
            )
            .expect("delete files");
        assert_eq!(
            *panel.0.lock().unwrap(),
            vec!["world_old".to_string(), "logs/latest.log".to_string()]
        );
    }
}
