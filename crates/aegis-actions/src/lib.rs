use aegis_core::{ActionRequest, ErrorKind, ResourceSnapshot, RiskAssessment, RiskTier};

/// Canonical panel actions. The catalog is closed: new actions arrive by
/// redeploying the registry, never by request-time registration, so risk
/// tiers cannot be injected by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    GetStatus,
    ListServers,
    Start,
    Stop,
    Restart,
    Kill,
    SendCommand,
    ReadFile,
    WriteFile,
    DeleteFiles,
    CreateBackup,
    RestoreBackup,
    CreateDatabase,
    DeleteDatabase,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetStatus => "get_status",
            Self::ListServers => "list_servers",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Kill => "kill",
            Self::SendCommand => "send_command",
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::DeleteFiles => "delete_files",
            Self::CreateBackup => "create_backup",
            Self::RestoreBackup => "restore_backup",
            Self::CreateDatabase => "create_database",
            Self::DeleteDatabase => "delete_database",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "get_status" => Some(Self::GetStatus),
            "list_servers" => Some(Self::ListServers),
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "restart" => Some(Self::Restart),
            "kill" => Some(Self::Kill),
            "send_command" => Some(Self::SendCommand),
            "read_file" => Some(Self::ReadFile),
            "write_file" => Some(Self::WriteFile),
            "delete_files" => Some(Self::DeleteFiles),
            "create_backup" => Some(Self::CreateBackup),
            "restore_backup" => Some(Self::RestoreBackup),
            "create_database" => Some(Self::CreateDatabase),
            "delete_database" => Some(Self::DeleteDatabase),
            _ => None,
        }
    }
}

/// Static classification of a single action. Loaded once at process
/// start and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ActionDefinition {
    pub kind: ActionKind,
    pub required_parameters: &'static [&'static str],
    pub base_tier: RiskTier,
    /// Whether repeating the call with identical parameters converges to
    /// the same end state. Power signals are ensure-state and qualify;
    /// console injection and mutating file/backup/db calls do not.
    pub idempotent: bool,
    /// Power-style actions that interrupt connected players.
    pub disruptive: bool,
    /// Name of a free-text parameter scanned for destructive patterns.
    pub payload_parameter: Option<&'static str>,
    pub required_scope: &'static str,
}

impl ActionDefinition {
    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }
}

#[derive(Debug)]
pub struct ActionRegistry {
    actions: Vec<ActionDefinition>,
}

impl ActionRegistry {
    pub fn with_defaults() -> Self {
        let actions = vec![
            ActionDefinition {
                kind: ActionKind::GetStatus,
                required_parameters: &[],
                base_tier: RiskTier::Low,
                idempotent: true,
                disruptive: false,
                payload_parameter: None,
                required_scope: "server.control",
            },
            ActionDefinition {
                kind: ActionKind::ListServers,
                required_parameters: &[],
                base_tier: RiskTier::Low,
                idempotent: true,
                disruptive: false,
                payload_parameter: None,
                required_scope: "server.control",
            },
            ActionDefinition {
                kind: ActionKind::Start,
                required_parameters: &[],
                base_tier: RiskTier::Medium,
                idempotent: true,
                disruptive: false,
                payload_parameter: None,
                required_scope: "server.control",
            },
            ActionDefinition {
                kind: ActionKind::Stop,
                required_parameters: &[],
                base_tier: RiskTier::High,
                idempotent: true,
                disruptive: true,
                payload_parameter: None,
                required_scope: "server.control",
            },
            ActionDefinition {
                kind: ActionKind::Restart,
                required_parameters: &[],
                base_tier: RiskTier::High,
                idempotent: true,
                disruptive: true,
                payload_parameter: None,
                required_scope: "server.control",
            },
            ActionDefinition {
                kind: ActionKind::Kill,
                required_parameters: &[],
                base_tier: RiskTier::High,
                idempotent: true,
                disruptive: true,
                payload_parameter: None,
                required_scope: "server.control",
            },
            ActionDefinition {
                kind: ActionKind::SendCommand,
                required_parameters: &["command"],
                base_tier: RiskTier::High,
                idempotent: false,
                disruptive: false,
                payload_parameter: Some("command"),
                required_scope: "server.control",
            },
            ActionDefinition {
                kind: ActionKind::ReadFile,
                required_parameters: &["file"],
                base_tier: RiskTier::Low,
                idempotent: true,
                disruptive: false,
                payload_parameter: None,
                required_scope: "server.files",
            },
            ActionDefinition {
                kind: ActionKind::WriteFile,
                required_parameters: &["file", "content"],
                base_tier: RiskTier::High,
                idempotent: false,
                disruptive: false,
                payload_parameter: None,
                required_scope: "server.files",
            },
            ActionDefinition {
                kind: ActionKind::DeleteFiles,
                required_parameters: &["files"],
                base_tier: RiskTier::Critical,
                idempotent: false,
                disruptive: false,
                payload_parameter: None,
                required_scope: "server.files",
            },
            ActionDefinition {
                kind: ActionKind::CreateBackup,
                required_parameters: &[],
                base_tier: RiskTier::Medium,
                idempotent: false,
                disruptive: false,
                payload_parameter: None,
                required_scope: "server.backup",
            },
            ActionDefinition {
                kind: ActionKind::RestoreBackup,
                required_parameters: &["backup_id"],
                base_tier: RiskTier::Critical,
                idempotent: false,
                disruptive: true,
                payload_parameter: None,
                required_scope: "server.backup",
            },
            ActionDefinition {
                kind: ActionKind::CreateDatabase,
                required_parameters: &["name"],
                base_tier: RiskTier::Medium,
                idempotent: false,
                disruptive: false,
                payload_parameter: None,
                required_scope: "server.database",
            },
            ActionDefinition {
                kind: ActionKind::DeleteDatabase,
                required_parameters: &["database_id"],
                base_tier: RiskTier::Critical,
                idempotent: false,
                disruptive: false,
                payload_parameter: None,
                required_scope: "server.database",
            },
        ];
        Self { actions }
    }

    pub fn list(&self) -> &[ActionDefinition] {
        &self.actions
    }

    pub fn resolve(&self, name: &str) -> Result<&ActionDefinition, ErrorKind> {
        let kind =
            ActionKind::parse(name).ok_or_else(|| ErrorKind::UnknownAction(name.to_string()))?;
        self.actions
            .iter()
            .find(|action| action.kind == kind)
            .ok_or_else(|| ErrorKind::UnknownAction(name.to_string()))
    }

    /// Fails with the first missing required parameter, in catalog order.
    pub fn validate_parameters(
        &self,
        definition: &ActionDefinition,
        request: &ActionRequest,
    ) -> Result<(), ErrorKind> {
        for required in definition.required_parameters {
            match request.parameters.get(*required) {
                Some(value) if !value.trim().is_empty() => {}
                _ => return Err(ErrorKind::MissingParameter((*required).to_string())),
            }
        }
        Ok(())
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

struct DestructiveMatcher {
    label: &'static str,
    needles: &'static [&'static str],
}

/// Fixed destructive-pattern categories for free-text console payloads.
/// Each matched category raises the tier by one level.
const DESTRUCTIVE_MATCHERS: &[DestructiveMatcher] = &[
    DestructiveMatcher {
        label: "process kill or shutdown",
        needles: &["stop", "shutdown", "kill", "halt"],
    },
    DestructiveMatcher {
        label: "data deletion or wipe",
        needles: &["rm -rf", "rm ", "delete", "format", "wipe"],
    },
    DestructiveMatcher {
        label: "player ban or whitelist removal",
        needles: &["ban ", "kick ", "whitelist remove"],
    },
    DestructiveMatcher {
        label: "permission escalation",
        needles: &["op ", "grant ", "promote "],
    },
];

pub struct RiskAssessor;

impl RiskAssessor {
    /// Computes the effective risk tier for a concrete request.
    /// Deterministic over its inputs, never performs I/O, and never
    /// returns a tier below the registry's static classification.
    pub fn assess(
        definition: &ActionDefinition,
        request: &ActionRequest,
        snapshot: ResourceSnapshot,
    ) -> RiskAssessment {
        let mut tier = definition.base_tier;
        let mut reasons = Vec::new();

        if let Some(parameter) = definition.payload_parameter
            && let Some(payload) = request.parameters.get(parameter)
        {
            let lowered = payload.to_ascii_lowercase();
            for matcher in DESTRUCTIVE_MATCHERS {
                if matcher
                    .needles
                    .iter()
                    .any(|needle| matches_at_word_start(&lowered, needle))
                {
                    tier = tier.bump();
                    reasons.push(format!("payload matches {}", matcher.label));
                }
            }
        }

        if definition.disruptive && snapshot.active_players > 0 {
            tier = tier.bump();
            reasons.push(format!(
                "{} active players would be disrupted",
                snapshot.active_players
            ));
        }

        RiskAssessment { tier, reasons }
    }
}

/// Substring match anchored to a word start, so "op " matches "op steve"
/// but not the tail of "stop".
fn matches_at_word_start(haystack: &str, needle: &str) -> bool {
    let mut from = 0;
    while let Some(found) = haystack[from..].find(needle) {
        let index = from + found;
        let boundary = index == 0
            || haystack[..index]
                .chars()
                .next_back()
                .is_some_and(|ch| !ch.is_alphanumeric());
        if boundary {
            return true;
        }
        from = index + 1;
    }
    false
}
