use thiserror::Error;

/// The closed set of error kinds a `call` can resolve to. Never propagated
/// by unwinding — always carried in a [`crate::engine::CallOutcome`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CyreError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("registration invalid: [{rule}] {field}: {message}")]
    RegistrationInvalid {
        field: String,
        rule: String,
        message: String,
    },

    #[error("pre-blocked: {reason}")]
    PreBlocked { reason: String },

    #[error("throttled, {remaining_ms}ms remaining")]
    Throttled { remaining_ms: u64 },

    #[error("debounced, scheduled to fire at {fires_at_ms}")]
    Debounced { fires_at_ms: i64 },

    #[error("schema invalid: {message}")]
    SchemaInvalid { message: String },

    #[error("required payload missing")]
    RequiredMissing,

    #[error("condition not met")]
    ConditionNotMet,

    #[error("payload unchanged")]
    Unchanged,

    #[error("handler error: {message}")]
    HandlerError { message: String },

    #[error("scheduler error: {message}")]
    SchedulerError { message: String },
}

impl CyreError {
    /// Stable string tag for this error kind, used in sensor metadata and
    /// anywhere callers want to match on error class without a `match`.
    pub fn kind(&self) -> &'static str {
        match self {
            CyreError::UnknownChannel(_) => "unknown-channel",
            CyreError::RegistrationInvalid { .. } => "registration-invalid",
            CyreError::PreBlocked { .. } => "pre-blocked",
            CyreError::Throttled { .. } => "throttled",
            CyreError::Debounced { .. } => "debounced",
            CyreError::SchemaInvalid { .. } => "schema-invalid",
            CyreError::RequiredMissing => "required-missing",
            CyreError::ConditionNotMet => "condition-not-met",
            CyreError::Unchanged => "unchanged",
            CyreError::HandlerError { .. } => "handler-error",
            CyreError::SchedulerError { .. } => "scheduler-error",
        }
    }
}

/// One violation surfaced while compiling a `ChannelConfig`. The compiler
/// collects every violation rather than stopping at the first.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationError {
    pub field: String,
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.rule, self.field, self.message)
    }
}

impl RegistrationError {
    pub fn new(field: impl Into<String>, rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            rule: rule.into(),
            message: message.into(),
        }
    }
}
