use crate::error::RegistrationError;
use crate::types::{ChannelConfig, CompiledChannel, ProtectionStep, Repeat};

/// Validate a `ChannelConfig` and, if it passes, build its compiled pipeline.
/// Every violation is collected — the compiler never stops at the first
/// problem, returning the full set of rule violations in one pass.
pub fn compile(config: ChannelConfig) -> Result<CompiledChannel, Vec<RegistrationError>> {
    let errors = validate(&config);
    if !errors.is_empty() {
        return Err(errors);
    }
    Ok(assemble_pipeline(config))
}

/// R1-R6: field-level validation rules.
fn validate(config: &ChannelConfig) -> Vec<RegistrationError> {
    let mut errors = Vec::new();

    // R1: id must be non-empty.
    if config.id.trim().is_empty() {
        errors.push(RegistrationError::new("id", "R1", "id must be a non-empty string"));
    }

    // R2: numeric fields are already unsigned (u64) at the type level, so
    // "negative" is unrepresentable; nothing further to check here beyond
    // the type system itself (see DESIGN.md).

    // R3: repeat == 0 is accepted but marked pre-blocked at the pipeline
    // assembly stage below, not rejected here.

    // R4: priority — nothing to check; `Priority` is a closed Rust enum so
    // an invalid priority value cannot be constructed.

    // R5: schema/condition/selector/transform must be callable — guaranteed
    // by the `Arc<dyn Fn...>` type itself (unrepresentable otherwise).

    // R6: a fast-path channel (no protections) still requires a sane id.
    let _ = config;

    errors
}

fn assemble_pipeline(config: ChannelConfig) -> CompiledChannel {
    let mut pipeline = Vec::new();
    let mut pre_blocked = None;

    if config.block {
        pre_blocked = Some("block=true");
    } else if config.repeat.is_blocked_at_registration() {
        pre_blocked = Some("repeat=0");
    }

    if let Some(reason) = pre_blocked {
        pipeline.push(ProtectionStep::BlockGate { reason });
    }

    if config.throttle_ms > 0 {
        pipeline.push(ProtectionStep::Throttle { ms: config.throttle_ms });
    }
    if config.debounce_ms > 0 {
        pipeline.push(ProtectionStep::Debounce { ms: config.debounce_ms });
    }
    if let Some(schema) = &config.schema {
        pipeline.push(ProtectionStep::Schema(schema.clone()));
    }
    if config.required {
        pipeline.push(ProtectionStep::Required);
    }
    if let Some(condition) = &config.condition {
        pipeline.push(ProtectionStep::Condition(condition.clone()));
    }
    if let Some(selector) = &config.selector {
        pipeline.push(ProtectionStep::Selector(selector.clone()));
    }
    if let Some(transform) = &config.transform {
        pipeline.push(ProtectionStep::Transform(transform.clone()));
    }
    for mw in &config.middlewares {
        pipeline.push(ProtectionStep::Middleware(mw.clone()));
    }
    if config.detect_changes {
        pipeline.push(ProtectionStep::ChangeDetect);
    }

    let fast_path = pipeline.is_empty() && config.interval_ms == 0 && matches!(config.repeat, Repeat::Times(1));

    CompiledChannel {
        config,
        pipeline,
        fast_path,
        pre_blocked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Payload;
    use std::sync::Arc;

    #[test]
    fn test_empty_id_rejected() {
        let cfg = ChannelConfig::new("");
        let err = compile(cfg).unwrap_err();
        assert!(err.iter().any(|e| e.rule == "R1"));
    }

    #[test]
    fn test_fast_path_when_no_protections() {
        let compiled = compile(ChannelConfig::new("a")).unwrap();
        assert!(compiled.fast_path);
        assert!(compiled.pipeline.is_empty());
    }

    #[test]
    fn test_throttle_gives_non_fast_path_with_throttle_step() {
        let mut cfg = ChannelConfig::new("b");
        cfg.throttle_ms = 500;
        let compiled = compile(cfg).unwrap();
        assert!(!compiled.fast_path);
        assert!(matches!(compiled.pipeline[0], ProtectionStep::Throttle { ms: 500 }));
    }

    #[test]
    fn test_repeat_zero_is_pre_blocked_not_rejected() {
        let mut cfg = ChannelConfig::new("c");
        cfg.repeat = Repeat::Times(0);
        let compiled = compile(cfg).unwrap();
        assert_eq!(compiled.pre_blocked, Some("repeat=0"));
        assert!(matches!(compiled.pipeline[0], ProtectionStep::BlockGate { .. }));
    }

    #[test]
    fn test_block_flag_is_pre_blocked() {
        let mut cfg = ChannelConfig::new("d");
        cfg.block = true;
        let compiled = compile(cfg).unwrap();
        assert_eq!(compiled.pre_blocked, Some("block=true"));
    }

    #[test]
    fn test_pipeline_steps_assembled_in_fixed_order() {
        let mut cfg = ChannelConfig::new("e");
        cfg.throttle_ms = 10;
        cfg.debounce_ms = 10;
        cfg.schema = Some(Arc::new(|_: &Payload| Ok(())));
        cfg.required = true;
        cfg.condition = Some(Arc::new(|_: &Payload| true));
        cfg.selector = Some(Arc::new(|p: &Payload| p.clone()));
        cfg.transform = Some(Arc::new(|p: Payload| p));
        cfg.detect_changes = true;
        let compiled = compile(cfg).unwrap();
        let kinds: Vec<&str> = compiled
            .pipeline
            .iter()
            .map(|s| match s {
                ProtectionStep::BlockGate { .. } => "block",
                ProtectionStep::Throttle { .. } => "throttle",
                ProtectionStep::Debounce { .. } => "debounce",
                ProtectionStep::Schema(_) => "schema",
                ProtectionStep::Required => "required",
                ProtectionStep::Condition(_) => "condition",
                ProtectionStep::Selector(_) => "selector",
                ProtectionStep::Transform(_) => "transform",
                ProtectionStep::Middleware(_) => "middleware",
                ProtectionStep::ChangeDetect => "change-detect",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "throttle",
                "debounce",
                "schema",
                "required",
                "condition",
                "selector",
                "transform",
                "change-detect",
            ]
        );
    }
}
