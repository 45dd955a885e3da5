use abt_core::errors::{AbtError, ErrorInfo};
use abt_core::{ExperimentId, Goal, NewExperiment, PageId, Status};

fn sample_info(code: &str, message: &str) -> ErrorInfo {
    ErrorInfo::new(code, message)
        .with_context("experiment", 1)
        .with_context("reason", "example")
}

#[test]
fn invalid_transition_surface() {
    let err = AbtError::InvalidTransition(sample_info("invalid-transition", "pause from draft"));
    assert_eq!(err.info().code, "invalid-transition");
    assert!(err.info().context.contains_key("experiment"));
}

#[test]
fn not_active_surface() {
    let err = AbtError::not_active(ExperimentId::from_raw(7), Status::Paused);
    assert_eq!(err.info().code, "experiment-not-active");
    assert_eq!(err.info().context.get("status"), Some(&"paused".to_string()));
    assert_eq!(err.info().context.get("experiment"), Some(&"7".to_string()));
}

#[test]
fn duplicate_active_surface() {
    let err = AbtError::duplicate_active(PageId::from_raw(3), ExperimentId::from_raw(9));
    assert!(matches!(err, AbtError::DuplicateActiveExperiment(_)));
    assert_eq!(err.info().context.get("page"), Some(&"3".to_string()));
    assert!(err.info().hint.is_some());
}

#[test]
fn display_includes_code_and_context() {
    let err = AbtError::Storage(sample_info("store-open", "failed to open").with_hint("check path"));
    let rendered = err.to_string();
    assert!(rendered.starts_with("storage error: failed to open (code: store-open)"));
    assert!(rendered.contains("experiment=1, reason=example"));
    assert!(rendered.ends_with("| hint: check path"));
}

#[test]
fn error_serializes_with_family_tag() {
    let err = AbtError::experiment_not_found(ExperimentId::from_raw(4));
    let json = serde_json::to_value(&err).expect("serialize");
    assert_eq!(json["family"], "NotFound");
    assert_eq!(json["detail"]["code"], "experiment-not-found");
    let decoded: AbtError = serde_json::from_value(json).expect("deserialize");
    assert_eq!(decoded, err);
}

#[test]
fn oversized_sample_size_fails_validation() {
    let mut new = NewExperiment {
        name: "headline".into(),
        hypothesis: String::new(),
        goal: Goal {
            event: "visit-page".into(),
            page: None,
        },
        sample_size: u64::MAX,
        treatment_revision: None,
    };
    let err = new.validate().unwrap_err();
    assert!(matches!(err, AbtError::Validation(_)));
    assert_eq!(err.info().code, "sample-size-too-large");
    assert_eq!(
        err.info().context.get("sample_size"),
        Some(&u64::MAX.to_string())
    );

    new.sample_size = NewExperiment::MAX_SAMPLE_SIZE;
    assert!(new.validate().is_ok());
    new.sample_size += 1;
    assert!(new.validate().is_err());
}
