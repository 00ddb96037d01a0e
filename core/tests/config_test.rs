use std::path::PathBuf;

use serial_test::serial;

use retina_core::config::SpecialistMode;
use retina_core::imaging::Interpolation;
use retina_core::{DiagnosticsConfig, RetinaError};

const VARS: [&str; 11] = [
    "LLM_BASE_URL",
    "LLM_MODEL",
    "ANTHROPIC_API_KEY",
    "CLAUDE_API_KEY",
    "LLM_TIMEOUT_MS",
    "SPECIALIST_URL",
    "RETINA_MODEL_PATH",
    "RETINA_SERVER_ADDR",
    "RETINA_CONFIG",
    "RETINA_SESSION_TIMEOUT_MS",
    "SPECIALIST_TIMEOUT_MS",
];

fn clear_env() {
    for v in VARS {
        std::env::remove_var(v);
    }
}

#[test]
#[serial]
fn defaults_without_env() {
    clear_env();

    let cfg = DiagnosticsConfig::default();
    assert_eq!(cfg.specialist.mode, SpecialistMode::Local);
    assert_eq!(cfg.specialist.endpoint, "http://127.0.0.1:5000/predict_retina");
    assert_eq!(cfg.specialist.retries, 1);
    assert_eq!(cfg.classifier.class_names, vec!["DR", "No_DR"]);
    assert_eq!(cfg.classifier.input_size, 224);
    assert_eq!(cfg.classifier.interpolation, Interpolation::Nearest);
    assert_eq!(cfg.classifier.model_path, None);
    assert_eq!(cfg.server.addr, "0.0.0.0:5000");
    assert_eq!(cfg.orchestrator.max_tool_rounds, 1);
    assert_eq!(cfg.orchestrator.first_round_max_tokens, 2048);
    assert_eq!(cfg.orchestrator.followup_max_tokens, 4096);
    assert_eq!(cfg.orchestrator.model, cfg.llm.model);
    assert!(cfg.validate().is_ok());
    assert!(matches!(cfg.require_api_key(), Err(RetinaError::ConfigError(_))));
}

#[test]
#[serial]
fn env_selects_remote_specialist_and_model() {
    clear_env();
    std::env::set_var("SPECIALIST_URL", "http://specialist:5000/predict_retina");
    std::env::set_var("RETINA_MODEL_PATH", "/models/retina.onnx");
    std::env::set_var("LLM_MODEL", "claude-test");
    std::env::set_var("ANTHROPIC_API_KEY", "sk-env");

    let cfg = DiagnosticsConfig::default();
    assert_eq!(cfg.specialist.mode, SpecialistMode::Http);
    assert_eq!(cfg.specialist.endpoint, "http://specialist:5000/predict_retina");
    assert_eq!(cfg.classifier.model_path, Some(PathBuf::from("/models/retina.onnx")));
    assert_eq!(cfg.orchestrator.model, "claude-test");
    assert!(cfg.require_api_key().is_ok());

    clear_env();
}

#[test]
#[serial]
fn toml_overlays_defaults() {
    clear_env();

    let cfg = DiagnosticsConfig::from_toml_str(
        r#"
        [llm]
        model = "claude-overlay"
        api_key = "sk-toml"

        [specialist]
        mode = "http"
        endpoint = "http://10.0.0.5:5000/predict_retina"
        retries = 2

        [classifier]
        interpolation = "bilinear"
        input_size = 128

        [orchestrator]
        max_tool_rounds = 2
        expose_patient_tool = true
        per_tool_timeout_ms = 100000

        [server]
        addr = "127.0.0.1:8080"
        "#,
    )
    .unwrap();

    assert_eq!(cfg.llm.model, "claude-overlay");
    assert_eq!(cfg.orchestrator.model, "claude-overlay");
    assert_eq!(cfg.llm.api_key.as_deref(), Some("sk-toml"));
    assert_eq!(cfg.specialist.mode, SpecialistMode::Http);
    assert_eq!(cfg.specialist.retries, 2);
    assert_eq!(cfg.classifier.interpolation, Interpolation::Bilinear);
    assert_eq!(cfg.normalizer().size(), 128);
    assert_eq!(cfg.orchestrator.max_tool_rounds, 2);
    assert!(cfg.orchestrator.expose_patient_tool);
    assert_eq!(cfg.server_addr().unwrap().port(), 8080);
    // Untouched sections keep their defaults
    assert_eq!(cfg.orchestrator.followup_max_tokens, 4096);
}

#[test]
#[serial]
fn tool_timeout_leaves_room_for_specialist_retry() {
    clear_env();

    let cfg = DiagnosticsConfig::default();
    assert!(cfg.orchestrator.per_tool_timeout_ms > cfg.specialist.attempts_budget_ms());

    std::env::set_var("SPECIALIST_TIMEOUT_MS", "50000");
    let cfg = DiagnosticsConfig::default();
    assert_eq!(cfg.specialist.attempts_budget_ms(), 100_000);
    assert!(cfg.orchestrator.per_tool_timeout_ms > 100_000);
    clear_env();

    let err = DiagnosticsConfig::from_toml_str(
        "[specialist]\nmode = \"http\"\nrequest_timeout_ms = 30000\nretries = 1\n\n[orchestrator]\nper_tool_timeout_ms = 30000\n",
    )
    .unwrap_err();
    assert!(matches!(err, RetinaError::ConfigError(ref m) if m.contains("per_tool_timeout_ms")), "{err:?}");
}

#[test]
#[serial]
fn reversed_or_unknown_class_names_are_checked() {
    clear_env();

    let cfg = DiagnosticsConfig::from_toml_str("[classifier]\nclass_names = [\"No_DR\", \"DR\"]\n").unwrap();
    let mapping = cfg.label_mapping().unwrap();
    assert_eq!(mapping.class_names().collect::<Vec<_>>(), vec!["No_DR", "DR"]);

    let err = DiagnosticsConfig::from_toml_str("[classifier]\nclass_names = [\"DR\", \"catarata\"]\n").unwrap_err();
    assert!(matches!(err, RetinaError::ConfigError(_)));
}

#[test]
#[serial]
fn malformed_toml_is_a_config_error() {
    clear_env();
    let err = DiagnosticsConfig::from_toml_str("[orchestrator\nmax_tool_rounds = ").unwrap_err();
    assert!(matches!(err, RetinaError::ConfigError(_)));
}

#[test]
#[serial]
fn load_reads_file_named_by_env() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("retina.toml");
    std::fs::write(&path, "[orchestrator]\nsession_timeout_ms = 1234\n").unwrap();
    std::env::set_var("RETINA_CONFIG", &path);

    let cfg = DiagnosticsConfig::load();
    assert_eq!(cfg.orchestrator.session_timeout_ms, 1234);

    clear_env();
}

#[tokio::test]
#[serial]
async fn local_mode_without_model_builds_unloaded_specialist() {
    clear_env();
    let cfg = DiagnosticsConfig::default();

    let classifier = cfg.load_classifier().unwrap();
    assert!(!classifier.is_loaded());

    let specialist = cfg.build_specialist().unwrap();
    let err = specialist
        .analyze(&retina_core::ImageRef::bytes(vec![0u8; 4]))
        .await
        .unwrap_err();
    assert_eq!(err.kind, retina_core::ServiceErrorKind::ModelUnavailable);
}
