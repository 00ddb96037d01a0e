use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classifier::{LabelMapping, SpecialistClassifier, NEGATIVE_CLASS, POSITIVE_CLASS};
use crate::imaging::{ImageNormalizer, Interpolation, DEFAULT_INPUT_SIZE};
use crate::llm::LlmClientConfig;
use crate::orchestrator::OrchestratorOptions;
use crate::specialist::{HttpSpecialist, LocalSpecialist, Specialist};
use crate::{RetinaError, Result};

/// Top-level configuration shared by the server and the command-line session
#[derive(Clone, Debug, PartialEq)]
pub struct DiagnosticsConfig {
    pub llm: LlmClientConfig,
    pub specialist: SpecialistConfig,
    pub classifier: ClassifierConfig,
    pub orchestrator: OrchestratorOptions,
    pub server: ServerConfig,
}

/// Where the orchestrator's specialist lives
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecialistMode {
    /// Classifier loaded in this process
    #[default]
    Local,
    /// `POST /predict_retina` on a remote service
    Http,
}

/// Slack between the last specialist attempt and the tool timeout
const TOOL_TIMEOUT_MARGIN_MS: u64 = 5_000;

#[derive(Clone, Debug, PartialEq)]
pub struct SpecialistConfig {
    pub mode: SpecialistMode,
    pub endpoint: String,
    pub request_timeout_ms: u64,
    /// Extra attempts on `UNREACHABLE`
    pub retries: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClassifierConfig {
    pub model_path: Option<PathBuf>,
    /// Class names in model output order
    pub class_names: Vec<String>,
    pub input_size: u32,
    pub interpolation: Interpolation,
    pub inference_timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    pub addr: String,
    pub max_upload_bytes: usize,
}

impl Default for SpecialistConfig {
    fn default() -> Self {
        let endpoint = std::env::var("SPECIALIST_URL")
            .ok()
            .filter(|s| !s.is_empty());
        Self {
            mode: if endpoint.is_some() {
                SpecialistMode::Http
            } else {
                SpecialistMode::Local
            },
            endpoint: endpoint.unwrap_or_else(|| "http://127.0.0.1:5000/predict_retina".to_string()),
            request_timeout_ms: std::env::var("SPECIALIST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30_000),
            retries: 1,
        }
    }
}

impl SpecialistConfig {
    /// Worst-case wall time of one `analyze` call including retries
    pub fn attempts_budget_ms(&self) -> u64 {
        self.request_timeout_ms.saturating_mul(u64::from(self.retries) + 1)
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model_path: std::env::var("RETINA_MODEL_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            class_names: vec![POSITIVE_CLASS.to_string(), NEGATIVE_CLASS.to_string()],
            input_size: DEFAULT_INPUT_SIZE,
            interpolation: Interpolation::default(),
            inference_timeout_ms: std::env::var("RETINA_INFERENCE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(20_000),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: std::env::var("RETINA_SERVER_ADDR")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "0.0.0.0:5000".to_string()),
            max_upload_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        let llm = LlmClientConfig::default();
        let mut orchestrator = OrchestratorOptions {
            model: llm.model.clone(),
            ..OrchestratorOptions::default()
        };
        if let Some(v) = std::env::var("RETINA_SESSION_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            orchestrator.session_timeout_ms = v;
        }
        let specialist = SpecialistConfig::default();
        orchestrator.per_tool_timeout_ms = orchestrator
            .per_tool_timeout_ms
            .max(specialist.attempts_budget_ms() + TOOL_TIMEOUT_MARGIN_MS);
        Self {
            llm,
            specialist,
            classifier: ClassifierConfig::default(),
            orchestrator,
            server: ServerConfig::default(),
        }
    }
}

impl DiagnosticsConfig {
    /// Load configuration from a TOML file (path via RETINA_CONFIG or ./retina.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let path = std::env::var("RETINA_CONFIG").unwrap_or_else(|_| "retina.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target: "config", path = %path, "No TOML config found; using defaults/env");
            return Self::default();
        }
        match Self::from_file(p) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(target: "config", path = %path, error = %e, "Failed to load TOML; using defaults");
                Self::default()
            }
        }
    }

    /// Read and overlay an explicit TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let t: DiagnosticsToml =
            toml::from_str(s).map_err(|e| RetinaError::ConfigError(format!("invalid TOML: {e}")))?;
        let cfg = t.overlay(Self::default());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.label_mapping()?;
        if self.orchestrator.first_round_max_tokens == 0 || self.orchestrator.followup_max_tokens == 0 {
            return Err(RetinaError::ConfigError("max_tokens must be positive".into()));
        }
        if self.specialist.mode == SpecialistMode::Http {
            if self.specialist.endpoint.is_empty() {
                return Err(RetinaError::ConfigError(
                    "specialist.endpoint is required in http mode".into(),
                ));
            }
            // Every specialist attempt has to fit inside the tool timeout
            let budget = self.specialist.attempts_budget_ms();
            if self.orchestrator.per_tool_timeout_ms <= budget {
                return Err(RetinaError::ConfigError(format!(
                    "orchestrator.per_tool_timeout_ms ({}) must exceed (retries + 1) x specialist.request_timeout_ms ({budget})",
                    self.orchestrator.per_tool_timeout_ms
                )));
            }
        }
        Ok(())
    }

    /// The LLM needs a key before a session can start
    pub fn require_api_key(&self) -> Result<()> {
        match &self.llm.api_key {
            Some(k) if !k.is_empty() => Ok(()),
            _ => Err(RetinaError::ConfigError(
                "no API key: set ANTHROPIC_API_KEY or llm.api_key".into(),
            )),
        }
    }

    pub fn server_addr(&self) -> Result<SocketAddr> {
        self.server
            .addr
            .parse()
            .map_err(|e| RetinaError::ConfigError(format!("invalid server.addr '{}': {e}", self.server.addr)))
    }

    pub fn label_mapping(&self) -> Result<LabelMapping> {
        LabelMapping::from_class_names(&self.classifier.class_names).map_err(|e| RetinaError::ConfigError(e.to_string()))
    }

    pub fn normalizer(&self) -> ImageNormalizer {
        ImageNormalizer::new(self.classifier.input_size, self.classifier.interpolation)
    }

    /// Load the model once. Failures leave the classifier unloaded so the
    /// service keeps answering with `MODEL_UNAVAILABLE`.
    pub fn load_classifier(&self) -> Result<Arc<SpecialistClassifier>> {
        let mapping = self.label_mapping()?;
        let Some(path) = &self.classifier.model_path else {
            tracing::warn!(target: "classifier", "No model path configured; classifier is unloaded");
            return Ok(Arc::new(SpecialistClassifier::unloaded(mapping)));
        };
        Ok(Arc::new(load_model(path, mapping)))
    }

    /// Specialist facade selected by `specialist.mode`
    pub fn build_specialist(&self) -> Result<Arc<dyn Specialist>> {
        match self.specialist.mode {
            SpecialistMode::Local => {
                let local = LocalSpecialist::new(
                    self.load_classifier()?,
                    self.normalizer(),
                    Duration::from_millis(self.classifier.inference_timeout_ms),
                );
                Ok(Arc::new(local))
            }
            SpecialistMode::Http => {
                let http = HttpSpecialist::new(
                    self.specialist.endpoint.clone(),
                    Duration::from_millis(self.specialist.request_timeout_ms),
                    self.specialist.retries,
                )
                .map_err(|e| RetinaError::ConfigError(e.to_string()))?
                .with_mapping(self.label_mapping()?);
                Ok(Arc::new(http))
            }
        }
    }
}

#[cfg(feature = "onnx")]
fn load_model(path: &Path, mapping: LabelMapping) -> SpecialistClassifier {
    match SpecialistClassifier::load_onnx(path, mapping.clone()) {
        Ok(c) => {
            tracing::info!(target: "classifier", path = %path.display(), "Model loaded");
            c
        }
        Err(e) => {
            tracing::error!(target: "classifier", path = %path.display(), error = %e, "Failed to load model");
            SpecialistClassifier::unloaded(mapping)
        }
    }
}

#[cfg(not(feature = "onnx"))]
fn load_model(path: &Path, mapping: LabelMapping) -> SpecialistClassifier {
    tracing::warn!(
        target: "classifier",
        path = %path.display(),
        "Built without the `onnx` feature; classifier is unloaded"
    );
    SpecialistClassifier::unloaded(mapping)
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, Deserialize)]
struct DiagnosticsToml {
    pub llm: Option<LlmToml>,
    pub specialist: Option<SpecialistToml>,
    pub classifier: Option<ClassifierToml>,
    pub orchestrator: Option<OrchestratorToml>,
    pub server: Option<ServerToml>,
}

impl DiagnosticsToml {
    fn overlay(self, mut base: DiagnosticsConfig) -> DiagnosticsConfig {
        if let Some(l) = self.llm {
            l.apply(&mut base.llm);
            // The session model follows the client model unless set explicitly
            base.orchestrator.model = base.llm.model.clone();
        }
        if let Some(s) = self.specialist {
            s.apply(&mut base.specialist);
        }
        if let Some(c) = self.classifier {
            c.apply(&mut base.classifier);
        }
        if let Some(o) = self.orchestrator {
            o.apply(&mut base.orchestrator);
        }
        if let Some(s) = self.server {
            s.apply(&mut base.server);
        }
        base
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LlmToml {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub api_version: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
}
impl LlmToml {
    fn apply(self, l: &mut LlmClientConfig) {
        if let Some(x) = self.base_url {
            l.base_url = x;
        }
        if let Some(x) = self.model {
            l.model = x;
        }
        if let Some(x) = self.api_key.filter(|k| !k.is_empty()) {
            l.api_key = Some(x);
        }
        if let Some(x) = self.api_version {
            l.api_version = x;
        }
        if let Some(x) = self.request_timeout_ms {
            l.request_timeout_ms = x;
        }
        if let Some(x) = self.max_retries {
            l.max_retries = x;
        }
        if let Some(x) = self.retry_backoff_ms {
            l.retry_backoff_ms = x;
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SpecialistToml {
    pub mode: Option<SpecialistMode>,
    pub endpoint: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub retries: Option<u32>,
}
impl SpecialistToml {
    fn apply(self, s: &mut SpecialistConfig) {
        if let Some(x) = self.mode {
            s.mode = x;
        }
        if let Some(x) = self.endpoint {
            s.endpoint = x;
        }
        if let Some(x) = self.request_timeout_ms {
            s.request_timeout_ms = x;
        }
        if let Some(x) = self.retries {
            s.retries = x;
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ClassifierToml {
    pub model_path: Option<PathBuf>,
    pub class_names: Option<Vec<String>>,
    pub input_size: Option<u32>,
    pub interpolation: Option<Interpolation>,
    pub inference_timeout_ms: Option<u64>,
}
impl ClassifierToml {
    fn apply(self, c: &mut ClassifierConfig) {
        if let Some(x) = self.model_path {
            c.model_path = Some(x);
        }
        if let Some(x) = self.class_names {
            c.class_names = x;
        }
        if let Some(x) = self.input_size {
            c.input_size = x.max(1);
        }
        if let Some(x) = self.interpolation {
            c.interpolation = x;
        }
        if let Some(x) = self.inference_timeout_ms {
            c.inference_timeout_ms = x;
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OrchestratorToml {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub first_round_max_tokens: Option<u32>,
    pub followup_max_tokens: Option<u32>,
    pub max_tool_rounds: Option<usize>,
    pub per_tool_timeout_ms: Option<u64>,
    pub session_timeout_ms: Option<u64>,
    pub expose_patient_tool: Option<bool>,
}
impl OrchestratorToml {
    fn apply(self, o: &mut OrchestratorOptions) {
        if let Some(x) = self.model {
            o.model = x;
        }
        if let Some(x) = self.system_prompt {
            o.system_prompt = x;
        }
        if let Some(x) = self.first_round_max_tokens {
            o.first_round_max_tokens = x;
        }
        if let Some(x) = self.followup_max_tokens {
            o.followup_max_tokens = x;
        }
        if let Some(x) = self.max_tool_rounds {
            o.max_tool_rounds = x;
        }
        if let Some(x) = self.per_tool_timeout_ms {
            o.per_tool_timeout_ms = x;
        }
        if let Some(x) = self.session_timeout_ms {
            o.session_timeout_ms = x;
        }
        if let Some(x) = self.expose_patient_tool {
            o.expose_patient_tool = x;
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ServerToml {
    pub addr: Option<String>,
    pub max_upload_bytes: Option<usize>,
}
impl ServerToml {
    fn apply(self, s: &mut ServerConfig) {
        if let Some(x) = self.addr {
            s.addr = x;
        }
        if let Some(x) = self.max_upload_bytes {
            s.max_upload_bytes = x;
        }
    }
}
