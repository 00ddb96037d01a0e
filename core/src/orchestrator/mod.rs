//! Tool-use orchestration loop.
//!
//! Drives one diagnostic session through the remote model:
//! - round 1 sends the image and patient context with the tool definitions
//! - a `tool_use` stop dispatches the first recognized call and appends its result
//! - any other stop ends the session with the model's text as the report
//!
//! Specialist failures reach the model as tool-result content. Everything
//! that breaks the protocol itself ends the session in `SessionState::Error`.

mod error;
mod prompt;
mod session;

pub use error::{SessionError, SessionFailure};
pub use prompt::{hybrid_report_prompt, DEFAULT_SYSTEM_PROMPT, HYBRID_REPORT_CLOSING, HYBRID_REPORT_OPENING};
pub use session::{DiagnosticReport, DiagnosticRequest, DiagnosticSession, SessionState};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::conversation::{ContentBlock, ToolCallRecord, Turn};
use crate::llm::{ModelBackend, ModelRequest, StopReason};
use crate::specialist::Specialist;
use crate::tools::{ToolDispatcher, ToolRegistry, RETINA_TOOL_NAME};

/// Knobs for the orchestration loop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorOptions {
    pub model: String,
    pub system_prompt: String,
    /// `max_tokens` for the first round
    pub first_round_max_tokens: u32,
    /// `max_tokens` once tool results are in the history
    pub followup_max_tokens: u32,
    pub max_tool_rounds: usize,
    pub per_tool_timeout_ms: u64,
    pub session_timeout_ms: u64,
    pub expose_patient_tool: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            model: "claude-3-5-sonnet-20240620".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            first_round_max_tokens: 2048,
            followup_max_tokens: 4096,
            max_tool_rounds: 1,
            per_tool_timeout_ms: 65_000,
            session_timeout_ms: 180_000,
            expose_patient_tool: false,
        }
    }
}

/// Runs diagnostic sessions against a model backend and a closed tool registry.
///
/// Holds only shared read-only state, so one orchestrator can drive many
/// sessions concurrently.
#[derive(Clone)]
pub struct Orchestrator {
    backend: Arc<dyn ModelBackend>,
    dispatcher: ToolDispatcher,
    options: OrchestratorOptions,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn ModelBackend>, registry: Arc<ToolRegistry>, options: OrchestratorOptions) -> Self {
        let dispatcher = ToolDispatcher::new(registry, Duration::from_millis(options.per_tool_timeout_ms));
        Self {
            backend,
            dispatcher,
            options,
        }
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        self.dispatcher.registry()
    }

    /// Build a session in `Init` holding the opening USER turn
    pub async fn start_session(&self, request: DiagnosticRequest) -> Result<DiagnosticSession, SessionError> {
        let bytes = request
            .image
            .read()
            .await
            .map_err(|e| SessionError::InvalidRequest(e.to_string()))?;

        let registry = self.registry();
        let specialist_tool = if registry.contains(RETINA_TOOL_NAME) {
            Some(RETINA_TOOL_NAME.to_string())
        } else {
            registry.definitions().first().map(|d| d.name.clone())
        };
        let opening = prompt::initial_user_turn(&bytes, &request.patient, specialist_tool.as_deref())?;

        let mut session = DiagnosticSession::new(request);
        session.append(opening);
        debug!(
            target: "orchestrator",
            session = %session.id(),
            image_bytes = bytes.len(),
            patient_fields = session.context().patient.len(),
            "Session initialized"
        );
        Ok(session)
    }

    /// Start and drive a session to completion
    #[tracing::instrument(name = "orchestrator.run", skip(self, request))]
    pub async fn run(&self, request: DiagnosticRequest) -> Result<DiagnosticReport, SessionError> {
        let mut session = self.start_session(request).await?;
        let text = self.execute(&mut session).await?;
        Ok(session.into_report(text))
    }

    /// Consult `specialist` up front, then ask the model for a hybrid report
    /// built from the patient readings and that result. A failed analysis is
    /// still reported, as `Error` with zero confidence.
    #[tracing::instrument(name = "orchestrator.run_hybrid", skip(self, request, specialist))]
    pub async fn run_hybrid(
        &self,
        request: DiagnosticRequest,
        specialist: &dyn Specialist,
    ) -> Result<DiagnosticReport, SessionError> {
        let analysis = specialist.analyze(&request.image).await;
        if let Err(e) = &analysis {
            warn!(target: "orchestrator", kind = %e.kind, error = %e.message, "Specialist failed before hybrid report");
        }
        let text = prompt::hybrid_report_prompt(&request.patient, &request.image, &analysis);

        let mut session = DiagnosticSession::new(request);
        session.append(Turn::User {
            content: vec![ContentBlock::text(text)],
        });
        debug!(target: "orchestrator", session = %session.id(), "Hybrid session initialized");

        let text = self.execute(&mut session).await?;
        Ok(session.into_report(text))
    }

    /// Drive `session` under the whole-session timeout.
    ///
    /// On failure the session is left in `Error` with its transcript intact.
    #[tracing::instrument(name = "orchestrator.execute", skip(self, session), fields(session = %session.id()))]
    pub async fn execute(&self, session: &mut DiagnosticSession) -> Result<String, SessionError> {
        let limit = Duration::from_millis(self.options.session_timeout_ms);
        let outcome = tokio::time::timeout(limit, self.drive(session)).await;
        match outcome {
            Ok(Ok(text)) => {
                info!(
                    target: "orchestrator",
                    session = %session.id(),
                    tool_rounds = session.tool_rounds(),
                    turns = session.conversation().len(),
                    "Session done"
                );
                Ok(text)
            }
            Ok(Err(e)) => {
                warn!(target: "orchestrator", session = %session.id(), kind = e.kind(), error = %e, "Session failed");
                Err(e)
            }
            Err(_) => {
                warn!(target: "orchestrator", session = %session.id(), timeout_ms = self.options.session_timeout_ms, "Session timed out");
                Err(session.fail(SessionError::Timeout(limit)))
            }
        }
    }

    async fn drive(&self, session: &mut DiagnosticSession) -> Result<String, SessionError> {
        if session.state().is_terminal() {
            return Err(SessionError::InvalidRequest(format!(
                "session {} already finished",
                session.id()
            )));
        }
        let tools = self.registry().definitions();
        let mut round = 1;

        loop {
            session.set_state(SessionState::AwaitingModel { round });
            let request = ModelRequest {
                model: self.options.model.clone(),
                max_tokens: if round == 1 {
                    self.options.first_round_max_tokens
                } else {
                    self.options.followup_max_tokens
                },
                system: self.options.system_prompt.clone(),
                tools: tools.clone(),
                messages: session.conversation().history().to_vec(),
            };

            debug!(
                target: "orchestrator",
                session = %session.id(),
                round,
                messages = request.messages.len(),
                "Calling model"
            );
            let response = match self.backend.send(&request).await {
                Ok(r) => r,
                Err(e) => return Err(session.fail(SessionError::LlmCall(e))),
            };

            let text = response.text();
            let calls = response.tool_calls();
            session.append(Turn::Assistant {
                content: response.content,
            });

            if response.stop_reason != StopReason::ToolUse {
                if text.trim().is_empty() {
                    return Err(session.fail(SessionError::ProtocolViolation(format!(
                        "model stopped with '{}' and no text",
                        response.stop_reason.as_str()
                    ))));
                }
                session.set_state(SessionState::Done);
                return Ok(text);
            }

            if session.tool_rounds() >= self.options.max_tool_rounds {
                if text.trim().is_empty() {
                    return Err(session.fail(SessionError::RoundLimitExceeded(self.options.max_tool_rounds)));
                }
                info!(
                    target: "orchestrator",
                    session = %session.id(),
                    "Tool round limit reached; using the reply text as the report"
                );
                session.set_state(SessionState::Done);
                return Ok(text);
            }

            let call = match self.select_call(&calls) {
                Ok(call) => call,
                Err(e) => return Err(session.fail(e)),
            };

            session.set_state(SessionState::ToolRequested {
                round,
                call: call.clone(),
            });
            let result = match self.dispatcher.dispatch(&call, session.context()).await {
                Ok(turn) => turn,
                Err(e) => return Err(session.fail(e.into())),
            };
            session.append(result);
            session.record_tool_round(call);
            round += 1;
        }
    }

    /// First call naming a registered tool; the rest are dropped
    fn select_call(&self, calls: &[ToolCallRecord]) -> Result<ToolCallRecord, SessionError> {
        let first = calls.first().ok_or_else(|| {
            SessionError::ProtocolViolation("stop_reason is tool_use but the reply holds no tool call".into())
        })?;

        let registry = self.registry();
        let Some(selected) = calls.iter().find(|c| registry.contains(&c.name)) else {
            return Err(SessionError::UnknownTool(first.name.clone()));
        };
        for dropped in calls.iter().filter(|c| c.id != selected.id) {
            warn!(
                target: "orchestrator",
                tool = %dropped.name,
                id = %dropped.id,
                "Dropping extra tool call; one call is honored per turn"
            );
        }
        Ok(selected.clone())
    }
}
