use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use super::SessionError;
use crate::conversation::{Conversation, ToolCallRecord, Turn};
use crate::patient::PatientContext;
use crate::specialist::ImageRef;
use crate::tools::ToolContext;

/// Input to one diagnostic session
#[derive(Debug, Clone)]
pub struct DiagnosticRequest {
    pub image: ImageRef,
    pub patient: PatientContext,
}

impl DiagnosticRequest {
    pub fn new(image: ImageRef, patient: PatientContext) -> Self {
        Self { image, patient }
    }
}

/// Where a session is in the tool-use protocol.
///
/// `Init -> AwaitingModel(n) -> {ToolRequested(n) -> AwaitingModel(n+1)} -> Done`,
/// with `Error` reachable from every state. `Done` and `Error` are terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Init,
    AwaitingModel { round: usize },
    ToolRequested { round: usize, call: ToolCallRecord },
    Done,
    Error(SessionError),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Error(_))
    }
}

/// One in-flight session. Owned by a single task; nothing in it is shared.
#[derive(Debug)]
pub struct DiagnosticSession {
    id: String,
    state: SessionState,
    conversation: Conversation,
    context: ToolContext,
    tool_calls: Vec<ToolCallRecord>,
    tool_rounds: usize,
}

impl DiagnosticSession {
    pub(crate) fn new(request: DiagnosticRequest) -> Self {
        let id = new_session_id();
        Self {
            context: ToolContext {
                session_id: id.clone(),
                image: request.image,
                patient: request.patient,
            },
            id,
            state: SessionState::Init,
            conversation: Conversation::new(),
            tool_calls: Vec::new(),
            tool_rounds: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    /// Tool calls that were actually dispatched, in order
    pub fn tool_calls(&self) -> &[ToolCallRecord] {
        &self.tool_calls
    }

    pub fn tool_rounds(&self) -> usize {
        self.tool_rounds
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub(crate) fn append(&mut self, turn: Turn) {
        self.conversation.append(turn);
    }

    pub(crate) fn record_tool_round(&mut self, call: ToolCallRecord) {
        self.tool_calls.push(call);
        self.tool_rounds += 1;
    }

    /// Move to `Error` and hand the error back for propagation
    pub(crate) fn fail(&mut self, error: SessionError) -> SessionError {
        self.state = SessionState::Error(error.clone());
        error
    }

    pub(crate) fn into_report(self, text: String) -> DiagnosticReport {
        DiagnosticReport {
            session_id: self.id,
            text,
            tool_calls: self.tool_calls,
            tool_rounds: self.tool_rounds,
            conversation: self.conversation,
        }
    }
}

/// Final report of a completed session, with the full transcript for audit
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DiagnosticReport {
    pub session_id: String,
    pub text: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub tool_rounds: usize,
    pub conversation: Conversation,
}

static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

fn new_session_id() -> String {
    let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("session_{nanos:x}_{seq}")
}
