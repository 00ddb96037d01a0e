use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use mockall::mock;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use retina_core::conversation::Role;
use retina_core::llm::{LlmCallError, ModelBackend, ModelRequest, ModelResponse};
use retina_core::orchestrator::{hybrid_report_prompt, HYBRID_REPORT_CLOSING, HYBRID_REPORT_OPENING};
use retina_core::specialist::HttpSpecialist;
use retina_core::tools::{default_registry, RETINA_TOOL_NAME};
use retina_core::{
    ClassificationResult, ContentBlock, DiagnosticRequest, ImageRef, LabelMapping, Orchestrator, OrchestratorOptions,
    PatientContext, ServiceError, SessionError, SessionState, Specialist, Turn,
};

mock! {
    pub Retina {}

    #[async_trait]
    impl Specialist for Retina {
        async fn analyze(&self, image: &ImageRef) -> Result<ClassificationResult, ServiceError>;
    }
}

mock! {
    pub Backend {}

    #[async_trait]
    impl ModelBackend for Backend {
        async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, LlmCallError>;
    }
}

/// Replays canned responses and records every request it receives
#[derive(Default)]
struct ScriptedBackend {
    script: Mutex<VecDeque<Result<ModelResponse, LlmCallError>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedBackend {
    fn new(responses: Vec<Value>) -> Arc<Self> {
        let script = responses
            .into_iter()
            .map(|v| Ok(ModelResponse::from_wire(v).unwrap()))
            .collect();
        Arc::new(Self {
            script: Mutex::new(script),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, LlmCallError> {
        self.requests.lock().unwrap().push(request.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmCallError::Decode("script exhausted".into())))
    }
}

fn tool_use(calls: &[(&str, &str, Value)], text: Option<&str>) -> Value {
    let mut content: Vec<Value> = text
        .map(|t| vec![json!({"type": "text", "text": t})])
        .unwrap_or_default();
    for (id, name, input) in calls {
        content.push(json!({"type": "tool_use", "id": id, "name": name, "input": input}));
    }
    json!({"id": "msg", "model": "test-model", "stop_reason": "tool_use", "content": content})
}

fn end_turn(text: &str) -> Value {
    json!({
        "id": "msg",
        "model": "test-model",
        "stop_reason": "end_turn",
        "content": [{"type": "text", "text": text}]
    })
}

fn retina_call(id: &str) -> (&str, &'static str, Value) {
    (id, RETINA_TOOL_NAME, json!({"motivo": "Analizar imagen del paciente"}))
}

fn png_bytes() -> Vec<u8> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb([120, 60, 30])))
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

fn request() -> DiagnosticRequest {
    DiagnosticRequest::new(
        ImageRef::bytes(png_bytes()),
        PatientContext::new([("glucosa_avg_14d", json!(185)), ("glucosa_picos", json!("frecuentes post-comida"))]),
    )
}

fn positive_at(confidence: f32) -> ClassificationResult {
    ClassificationResult::from_scores(vec![confidence, 1.0 - confidence], &LabelMapping::default()).unwrap()
}

fn orchestrator(backend: Arc<dyn ModelBackend>, specialist: Arc<dyn Specialist>, options: OrchestratorOptions) -> Orchestrator {
    let registry = default_registry(specialist, options.expose_patient_tool).unwrap();
    Orchestrator::new(backend, Arc::new(registry), options)
}

#[tokio::test]
async fn positive_finding_flows_through_two_rounds() {
    let mut specialist = MockRetina::new();
    specialist.expect_analyze().times(1).returning(|_| Ok(positive_at(0.93)));
    let backend = ScriptedBackend::new(vec![
        tool_use(&[retina_call("toolu_1")], None),
        end_turn("Resumen: retinopatía diabética probable."),
    ]);
    let orch = orchestrator(backend.clone(), Arc::new(specialist), OrchestratorOptions::default());

    let mut session = orch.start_session(request()).await.unwrap();
    let text = orch.execute(&mut session).await.unwrap();

    assert_eq!(text, "Resumen: retinopatía diabética probable.");
    assert_eq!(session.state(), &SessionState::Done);
    assert_eq!(session.tool_rounds(), 1);

    let requests = backend.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].max_tokens, 2048);
    assert_eq!(requests[1].max_tokens, 4096);
    assert_eq!(requests[0].tools[0].name, RETINA_TOOL_NAME);

    // Round 1: the multimodal user turn only
    assert_eq!(requests[0].messages.len(), 1);
    let Turn::User { content } = &requests[0].messages[0] else {
        panic!("first turn must be the user turn");
    };
    assert!(matches!(&content[0], ContentBlock::Image { media_type, .. } if media_type == "image/png"));
    let prompt = requests[0].messages[0].text();
    assert!(prompt.contains("glucosa_avg_14d: 185"));
    assert!(prompt.contains(RETINA_TOOL_NAME));

    // Round 2: user, assistant tool call, tool result
    let history = &requests[1].messages;
    assert_eq!(history.len(), 3);
    assert_eq!(
        history.iter().map(Turn::role).collect::<Vec<_>>(),
        vec![Role::User, Role::Assistant, Role::ToolResult]
    );
    let Turn::ToolResult { tool_call_id, content, is_error } = &history[2] else {
        panic!("third turn must be the tool result");
    };
    assert_eq!(tool_call_id, "toolu_1");
    assert!(!is_error);
    assert!(content.contains("\"status\": \"DR_DETECTADA\""), "{content}");
    assert!(content.contains("\"confianza\": 0.93"), "{content}");

    assert_eq!(session.conversation().len(), 4);
}

#[tokio::test]
async fn run_returns_report_with_transcript() {
    let mut specialist = MockRetina::new();
    specialist.expect_analyze().returning(|_| Ok(positive_at(0.2)));
    let backend = ScriptedBackend::new(vec![tool_use(&[retina_call("toolu_1")], None), end_turn("Sin DR.")]);
    let orch = orchestrator(backend, Arc::new(specialist), OrchestratorOptions::default());

    let report = orch.run(request()).await.unwrap();

    assert_eq!(report.text, "Sin DR.");
    assert_eq!(report.tool_rounds, 1);
    assert_eq!(report.tool_calls.len(), 1);
    assert_eq!(report.tool_calls[0].name, RETINA_TOOL_NAME);
    assert_eq!(report.conversation.len(), 4);
    assert!(report.session_id.starts_with("session_"));
    let wire = serde_json::to_value(&report).unwrap();
    assert_eq!(wire["conversation"]["turns"][2]["role"], "tool_result");
}

#[tokio::test]
async fn direct_answer_skips_the_tool() {
    let specialist = MockRetina::new();
    let backend = ScriptedBackend::new(vec![end_turn("No necesito la herramienta.")]);
    let orch = orchestrator(backend.clone(), Arc::new(specialist), OrchestratorOptions::default());

    let mut session = orch.start_session(request()).await.unwrap();
    let text = orch.execute(&mut session).await.unwrap();

    assert_eq!(text, "No necesito la herramienta.");
    assert_eq!(session.tool_rounds(), 0);
    assert_eq!(session.conversation().len(), 2);
    assert_eq!(backend.requests().len(), 1);
}

#[tokio::test]
async fn unregistered_tool_ends_in_error() {
    let specialist = MockRetina::new();
    let backend = ScriptedBackend::new(vec![tool_use(&[("toolu_1", "borrar_historial", json!({}))], None)]);
    let orch = orchestrator(backend.clone(), Arc::new(specialist), OrchestratorOptions::default());

    let mut session = orch.start_session(request()).await.unwrap();
    let err = orch.execute(&mut session).await.unwrap_err();

    assert_eq!(err, SessionError::UnknownTool("borrar_historial".into()));
    assert_eq!(session.state(), &SessionState::Error(err.clone()));
    assert_eq!(err.to_failure().kind, "UNKNOWN_TOOL");
    // User turn and the offending assistant turn; nothing from the dispatcher
    assert_eq!(session.conversation().len(), 2);
    assert_eq!(session.conversation().count(Role::ToolResult), 0);
    assert_eq!(backend.requests().len(), 1);
}

#[tokio::test]
async fn invalid_arguments_end_in_error() {
    let specialist = MockRetina::new();
    let backend = ScriptedBackend::new(vec![tool_use(&[("toolu_1", RETINA_TOOL_NAME, json!({}))], None)]);
    let orch = orchestrator(backend, Arc::new(specialist), OrchestratorOptions::default());

    let err = orch.run(request()).await.unwrap_err();

    assert!(matches!(err, SessionError::InvalidToolArguments { ref tool, .. } if tool == RETINA_TOOL_NAME));
    assert_eq!(err.kind(), "INVALID_TOOL_ARGUMENTS");
}

#[tokio::test]
async fn unreachable_specialist_still_reaches_done() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let specialist = HttpSpecialist::new(format!("http://{addr}/predict_retina"), Duration::from_secs(2), 0).unwrap();

    let backend = ScriptedBackend::new(vec![
        tool_use(&[retina_call("toolu_1")], None),
        end_turn("El especialista no respondió; recomiendo repetir el estudio."),
    ]);
    let orch = orchestrator(backend.clone(), Arc::new(specialist), OrchestratorOptions::default());

    let mut session = orch.start_session(request()).await.unwrap();
    orch.execute(&mut session).await.unwrap();

    assert_eq!(session.state(), &SessionState::Done);
    let history = &backend.requests()[1].messages;
    let Turn::ToolResult { content, is_error, .. } = &history[2] else {
        panic!("third turn must be the tool result");
    };
    assert!(*is_error);
    assert!(content.contains("UNREACHABLE"), "{content}");
}

#[tokio::test]
async fn only_first_recognized_call_is_dispatched() {
    let mut specialist = MockRetina::new();
    specialist.expect_analyze().times(1).returning(|_| Ok(positive_at(0.7)));
    let backend = ScriptedBackend::new(vec![
        tool_use(
            &[
                ("toolu_0", "desconocida", json!({})),
                retina_call("toolu_1"),
                retina_call("toolu_2"),
            ],
            Some("Consultando al especialista."),
        ),
        end_turn("Listo."),
    ]);
    let orch = orchestrator(backend.clone(), Arc::new(specialist), OrchestratorOptions::default());

    let mut session = orch.start_session(request()).await.unwrap();
    orch.execute(&mut session).await.unwrap();

    let history = &backend.requests()[1].messages;
    assert_eq!(history.len(), 3);
    assert!(matches!(&history[2], Turn::ToolResult { tool_call_id, .. } if tool_call_id == "toolu_1"));
    assert_eq!(session.tool_calls().len(), 1);
}

#[tokio::test]
async fn extra_rounds_are_allowed_when_configured() {
    let mut specialist = MockRetina::new();
    specialist.expect_analyze().times(2).returning(|_| Ok(positive_at(0.9)));
    let backend = ScriptedBackend::new(vec![
        tool_use(&[retina_call("toolu_1")], None),
        tool_use(&[retina_call("toolu_2")], None),
        end_turn("Confirmado en dos análisis."),
    ]);
    let options = OrchestratorOptions {
        max_tool_rounds: 2,
        ..OrchestratorOptions::default()
    };
    let orch = orchestrator(backend.clone(), Arc::new(specialist), options);

    let report = orch.run(request()).await.unwrap();

    assert_eq!(report.tool_rounds, 2);
    let requests = backend.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[2].messages.len(), 5);
}

#[tokio::test]
async fn tool_request_past_the_limit_without_text_fails() {
    let mut specialist = MockRetina::new();
    specialist.expect_analyze().times(1).returning(|_| Ok(positive_at(0.9)));
    let backend = ScriptedBackend::new(vec![
        tool_use(&[retina_call("toolu_1")], None),
        tool_use(&[retina_call("toolu_2")], None),
    ]);
    let orch = orchestrator(backend, Arc::new(specialist), OrchestratorOptions::default());

    let err = orch.run(request()).await.unwrap_err();

    assert_eq!(err, SessionError::RoundLimitExceeded(1));
    assert_eq!(err.kind(), "ROUND_LIMIT_EXCEEDED");
}

#[tokio::test]
async fn tool_request_past_the_limit_with_text_is_final() {
    let mut specialist = MockRetina::new();
    specialist.expect_analyze().times(1).returning(|_| Ok(positive_at(0.9)));
    let backend = ScriptedBackend::new(vec![
        tool_use(&[retina_call("toolu_1")], None),
        tool_use(&[retina_call("toolu_2")], Some("Informe con lo disponible.")),
    ]);
    let orch = orchestrator(backend, Arc::new(specialist), OrchestratorOptions::default());

    let report = orch.run(request()).await.unwrap();

    assert_eq!(report.text, "Informe con lo disponible.");
    assert_eq!(report.tool_rounds, 1);
}

#[tokio::test]
async fn empty_final_answer_is_a_protocol_violation() {
    let backend = ScriptedBackend::new(vec![end_turn("   ")]);
    let orch = orchestrator(backend, Arc::new(MockRetina::new()), OrchestratorOptions::default());

    let err = orch.run(request()).await.unwrap_err();

    assert!(matches!(err, SessionError::ProtocolViolation(_)));
}

#[tokio::test]
async fn llm_failure_ends_session_in_error() {
    let mut backend = MockBackend::new();
    backend
        .expect_send()
        .times(1)
        .returning(|_| Err(LlmCallError::Auth("invalid x-api-key".into())));
    let orch = orchestrator(Arc::new(backend), Arc::new(MockRetina::new()), OrchestratorOptions::default());

    let mut session = orch.start_session(request()).await.unwrap();
    let err = orch.execute(&mut session).await.unwrap_err();

    assert_eq!(err, SessionError::LlmCall(LlmCallError::Auth("invalid x-api-key".into())));
    assert_eq!(err.to_failure().kind, "LLM_CALL_FAILED");
    assert!(matches!(session.state(), SessionState::Error(SessionError::LlmCall(_))));
    assert_eq!(session.conversation().len(), 1);
}

#[tokio::test]
async fn llm_failure_after_tool_round_ends_session() {
    let mut specialist = MockRetina::new();
    specialist.expect_analyze().returning(|_| Ok(positive_at(0.9)));
    let mut backend = MockBackend::new();
    let mut seq = mockall::Sequence::new();
    let first = ModelResponse::from_wire(tool_use(&[retina_call("toolu_1")], None)).unwrap();
    backend
        .expect_send()
        .times(1)
        .in_sequence(&mut seq)
        .returning(move |_| Ok(first.clone()));
    backend
        .expect_send()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Err(LlmCallError::RateLimited("overloaded".into())));
    let orch = orchestrator(Arc::new(backend), Arc::new(specialist), OrchestratorOptions::default());

    let mut session = orch.start_session(request()).await.unwrap();
    let err = orch.execute(&mut session).await.unwrap_err();

    assert!(matches!(err, SessionError::LlmCall(LlmCallError::RateLimited(_))));
    // No partial report: the transcript ends on the tool result
    assert!(matches!(session.conversation().last(), Some(Turn::ToolResult { .. })));
}

struct StallingBackend;

#[async_trait]
impl ModelBackend for StallingBackend {
    async fn send(&self, _request: &ModelRequest) -> Result<ModelResponse, LlmCallError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(LlmCallError::Timeout)
    }
}

#[tokio::test]
async fn whole_session_timeout_is_enforced() {
    let options = OrchestratorOptions {
        session_timeout_ms: 50,
        ..OrchestratorOptions::default()
    };
    let orch = orchestrator(Arc::new(StallingBackend), Arc::new(MockRetina::new()), options);

    let mut session = orch.start_session(request()).await.unwrap();
    let err = orch.execute(&mut session).await.unwrap_err();

    assert_eq!(err, SessionError::Timeout(Duration::from_millis(50)));
    assert_eq!(err.kind(), "SESSION_TIMEOUT");
    assert!(matches!(session.state(), SessionState::Error(SessionError::Timeout(_))));
}

#[tokio::test]
async fn unusable_image_is_an_invalid_request() {
    let backend = ScriptedBackend::new(vec![]);
    let orch = orchestrator(backend.clone(), Arc::new(MockRetina::new()), OrchestratorOptions::default());

    let err = orch
        .run(DiagnosticRequest::new(ImageRef::bytes(b"not an image".to_vec()), PatientContext::default()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "INVALID_REQUEST");

    let err = orch
        .run(DiagnosticRequest::new(ImageRef::path("/nonexistent/fondo.jpg"), PatientContext::default()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "INVALID_REQUEST");
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn finished_session_cannot_be_driven_again() {
    let backend = ScriptedBackend::new(vec![end_turn("Listo.")]);
    let orch = orchestrator(backend.clone(), Arc::new(MockRetina::new()), OrchestratorOptions::default());

    let mut session = orch.start_session(request()).await.unwrap();
    orch.execute(&mut session).await.unwrap();
    let err = orch.execute(&mut session).await.unwrap_err();

    assert!(matches!(err, SessionError::InvalidRequest(_)));
    assert_eq!(session.state(), &SessionState::Done);
    assert_eq!(backend.requests().len(), 1);
}

struct AlwaysDone;

#[async_trait]
impl ModelBackend for AlwaysDone {
    async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, LlmCallError> {
        ModelResponse::from_wire(end_turn(&format!("{} turnos", request.messages.len())))
    }
}

#[tokio::test]
async fn sessions_run_concurrently_and_independently() {
    let orch = orchestrator(Arc::new(AlwaysDone), Arc::new(MockRetina::new()), OrchestratorOptions::default());

    let (a, b) = tokio::join!(orch.run(request()), orch.run(request()));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.session_id, b.session_id);
    assert_eq!(a.text, "1 turnos");
    assert_eq!(b.conversation.len(), 2);
}

#[test]
fn hybrid_prompt_combines_readings_and_finding() {
    let patient = PatientContext::new([("glucosa_avg_14d", json!(185)), ("smartwatch_hr_reposo", json!(88))]);
    let image = ImageRef::path("/datos/retina_001.jpg");

    let prompt = hybrid_report_prompt(&patient, &image, &Ok(positive_at(0.93)));

    assert!(prompt.contains("- glucosa_avg_14d: 185"), "{prompt}");
    assert!(prompt.contains("- smartwatch_hr_reposo: 88"), "{prompt}");
    assert!(prompt.contains("- Imagen: /datos/retina_001.jpg"), "{prompt}");
    assert!(prompt.contains("- Resultado: DR_DETECTADA"), "{prompt}");
    assert!(prompt.contains("- Confianza del modelo: 0.93"), "{prompt}");
    assert!(prompt.contains(&format!("Inicia con '{HYBRID_REPORT_OPENING}'")));
    assert!(prompt.trim_end().ends_with(&format!("Finaliza con '{HYBRID_REPORT_CLOSING}'.")));
}

#[test]
fn hybrid_prompt_falls_back_when_analysis_failed() {
    let prompt = hybrid_report_prompt(
        &PatientContext::default(),
        &ImageRef::bytes(png_bytes()),
        &Err(ServiceError::not_found("image not found")),
    );

    assert!(prompt.contains("- Resultado: Error"), "{prompt}");
    assert!(prompt.contains("- Confianza del modelo: 0.00"), "{prompt}");
    assert!(prompt.contains("- Imagen: (adjunta)"), "{prompt}");
}

#[tokio::test]
async fn hybrid_run_consults_specialist_before_the_model() {
    let backend = ScriptedBackend::new(vec![end_turn(
        "Reporte Híbrido del Paciente: retinopatía probable. Sugerencias de Próximos Pasos: oftalmología.",
    )]);
    let mut specialist = MockRetina::new();
    specialist.expect_analyze().times(1).returning(|_| Ok(positive_at(0.93)));
    let orch = orchestrator(backend.clone(), Arc::new(MockRetina::new()), OrchestratorOptions::default());

    let report = orch.run_hybrid(request(), &specialist).await.unwrap();

    assert!(report.text.starts_with("Reporte Híbrido del Paciente:"));
    assert_eq!(report.tool_rounds, 0);
    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    let opening = requests[0].messages[0].text();
    assert!(opening.contains("- Resultado: DR_DETECTADA"), "{opening}");
    assert!(opening.contains("- glucosa_avg_14d: 185"), "{opening}");
}
