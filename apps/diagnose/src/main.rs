use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use retina_core::config::SpecialistMode;
use retina_core::llm::LlmClient;
use retina_core::telemetry::init_tracing;
use retina_core::tools::default_registry;
use retina_core::{DiagnosticRequest, DiagnosticsConfig, ImageRef, Orchestrator, PatientContext, RetinaError};

#[derive(Parser)]
#[command(author, version, about = "Run one retina diagnostic session")]
struct Cli {
    /// Retina fundus image (JPEG or PNG)
    #[arg(long)]
    image: PathBuf,
    /// Patient readings, JSON or TOML
    #[arg(long)]
    patient: Option<PathBuf>,
    /// Config file; defaults to RETINA_CONFIG or ./retina.toml
    #[arg(long)]
    config: Option<PathBuf>,
    /// Use a remote specialist at this URL instead of the configured one
    #[arg(long)]
    specialist_url: Option<String>,
    /// Analyze the image first and ask for a hybrid report, instead of
    /// letting the model call the specialist tool
    #[arg(long)]
    hybrid: bool,
    /// Print the full report, transcript included, as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing("info,retina_core=info,retina_diagnose=info");
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let failure = match &e {
                RetinaError::SessionError(s) => s.to_failure(),
                other => retina_core::SessionFailure {
                    kind: "INVALID_REQUEST".to_string(),
                    message: other.to_string(),
                },
            };
            error!(target: "retina_diagnose", kind = %failure.kind, error = %failure.message, "Diagnosis failed");
            match serde_json::to_string_pretty(&failure) {
                Ok(s) => eprintln!("{s}"),
                Err(_) => eprintln!("{}: {}", failure.kind, failure.message),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> retina_core::Result<()> {
    let mut config = match &cli.config {
        Some(path) => DiagnosticsConfig::from_file(path)?,
        None => DiagnosticsConfig::load(),
    };
    if let Some(url) = cli.specialist_url {
        config.specialist.mode = SpecialistMode::Http;
        config.specialist.endpoint = url;
    }
    config.validate()?;
    config.require_api_key()?;

    let patient = match &cli.patient {
        Some(path) => PatientContext::from_file(path)?,
        None => PatientContext::default(),
    };

    let specialist = config.build_specialist()?;
    let registry = default_registry(specialist.clone(), config.orchestrator.expose_patient_tool)?;
    let backend = LlmClient::new(config.llm.clone()).map_err(|e| RetinaError::ConfigError(e.to_string()))?;
    let orchestrator = Orchestrator::new(Arc::new(backend), Arc::new(registry), config.orchestrator.clone());

    info!(
        target: "retina_diagnose",
        image = %cli.image.display(),
        specialist = ?config.specialist.mode,
        model = %config.orchestrator.model,
        hybrid = cli.hybrid,
        "Starting diagnostic session"
    );
    let request = DiagnosticRequest::new(ImageRef::path(cli.image.clone()), patient);
    let report = if cli.hybrid {
        orchestrator.run_hybrid(request, specialist.as_ref()).await?
    } else {
        orchestrator.run(request).await?
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.text);
    }
    Ok(())
}
