use std::time::Duration;

use retina_core::specialist::LocalSpecialist;
use retina_core::telemetry::init_tracing;
use retina_core::DiagnosticsConfig;
use retina_specialist::start_server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info,retina_specialist=debug");

    let config = DiagnosticsConfig::load();
    config.validate()?;

    // Loaded once; shared by every request
    let classifier = config.load_classifier()?;
    let specialist = LocalSpecialist::new(
        classifier,
        config.normalizer(),
        Duration::from_millis(config.classifier.inference_timeout_ms),
    );

    let addr = config.server_addr()?;
    start_server(addr, specialist, config.server.max_upload_bytes).await?;
    Ok(())
}
