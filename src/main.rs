/**
 * Biometric Vault Server
 * Serves the confidential verification engine over HTTP
 *
 * Runs an in-process reference coprocessor and its decryption relay. An
 * external coprocessor can deliver results through /oracle/callback instead.
 */

use anyhow::Context;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use biometric_vault::api::{self, AppState};
use biometric_vault::{
    AttestationService, BiometricEngine, CoprocessorRelay, EngineBuilder, EngineConfig, LocalCoprocessor,
    ProofVerifier,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Biometric Vault Server");

    let config = EngineConfig::from_env().context("loading configuration")?;
    let attestation = match config.coprocessor_seed {
        Some(seed) => AttestationService::from_seed(&seed)?,
        None => AttestationService::generate()?,
    };
    info!("Recognized coprocessor key: {}", attestation.key_id());

    let coprocessor = Arc::new(LocalCoprocessor::new());
    let engine: Arc<BiometricEngine> = Arc::new(
        EngineBuilder::from_config(&config)
            .verifier(ProofVerifier::new().with_key(&attestation.public_key()))
            .build(coprocessor.clone())?,
    );
    let _relay = CoprocessorRelay::new(coprocessor, attestation).spawn(engine.clone());

    let app = api::router(AppState { engine });

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;

    info!("Biometric Vault Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.context("server failed")?;
    Ok(())
}
