/**
 * Coprocessor Relay
 * Drains outbound decryption requests, decrypts, attests and calls back into the engine
 */

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::attestation::AttestationService;
use crate::coprocessor::DecryptionService;
use crate::engine::BiometricEngine;
use crate::error::Result;
use crate::oracle::{DecryptionCompletion, DecryptionRequestMessage};

pub struct CoprocessorRelay {
    decryptor: Arc<dyn DecryptionService>,
    attestation: AttestationService,
}

impl CoprocessorRelay {
    pub fn new(decryptor: Arc<dyn DecryptionService>, attestation: AttestationService) -> Self {
        Self {
            decryptor,
            attestation,
        }
    }

    /// Connects to `engine` and serves requests until the engine drops its sender.
    pub fn spawn(self, engine: Arc<BiometricEngine>) -> JoinHandle<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        engine.connect_oracle(tx);

        // Anything queued before the relay attached.
        let backlog = engine.pending_requests();
        tokio::spawn(self.run(engine, backlog, rx))
    }

    /// Decrypts and attests one request.
    pub fn complete(&self, request: &DecryptionRequestMessage) -> Result<DecryptionCompletion> {
        let mut plaintext_result = true;
        for ct in &request.ciphertexts {
            plaintext_result &= self.decryptor.decrypt(ct)? != 0;
        }
        Ok(DecryptionCompletion {
            request_id: request.request_id,
            plaintext_result,
            proof: self
                .attestation
                .attest(request.request_id, &request.ciphertexts, plaintext_result),
        })
    }

    async fn run(
        self,
        engine: Arc<BiometricEngine>,
        backlog: Vec<DecryptionRequestMessage>,
        mut rx: mpsc::UnboundedReceiver<DecryptionRequestMessage>,
    ) {
        info!("Coprocessor relay started with key {}", self.attestation.key_id());
        let relay = Arc::new(self);
        for request in backlog {
            Self::dispatch(relay.clone(), engine.clone(), request).await;
        }
        while let Some(request) = rx.recv().await {
            Self::dispatch(relay.clone(), engine.clone(), request).await;
        }
        info!("Coprocessor relay stopped");
    }

    /// Decryption and the engine callback both block, so they run on the blocking pool.
    async fn dispatch(relay: Arc<Self>, engine: Arc<BiometricEngine>, request: DecryptionRequestMessage) {
        let request_id = request.request_id;
        if let Err(e) = tokio::task::spawn_blocking(move || relay.handle(&engine, &request)).await {
            warn!("Relay task for request {} failed: {}", request_id, e);
        }
    }

    fn handle(&self, engine: &BiometricEngine, request: &DecryptionRequestMessage) {
        let outcome = self
            .complete(request)
            .and_then(|completion| engine.on_decryption_result(&completion));
        if let Err(e) = outcome {
            warn!("Relay failed to resolve request {}: {}", request.request_id, e);
        }
    }
}
