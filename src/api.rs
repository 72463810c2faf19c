/**
 * HTTP surface
 * Routes every engine operation and query; the caller is named by a header
 * that the fronting gateway sets after checking the client's credentials
 */

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::engine::{BiometricEngine, Statistics, VerificationHandle, VerificationScore};
use crate::error::EngineError;
use crate::ledger::AccessAttempt;
use crate::oracle::{DecryptionCompletion, DecryptionRequestMessage, Resolution};
use crate::store::TemplateStatus;
use crate::types::{BiometricFactors, Identity};

pub const CALLER_HEADER: &str = "x-caller-identity";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<BiometricEngine>,
}

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    MissingCaller,
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

#[derive(Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

pub fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::AlreadyRegistered(_) => StatusCode::CONFLICT,
        EngineError::NotRegistered(_) => StatusCode::NOT_FOUND,
        EngineError::IndexOutOfRange { .. } => StatusCode::NOT_FOUND,
        EngineError::InvalidRequest(_) => StatusCode::CONFLICT,
        EngineError::InvalidProof(_) => StatusCode::UNAUTHORIZED,
        EngineError::Unauthorized { .. } => StatusCode::FORBIDDEN,
        EngineError::AlreadyResolved { .. } => StatusCode::CONFLICT,
        EngineError::Coprocessor(_) => StatusCode::BAD_GATEWAY,
        EngineError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Engine(e) => (status_for(&e), e.kind().to_string(), e.to_string()),
            ApiError::MissingCaller => (
                StatusCode::UNAUTHORIZED,
                "missing_caller".to_string(),
                format!("{} header is required", CALLER_HEADER),
            ),
            ApiError::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal".to_string(),
                message,
            ),
        };
        if status.is_server_error() {
            warn!("Request failed: {}", message);
        }
        (status, Json(ErrorBody { error, message })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize, Deserialize)]
pub struct TemplateResponse {
    pub identity: Identity,
    pub status: TemplateStatus,
}

#[derive(Serialize, Deserialize)]
pub struct LedgerResponse {
    pub identity: Identity,
    pub length: usize,
    pub entries: Vec<AccessAttempt>,
}

#[derive(Serialize, Deserialize)]
pub struct PrincipalRequest {
    pub principal: Identity,
}

#[derive(Serialize, Deserialize)]
pub struct DeactivationResponse {
    pub deactivated: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/templates/register", post(register))
        .route("/templates/update", post(update))
        .route("/templates/deactivate", post(deactivate))
        .route("/verify", post(verify))
        .route("/oracle/callback", post(oracle_callback))
        .route("/oracle/pending", get(oracle_pending))
        .route("/status/:identity", get(status))
        .route("/ledger/:identity", get(ledger))
        .route("/ledger/:identity/:index", get(ledger_entry))
        .route("/score/:identity", get(score))
        .route("/admin/identities", get(identities))
        .route("/admin/statistics", get(statistics))
        .route("/admin/authorize", post(authorize))
        .route("/admin/deauthorize", post(deauthorize))
        .route("/admin/transfer-ownership", post(transfer_ownership))
        .route("/admin/emergency-deactivate", post(emergency_deactivate))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn caller(headers: &HeaderMap) -> ApiResult<Identity> {
    headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(Identity::new)
        .ok_or(ApiError::MissingCaller)
}

/// Runs engine work off the async executor. Every engine call can wait on the
/// writer lock while a verification holds it.
async fn blocking<T, F>(state: &AppState, work: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&BiometricEngine) -> Result<T, EngineError> + Send + 'static,
{
    let engine = state.engine.clone();
    tokio::task::spawn_blocking(move || work(engine.as_ref()))
        .await
        .map_err(|e| ApiError::Internal(format!("engine task failed: {}", e)))?
        .map_err(ApiError::from)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(factors): Json<BiometricFactors>,
) -> ApiResult<(StatusCode, Json<TemplateResponse>)> {
    let identity = caller(&headers)?;
    info!("Template registration request: identity={}", identity);

    let id = identity.clone();
    let template = blocking(&state, move |engine| engine.register(&id, &factors)).await?;
    Ok((
        StatusCode::CREATED,
        Json(TemplateResponse {
            identity,
            status: TemplateStatus {
                active: template.active,
                registered_at: template.registered_at,
                access_count: template.access_count,
            },
        }),
    ))
}

async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(factors): Json<BiometricFactors>,
) -> ApiResult<Json<TemplateResponse>> {
    let identity = caller(&headers)?;
    info!("Template update request: identity={}", identity);

    let id = identity.clone();
    let status = blocking(&state, move |engine| {
        engine.update(&id, &factors)?;
        Ok(engine.status(&id))
    })
    .await?;
    Ok(Json(TemplateResponse { identity, status }))
}

async fn deactivate(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<TemplateResponse>> {
    let identity = caller(&headers)?;
    let id = identity.clone();
    let status = blocking(&state, move |engine| {
        engine.deactivate(&id)?;
        Ok(engine.status(&id))
    })
    .await?;
    Ok(Json(TemplateResponse { identity, status }))
}

async fn verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(samples): Json<BiometricFactors>,
) -> ApiResult<(StatusCode, Json<VerificationHandle>)> {
    let identity = caller(&headers)?;
    info!("Verification request: identity={}", identity);

    let handle = blocking(&state, move |engine| engine.verify(&identity, &samples)).await?;
    Ok((StatusCode::ACCEPTED, Json(handle)))
}

async fn oracle_callback(
    State(state): State<AppState>,
    Json(completion): Json<DecryptionCompletion>,
) -> ApiResult<Json<Resolution>> {
    info!("Decryption callback: request_id={}", completion.request_id);
    let resolution = blocking(&state, move |engine| engine.on_decryption_result(&completion)).await?;
    Ok(Json(resolution))
}

async fn oracle_pending(State(state): State<AppState>) -> ApiResult<Json<Vec<DecryptionRequestMessage>>> {
    Ok(Json(blocking(&state, |engine| Ok(engine.pending_requests())).await?))
}

async fn status(State(state): State<AppState>, Path(identity): Path<String>) -> ApiResult<Json<TemplateStatus>> {
    let identity = Identity::new(identity);
    Ok(Json(blocking(&state, move |engine| Ok(engine.status(&identity))).await?))
}

async fn ledger(State(state): State<AppState>, Path(identity): Path<String>) -> ApiResult<Json<LedgerResponse>> {
    let identity = Identity::new(identity);
    let id = identity.clone();
    let entries = blocking(&state, move |engine| Ok(engine.ledger_entries(&id))).await?;
    Ok(Json(LedgerResponse {
        length: entries.len(),
        identity,
        entries,
    }))
}

async fn ledger_entry(
    State(state): State<AppState>,
    Path((identity, index)): Path<(String, usize)>,
) -> ApiResult<Json<AccessAttempt>> {
    let identity = Identity::new(identity);
    Ok(Json(blocking(&state, move |engine| engine.ledger_entry(&identity, index)).await?))
}

async fn score(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(identity): Path<String>,
) -> ApiResult<Json<Option<VerificationScore>>> {
    let caller = caller(&headers)?;
    let identity = Identity::new(identity);
    Ok(Json(blocking(&state, move |engine| engine.current_score(&caller, &identity)).await?))
}

async fn identities(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Vec<Identity>>> {
    let caller = caller(&headers)?;
    Ok(Json(blocking(&state, move |engine| engine.registered_identities(&caller)).await?))
}

async fn statistics(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Statistics>> {
    let caller = caller(&headers)?;
    Ok(Json(blocking(&state, move |engine| engine.statistics(&caller)).await?))
}

async fn authorize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PrincipalRequest>,
) -> ApiResult<StatusCode> {
    let caller = caller(&headers)?;
    blocking(&state, move |engine| engine.authorize(&caller, &request.principal)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn deauthorize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PrincipalRequest>,
) -> ApiResult<StatusCode> {
    let caller = caller(&headers)?;
    blocking(&state, move |engine| engine.deauthorize(&caller, &request.principal)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn transfer_ownership(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PrincipalRequest>,
) -> ApiResult<StatusCode> {
    let caller = caller(&headers)?;
    blocking(&state, move |engine| engine.transfer_ownership(&caller, &request.principal)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn emergency_deactivate(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<DeactivationResponse>> {
    let caller = caller(&headers)?;
    warn!("Emergency deactivation requested by {}", caller);
    let deactivated = blocking(&state, move |engine| engine.emergency_deactivate_all(&caller)).await?;
    Ok(Json(DeactivationResponse { deactivated }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{AttestationService, ProofVerifier};
    use crate::coprocessor::{ConfidentialCoprocessor, LocalCoprocessor};
    use crate::relay::CoprocessorRelay;
    use crate::types::{CipherKind, Ciphertext};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde::de::DeserializeOwned;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        relay: CoprocessorRelay,
    }

    fn app() -> TestApp {
        let coprocessor = Arc::new(LocalCoprocessor::new());
        let signer = AttestationService::from_seed(&[4u8; 32]).unwrap();
        let engine = BiometricEngine::builder(Identity::from("owner"))
            .verifier(ProofVerifier::new().with_key(&signer.public_key()))
            .build(coprocessor.clone())
            .unwrap();
        TestApp {
            router: router(AppState {
                engine: Arc::new(engine),
            }),
            relay: CoprocessorRelay::new(coprocessor, signer),
        }
    }

    impl TestApp {
        async fn call(&self, method: &str, uri: &str, caller: Option<&str>, body: Option<serde_json::Value>) -> Response {
            send(self.router.clone(), method, uri, caller, body).await
        }
    }

    async fn send(
        router: Router,
        method: &str,
        uri: &str,
        caller: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Response {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(caller) = caller {
            request = request.header(CALLER_HEADER, caller);
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        router.oneshot(request).await.unwrap()
    }

    /// Reference coprocessor that can be slowed to 50ms per encryption.
    #[derive(Default)]
    struct SlowCoprocessor {
        inner: LocalCoprocessor,
        slow: AtomicBool,
        busy: AtomicBool,
    }

    impl ConfidentialCoprocessor for SlowCoprocessor {
        fn encrypt(&self, value: u64, kind: CipherKind) -> Result<Ciphertext, EngineError> {
            if self.slow.load(Ordering::SeqCst) {
                self.busy.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
            }
            self.inner.encrypt(value, kind)
        }

        fn equals(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, EngineError> {
            self.inner.equals(a, b)
        }

        fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, EngineError> {
            self.inner.add(a, b)
        }

        fn mul(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, EngineError> {
            self.inner.mul(a, b)
        }

        fn greater_or_equal(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, EngineError> {
            self.inner.greater_or_equal(a, b)
        }

        fn select(&self, cond: &Ciphertext, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, EngineError> {
            self.inner.select(cond, a, b)
        }

        fn grant(&self, ciphertext: &Ciphertext, principal: &Identity) -> Result<(), EngineError> {
            self.inner.grant(ciphertext, principal)
        }

        fn is_granted(&self, ciphertext: &Ciphertext, principal: &Identity) -> bool {
            self.inner.is_granted(ciphertext, principal)
        }

        fn release(&self, ciphertext: &Ciphertext) {
            self.inner.release(ciphertext)
        }
    }

    async fn read<T: DeserializeOwned>(response: Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn factors(a: u64, b: u64, c: u32, d: u32) -> serde_json::Value {
        json!({ "fingerprint": a, "face_template": b, "voice_print": c, "iris": d })
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = app();
        assert_eq!(app.call("GET", "/health", None, None).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn register_verify_and_callback() {
        let app = app();

        let response = app
            .call("POST", "/templates/register", Some("alice"), Some(factors(10, 20, 30, 40)))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .call("POST", "/templates/register", Some("alice"), Some(factors(10, 20, 30, 40)))
            .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: ErrorBody = read(response).await;
        assert_eq!(body.error, "already_registered");

        let response = app
            .call("POST", "/verify", Some("alice"), Some(factors(10, 20, 30, 99)))
            .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let handle: VerificationHandle = read(response).await;

        let pending: Vec<DecryptionRequestMessage> =
            read(app.call("GET", "/oracle/pending", None, None).await).await;
        assert_eq!(pending.len(), 1);
        let completion = app.relay.complete(&pending[0]).unwrap();
        let body = serde_json::to_value(&completion).unwrap();

        let response = app.call("POST", "/oracle/callback", None, Some(body.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let resolution: Resolution = read(response).await;
        assert_eq!(resolution.request_id, handle.request_id);
        assert!(resolution.verified);

        let replay = app.call("POST", "/oracle/callback", None, Some(body)).await;
        assert_eq!(replay.status(), StatusCode::CONFLICT);

        let entry: AccessAttempt = read(app.call("GET", "/ledger/alice/0", None, None).await).await;
        assert!(entry.verified);
        assert_eq!(entry.confidence_score, 95);
        assert_eq!(
            app.call("GET", "/ledger/alice/1", None, None).await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn forged_callback_is_unauthorized() {
        let app = app();
        app.call("POST", "/templates/register", Some("alice"), Some(factors(1, 2, 3, 4)))
            .await;
        app.call("POST", "/verify", Some("alice"), Some(factors(1, 2, 3, 4)))
            .await;

        let pending: Vec<DecryptionRequestMessage> =
            read(app.call("GET", "/oracle/pending", None, None).await).await;
        let mut completion = app.relay.complete(&pending[0]).unwrap();
        completion.plaintext_result = !completion.plaintext_result;

        let response = app
            .call("POST", "/oracle/callback", None, Some(serde_json::to_value(&completion).unwrap()))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let ledger: LedgerResponse = read(app.call("GET", "/ledger/alice", None, None).await).await;
        assert_eq!(ledger.length, 1);
        assert!(!ledger.entries[0].is_resolved());
    }

    #[tokio::test]
    async fn verify_unknown_identity_is_not_found() {
        let app = app();
        let response = app
            .call("POST", "/verify", Some("ghost"), Some(factors(1, 2, 3, 4)))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            app.call("POST", "/verify", None, Some(factors(1, 2, 3, 4))).await.status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn admin_routes_are_gated() {
        let app = app();
        app.call("POST", "/templates/register", Some("alice"), Some(factors(1, 2, 3, 4)))
            .await;

        assert_eq!(
            app.call("GET", "/admin/statistics", Some("alice"), None).await.status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            app.call("GET", "/score/alice", Some("bob"), None).await.status(),
            StatusCode::FORBIDDEN
        );

        let response = app
            .call("POST", "/admin/authorize", Some("owner"), Some(json!({ "principal": "bob" })))
            .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let stats: Statistics = read(app.call("GET", "/admin/statistics", Some("bob"), None).await).await;
        assert_eq!(stats.total_identities, 1);
        assert_eq!(stats.active_identities, 1);

        let ids: Vec<Identity> = read(app.call("GET", "/admin/identities", Some("bob"), None).await).await;
        assert_eq!(ids, vec![Identity::from("alice")]);

        assert_eq!(
            app.call("POST", "/admin/emergency-deactivate", Some("bob"), None).await.status(),
            StatusCode::FORBIDDEN
        );
        let response: DeactivationResponse =
            read(app.call("POST", "/admin/emergency-deactivate", Some("owner"), None).await).await;
        assert_eq!(response.deactivated, 1);

        let status: TemplateStatus = read(app.call("GET", "/status/alice", None, None).await).await;
        assert!(!status.active);
    }

    #[tokio::test]
    async fn update_and_deactivate() {
        let app = app();
        assert_eq!(
            app.call("POST", "/templates/update", Some("alice"), Some(factors(1, 2, 3, 4))).await.status(),
            StatusCode::NOT_FOUND
        );
        app.call("POST", "/templates/register", Some("alice"), Some(factors(1, 2, 3, 4)))
            .await;

        let updated: TemplateResponse = read(
            app.call("POST", "/templates/update", Some("alice"), Some(factors(5, 6, 7, 8)))
                .await,
        )
        .await;
        assert!(updated.status.active);

        let first: TemplateResponse = read(app.call("POST", "/templates/deactivate", Some("alice"), None).await).await;
        let second = app.call("POST", "/templates/deactivate", Some("alice"), None).await;
        assert!(!first.status.active);
        assert_eq!(second.status(), StatusCode::OK);
    }

    // Single-threaded runtime: a handler that parks the thread on the engine
    // lock would also stop the timer below from firing.
    #[tokio::test]
    async fn queries_wait_off_the_executor_during_verification() {
        let coprocessor = Arc::new(SlowCoprocessor::default());
        let engine = BiometricEngine::builder(Identity::from("owner"))
            .build(coprocessor.clone())
            .unwrap();
        let service = router(AppState {
            engine: Arc::new(engine),
        });
        let response = send(
            service.clone(),
            "POST",
            "/templates/register",
            Some("bob"),
            Some(factors(1, 2, 3, 4)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        coprocessor.slow.store(true, Ordering::SeqCst);
        let verifying = tokio::spawn(send(
            service.clone(),
            "POST",
            "/verify",
            Some("bob"),
            Some(factors(1, 2, 3, 4)),
        ));
        while !coprocessor.busy.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let query = tokio::time::timeout(
            Duration::from_millis(20),
            send(service.clone(), "GET", "/status/bob", None, None),
        )
        .await;
        assert!(query.is_err(), "status query completed while verification held the engine");

        assert_eq!(verifying.await.unwrap().status(), StatusCode::ACCEPTED);
        coprocessor.slow.store(false, Ordering::SeqCst);
        let status: TemplateStatus = read(send(service, "GET", "/status/bob", None, None).await).await;
        assert_eq!(status.access_count, 1);
    }
}
