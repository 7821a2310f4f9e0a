//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use chrono::{DateTime, Duration, Utc};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use tokio::net::TcpListener;

use sentinel::{
    AuthorityRequest, AuthorityResponse, AuthorityStatus, AuthorityTransport, LicenseArtifact,
    LicensePayload, NetworkError, Product, ProductVersion, PublicKey, RevocationUpdate,
};

pub const PRODUCT_ID: u64 = 42;

/// A product together with the private key that signs its licenses.
pub struct Vendor {
    pair: Ed25519KeyPair,
    pub product: Arc<Product>,
}

impl Vendor {
    pub fn new() -> Self {
        Self::with_id(PRODUCT_ID)
    }

    pub fn with_id(id: u64) -> Self {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).expect("keygen failed");
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).expect("bad pkcs8");
        let key = PublicKey::from_bytes(pair.public_key().as_ref().to_vec()).expect("bad key");
        let product = Product::new(id, "Parsers", key, None, ProductVersion::new("2.4.1"), None)
            .expect("bad product");
        Self {
            pair,
            product: Arc::new(product),
        }
    }

    pub fn payload(&self, license_id: &str, issued_at: DateTime<Utc>) -> LicensePayload {
        LicensePayload {
            license_id: license_id.to_string(),
            product_id: self.product.id(),
            holder: "Acme Ltd".to_string(),
            issued_at,
            expires_at: Some(issued_at + Duration::days(30)),
            entitlements: ["export".to_string()].into_iter().collect(),
            max_offline_grace_days: 7,
        }
    }

    pub fn sign(&self, payload: &LicensePayload) -> Vec<u8> {
        let input = LicenseArtifact::signing_input(payload).expect("signing input");
        LicenseArtifact::assemble(&input, self.pair.sign(&input).as_ref()).expect("assemble")
    }
}

pub fn valid_response(server_time: DateTime<Utc>) -> AuthorityResponse {
    AuthorityResponse {
        status: AuthorityStatus::Valid,
        expires_at: Some(server_time + Duration::days(30)),
        entitlements: ["export".to_string()].into_iter().collect(),
        revocation_snapshot: RevocationUpdate::default(),
        server_time,
    }
}

/// In-process authority with a scripted answer.
pub struct ScriptedAuthority {
    answer: Mutex<Result<AuthorityResponse, NetworkError>>,
}

impl ScriptedAuthority {
    pub fn answering(answer: Result<AuthorityResponse, NetworkError>) -> Arc<Self> {
        Arc::new(Self {
            answer: Mutex::new(answer),
        })
    }

    pub fn unreachable() -> Arc<Self> {
        Self::answering(Err(NetworkError::Connect("connection refused".to_string())))
    }

    pub fn set(&self, answer: Result<AuthorityResponse, NetworkError>) {
        *self.answer.lock().unwrap() = answer;
    }
}

#[async_trait]
impl AuthorityTransport for ScriptedAuthority {
    async fn check(&self, _request: &AuthorityRequest) -> Result<AuthorityResponse, NetworkError> {
        self.answer.lock().unwrap().clone()
    }
}

/// Authority that never answers.
pub struct HangingAuthority;

#[async_trait]
impl AuthorityTransport for HangingAuthority {
    async fn check(&self, _request: &AuthorityRequest) -> Result<AuthorityResponse, NetworkError> {
        std::future::pending().await
    }
}

/// What the HTTP test authority answers and what it has seen.
#[derive(Clone, Default)]
pub struct AuthorityState {
    pub reply: Arc<Mutex<Option<AuthorityResponse>>>,
    pub seen: Arc<Mutex<Vec<AuthorityRequest>>>,
}

async fn status_handler(
    State(state): State<AuthorityState>,
    Json(request): Json<AuthorityRequest>,
) -> Result<Json<AuthorityResponse>, StatusCode> {
    state.seen.lock().unwrap().push(request);
    match state.reply.lock().unwrap().clone() {
        Some(reply) => Ok(Json(reply)),
        None => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

async fn garbage_handler() -> &'static str {
    "not json"
}

/// Spin up a license authority on a random port.
pub async fn spawn_test_authority(state: AuthorityState) -> String {
    let router: Router = Router::new()
        .route("/api/v1/licenses/status", post(status_handler))
        .route("/garbage/api/v1/licenses/status", post(garbage_handler))
        .with_state(state);

    // Bind to an ephemeral port
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .await
            .expect("server failed");
    });

    format!("http://{}", addr)
}
