use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

use parley_core::error::ParleyError;
use parley_core::types::now_unix;

use crate::auth::verify_auth_header;
use crate::db::{AdminDb, ExpertRow, WalletRow};

const BODY_LIMIT: usize = 1024 * 1024;

/// Listing constraints returned by the permissions hook.
#[derive(Debug, Clone, Default)]
pub struct Perms {
    /// When set, listing endpoints only return these row ids.
    pub list_ids: Option<Vec<i64>>,
}

/// Permissions hook consulted per request. The default allows everything.
pub trait CheckPerms: Send + Sync {
    fn check(&self, user_id: i64, path: &str) -> Perms;
}

/// Allow-all permissions.
pub struct AllowAll;

impl CheckPerms for AllowAll {
    fn check(&self, _user_id: i64, _path: &str) -> Perms {
        Perms::default()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: AdminDb,
    pub perms: Arc<dyn CheckPerms>,
    pub stopping: watch::Receiver<bool>,
}

/// The authenticated caller, injected by the auth middleware.
#[derive(Debug, Clone)]
struct AuthedUser {
    id: i64,
}

// ── Error mapping ────────────────────────────────────────────────────────────

struct ApiError(ParleyError);

impl From<ParleyError> for ApiError {
    fn from(e: ParleyError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ParleyError::PermissionDenied => StatusCode::FORBIDDEN,
            ParleyError::UnknownReference(_) => StatusCode::NOT_FOUND,
            e if e.kind() == "auth" => StatusCode::UNAUTHORIZED,
            e if e.kind() == "protocol" || e.kind() == "storage" => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "error": { "kind": self.0.kind(), "code": self.0.code(), "message": self.0.to_string() }
        }));
        (status, body).into_response()
    }
}

// ── Server ───────────────────────────────────────────────────────────────────

/// The admin HTTP server. `stop()` flips health to 503 and begins graceful
/// shutdown.
pub struct HttpServer {
    addr: SocketAddr,
    stop: watch::Sender<bool>,
}

impl HttpServer {
    pub async fn bind(
        addr: &str,
        db: AdminDb,
        perms: Arc<dyn CheckPerms>,
    ) -> Result<Self, ParleyError> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let state = AppState { db, perms, stopping: stop_rx.clone() };
        let app = router(state);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ParleyError::Connect(format!("http bind: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| ParleyError::Connect(e.to_string()))?;

        let mut shutdown = stop_rx;
        tokio::spawn(async move {
            let graceful = async move {
                let _ = shutdown.changed().await;
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(graceful).await {
                debug!(error = %e, "http server exited");
            }
        });

        info!(%addr, "admin http listening");
        Ok(Self { addr, stop: stop_tx })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Build the admin router. Everything except `/health` sits behind the
/// event-token auth middleware.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/wallets", get(list_wallets).post(create_wallet))
        .route("/wallets/default", get(default_wallet))
        .route("/wallets/name/:name", get(wallet_by_name))
        .route(
            "/wallets/:id",
            get(get_wallet).put(update_wallet).delete(delete_wallet),
        )
        .route("/experts", get(list_experts).post(create_expert))
        .route(
            "/experts/:pubkey",
            get(get_expert).put(update_expert).delete(delete_expert),
        )
        .route("/experts/:pubkey/disabled", patch(set_expert_disabled))
        .route("/users", post(create_user))
        .route("/users/whoami", get(whoami))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

// ── Middleware ───────────────────────────────────────────────────────────────

async fn auth_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let (parts, body) = req.into_parts();
    let bytes = to_bytes(body, BODY_LIMIT)
        .await
        .map_err(|e| ParleyError::Parse(format!("request body: {e}")))?;

    let header_value = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ParleyError::TokenMissing)?;

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let url = format!("http://{host}{}", parts.uri);

    let body_opt = if bytes.is_empty() { None } else { Some(bytes.as_ref()) };
    let pubkey =
        verify_auth_header(header_value, parts.method.as_str(), &url, body_opt, now_unix())?;

    let user = state.db.ensure_user(&pubkey.to_hex())?;
    let mut req = Request::from_parts(parts, Body::from(bytes));
    req.extensions_mut().insert(AuthedUser { id: user.id });
    Ok(next.run(req).await)
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Response {
    if *state.stopping.borrow() {
        (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({"status": "stopping"})))
            .into_response()
    } else {
        Json(serde_json::json!({"status": "ok"})).into_response()
    }
}

#[derive(Deserialize)]
struct WalletBody {
    name: String,
    nwc: String,
    #[serde(default)]
    is_default: bool,
}

async fn list_wallets(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<Vec<WalletRow>>, ApiError> {
    let perms = state.perms.check(user.id, "/wallets");
    let wallets = state.db.list_wallets(user.id, perms.list_ids.as_deref())?;
    Ok(Json(wallets))
}

async fn create_wallet(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Json(body): Json<WalletBody>,
) -> Result<Json<WalletRow>, ApiError> {
    let wallet = state.db.add_wallet(user.id, &body.name, &body.nwc, body.is_default)?;
    Ok(Json(wallet))
}

async fn get_wallet(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Path(id): Path<i64>,
) -> Result<Json<WalletRow>, ApiError> {
    state
        .db
        .get_wallet(user.id, id)?
        .map(Json)
        .ok_or_else(|| ParleyError::UnknownReference(format!("wallet {id}")).into())
}

async fn wallet_by_name(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Path(name): Path<String>,
) -> Result<Json<WalletRow>, ApiError> {
    state
        .db
        .get_wallet_by_name(user.id, &name)?
        .map(Json)
        .ok_or_else(|| ParleyError::UnknownReference(format!("wallet {name}")).into())
}

async fn default_wallet(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<WalletRow>, ApiError> {
    state
        .db
        .default_wallet(user.id)?
        .map(Json)
        .ok_or_else(|| ParleyError::UnknownReference("default wallet".into()).into())
}

async fn update_wallet(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Path(id): Path<i64>,
    Json(body): Json<WalletBody>,
) -> Result<Json<WalletRow>, ApiError> {
    let wallet = WalletRow {
        id,
        name: body.name,
        nwc: body.nwc,
        user_id: user.id,
        is_default: body.is_default,
    };
    if !state.db.update_wallet(&wallet)? {
        return Err(ParleyError::UnknownReference(format!("wallet {id}")).into());
    }
    Ok(Json(wallet))
}

async fn delete_wallet(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if !state.db.delete_wallet(user.id, id)? {
        return Err(ParleyError::UnknownReference(format!("wallet {id}")).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ExpertBody {
    pubkey: String,
    #[serde(default)]
    wallet_id: Option<i64>,
    #[serde(rename = "type", default)]
    expert_type: String,
    #[serde(default)]
    nickname: String,
    #[serde(default)]
    env: String,
    #[serde(default)]
    docstores: String,
    #[serde(default)]
    privkey: String,
}

#[derive(Deserialize)]
struct DisabledBody {
    disabled: bool,
}

async fn list_experts(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<Vec<ExpertRow>>, ApiError> {
    Ok(Json(state.db.list_experts(user.id)?))
}

async fn create_expert(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Json(body): Json<ExpertBody>,
) -> Result<Json<ExpertRow>, ApiError> {
    let expert = ExpertRow {
        pubkey: body.pubkey,
        wallet_id: body.wallet_id,
        expert_type: body.expert_type,
        nickname: body.nickname,
        env: body.env,
        docstores: body.docstores,
        privkey: body.privkey,
        disabled: false,
        user_id: user.id,
    };
    state.db.upsert_expert(&expert)?;
    Ok(Json(expert))
}

async fn get_expert(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Path(pubkey): Path<String>,
) -> Result<Json<ExpertRow>, ApiError> {
    state
        .db
        .get_expert(user.id, &pubkey)?
        .map(Json)
        .ok_or_else(|| ParleyError::UnknownReference(format!("expert {pubkey}")).into())
}

async fn update_expert(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Path(pubkey): Path<String>,
    Json(body): Json<ExpertBody>,
) -> Result<Json<ExpertRow>, ApiError> {
    let existing = state
        .db
        .get_expert(user.id, &pubkey)?
        .ok_or_else(|| ParleyError::UnknownReference(format!("expert {pubkey}")))?;
    let expert = ExpertRow {
        pubkey,
        wallet_id: body.wallet_id.or(existing.wallet_id),
        expert_type: body.expert_type,
        nickname: body.nickname,
        env: body.env,
        docstores: body.docstores,
        privkey: if body.privkey.is_empty() { existing.privkey } else { body.privkey },
        disabled: existing.disabled,
        user_id: user.id,
    };
    state.db.upsert_expert(&expert)?;
    Ok(Json(expert))
}

async fn set_expert_disabled(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Path(pubkey): Path<String>,
    Json(body): Json<DisabledBody>,
) -> Result<StatusCode, ApiError> {
    if !state.db.set_expert_disabled(user.id, &pubkey, body.disabled)? {
        return Err(ParleyError::UnknownReference(format!("expert {pubkey}")).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_expert(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Path(pubkey): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !state.db.delete_expert(user.id, &pubkey)? {
        return Err(ParleyError::UnknownReference(format!("expert {pubkey}")).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn create_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Auth already materialized the row; echo it.
    Ok(Json(serde_json::json!({ "id": user.id })))
}

async fn whoami(
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(serde_json::json!({ "id": user.id })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::build_request_token;
    use axum::http::Request as HttpRequest;
    use parley_crypto::Keys;
    use tower::util::ServiceExt;

    const HOST: &str = "admin.example.com";

    fn test_state() -> (AppState, watch::Sender<bool>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let state = AppState {
            db: AdminDb::open_in_memory().unwrap(),
            perms: Arc::new(AllowAll),
            stopping: stop_rx,
        };
        (state, stop_tx)
    }

    fn authed_request(
        keys: &Keys,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> HttpRequest<Body> {
        let url = format!("http://{HOST}{path}");
        let bytes = body.map(|v| v.to_string().into_bytes());
        let token = build_request_token(keys, &url, method, bytes.as_deref());
        let mut builder = HttpRequest::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, HOST)
            .header(header::AUTHORIZATION, token);
        if bytes.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        builder.body(bytes.map(Body::from).unwrap_or_else(Body::empty)).unwrap()
    }

    #[tokio::test]
    async fn health_flips_to_503_when_stopping() {
        let (state, stop) = test_state();
        let app = router(state);

        let resp = app
            .clone()
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        stop.send(true).unwrap();
        let resp = app
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn wallets_require_a_token() {
        let (state, _stop) = test_state();
        let app = router(state);

        let resp = app
            .oneshot(
                HttpRequest::get("/wallets")
                    .header(header::HOST, HOST)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wallet_crud_round_trip() {
        let (state, _stop) = test_state();
        let app = router(state);
        let keys = Keys::generate();

        // Create.
        let resp = app
            .clone()
            .oneshot(authed_request(
                &keys,
                "POST",
                "/wallets",
                Some(serde_json::json!({"name": "main", "nwc": "nwc://x", "is_default": true})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // List.
        let resp = app
            .clone()
            .oneshot(authed_request(&keys, "GET", "/wallets", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
        let wallets: Vec<WalletRow> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(wallets.len(), 1);
        assert_eq!(wallets[0].name, "main");

        // Default lookup.
        let resp = app
            .clone()
            .oneshot(authed_request(&keys, "GET", "/wallets/default", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // A different identity sees nothing.
        let other = Keys::generate();
        let resp = app
            .clone()
            .oneshot(authed_request(&other, "GET", "/wallets/default", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn expert_disable_patch() {
        let (state, _stop) = test_state();
        let app = router(state);
        let keys = Keys::generate();

        let resp = app
            .clone()
            .oneshot(authed_request(
                &keys,
                "POST",
                "/experts",
                Some(serde_json::json!({"pubkey": "ee", "nickname": "atlas", "type": "rag"})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(authed_request(
                &keys,
                "PATCH",
                "/experts/ee/disabled",
                Some(serde_json::json!({"disabled": true})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app
            .oneshot(authed_request(&keys, "GET", "/experts/ee", None))
            .await
            .unwrap();
        let bytes = to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
        let expert: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(expert["disabled"], serde_json::json!(true));
    }
}
