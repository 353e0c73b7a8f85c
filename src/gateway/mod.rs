//! Axum-based HTTP gateway with proper HTTP/1.1 compliance, body limits, and timeouts.
//!
//! The gateway owns everything HTTP: bearer auth, rate limiting, JSON
//! shapes, status-code mapping, and the QR presentation of pairing codes.
//! Session semantics live below it in [`SessionManager`]; no handler talks
//! to the registry or the engine directly.
//!
//! Hardening baked into the stack:
//! - Request body size limits (64KB max)
//! - Request timeouts (30s)
//! - Sliding-window rate limits on login and send
//! - Content-Length validation and header sanitization (handled by axum/hyper)

pub mod qr;

use crate::auth::AuthStore;
use crate::config::Config;
use crate::engine::{EngineAdapter, MessagingEngine, SimEngine};
use crate::session::{LifecycleError, SendError, SessionManager, SessionRegistry};
use crate::store::SqliteCredentialStore;
use anyhow::Result;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use parking_lot::Mutex;
use serde::Deserialize as GatewayDeserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB) — prevents memory exhaustion
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s) — every operation answers from a snapshot, nothing
/// long-running runs inside a request
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Sliding window used by gateway rate limiting.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// How often the rate limiter sweeps stale IP entries from its map.
const RATE_LIMITER_SWEEP_INTERVAL_SECS: u64 = 300; // 5 minutes

/// How often expired auth tokens are swept from the database.
const TOKEN_SWEEP_INTERVAL_SECS: u64 = 3600; // hourly

#[derive(Debug)]
struct SlidingWindowRateLimiter {
    limit_per_window: u32,
    window: Duration,
    requests: Mutex<(HashMap<String, Vec<Instant>>, Instant)>,
}

impl SlidingWindowRateLimiter {
    fn new(limit_per_window: u32, window: Duration) -> Self {
        Self {
            limit_per_window,
            window,
            requests: Mutex::new((HashMap::new(), Instant::now())),
        }
    }

    fn allow(&self, key: &str) -> bool {
        if self.limit_per_window == 0 {
            return true;
        }

        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or_else(Instant::now);

        let mut guard = self.requests.lock();
        let (requests, last_sweep) = &mut *guard;

        // Periodic sweep: remove IPs with no recent requests
        if last_sweep.elapsed() >= Duration::from_secs(RATE_LIMITER_SWEEP_INTERVAL_SECS) {
            requests.retain(|_, timestamps| {
                timestamps.retain(|t| *t > cutoff);
                !timestamps.is_empty()
            });
            *last_sweep = now;
        }

        let entry = requests.entry(key.to_owned()).or_default();
        entry.retain(|instant| *instant > cutoff);

        if entry.len() >= self.limit_per_window as usize {
            return false;
        }

        entry.push(now);
        true
    }
}

#[derive(Debug)]
pub struct GatewayRateLimiter {
    login: SlidingWindowRateLimiter,
    send: SlidingWindowRateLimiter,
}

impl GatewayRateLimiter {
    fn new(login_per_minute: u32, send_per_minute: u32) -> Self {
        let window = Duration::from_secs(RATE_LIMIT_WINDOW_SECS);
        Self {
            login: SlidingWindowRateLimiter::new(login_per_minute, window),
            send: SlidingWindowRateLimiter::new(send_per_minute, window),
        }
    }

    fn allow_login(&self, key: &str) -> bool {
        self.login.allow(key)
    }

    fn allow_send(&self, key: &str) -> bool {
        self.send.allow(key)
    }
}

fn client_key_from_headers(headers: &HeaderMap) -> String {
    ["X-Forwarded-For", "X-Real-IP"]
        .iter()
        .find_map(|name| {
            let value = headers.get(*name)?.to_str().ok()?;
            let first = value.split(',').next()?.trim();
            (!first.is_empty()).then(|| first.to_owned())
        })
        .unwrap_or_else(|| "unknown".into())
}

fn is_public_bind(host: &str) -> bool {
    !matches!(host, "127.0.0.1" | "localhost" | "::1")
}

/// Spawns the periodic sweep of expired token rows. Token validation only
/// reads, so without the sweep expired rows would sit in the table forever.
fn spawn_token_sweep(auth: Arc<AuthStore>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match auth.cleanup_expired_tokens() {
                Ok(removed) if removed > 0 => {
                    tracing::debug!(removed, "swept expired auth tokens");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "token sweep failed"),
            }
        }
    });
}

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub auth: Arc<AuthStore>,
    pub rate_limiter: Arc<GatewayRateLimiter>,
    /// Whether new user registration is allowed.
    pub allow_registration: bool,
    /// Maximum registered users (0 = unlimited).
    pub max_users: u64,
}

/// Run the HTTP gateway: open the stores, wire the session core, serve.
pub async fn run_gateway(host: &str, port: u16, config: Config) -> Result<()> {
    // ── Security: refuse public bind without explicit opt-in ──
    if is_public_bind(host) && !config.gateway.allow_public_bind {
        anyhow::bail!(
            "Refusing to bind to {host} — gateway would be exposed to the internet.\n\
             Fix: use --host 127.0.0.1 (default), or set [gateway] allow_public_bind = true\n\
             in config.toml when a trusted reverse proxy terminates for you."
        );
    }

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let auth = Arc::new(AuthStore::new(
        &data_dir.join("auth.db"),
        Some(config.auth.token_ttl_secs),
    )?);
    let credentials = Arc::new(SqliteCredentialStore::open(&data_dir.join("credentials.db"))?);
    tracing::info!(data_dir = %data_dir.display(), "stores opened");

    spawn_token_sweep(
        Arc::clone(&auth),
        Duration::from_secs(TOKEN_SWEEP_INTERVAL_SECS),
    );

    // The simulated engine is what ships; a live protocol implementation
    // slots in behind `MessagingEngine` without touching anything below.
    let engine: Arc<dyn MessagingEngine> = if config.engine.auto_pair {
        tracing::info!(
            delay_ms = config.engine.auto_pair_delay_ms,
            "engine auto-pair enabled"
        );
        Arc::new(SimEngine::with_auto_pair(Duration::from_millis(
            config.engine.auto_pair_delay_ms,
        )))
    } else {
        Arc::new(SimEngine::new())
    };

    let registry = Arc::new(SessionRegistry::new());
    let adapter = EngineAdapter::new(
        engine,
        registry.clone(),
        auth.clone(),
        credentials,
        config.engine.max_init_attempts,
        Duration::from_millis(config.engine.init_retry_backoff_ms),
    );
    let manager = Arc::new(SessionManager::new(
        registry,
        adapter,
        auth.clone(),
        Duration::from_secs(config.session.pairing_code_ttl_secs),
    ));

    let state = AppState {
        manager,
        auth,
        rate_limiter: Arc::new(GatewayRateLimiter::new(
            config.gateway.login_rate_per_minute,
            config.gateway.send_rate_per_minute,
        )),
        allow_registration: config.auth.allow_registration,
        max_users: config.auth.max_users,
    };

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_port = listener.local_addr()?.port();
    tracing::info!("Gateway listening on http://{host}:{actual_port}");

    // ── CORS — allow web clients to connect from any origin ──
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    // Build router with middleware
    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/api/auth/register", post(handle_auth_register))
        .route("/api/auth/login", post(handle_auth_login))
        .route("/api/auth/logout", post(handle_auth_logout))
        .route("/api/session/pairing-code", get(handle_pairing_code))
        .route("/api/session/status", get(handle_status))
        .route("/api/session/send", post(handle_send))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)));

    // Run the server
    axum::serve(listener, app).await?;

    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health — always public (no secrets leaked)
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "active_sessions": state.manager.active_sessions(),
    }))
}

type AuthResponse = (StatusCode, Json<serde_json::Value>);

/// Request body for user registration.
#[derive(GatewayDeserialize)]
struct AuthRegisterBody {
    username: String,
    password: String,
}

/// Request body for login.
#[derive(GatewayDeserialize)]
struct AuthLoginBody {
    username: String,
    password: String,
}

/// Request body for sending a message.
#[derive(GatewayDeserialize)]
struct SendBody {
    recipient: String,
    body: String,
}

/// Extract bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Validate the bearer token and return the user id it belongs to.
/// Returns an error response if missing, unknown, or expired.
fn require_auth_user(state: &AppState, headers: &HeaderMap) -> Result<String, AuthResponse> {
    let token = extract_bearer_token(headers).ok_or_else(|| {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Missing Authorization header"})),
        )
    })?;

    state
        .auth
        .validate_token(token)
        .map(|auth| auth.user_id)
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Invalid or expired token"})),
            )
        })
}

/// POST /api/auth/register — create a user account and log it straight in.
async fn handle_auth_register(
    State(state): State<AppState>,
    body: Result<Json<AuthRegisterBody>, axum::extract::rejection::JsonRejection>,
) -> AuthResponse {
    if !state.allow_registration {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({"error": "Registration is disabled"})),
        );
    }

    // Enforce max_users limit (0 = unlimited)
    if state.max_users > 0 {
        if let Ok(count) = state.auth.user_count() {
            if count >= state.max_users {
                return (
                    StatusCode::FORBIDDEN,
                    Json(serde_json::json!({"error": "Maximum user limit reached"})),
                );
            }
        }
    }

    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": format!("Invalid request: {e}")})),
            );
        }
    };

    let user_id = match state.auth.register(&body.username, &body.password) {
        Ok(id) => id,
        Err(e) => {
            let msg = e.to_string();
            let status = if msg.contains("already taken") {
                StatusCode::CONFLICT
            } else {
                StatusCode::BAD_REQUEST
            };
            return (status, Json(serde_json::json!({"error": msg})));
        }
    };

    match state.auth.issue_token(&user_id) {
        Ok(token) => {
            let status = state.manager.get_status(&user_id).ok();
            (
                StatusCode::CREATED,
                Json(serde_json::json!({
                    "status": "registered",
                    "token": token,
                    "user_id": user_id,
                    "username": body.username.trim(),
                    "ready": status.as_ref().is_some_and(|s| s.ready),
                    "state": status.as_ref().map_or("not_initialized", |s| s.state),
                    "first_login": status.as_ref().map_or(true, |s| s.first_login),
                })),
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": format!("Token creation failed: {e}")})),
        ),
    }
}

/// POST /api/auth/login — authenticate and get a bearer token.
async fn handle_auth_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AuthLoginBody>, axum::extract::rejection::JsonRejection>,
) -> AuthResponse {
    let client_key = client_key_from_headers(&headers);
    if !state.rate_limiter.allow_login(&client_key) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({"error": "Too many login attempts; retry later"})),
        );
    }

    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": format!("Invalid request: {e}")})),
            );
        }
    };

    let user = match state.auth.authenticate(&body.username, &body.password) {
        Ok(u) => u,
        Err(_) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Invalid username or password"})),
            );
        }
    };

    match state.auth.issue_token(&user.id) {
        Ok(token) => {
            let status = state.manager.get_status(&user.id).ok();
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": "authenticated",
                    "token": token,
                    "user_id": user.id,
                    "username": user.username,
                    "ready": status.as_ref().is_some_and(|s| s.ready),
                    "state": status.as_ref().map_or("not_initialized", |s| s.state),
                    "first_login": status.as_ref().map_or(true, |s| s.first_login),
                })),
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": format!("Token creation failed: {e}")})),
        ),
    }
}

/// POST /api/auth/logout — revoke the presented token.
async fn handle_auth_logout(State(state): State<AppState>, headers: HeaderMap) -> AuthResponse {
    let token = match extract_bearer_token(&headers) {
        Some(t) => t,
        None => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Missing Authorization header"})),
            );
        }
    };

    match state.auth.revoke_token(token) {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "logged_out"})),
        ),
        Ok(false) => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Invalid token"})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": format!("Logout failed: {e}")})),
        ),
    }
}

/// GET /api/session/pairing-code — ensure a session cycle is running and
/// report where pairing stands. Presents a fresh code both as text and as
/// a QR PNG data URL. Safe to poll.
async fn handle_pairing_code(State(state): State<AppState>, headers: HeaderMap) -> AuthResponse {
    let user_id = match require_auth_user(&state, &headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.manager.request_pairing(&user_id) {
        Ok(pairing) => {
            let qr_url = pairing.pairing_code.as_deref().and_then(|code| {
                match qr::pairing_code_data_url(code) {
                    Ok(url) => Some(url),
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, error = %e, "QR rendering failed");
                        None
                    }
                }
            });
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "state": pairing.state,
                    "pairing_code": pairing.pairing_code,
                    "qr": qr_url,
                })),
            )
        }
        Err(LifecycleError::UnknownUser { .. }) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Unknown user"})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": format!("Pairing request failed: {e}")})),
        ),
    }
}

/// GET /api/session/status — session status, no side effects.
async fn handle_status(State(state): State<AppState>, headers: HeaderMap) -> AuthResponse {
    let user_id = match require_auth_user(&state, &headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.manager.get_status(&user_id) {
        Ok(status) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "ready": status.ready,
                "state": status.state,
                "first_login": status.first_login,
            })),
        ),
        Err(LifecycleError::UnknownUser { .. }) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Unknown user"})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": format!("Status read failed: {e}")})),
        ),
    }
}

/// POST /api/session/send — deliver one message through the user's session.
///
/// Mapping: not-ready conditions → 409, no session → 404, transport
/// failure → 502. A failed delivery is never retried here.
async fn handle_send(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SendBody>, axum::extract::rejection::JsonRejection>,
) -> AuthResponse {
    let user_id = match require_auth_user(&state, &headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let client_key = client_key_from_headers(&headers);
    if !state.rate_limiter.allow_send(&client_key) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({"error": "Too many messages; retry later"})),
        );
    }

    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": format!("Invalid request: {e}")})),
            );
        }
    };

    let recipient = body.recipient.trim();
    if recipient.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "recipient is required"})),
        );
    }
    if body.body.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "body is required"})),
        );
    }

    match state.manager.send_message(&user_id, recipient, &body.body).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "sent"}))),
        Err(err @ (SendError::UserNotReady | SendError::SessionNotReady { .. })) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": err.to_string()})),
        ),
        Err(err @ SendError::SessionNotFound { .. }) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": err.to_string()})),
        ),
        Err(SendError::Engine(err)) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({"error": format!("Message delivery failed: {err}")})),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SimEngine;
    use crate::session::{ProjectionPatch, ProjectionStore};
    use axum::http::HeaderValue;
    use axum::response::IntoResponse;
    use http_body_util::BodyExt;
    use tempfile::TempDir;

    #[test]
    fn security_body_limit_is_64kb() {
        assert_eq!(MAX_BODY_SIZE, 65_536);
    }

    #[test]
    fn security_timeout_is_30_seconds() {
        assert_eq!(REQUEST_TIMEOUT_SECS, 30);
    }

    #[test]
    fn app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }

    #[test]
    fn loopback_hosts_are_not_public() {
        assert!(!is_public_bind("127.0.0.1"));
        assert!(!is_public_bind("localhost"));
        assert!(is_public_bind("0.0.0.0"));
        assert!(is_public_bind("192.168.1.10"));
    }

    #[test]
    fn gateway_rate_limiter_blocks_after_limit() {
        let limiter = GatewayRateLimiter::new(2, 2);
        assert!(limiter.allow_login("127.0.0.1"));
        assert!(limiter.allow_login("127.0.0.1"));
        assert!(!limiter.allow_login("127.0.0.1"));
    }

    #[test]
    fn rate_limiter_sweep_drops_idle_clients() {
        let limiter = SlidingWindowRateLimiter::new(5, Duration::from_secs(60));
        for key in ["203.0.113.7", "203.0.113.8", "203.0.113.9"] {
            assert!(limiter.allow(key));
        }

        // Backdate the last sweep and age out two clients.
        {
            let mut guard = limiter.requests.lock();
            assert_eq!(guard.0.len(), 3);
            guard.1 = Instant::now()
                .checked_sub(Duration::from_secs(RATE_LIMITER_SWEEP_INTERVAL_SECS + 1))
                .unwrap();
            guard.0.get_mut("203.0.113.8").unwrap().clear();
            guard.0.get_mut("203.0.113.9").unwrap().clear();
        }

        // The next allow() runs the sweep.
        assert!(limiter.allow("203.0.113.7"));

        let guard = limiter.requests.lock();
        assert_eq!(guard.0.len(), 1);
        assert!(guard.0.contains_key("203.0.113.7"));
    }

    #[test]
    fn rate_limiter_zero_limit_always_allows() {
        let limiter = SlidingWindowRateLimiter::new(0, Duration::from_secs(60));
        for _ in 0..50 {
            assert!(limiter.allow("203.0.113.7"));
        }
    }

    #[tokio::test]
    async fn token_sweep_deletes_expired_rows() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("auth.db");
        // TTL of zero: every issued token is expired the moment it exists.
        let auth = Arc::new(AuthStore::new(&db, Some(0)).unwrap());
        let user_id = auth.register("carol", "password123!").unwrap();
        auth.issue_token(&user_id).unwrap();

        spawn_token_sweep(Arc::clone(&auth), Duration::from_millis(5));

        let conn = rusqlite::Connection::open(&db).unwrap();
        for _ in 0..400 {
            let rows: i64 = conn
                .query_row("SELECT COUNT(*) FROM auth_tokens", [], |row| row.get(0))
                .unwrap();
            if rows == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expired token row survived the sweep");
    }

    // ── Handler tests ───────────────────────────────────────────────

    fn test_state() -> (TempDir, AppState, Arc<SimEngine>) {
        let dir = TempDir::new().unwrap();
        let auth = Arc::new(AuthStore::new(&dir.path().join("auth.db"), None).unwrap());
        let credentials =
            Arc::new(SqliteCredentialStore::open(&dir.path().join("creds.db")).unwrap());
        let engine = Arc::new(SimEngine::new());
        let registry = Arc::new(SessionRegistry::new());
        let adapter = EngineAdapter::new(
            engine.clone(),
            registry.clone(),
            auth.clone(),
            credentials,
            3,
            Duration::from_millis(5),
        );
        let manager = Arc::new(SessionManager::new(
            registry,
            adapter,
            auth.clone(),
            Duration::from_secs(60),
        ));
        let state = AppState {
            manager,
            auth,
            rate_limiter: Arc::new(GatewayRateLimiter::new(100, 100)),
            allow_registration: true,
            max_users: 0,
        };
        (dir, state, engine)
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    async fn json_of(response: axum::response::Response) -> (StatusCode, serde_json::Value) {
        let status = response.status();
        let payload = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&payload).unwrap())
    }

    async fn register_user(state: &AppState, username: &str) -> (String, String) {
        let body = Ok(Json(AuthRegisterBody {
            username: username.into(),
            password: "password123!".into(),
        }));
        let response = handle_auth_register(State(state.clone()), body)
            .await
            .into_response();
        let (status, parsed) = json_of(response).await;
        assert_eq!(status, StatusCode::CREATED);
        (
            parsed["user_id"].as_str().unwrap().to_string(),
            parsed["token"].as_str().unwrap().to_string(),
        )
    }

    async fn poll_pairing_code(state: &AppState, headers: &HeaderMap) -> serde_json::Value {
        for _ in 0..400 {
            let response = handle_pairing_code(State(state.clone()), headers.clone())
                .await
                .into_response();
            let (status, parsed) = json_of(response).await;
            assert_eq!(status, StatusCode::OK);
            if parsed["pairing_code"].is_string() {
                return parsed;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for a pairing code");
    }

    async fn poll_until_ready(state: &AppState, headers: &HeaderMap) {
        for _ in 0..400 {
            let response = handle_status(State(state.clone()), headers.clone())
                .await
                .into_response();
            let (_, parsed) = json_of(response).await;
            if parsed["ready"] == true {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for ready");
    }

    #[tokio::test]
    async fn register_returns_token_and_fresh_status() {
        let (_dir, state, _engine) = test_state();

        let body = Ok(Json(AuthRegisterBody {
            username: "alice".into(),
            password: "password123!".into(),
        }));
        let response = handle_auth_register(State(state.clone()), body)
            .await
            .into_response();
        let (status, parsed) = json_of(response).await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(parsed["status"], "registered");
        assert_eq!(parsed["state"], "not_initialized");
        assert_eq!(parsed["ready"], false);
        assert_eq!(parsed["first_login"], true);

        // The token works immediately.
        let token = parsed["token"].as_str().unwrap();
        let response = handle_status(State(state.clone()), bearer(token))
            .await
            .into_response();
        let (status, parsed) = json_of(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parsed["state"], "not_initialized");
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let (_dir, state, _engine) = test_state();
        register_user(&state, "alice").await;

        let body = Ok(Json(AuthRegisterBody {
            username: "alice".into(),
            password: "password456!".into(),
        }));
        let response = handle_auth_register(State(state), body).await.into_response();
        let (status, _) = json_of(response).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn disabled_registration_is_forbidden() {
        let (_dir, mut state, _engine) = test_state();
        state.allow_registration = false;

        let body = Ok(Json(AuthRegisterBody {
            username: "alice".into(),
            password: "password123!".into(),
        }));
        let response = handle_auth_register(State(state), body).await.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn max_users_cap_is_enforced() {
        let (_dir, mut state, _engine) = test_state();
        state.max_users = 1;
        register_user(&state, "alice").await;

        let body = Ok(Json(AuthRegisterBody {
            username: "bob".into(),
            password: "password123!".into(),
        }));
        let response = handle_auth_register(State(state), body).await.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn login_issues_a_fresh_token() {
        let (_dir, state, _engine) = test_state();
        register_user(&state, "alice").await;

        let body = Ok(Json(AuthLoginBody {
            username: "alice".into(),
            password: "password123!".into(),
        }));
        let response = handle_auth_login(State(state.clone()), HeaderMap::new(), body)
            .await
            .into_response();
        let (status, parsed) = json_of(response).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(parsed["status"], "authenticated");
        assert_eq!(parsed["username"], "alice");
        assert_eq!(parsed["first_login"], true);
        assert!(parsed["token"].is_string());
    }

    #[tokio::test]
    async fn login_with_bad_password_is_unauthorized() {
        let (_dir, state, _engine) = test_state();
        register_user(&state, "alice").await;

        let body = Ok(Json(AuthLoginBody {
            username: "alice".into(),
            password: "wrong-password".into(),
        }));
        let response = handle_auth_login(State(state), HeaderMap::new(), body)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn login_is_rate_limited_per_client() {
        let (_dir, mut state, _engine) = test_state();
        state.rate_limiter = Arc::new(GatewayRateLimiter::new(2, 100));
        register_user(&state, "alice").await;

        for _ in 0..2 {
            let body = Ok(Json(AuthLoginBody {
                username: "alice".into(),
                password: "wrong-password".into(),
            }));
            let response = handle_auth_login(State(state.clone()), HeaderMap::new(), body)
                .await
                .into_response();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        let body = Ok(Json(AuthLoginBody {
            username: "alice".into(),
            password: "password123!".into(),
        }));
        let response = handle_auth_login(State(state), HeaderMap::new(), body)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn logout_revokes_the_token() {
        let (_dir, state, _engine) = test_state();
        let (_user_id, token) = register_user(&state, "alice").await;

        let response = handle_auth_logout(State(state.clone()), bearer(&token))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let response = handle_status(State(state.clone()), bearer(&token))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Second logout with the same token fails.
        let response = handle_auth_logout(State(state), bearer(&token))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn session_endpoints_require_a_bearer() {
        let (_dir, state, _engine) = test_state();

        let response = handle_status(State(state.clone()), HeaderMap::new())
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = handle_pairing_code(State(state.clone()), HeaderMap::new())
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = Ok(Json(SendBody {
            recipient: "+15550001111".into(),
            body: "hi".into(),
        }));
        let response = handle_send(State(state), HeaderMap::new(), body)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn pairing_status_send_flow() {
        let (_dir, state, engine) = test_state();
        let (user_id, token) = register_user(&state, "alice").await;
        let headers = bearer(&token);
        let session_id = SessionManager::session_id_for(&user_id);

        // Poll for the code; the QR presentation comes with it.
        let pairing = poll_pairing_code(&state, &headers).await;
        assert_eq!(pairing["state"], "awaiting_pairing");
        let qr_url = pairing["qr"].as_str().unwrap();
        assert!(qr_url.starts_with("data:image/png;base64,"));

        // Sending before ready is a conflict.
        let body = Ok(Json(SendBody {
            recipient: "+15550001111".into(),
            body: "too early".into(),
        }));
        let response = handle_send(State(state.clone()), headers.clone(), body)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        engine.scan(&session_id).await.unwrap();
        poll_until_ready(&state, &headers).await;

        let body = Ok(Json(SendBody {
            recipient: "+15550001111".into(),
            body: "hello".into(),
        }));
        let response = handle_send(State(state.clone()), headers.clone(), body)
            .await
            .into_response();
        let (status, parsed) = json_of(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parsed["status"], "sent");

        let outbox = engine.outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].body, "hello");

        // Transport failure maps to 502 and is not retried.
        engine.set_fail_sends(true);
        let attempts = engine.send_attempts();
        let body = Ok(Json(SendBody {
            recipient: "+15550001111".into(),
            body: "doomed".into(),
        }));
        let response = handle_send(State(state), headers, body).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(engine.send_attempts(), attempts + 1);
    }

    #[tokio::test]
    async fn send_validates_recipient_and_body() {
        let (_dir, state, _engine) = test_state();
        let (_user_id, token) = register_user(&state, "alice").await;
        let headers = bearer(&token);

        let body = Ok(Json(SendBody {
            recipient: "   ".into(),
            body: "hi".into(),
        }));
        let response = handle_send(State(state.clone()), headers.clone(), body)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = Ok(Json(SendBody {
            recipient: "+15550001111".into(),
            body: "".into(),
        }));
        let response = handle_send(State(state), headers, body).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ready_projection_without_live_session_maps_to_not_found() {
        let (_dir, state, _engine) = test_state();
        let (user_id, token) = register_user(&state, "alice").await;

        // A crashed process can leave the durable record claiming ready
        // while no session entry exists.
        state
            .auth
            .update_projection(
                &user_id,
                ProjectionPatch {
                    ready: Some(true),
                    ..ProjectionPatch::default()
                },
            )
            .unwrap();

        let body = Ok(Json(SendBody {
            recipient: "+15550001111".into(),
            body: "hi".into(),
        }));
        let response = handle_send(State(state), bearer(&token), body)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_active_sessions() {
        let (_dir, state, _engine) = test_state();
        let (_user_id, token) = register_user(&state, "alice").await;

        let response = handle_health(State(state.clone())).await.into_response();
        let (status, parsed) = json_of(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["active_sessions"], 0);

        poll_pairing_code(&state, &bearer(&token)).await;
        let response = handle_health(State(state)).await.into_response();
        let (_, parsed) = json_of(response).await;
        assert_eq!(parsed["active_sessions"], 1);
    }
}
