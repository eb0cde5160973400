use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use agent::model::DEFAULT_ENDPOINT;
use agent::orchestrator::DEFAULT_MAX_TURNS;
use agent::quota::{DEFAULT_DAILY_LIMIT, DEFAULT_PRIMARY_MODEL, DEFAULT_SECONDARY_MODEL};
use agent::tools::DEFAULT_CANONICAL_SCRIPT;
use agent::{
    bearer_token, store, AgentMetrics, Anonymous, GeminiClient, GeminiConfig, IdentityResolver,
    Orchestrator, OrchestratorConfig, QuotaPolicy, QuotaScheduler, RateDecision, RateLimitPolicy,
    RateLimiter, ScriptClearPolicy, SessionStore, ToolCallRecord, ToolDispatcher,
};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sandbox::{RunConfig, SandboxRoot, DEFAULT_RUN_TIMEOUT};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{dispatcher, error, info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use crate::identity::JwtIdentity;

mod identity;

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    limiter: RateLimiter,
    identity: Arc<dyn IdentityResolver>,
    metrics: Arc<AgentMetrics>,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    response: String,
    function_calls: Vec<ToolCallRecord>,
    session_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    let metrics = Arc::new(AgentMetrics::new()?);
    let bind_addr = resolve_bind_address()?;

    let pool = store::open(&database_path(), env_or("DATABASE_MAX_CONNECTIONS", 5)?).await?;
    let quota = QuotaScheduler::new(pool.clone(), quota_policy()?);
    let limiter = RateLimiter::new(pool, rate_limit_policy()?);
    let tools = initialize_tools()?;
    let model = initialize_model()?;
    let identity = initialize_identity()?;

    let orchestrator = Orchestrator::new(model, quota, tools, Arc::new(SessionStore::new()))
        .with_config(orchestrator_config()?)
        .with_metrics(metrics.clone());

    let state = AppState {
        orchestrator: Arc::new(orchestrator),
        limiter,
        identity,
        metrics,
    };

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "server starting");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/health", get(health))
        .route("/api/model-status", get(model_status))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

fn init_tracing() -> anyhow::Result<()> {
    if dispatcher::has_been_set() {
        return Ok(());
    }

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().json();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid {key} value '{raw}': {err}")),
        _ => Ok(default),
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn resolve_bind_address() -> anyhow::Result<SocketAddr> {
    let raw = env_string("API_BIND_ADDR", "0.0.0.0:8000");
    Ok(raw.parse()?)
}

fn database_path() -> PathBuf {
    PathBuf::from(env_string("DATABASE_PATH", "data/singularity.db"))
}

fn quota_policy() -> anyhow::Result<QuotaPolicy> {
    Ok(QuotaPolicy {
        daily_limit: env_or("QUOTA_DAILY_LIMIT", DEFAULT_DAILY_LIMIT)?,
        primary_model: env_string("QUOTA_PRIMARY_MODEL", DEFAULT_PRIMARY_MODEL),
        secondary_model: env_string("QUOTA_SECONDARY_MODEL", DEFAULT_SECONDARY_MODEL),
    })
}

fn rate_limit_policy() -> anyhow::Result<RateLimitPolicy> {
    let defaults = RateLimitPolicy::default();
    Ok(RateLimitPolicy {
        max_requests: env_or("RATE_LIMIT_REQUESTS", defaults.max_requests)?,
        window: Duration::from_secs(env_or("RATE_LIMIT_WINDOW_SECS", defaults.window.as_secs())?),
        cooldown: Duration::from_secs(env_or(
            "RATE_LIMIT_COOLDOWN_SECS",
            defaults.cooldown.as_secs(),
        )?),
    })
}

fn orchestrator_config() -> anyhow::Result<OrchestratorConfig> {
    let defaults = OrchestratorConfig::default();
    let max_turns = env_or("AGENT_MAX_TURNS", DEFAULT_MAX_TURNS)?;
    if max_turns == 0 {
        anyhow::bail!("AGENT_MAX_TURNS must be at least 1");
    }
    Ok(OrchestratorConfig {
        max_turns,
        system_instruction: env_string("AGENT_SYSTEM_INSTRUCTION", &defaults.system_instruction),
    })
}

fn initialize_tools() -> anyhow::Result<ToolDispatcher> {
    let root = SandboxRoot::new(sandbox_root()?)?;
    let timeout_ms = env_or("SANDBOX_RUN_TIMEOUT_MS", DEFAULT_RUN_TIMEOUT.as_millis() as u64)?;
    let config = RunConfig::new(
        root,
        env_string("SANDBOX_INTERPRETER", "python3"),
        env_string("SANDBOX_SCRIPT_EXTENSION", "py"),
        Duration::from_millis(timeout_ms),
    )?;
    let clear_policy: ScriptClearPolicy = env_string("SANDBOX_CLEAR_POLICY", "every").parse()?;
    info!(
        root = %config.root().as_path().display(),
        interpreter = config.interpreter(),
        timeout_ms,
        ?clear_policy,
        "sandbox ready"
    );
    Ok(ToolDispatcher::new(config)
        .with_canonical_script(env_string("SANDBOX_CANONICAL_SCRIPT", DEFAULT_CANONICAL_SCRIPT))
        .with_clear_policy(clear_policy))
}

fn sandbox_root() -> anyhow::Result<PathBuf> {
    let path = PathBuf::from(env_string("SANDBOX_ROOT", "./sandbox"));
    if path.is_absolute() {
        Ok(path)
    } else {
        let cwd = std::env::current_dir()?;
        Ok(cwd.join(path))
    }
}

fn initialize_model() -> anyhow::Result<Arc<GeminiClient>> {
    let api_key = std::env::var("GEMINI_API_KEY")
        .map_err(|_| anyhow::anyhow!("GEMINI_API_KEY environment variable is required"))?;
    let config = GeminiConfig {
        endpoint: env_string("GEMINI_ENDPOINT", DEFAULT_ENDPOINT),
        api_key,
        timeout: Duration::from_millis(env_or("GEMINI_TIMEOUT_MS", 60_000u64)?),
    };
    Ok(Arc::new(GeminiClient::new(config)?))
}

fn initialize_identity() -> anyhow::Result<Arc<dyn IdentityResolver>> {
    match std::env::var("API_JWT_SECRET") {
        Ok(secret) if !secret.is_empty() => {
            let issuer = std::env::var("API_JWT_ISSUER").ok();
            Ok(Arc::new(JwtIdentity::new(secret.as_bytes(), issuer)))
        }
        _ => {
            warn!("API_JWT_SECRET not set; every caller is anonymous and rate limits are off");
            Ok(Arc::new(Anonymous))
        }
    }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn model_status(State(state): State<AppState>) -> Response {
    match state.orchestrator.quota().status().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(err) => {
            error!(%err, "failed to read quota status");
            internal_error()
        }
    }
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => {
            error!(%err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    let user = resolve_user(&state, &headers).await;

    match state.limiter.check(user.as_deref()).await {
        Ok(RateDecision::Allowed) => {}
        Ok(RateDecision::Limited { retry_after }) => {
            state.metrics.record_rate_limited();
            info!(user = user.as_deref(), wait_secs = retry_after.as_secs(), "chat request rate limited");
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "detail": format!("Rate limited. Please wait {} seconds.", retry_after.as_secs())
                })),
            )
                .into_response();
        }
        Err(err) => {
            error!(%err, "rate limit check failed");
            return internal_error();
        }
    }
    if let Err(err) = state.limiter.record(user.as_deref()).await {
        error!(%err, "failed to record chat request");
        return internal_error();
    }

    let session_id = request
        .session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let outcome = state
        .orchestrator
        .respond(&session_id, &request.message)
        .await;

    Json(ChatResponse {
        response: outcome.reply,
        function_calls: outcome.tool_calls,
        session_id,
    })
    .into_response()
}

async fn resolve_user(state: &AppState, headers: &HeaderMap) -> Option<String> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    let token = bearer_token(header)?;
    state.identity.resolve(token).await
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "detail": "internal server error" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent::{ModelClient, ModelError, ModelRequest, ModelResponse};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const SECRET: &[u8] = b"test-secret";

    struct Echo;

    #[async_trait::async_trait]
    impl ModelClient for Echo {
        async fn generate(&self, request: &ModelRequest<'_>) -> Result<ModelResponse, ModelError> {
            let last = request.turns.last().and_then(|turn| turn.text()).unwrap_or_default();
            Ok(ModelResponse::text(format!("echo: {last}")))
        }
    }

    async fn app() -> (TempDir, Router) {
        let temp = tempfile::tempdir().unwrap();
        let pool = store::in_memory().await.unwrap();
        let root = SandboxRoot::new(temp.path().join("sandbox")).unwrap();
        let tools = ToolDispatcher::new(RunConfig::python(root).unwrap());
        let orchestrator = Orchestrator::new(
            Arc::new(Echo),
            QuotaScheduler::new(pool.clone(), QuotaPolicy::default()),
            tools,
            Arc::new(SessionStore::new()),
        );
        let state = AppState {
            orchestrator: Arc::new(orchestrator),
            limiter: RateLimiter::new(pool, RateLimitPolicy::default()),
            identity: Arc::new(JwtIdentity::new(SECRET, None)),
            metrics: Arc::new(AgentMetrics::new().unwrap()),
        };
        (temp, router(state))
    }

    fn token(sub: &str) -> String {
        let exp = (chrono::Utc::now().timestamp() + 3600) as usize;
        encode(
            &Header::default(),
            &json!({ "sub": sub, "exp": exp }),
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    fn chat_request(body: Value, bearer: Option<&str>) -> Request<Body> {
        let mut builder = Request::post("/api/chat").header("content-type", "application/json");
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn chat_returns_reply_and_session() {
        let (_temp, app) = app().await;
        let response = app
            .oneshot(chat_request(json!({ "message": "hi", "session_id": "abc" }), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["response"], "echo: hi");
        assert_eq!(body["session_id"], "abc");
        assert_eq!(body["function_calls"], json!([]));
    }

    #[tokio::test]
    async fn chat_generates_session_id_when_missing() {
        let (_temp, app) = app().await;
        let response = app
            .oneshot(chat_request(json!({ "message": "hi" }), None))
            .await
            .unwrap();
        let body = json_body(response).await;
        let id = body["session_id"].as_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn fifth_authenticated_request_is_limited() {
        let (_temp, app) = app().await;
        let token = token("user-1");
        for _ in 0..4 {
            let response = app
                .clone()
                .oneshot(chat_request(json!({ "message": "hi" }), Some(&token)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app
            .clone()
            .oneshot(chat_request(json!({ "message": "hi" }), Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = json_body(response).await;
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.starts_with("Rate limited. Please wait "));
        assert!(detail.ends_with(" seconds."));

        // invalid tokens fall back to anonymous, which is never limited
        let response = app
            .oneshot(chat_request(json!({ "message": "hi" }), Some("not-a-jwt")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_and_model_status() {
        let (_temp, app) = app().await;
        let health = app
            .clone()
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(health).await, json!({ "status": "ok" }));

        let status = app
            .oneshot(Request::get("/api/model-status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(status.status(), StatusCode::OK);
        let body = json_body(status).await;
        assert_eq!(body["current_tier"], "primary");
        assert_eq!(body["daily_limit"], 20);
    }
}
