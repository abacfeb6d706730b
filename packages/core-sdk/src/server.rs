use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, Path, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, get_service, post},
    Json, Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::{
    config::ServerConfig,
    db,
    error::{ChatError, ChatResult},
    models::{ChatRequestBody, Profile, ProviderKind},
    providers::provider_for,
    relay::{open_relay, RelayContext},
    telemetry,
};

/**
 * \brief 请求间共享的只读状态。
 */
pub struct AppState {
    pub config: ServerConfig,
    /** \brief 复用连接池的 HTTP 客户端 */
    pub client: reqwest::Client,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

/**
 * \brief 构建路由，便于在测试中直接驱动。
 */
pub fn router(state: Arc<AppState>) -> Router {
    let ui_dir = state.config.ui_dir.clone();
    let body_limit = state.config.max_body_bytes;
    let app = Router::new()
        .route("/api/chat/{provider}", post(chat))
        .route("/api/assistants/{provider}", get(list_assistants))
        .route("/api/health", get(health_check))
        .route(
            "/api/profile",
            get(get_profile).put(put_profile).delete(delete_profile),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state);

    let app = match ui_dir {
        Some(dir) if dir.exists() => app.fallback_service(get_service(
            ServeDir::new(dir).append_index_html_on_directories(true),
        )),
        _ => app,
    };
    app.layer(TraceLayer::new_for_http())
}

/**
 * \brief 启动 HTTP 服务。
 * \details 启动前先迁移档案库，路径不可用时直接失败。
 */
pub async fn run(config: ServerConfig) -> Result<()> {
    db::open(&config.db_path)
        .with_context(|| format!("open profile store {}", config.db_path.display()))?;
    let addr = config.addr.clone();
    let user_header = config.user_header.clone();
    let app = router(Arc::new(AppState::new(config)));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    let local = listener.local_addr()?;
    telemetry::log_event("server.start", &format!("listening on http://{}", local));
    if !is_loopback(&local) {
        telemetry::log_warning(
            "server.start",
            &format!(
                "bound to non-loopback {}; the {} header is trusted as-is, keep this behind an identity proxy",
                local, user_header
            ),
        );
    }
    axum::serve(listener, app).await?;
    Ok(())
}

fn is_loopback(addr: &SocketAddr) -> bool {
    addr.ip().is_loopback()
}

/**
 * \brief 流式对话：成功时以 `text/plain` 分块返回生成文本。
 */
async fn chat(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> ChatResult<Response> {
    let kind: ProviderKind = provider.parse()?;
    let body = body?;
    let body: ChatRequestBody = serde_json::from_slice(&body)
        .map_err(|e| ChatError::MalformedRequestBody(e.to_string()))?;
    let profile = caller_profile(&state, &headers).await?;

    let provider = provider_for(kind, &state.config.endpoints, state.client.clone());
    let ctx = RelayContext {
        profile: profile.as_ref(),
        credentials: &state.config.credentials,
        directive_path: &state.config.directive_path,
    };
    let relay = open_relay(provider.as_ref(), ctx, &body).await?;
    Ok((
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        relay.into_body(),
    )
        .into_response())
}

async fn list_assistants(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> ChatResult<Json<Value>> {
    let kind: ProviderKind = provider.parse()?;
    let profile = caller_profile(&state, &headers).await?;
    let provider = provider_for(kind, &state.config.endpoints, state.client.clone());
    let credential = provider.resolve_credential(profile.as_ref(), &state.config.credentials)?;
    let assistants = provider.list_assistants(&credential).await?;
    Ok(Json(json!({ "assistants": assistants })))
}

#[derive(Serialize, Debug)]
struct ProviderStatus {
    id: &'static str,
    name: &'static str,
    /** \brief 进程环境中是否配置了密钥 */
    env_configured: bool,
}

/**
 * \brief 健康检查：列出支持的 Provider 及环境凭据情况，不访问上游。
 */
async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let providers: Vec<ProviderStatus> = ProviderKind::ALL
        .into_iter()
        .map(|kind| ProviderStatus {
            id: kind.as_str(),
            name: kind.display_name(),
            env_configured: state.config.credentials.api_key_for(kind).is_some(),
        })
        .collect();
    Json(json!({ "ok": true, "providers": providers }))
}

/**
 * \brief PUT /api/profile 的请求体，整体替换已保存的档案。
 */
#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct ProfileInput {
    display_name: String,
    openai_api_key: Option<String>,
    openai_organization_id: Option<String>,
    azure_openai_api_key: Option<String>,
    azure_openai_endpoint: Option<String>,
    azure_openai_35_turbo_id: Option<String>,
    azure_openai_45_turbo_id: Option<String>,
    azure_openai_45_vision_id: Option<String>,
    anthropic_api_key: Option<String>,
    google_gemini_api_key: Option<String>,
    mistral_api_key: Option<String>,
    groq_api_key: Option<String>,
    perplexity_api_key: Option<String>,
    openrouter_api_key: Option<String>,
}

impl ProfileInput {
    fn into_profile(self, user_id: String) -> Profile {
        Profile {
            user_id,
            display_name: self.display_name,
            openai_api_key: self.openai_api_key,
            openai_organization_id: self.openai_organization_id,
            azure_openai_api_key: self.azure_openai_api_key,
            azure_openai_endpoint: self.azure_openai_endpoint,
            azure_openai_35_turbo_id: self.azure_openai_35_turbo_id,
            azure_openai_45_turbo_id: self.azure_openai_45_turbo_id,
            azure_openai_45_vision_id: self.azure_openai_45_vision_id,
            anthropic_api_key: self.anthropic_api_key,
            google_gemini_api_key: self.google_gemini_api_key,
            mistral_api_key: self.mistral_api_key,
            groq_api_key: self.groq_api_key,
            perplexity_api_key: self.perplexity_api_key,
            openrouter_api_key: self.openrouter_api_key,
            updated_at: None,
        }
    }
}

/**
 * \brief 对外展示的档案：密钥只返回是否已设置。
 */
#[derive(Serialize, Debug)]
struct ProfileView {
    user_id: String,
    display_name: String,
    openai_organization_id: Option<String>,
    azure_openai_endpoint: Option<String>,
    azure_openai_35_turbo_id: Option<String>,
    azure_openai_45_turbo_id: Option<String>,
    azure_openai_45_vision_id: Option<String>,
    /** \brief Provider 标识 → 是否已设置密钥 */
    keys: serde_json::Map<String, Value>,
    updated_at: Option<String>,
}

impl From<Profile> for ProfileView {
    fn from(profile: Profile) -> Self {
        let keys = ProviderKind::ALL
            .into_iter()
            .map(|kind| {
                (
                    kind.as_str().to_string(),
                    Value::Bool(profile.api_key_for(kind).is_some()),
                )
            })
            .collect();
        Self {
            keys,
            user_id: profile.user_id,
            display_name: profile.display_name,
            openai_organization_id: profile.openai_organization_id,
            azure_openai_endpoint: profile.azure_openai_endpoint,
            azure_openai_35_turbo_id: profile.azure_openai_35_turbo_id,
            azure_openai_45_turbo_id: profile.azure_openai_45_turbo_id,
            azure_openai_45_vision_id: profile.azure_openai_45_vision_id,
            updated_at: profile.updated_at,
        }
    }
}

async fn get_profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ChatResult<Response> {
    let user_id = caller_id(&state, &headers).ok_or(ChatError::Unauthenticated)?;
    let found = with_store(&state, move |conn| db::get_profile(conn, &user_id)).await?;
    Ok(match found {
        Some(profile) => Json(ProfileView::from(profile)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": "Profile not found" })),
        )
            .into_response(),
    })
}

async fn put_profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> ChatResult<Json<ProfileView>> {
    let user_id = caller_id(&state, &headers).ok_or(ChatError::Unauthenticated)?;
    let body = body?;
    let input: ProfileInput = serde_json::from_slice(&body)
        .map_err(|e| ChatError::MalformedRequestBody(e.to_string()))?;
    let profile = input.into_profile(user_id);
    let stored = with_store(&state, move |conn| db::upsert_profile(conn, &profile)).await?;
    telemetry::log_event("server.profile", &format!("upsert user={}", stored.user_id));
    Ok(Json(ProfileView::from(stored)))
}

async fn delete_profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ChatResult<Json<Value>> {
    let user_id = caller_id(&state, &headers).ok_or(ChatError::Unauthenticated)?;
    let id = user_id.clone();
    let deleted = with_store(&state, move |conn| db::delete_profile(conn, &id)).await?;
    telemetry::log_event(
        "server.profile",
        &format!("delete user={} existed={}", user_id, deleted),
    );
    Ok(Json(json!({ "deleted": deleted })))
}

fn caller_id(state: &AppState, headers: &HeaderMap) -> Option<String> {
    headers
        .get(state.config.user_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/**
 * \brief 读取调用方档案；匿名请求返回 None，只使用环境凭据。
 */
async fn caller_profile(state: &AppState, headers: &HeaderMap) -> ChatResult<Option<Profile>> {
    match caller_id(state, headers) {
        Some(user_id) => with_store(state, move |conn| db::get_profile(conn, &user_id)).await,
        None => Ok(None),
    }
}

/**
 * \brief 在阻塞线程池中打开档案库并执行操作。
 */
async fn with_store<T, F>(state: &AppState, action: F) -> ChatResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
{
    let path = state.config.db_path.clone();
    tokio::task::spawn_blocking(move || {
        let conn = db::open(&path)?;
        action(&conn)
    })
    .await
    .map_err(|e| ChatError::Storage(e.into()))?
    .map_err(ChatError::Storage)
}
