use axum::{
    extract::rejection::BytesRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::{models::ProviderKind, telemetry};

pub type ChatResult<T> = Result<T, ChatError>;

const GENERIC_MESSAGE: &str = "An unexpected error occurred";
const TRANSPORT_MESSAGE: &str = "Could not reach the AI provider. Please try again later.";

/**
 * \brief 代理管线的错误分类。
 * \details 凭据缺失与请求体错误在调用 Provider 之前即可判定；
 *          凭据无效与上游错误只能在 Provider 响应后得出。
 */
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{provider} API key not found")]
    MissingCredential { provider: ProviderKind },

    #[error("{provider} rejected the API key ({status}): {message}")]
    InvalidCredential {
        provider: ProviderKind,
        status: u16,
        message: String,
    },

    #[error("upstream error {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("malformed request body: {0}")]
    MalformedRequestBody(String),

    #[error("request body too large: {0}")]
    PayloadTooLarge(String),

    /** \brief 非致命：只记录日志，从不返回给客户端。 */
    #[error("resource unavailable at {path}: {reason}")]
    ResourceUnavailable { path: String, reason: String },

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("{operation} is not supported by {provider}")]
    Unsupported {
        provider: ProviderKind,
        operation: &'static str,
    },

    #[error("missing user identity")]
    Unauthenticated,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("storage error: {0}")]
    Storage(anyhow::Error),
}

impl ChatError {
    /**
     * \brief 按 Provider 的错误响应归类：401 或密钥相关文案视为凭据无效。
     */
    pub fn from_vendor_response(provider: ProviderKind, status: u16, body: &str) -> Self {
        let message = vendor_message(body);
        let lowered = message.to_ascii_lowercase();
        let key_rejected = status == 401
            || [
                "incorrect api key",
                "invalid api key",
                "invalid x-api-key",
                "api key not valid",
            ]
            .iter()
            .any(|needle| lowered.contains(needle));
        if key_rejected {
            ChatError::InvalidCredential {
                provider,
                status,
                message,
            }
        } else {
            ChatError::Upstream { status, message }
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::MissingCredential { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ChatError::InvalidCredential { status, .. } | ChatError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ChatError::MalformedRequestBody(_) | ChatError::Unsupported { .. } => {
                StatusCode::BAD_REQUEST
            }
            ChatError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ChatError::UnknownProvider(_) => StatusCode::NOT_FOUND,
            ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ChatError::Transport(_) => StatusCode::BAD_GATEWAY,
            ChatError::ResourceUnavailable { .. } | ChatError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /** \brief 返回给客户端的可读文案。 */
    pub fn user_message(&self) -> String {
        match self {
            ChatError::MissingCredential { provider } => format!(
                "{} API Key not found. Please set it in your profile settings or as an environment variable.",
                provider
            ),
            ChatError::InvalidCredential { provider, .. } => format!(
                "{} API Key is incorrect. Please fix it in your profile settings or environment.",
                provider
            ),
            ChatError::Upstream { message, .. } if !message.trim().is_empty() => message.clone(),
            ChatError::Upstream { .. } => GENERIC_MESSAGE.to_string(),
            ChatError::Unauthenticated => {
                "A user identity is required for profile operations.".to_string()
            }
            ChatError::PayloadTooLarge(_) => {
                "Request body is too large. Try a smaller image or a shorter conversation."
                    .to_string()
            }
            // 细节只进日志，reqwest 文案里带有上游地址
            ChatError::Transport(_) => TRANSPORT_MESSAGE.to_string(),
            ChatError::ResourceUnavailable { .. } | ChatError::Storage(_) => {
                GENERIC_MESSAGE.to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            telemetry::log_error("server.error", &self.to_string());
        } else {
            telemetry::log_event("server.error", &self.to_string());
        }
        (status, Json(json!({ "message": self.user_message() }))).into_response()
    }
}

/**
 * \brief 请求体读取失败：超出上限为 413，其余按请求体错误处理。
 */
impl From<BytesRejection> for ChatError {
    fn from(rejection: BytesRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ChatError::PayloadTooLarge(rejection.body_text())
        } else {
            ChatError::MalformedRequestBody(rejection.body_text())
        }
    }
}

/**
 * \brief 从各家错误体中取出 message。
 * \details OpenAI/Gemini/Anthropic 均为 `{"error": {"message": ...}}`；其余情况退回原文。
 */
fn vendor_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let nested = value
            .get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .and_then(Value::as_str);
        if let Some(message) = nested.or_else(|| value.get("message").and_then(Value::as_str)) {
            return message.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        GENERIC_MESSAGE.to_string()
    } else {
        trimmed.to_string()
    }
}
