//! Provider 适配层：每个协议族一个实现，由路由中的 Provider 标识选择。

mod anthropic;
mod azure;
mod gemini;
mod openai;

pub use anthropic::Anthropic;
pub use azure::AzureOpenAi;
pub use gemini::Gemini;
pub use openai::OpenAiCompatible;

use async_trait::async_trait;
use reqwest::header::HeaderValue;
use serde_json::Value;

use crate::{
    compose::ComposedRequest,
    config::{EnvCredentials, ProviderEndpoints},
    credential::{self, Credential},
    error::{ChatError, ChatResult},
    models::{Profile, ProviderKind},
    sse::TextStream,
};

/**
 * \brief 映射到 Provider 线格式的请求。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct VendorRequest {
    /** \brief 模型名；Azure/Gemini 需要放在 URL 中 */
    pub model: String,
    /** \brief 请求体 */
    pub body: Value,
}

impl VendorRequest {
    /** \brief 序列化请求体，组装结果相同时字节一致。 */
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.body)
    }
}

/**
 * \brief Provider 能力接口：解析凭据、组装请求、发起流式补全。
 */
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn resolve_credential(
        &self,
        profile: Option<&Profile>,
        env: &EnvCredentials,
    ) -> ChatResult<Credential> {
        credential::resolve(self.kind(), profile, env)
    }

    fn compose_request(&self, request: &ComposedRequest) -> VendorRequest;

    async fn stream_completion(
        &self,
        credential: &Credential,
        request: VendorRequest,
    ) -> ChatResult<TextStream>;

    async fn list_assistants(&self, _credential: &Credential) -> ChatResult<Vec<Value>> {
        Err(ChatError::Unsupported {
            provider: self.kind(),
            operation: "listing assistants",
        })
    }
}

/**
 * \brief 按标识构造 Provider 实例。
 */
pub fn provider_for(
    kind: ProviderKind,
    endpoints: &ProviderEndpoints,
    client: reqwest::Client,
) -> Box<dyn ChatProvider> {
    let base = endpoints.base_url(kind).unwrap_or_default().to_string();
    match kind {
        ProviderKind::Azure => Box::new(AzureOpenAi::new(client)),
        ProviderKind::Anthropic => Box::new(Anthropic::new(base, client)),
        ProviderKind::Google => Box::new(Gemini::new(base, client)),
        ProviderKind::OpenAI
        | ProviderKind::Mistral
        | ProviderKind::Groq
        | ProviderKind::Perplexity
        | ProviderKind::OpenRouter => Box::new(OpenAiCompatible::new(kind, base, client)),
    }
}

/**
 * \brief 发送请求；非 2xx 时读取错误体并归类。
 */
pub(crate) async fn send_checked(
    kind: ProviderKind,
    request: reqwest::RequestBuilder,
) -> ChatResult<reqwest::Response> {
    let resp = request.send().await?;
    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(ChatError::from_vendor_response(kind, status, &text));
    }
    Ok(resp)
}

/**
 * \brief 把密钥转为请求头值。
 * \details 含有请求头不允许的字符时视为凭据无效，不发出请求。
 */
pub(crate) fn key_header(kind: ProviderKind, value: &str) -> ChatResult<HeaderValue> {
    let mut header = HeaderValue::from_str(value).map_err(|_| ChatError::InvalidCredential {
        provider: kind,
        status: 401,
        message: "API key contains characters not allowed in a header".to_string(),
    })?;
    header.set_sensitive(true);
    Ok(header)
}

/**
 * \brief 解析 `data:image/png;base64,...` 形式的图片地址。
 */
pub(crate) fn split_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64")?;
    Some((media_type, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_for_covers_every_kind() {
        let endpoints = ProviderEndpoints::default();
        for kind in ProviderKind::ALL {
            let provider = provider_for(kind, &endpoints, reqwest::Client::new());
            assert_eq!(provider.kind(), kind);
        }
    }

    #[test]
    fn test_split_data_url() {
        assert_eq!(
            split_data_url("data:image/jpeg;base64,AAAA"),
            Some(("image/jpeg", "AAAA"))
        );
        assert_eq!(split_data_url("https://example.com/cat.png"), None);
    }

    #[test]
    fn test_key_header_rejects_control_characters() {
        let header = key_header(ProviderKind::Groq, "gsk-ok").expect("valid key");
        assert!(header.is_sensitive());
        let err = key_header(ProviderKind::Groq, "gsk-bad\nkey").expect_err("newline");
        assert!(matches!(
            err,
            ChatError::InvalidCredential {
                provider: ProviderKind::Groq,
                status: 401,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_bad_key_is_invalid_credential_for_every_provider() {
        let endpoints = ProviderEndpoints::all_at("http://127.0.0.1:9");
        let request = VendorRequest {
            model: "m".into(),
            body: serde_json::json!({}),
        };
        for kind in ProviderKind::ALL {
            let provider = provider_for(kind, &endpoints, reqwest::Client::new());
            let credential = Credential {
                provider: kind,
                api_key: "sk-pasted\r\nwith-newline".into(),
                organization: None,
                endpoint: Some("http://127.0.0.1:9".into()),
                deployments: Default::default(),
                source: credential::CredentialSource::Environment,
            };
            let err = match provider.stream_completion(&credential, request.clone()).await {
                Ok(_) => panic!("{} accepted a key with a newline", kind),
                Err(err) => err,
            };
            assert!(
                matches!(err, ChatError::InvalidCredential { status: 401, .. }),
                "{}: {:?}",
                kind,
                err
            );
        }
    }
}
