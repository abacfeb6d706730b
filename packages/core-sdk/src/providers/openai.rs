use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use super::{key_header, send_checked, ChatProvider, VendorRequest};
use crate::{
    compose::ComposedRequest,
    credential::Credential,
    error::{ChatError, ChatResult},
    models::ProviderKind,
    sse::{text_deltas, Delta, TextStream},
};

/**
 * \brief OpenAI 兼容协议：OpenAI、Mistral、Groq、Perplexity、OpenRouter。
 */
pub struct OpenAiCompatible {
    kind: ProviderKind,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiCompatible {
    pub fn new(kind: ProviderKind, base_url: String, client: reqwest::Client) -> Self {
        Self {
            kind,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn chat_url(&self) -> String {
        match self.kind {
            ProviderKind::Perplexity => format!("{}/chat/completions", self.base_url),
            _ => format!("{}/v1/chat/completions", self.base_url),
        }
    }

    fn bearer(&self, credential: &Credential) -> ChatResult<HeaderValue> {
        key_header(self.kind, &format!("Bearer {}", credential.api_key))
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatible {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn compose_request(&self, request: &ComposedRequest) -> VendorRequest {
        VendorRequest {
            model: request.model.clone(),
            body: chat_body(request),
        }
    }

    async fn stream_completion(
        &self,
        credential: &Credential,
        request: VendorRequest,
    ) -> ChatResult<TextStream> {
        let mut builder = self
            .client
            .post(self.chat_url())
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, self.bearer(credential)?)
            .json(&request.body);
        if let Some(org) = credential.organization.as_deref() {
            builder = builder.header("OpenAI-Organization", org);
        }
        let resp = send_checked(self.kind, builder).await?;
        Ok(text_deltas(resp.bytes_stream(), parse_chat_delta))
    }

    async fn list_assistants(&self, credential: &Credential) -> ChatResult<Vec<Value>> {
        if self.kind != ProviderKind::OpenAI {
            return Err(ChatError::Unsupported {
                provider: self.kind,
                operation: "listing assistants",
            });
        }
        let mut builder = self
            .client
            .get(format!("{}/v1/assistants", self.base_url))
            .query(&[("limit", "100")])
            .header(AUTHORIZATION, self.bearer(credential)?)
            .header("OpenAI-Beta", "assistants=v2");
        if let Some(org) = credential.organization.as_deref() {
            builder = builder.header("OpenAI-Organization", org);
        }
        let resp = send_checked(self.kind, builder).await?;
        let payload: Value = resp.json().await?;
        Ok(assistant_list(payload))
    }
}

/**
 * \brief Chat Completions 请求体，Azure 共用。
 */
pub(crate) fn chat_body(request: &ComposedRequest) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": request.messages,
        "temperature": request.temperature,
        "stream": request.stream,
    });
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    body
}

pub(crate) fn parse_chat_delta(data: &str) -> Delta {
    if data.trim() == "[DONE]" {
        return Delta::Done;
    }
    let Ok(v) = serde_json::from_str::<Value>(data) else {
        return Delta::Skip;
    };
    if let Some(err) = v.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("stream error")
            .to_string();
        return Delta::Failed(message);
    }
    match v
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
    {
        Some(text) if !text.is_empty() => Delta::Text(text.to_string()),
        _ => Delta::Skip,
    }
}

pub(crate) fn assistant_list(payload: Value) -> Vec<Value> {
    match payload {
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        Value::Array(items) => items,
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compose::compose,
        models::{ChatSettings, Message},
    };

    fn composed(model: &str) -> ComposedRequest {
        let settings = ChatSettings {
            model: model.to_string(),
            temperature: 0.7,
            token_budget: None,
        };
        compose(&settings, "FAQ", &[Message::user("hi")])
    }

    #[test]
    fn test_body_omits_ceiling_for_plain_models() {
        let body = chat_body(&composed("gpt-3.5-turbo"));
        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["temperature"], json!(0.7));
        assert_eq!(
            body["messages"],
            json!([
                {"role": "system", "content": "FAQ"},
                {"role": "user", "content": "hi"}
            ])
        );
    }

    #[test]
    fn test_body_sets_ceiling_for_vision_models() {
        let body = chat_body(&composed("gpt-4o"));
        assert_eq!(body["max_tokens"], json!(4096));
    }

    #[test]
    fn test_compose_is_byte_identical() {
        let provider = OpenAiCompatible::new(
            ProviderKind::OpenAI,
            "https://api.openai.com".into(),
            reqwest::Client::new(),
        );
        let first = provider.compose_request(&composed("gpt-4o"));
        let second = provider.compose_request(&composed("gpt-4o"));
        assert_eq!(
            first.to_bytes().expect("serialize"),
            second.to_bytes().expect("serialize")
        );
    }

    #[test]
    fn test_parse_chat_delta() {
        assert_eq!(
            parse_chat_delta(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#),
            Delta::Text("Hel".into())
        );
        assert_eq!(
            parse_chat_delta(r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#),
            Delta::Skip
        );
        assert_eq!(parse_chat_delta("[DONE]"), Delta::Done);
        assert_eq!(
            parse_chat_delta(r#"{"error":{"message":"server overloaded"}}"#),
            Delta::Failed("server overloaded".into())
        );
    }

    #[test]
    fn test_chat_url_per_vendor() {
        let client = reqwest::Client::new();
        let perplexity = OpenAiCompatible::new(
            ProviderKind::Perplexity,
            "https://api.perplexity.ai/".into(),
            client.clone(),
        );
        assert_eq!(perplexity.chat_url(), "https://api.perplexity.ai/chat/completions");
        let groq = OpenAiCompatible::new(
            ProviderKind::Groq,
            "https://api.groq.com/openai".into(),
            client,
        );
        assert_eq!(groq.chat_url(), "https://api.groq.com/openai/v1/chat/completions");
    }
}
