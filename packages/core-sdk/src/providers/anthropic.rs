use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};

use super::{key_header, send_checked, split_data_url, ChatProvider, VendorRequest};
use crate::{
    compose::ComposedRequest,
    credential::Credential,
    error::ChatResult,
    models::{ContentPart, Message, MessageContent, ProviderKind, Role},
    sse::{text_deltas, Delta, TextStream},
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
/** \brief Messages API 要求显式 max_tokens。 */
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct Anthropic {
    base_url: String,
    client: reqwest::Client,
}

impl Anthropic {
    pub fn new(base_url: String, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl ChatProvider for Anthropic {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn compose_request(&self, request: &ComposedRequest) -> VendorRequest {
        let (system_prompt, messages) = anthropic_payload(&request.messages);
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "temperature": request.temperature,
            "messages": messages,
            "stream": request.stream,
        });
        if let Some(sys) = system_prompt {
            body["system"] = json!(sys);
        }
        VendorRequest {
            model: request.model.clone(),
            body,
        }
    }

    async fn stream_completion(
        &self,
        credential: &Credential,
        request: VendorRequest,
    ) -> ChatResult<TextStream> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            key_header(ProviderKind::Anthropic, &credential.api_key)?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );

        let builder = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .headers(headers)
            .json(&request.body);
        let resp = send_checked(ProviderKind::Anthropic, builder).await?;
        Ok(text_deltas(resp.bytes_stream(), parse_anthropic_event))
    }
}

/**
 * \brief system 消息按原序以空行拼接进 `system` 字段，其余消息转为内容块。
 */
fn anthropic_payload(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut items = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(msg.content.text()),
            Role::Assistant => items.push(json!({
                "role": "assistant",
                "content": content_blocks(&msg.content),
            })),
            Role::User => items.push(json!({
                "role": "user",
                "content": content_blocks(&msg.content),
            })),
        }
    }
    let system_prompt = system_parts.join("\n\n");
    let system_prompt = if system_prompt.trim().is_empty() {
        None
    } else {
        Some(system_prompt)
    };
    (system_prompt, items)
}

fn content_blocks(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(text) => vec![json!({"type": "text", "text": text})],
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({"type": "text", "text": text}),
                ContentPart::ImageUrl { image_url } => match split_data_url(&image_url.url) {
                    Some((media_type, data)) => json!({
                        "type": "image",
                        "source": {"type": "base64", "media_type": media_type, "data": data}
                    }),
                    None => json!({
                        "type": "image",
                        "source": {"type": "url", "url": image_url.url}
                    }),
                },
            })
            .collect(),
    }
}

fn parse_anthropic_event(data: &str) -> Delta {
    let Ok(v) = serde_json::from_str::<Value>(data) else {
        return Delta::Skip;
    };
    match v.get("type").and_then(Value::as_str) {
        Some("content_block_delta") => match v
            .get("delta")
            .and_then(|d| d.get("text"))
            .and_then(Value::as_str)
        {
            Some(text) if !text.is_empty() => Delta::Text(text.to_string()),
            _ => Delta::Skip,
        },
        Some("message_stop") => Delta::Done,
        Some("error") => Delta::Failed(
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("stream error")
                .to_string(),
        ),
        _ => Delta::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compose::compose,
        models::{ChatSettings, ImageUrl},
    };

    #[test]
    fn test_payload_moves_system_text_in_order() {
        let settings = ChatSettings {
            model: "claude-3-haiku-20240307".into(),
            temperature: 0.5,
            token_budget: None,
        };
        let caller = vec![Message::system("be brief"), Message::user("hi")];
        let composed = compose(&settings, "FAQ", &caller);
        let req = Anthropic::new("https://api.anthropic.com".into(), reqwest::Client::new())
            .compose_request(&composed);
        assert_eq!(req.body["system"], json!("FAQ\n\nbe brief"));
        assert_eq!(req.body["max_tokens"], json!(4096));
        assert_eq!(req.body["stream"], json!(true));
        assert_eq!(
            req.body["messages"],
            json!([{"role": "user", "content": [{"type": "text", "text": "hi"}]}])
        );
    }

    #[test]
    fn test_empty_directive_omits_system() {
        let (system, items) = anthropic_payload(&[Message::system(""), Message::user("hi")]);
        assert!(system.is_none());
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_image_parts_become_base64_blocks() {
        let content = MessageContent::Parts(vec![ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: "data:image/png;base64,AAAA".into(),
                detail: None,
            },
        }]);
        let blocks = content_blocks(&content);
        assert_eq!(blocks[0]["source"]["media_type"], json!("image/png"));
        assert_eq!(blocks[0]["source"]["data"], json!("AAAA"));
    }

    #[test]
    fn test_parse_anthropic_event() {
        assert_eq!(
            parse_anthropic_event(
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#
            ),
            Delta::Text("Hi".into())
        );
        assert_eq!(parse_anthropic_event(r#"{"type":"ping"}"#), Delta::Skip);
        assert_eq!(parse_anthropic_event(r#"{"type":"message_stop"}"#), Delta::Done);
        assert_eq!(
            parse_anthropic_event(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#),
            Delta::Failed("Overloaded".into())
        );
    }
}
