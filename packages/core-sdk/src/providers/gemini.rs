use async_trait::async_trait;
use serde_json::{json, Value};

use super::{key_header, send_checked, split_data_url, ChatProvider, VendorRequest};
use crate::{
    compose::ComposedRequest,
    credential::Credential,
    error::ChatResult,
    models::{ContentPart, Message, MessageContent, ProviderKind, Role},
    sse::{text_deltas, Delta, TextStream},
};

pub struct Gemini {
    base_url: String,
    client: reqwest::Client,
}

impl Gemini {
    pub fn new(base_url: String, client: reqwest::Client) -> Self {
        Self {
            base_url: normalize_gemini_base(&base_url),
            client,
        }
    }

    fn stream_url(&self, model: &str) -> String {
        format!("{}/models/{}:streamGenerateContent", self.base_url, model)
    }
}

#[async_trait]
impl ChatProvider for Gemini {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn compose_request(&self, request: &ComposedRequest) -> VendorRequest {
        let (system_prompt, contents) = gemini_payload(&request.messages);
        let mut generation = json!({ "temperature": request.temperature });
        if let Some(max_tokens) = request.max_tokens {
            generation["maxOutputTokens"] = json!(max_tokens);
        }
        let mut body = json!({
            "contents": contents,
            "generationConfig": generation,
        });
        if let Some(sys) = system_prompt {
            body["system_instruction"] = json!({
                "parts": [{"text": sys}]
            });
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
        let builder = self
            .client
            .post(self.stream_url(&request.model))
            .query(&[("alt", "sse")])
            .header(
                "x-goog-api-key",
                key_header(ProviderKind::Google, &credential.api_key)?,
            )
            .json(&request.body);
        let resp = send_checked(ProviderKind::Google, builder).await?;
        Ok(text_deltas(resp.bytes_stream(), parse_gemini_chunk))
    }
}

fn gemini_payload(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut contents = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(msg.content.text()),
            Role::Assistant => contents.push(json!({
                "role": "model",
                "parts": gemini_parts(&msg.content),
            })),
            Role::User => contents.push(json!({
                "role": "user",
                "parts": gemini_parts(&msg.content),
            })),
        }
    }
    let system_prompt = system_parts.join("\n\n");
    let system_prompt = if system_prompt.trim().is_empty() {
        None
    } else {
        Some(system_prompt)
    };
    (system_prompt, contents)
}

/** \brief 远程图片地址无法内联，退化为文本引用。 */
fn gemini_parts(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(text) => vec![json!({"text": text})],
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({"text": text}),
                ContentPart::ImageUrl { image_url } => match split_data_url(&image_url.url) {
                    Some((mime_type, data)) => json!({
                        "inline_data": {"mime_type": mime_type, "data": data}
                    }),
                    None => json!({"text": image_url.url}),
                },
            })
            .collect(),
    }
}

fn parse_gemini_chunk(data: &str) -> Delta {
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
    let text = v
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    if text.is_empty() {
        Delta::Skip
    } else {
        Delta::Text(text)
    }
}

fn normalize_gemini_base(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    if trimmed.ends_with("/v1beta") || trimmed.contains("/v1beta/") {
        trimmed.to_string()
    } else {
        format!("{}/v1beta", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compose::compose, models::ChatSettings};

    #[test]
    fn test_payload_maps_roles_and_system() {
        let settings = ChatSettings {
            model: "gemini-1.5-pro".into(),
            temperature: 0.2,
            token_budget: None,
        };
        let caller = vec![Message::user("hi"), Message::assistant("hello"), Message::user("bye")];
        let composed = compose(&settings, "FAQ", &caller);
        let req = Gemini::new("https://generativelanguage.googleapis.com".into(), reqwest::Client::new())
            .compose_request(&composed);
        assert_eq!(req.body["system_instruction"]["parts"][0]["text"], json!("FAQ"));
        assert_eq!(req.body["contents"][1]["role"], json!("model"));
        assert_eq!(req.body["contents"].as_array().map(Vec::len), Some(3));
        assert_eq!(req.body["generationConfig"]["temperature"], json!(0.2));
        assert!(req.body["generationConfig"].get("maxOutputTokens").is_none());
    }

    #[test]
    fn test_parse_gemini_chunk() {
        assert_eq!(
            parse_gemini_chunk(r#"{"candidates":[{"content":{"parts":[{"text":"He"},{"text":"y"}],"role":"model"}}]}"#),
            Delta::Text("Hey".into())
        );
        assert_eq!(parse_gemini_chunk(r#"{"usageMetadata":{}}"#), Delta::Skip);
        assert_eq!(
            parse_gemini_chunk(r#"{"error":{"code":500,"message":"internal"}}"#),
            Delta::Failed("internal".into())
        );
    }

    #[test]
    fn test_normalize_gemini_base() {
        assert_eq!(
            normalize_gemini_base("https://generativelanguage.googleapis.com/"),
            "https://generativelanguage.googleapis.com/v1beta"
        );
        assert_eq!(normalize_gemini_base("http://proxy/v1beta"), "http://proxy/v1beta");
        let gemini = Gemini::new("http://proxy".into(), reqwest::Client::new());
        assert_eq!(
            gemini.stream_url("gemini-pro"),
            "http://proxy/v1beta/models/gemini-pro:streamGenerateContent"
        );
    }
}
