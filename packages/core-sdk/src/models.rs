use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ChatError;

/**
 * \brief Provider 标识，对应路由中的 `{provider}` 段。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAI,
    Azure,
    Anthropic,
    Google,
    Mistral,
    Groq,
    Perplexity,
    OpenRouter,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 8] = [
        ProviderKind::OpenAI,
        ProviderKind::Azure,
        ProviderKind::Anthropic,
        ProviderKind::Google,
        ProviderKind::Mistral,
        ProviderKind::Groq,
        ProviderKind::Perplexity,
        ProviderKind::OpenRouter,
    ];

    /** \brief 路由与配置中使用的小写标识。 */
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Azure => "azure",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
            ProviderKind::Mistral => "mistral",
            ProviderKind::Groq => "groq",
            ProviderKind::Perplexity => "perplexity",
            ProviderKind::OpenRouter => "openrouter",
        }
    }

    /** \brief 面向用户的展示名称，用于错误提示。 */
    pub fn display_name(self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "OpenAI",
            ProviderKind::Azure => "Azure OpenAI",
            ProviderKind::Anthropic => "Anthropic",
            ProviderKind::Google => "Google Gemini",
            ProviderKind::Mistral => "Mistral",
            ProviderKind::Groq => "Groq",
            ProviderKind::Perplexity => "Perplexity",
            ProviderKind::OpenRouter => "OpenRouter",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for ProviderKind {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAI),
            "azure" | "azure-openai" => Ok(ProviderKind::Azure),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "google" | "gemini" => Ok(ProviderKind::Google),
            "mistral" => Ok(ProviderKind::Mistral),
            "groq" => Ok(ProviderKind::Groq),
            "perplexity" => Ok(ProviderKind::Perplexity),
            "openrouter" => Ok(ProviderKind::OpenRouter),
            _ => Err(ChatError::UnknownProvider(s.to_string())),
        }
    }
}

/**
 * \brief 消息角色。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/**
 * \brief 图片引用，与 OpenAI `image_url` 结构一致。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/**
 * \brief 消息正文：纯文本，或带图片引用的分段内容。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /** \brief 拼接全部文本片段，忽略图片。 */
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: Role,
    /** \brief 内容 */
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }
}

/**
 * \brief 调用方提供的生成参数。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    /** \brief 模型名，原样透传给 Provider */
    pub model: String,
    /** \brief 采样温度，取值 0.0–2.0 */
    pub temperature: f64,
    /** \brief 上下文 token 预算（前端用于截断历史） */
    #[serde(default, alias = "contextLength", skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<u32>,
}

/**
 * \brief `POST /api/chat/{provider}` 请求体。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestBody {
    pub chat_settings: ChatSettings,
    pub messages: Vec<Message>,
}

/**
 * \brief Azure OpenAI 部署名映射。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureDeployments {
    pub gpt_35_turbo: Option<String>,
    pub gpt_45_turbo: Option<String>,
    pub gpt_45_vision: Option<String>,
}

impl AzureDeployments {
    /** \brief 按模型名挑选部署名；未配置时退回模型名本身。 */
    pub fn deployment_for(&self, model: &str) -> String {
        let mapped = match model {
            "gpt-3.5-turbo" => self.gpt_35_turbo.as_deref(),
            "gpt-4-turbo-preview" | "gpt-4-turbo" => self.gpt_45_turbo.as_deref(),
            "gpt-4-vision-preview" => self.gpt_45_vision.as_deref(),
            _ => None,
        };
        mapped
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(model)
            .to_string()
    }
}

/**
 * \brief 用户档案中保存的 Provider 凭据。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /** \brief 身份提供方给出的用户 ID */
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub openai_organization_id: Option<String>,
    #[serde(default)]
    pub azure_openai_api_key: Option<String>,
    #[serde(default)]
    pub azure_openai_endpoint: Option<String>,
    #[serde(default)]
    pub azure_openai_35_turbo_id: Option<String>,
    #[serde(default)]
    pub azure_openai_45_turbo_id: Option<String>,
    #[serde(default)]
    pub azure_openai_45_vision_id: Option<String>,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub google_gemini_api_key: Option<String>,
    #[serde(default)]
    pub mistral_api_key: Option<String>,
    #[serde(default)]
    pub groq_api_key: Option<String>,
    #[serde(default)]
    pub perplexity_api_key: Option<String>,
    #[serde(default)]
    pub openrouter_api_key: Option<String>,
    /** \brief 最近一次写入时间（RFC 3339） */
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Profile {
    /** \brief 取该 Provider 的非空密钥。 */
    pub fn api_key_for(&self, kind: ProviderKind) -> Option<&str> {
        let key = match kind {
            ProviderKind::OpenAI => &self.openai_api_key,
            ProviderKind::Azure => &self.azure_openai_api_key,
            ProviderKind::Anthropic => &self.anthropic_api_key,
            ProviderKind::Google => &self.google_gemini_api_key,
            ProviderKind::Mistral => &self.mistral_api_key,
            ProviderKind::Groq => &self.groq_api_key,
            ProviderKind::Perplexity => &self.perplexity_api_key,
            ProviderKind::OpenRouter => &self.openrouter_api_key,
        };
        non_empty(key.as_deref())
    }

    pub fn azure_deployments(&self) -> AzureDeployments {
        AzureDeployments {
            gpt_35_turbo: self.azure_openai_35_turbo_id.clone(),
            gpt_45_turbo: self.azure_openai_45_turbo_id.clone(),
            gpt_45_vision: self.azure_openai_45_vision_id.clone(),
        }
    }
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parses_aliases() {
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAI);
        assert_eq!("claude".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        assert_eq!("gemini".parse::<ProviderKind>().unwrap(), ProviderKind::Google);
        for kind in ProviderKind::ALL {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), kind);
        }
        assert!(matches!(
            "cohere".parse::<ProviderKind>(),
            Err(ChatError::UnknownProvider(_))
        ));
    }

    #[test]
    fn test_request_body_accepts_text_and_image_parts() {
        let raw = r#"{
            "chatSettings": {"model": "gpt-4o", "temperature": 0.5, "contextLength": 4096, "includeProfileContext": true},
            "messages": [
                {"role": "user", "content": "hello"},
                {"role": "user", "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
                ]}
            ]
        }"#;
        let body: ChatRequestBody = serde_json::from_str(raw).expect("parse body");
        assert_eq!(body.chat_settings.token_budget, Some(4096));
        assert_eq!(body.messages.len(), 2);
        assert_eq!(body.messages[1].content.text(), "what is this");
        match &body.messages[1].content {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 2),
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[test]
    fn test_profile_ignores_blank_keys() {
        let profile = Profile {
            user_id: "u1".into(),
            openai_api_key: Some("   ".into()),
            groq_api_key: Some("gsk-1".into()),
            ..Default::default()
        };
        assert_eq!(profile.api_key_for(ProviderKind::OpenAI), None);
        assert_eq!(profile.api_key_for(ProviderKind::Groq), Some("gsk-1"));
    }

    #[test]
    fn test_azure_deployment_falls_back_to_model() {
        let deployments = AzureDeployments {
            gpt_35_turbo: Some("dep-35".into()),
            ..Default::default()
        };
        assert_eq!(deployments.deployment_for("gpt-3.5-turbo"), "dep-35");
        assert_eq!(deployments.deployment_for("gpt-4o"), "gpt-4o");
    }
}
