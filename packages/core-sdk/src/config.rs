use std::path::PathBuf;

use crate::models::{non_empty, AzureDeployments, ProviderKind};

pub const DEFAULT_ADDR: &str = "127.0.0.1:5173";
pub const DEFAULT_DB_PATH: &str = "chatrelay.db";
pub const DEFAULT_DIRECTIVE_PATH: &str = "public/faqs.md";
pub const DEFAULT_USER_HEADER: &str = "x-user-id";
/** \brief 请求体上限，需容纳内联 base64 图片 */
pub const DEFAULT_MAX_BODY_BYTES: usize = 20 * 1024 * 1024;

/**
 * \brief 服务端配置。
 */
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /** \brief 监听地址，如 "127.0.0.1:5173" */
    pub addr: String,
    /** \brief 用户档案数据库路径 */
    pub db_path: PathBuf,
    /** \brief 系统指令文件路径，每次请求重新读取 */
    pub directive_path: PathBuf,
    /** \brief 可选的静态前端目录 */
    pub ui_dir: Option<PathBuf>,
    /**
     * \brief 上游身份代理写入用户 ID 的请求头。
     * \details 该头不做校验，任何能直连本服务的客户端都可冒用他人档案中的密钥；
     *          仅应在回环地址或受信代理之后监听。
     */
    pub user_header: String,
    /** \brief 单个请求体的字节上限 */
    pub max_body_bytes: usize,
    pub endpoints: ProviderEndpoints,
    pub credentials: EnvCredentials,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            directive_path: PathBuf::from(DEFAULT_DIRECTIVE_PATH),
            ui_dir: None,
            user_header: DEFAULT_USER_HEADER.to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            endpoints: ProviderEndpoints::default(),
            credentials: EnvCredentials::default(),
        }
    }
}

impl ServerConfig {
    /** \brief 以默认值为底，读取进程环境中的凭据与地址覆盖。 */
    pub fn from_env() -> Self {
        Self {
            endpoints: ProviderEndpoints::from_env(),
            credentials: EnvCredentials::from_env(),
            ..Self::default()
        }
    }
}

/**
 * \brief 各 Provider 的 API 基地址（Azure 的地址来自凭据）。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    pub openai: String,
    pub anthropic: String,
    pub google: String,
    pub mistral: String,
    pub groq: String,
    pub perplexity: String,
    pub openrouter: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            openai: "https://api.openai.com".to_string(),
            anthropic: "https://api.anthropic.com".to_string(),
            google: "https://generativelanguage.googleapis.com".to_string(),
            mistral: "https://api.mistral.ai".to_string(),
            groq: "https://api.groq.com/openai".to_string(),
            perplexity: "https://api.perplexity.ai".to_string(),
            openrouter: "https://openrouter.ai/api".to_string(),
        }
    }
}

impl ProviderEndpoints {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /**
     * \brief 读取 `OPENAI_BASE_URL` 等覆盖项，未设置时保留默认地址。
     */
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut endpoints = Self::default();
        for kind in ProviderKind::ALL {
            let var = format!("{}_BASE_URL", kind.as_str().to_ascii_uppercase());
            if let Some(url) = lookup(&var).as_deref().and_then(|v| non_empty(Some(v))) {
                endpoints.set(kind, url.trim_end_matches('/').to_string());
            }
        }
        endpoints
    }

    pub fn base_url(&self, kind: ProviderKind) -> Option<&str> {
        let url = match kind {
            ProviderKind::OpenAI => &self.openai,
            ProviderKind::Anthropic => &self.anthropic,
            ProviderKind::Google => &self.google,
            ProviderKind::Mistral => &self.mistral,
            ProviderKind::Groq => &self.groq,
            ProviderKind::Perplexity => &self.perplexity,
            ProviderKind::OpenRouter => &self.openrouter,
            ProviderKind::Azure => return None,
        };
        Some(url.as_str())
    }

    /** \brief 将所有 Provider 指向同一地址，测试与自建网关使用。 */
    pub fn all_at(base: &str) -> Self {
        let mut endpoints = Self::default();
        for kind in ProviderKind::ALL {
            endpoints.set(kind, base.trim_end_matches('/').to_string());
        }
        endpoints
    }

    fn set(&mut self, kind: ProviderKind, url: String) {
        match kind {
            ProviderKind::OpenAI => self.openai = url,
            ProviderKind::Anthropic => self.anthropic = url,
            ProviderKind::Google => self.google = url,
            ProviderKind::Mistral => self.mistral = url,
            ProviderKind::Groq => self.groq = url,
            ProviderKind::Perplexity => self.perplexity = url,
            ProviderKind::OpenRouter => self.openrouter = url,
            ProviderKind::Azure => {}
        }
    }
}

/**
 * \brief 进程级回退凭据，启动时读取一次，请求期间只读。
 */
#[derive(Clone, Default, PartialEq, Eq)]
pub struct EnvCredentials {
    pub openai_api_key: Option<String>,
    pub openai_organization_id: Option<String>,
    pub azure_openai_api_key: Option<String>,
    pub azure_openai_endpoint: Option<String>,
    pub azure_deployments: AzureDeployments,
    pub anthropic_api_key: Option<String>,
    pub google_gemini_api_key: Option<String>,
    pub mistral_api_key: Option<String>,
    pub groq_api_key: Option<String>,
    pub perplexity_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
}

impl std::fmt::Debug for EnvCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let configured: Vec<&str> = ProviderKind::ALL
            .iter()
            .filter(|kind| self.api_key_for(**kind).is_some())
            .map(|kind| kind.as_str())
            .collect();
        f.debug_struct("EnvCredentials")
            .field("configured", &configured)
            .field("openai_organization_id", &self.openai_organization_id)
            .field("azure_openai_endpoint", &self.azure_openai_endpoint)
            .finish()
    }
}

impl EnvCredentials {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .as_deref()
                .and_then(|v| non_empty(Some(v)))
                .map(str::to_string)
        };
        Self {
            openai_api_key: get("OPENAI_API_KEY"),
            openai_organization_id: get("OPENAI_ORGANIZATION_ID"),
            azure_openai_api_key: get("AZURE_OPENAI_API_KEY"),
            azure_openai_endpoint: get("AZURE_OPENAI_ENDPOINT"),
            azure_deployments: AzureDeployments {
                gpt_35_turbo: get("AZURE_GPT_35_TURBO_NAME"),
                gpt_45_turbo: get("AZURE_GPT_45_TURBO_NAME"),
                gpt_45_vision: get("AZURE_GPT_45_VISION_NAME"),
            },
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            google_gemini_api_key: get("GOOGLE_GEMINI_API_KEY"),
            mistral_api_key: get("MISTRAL_API_KEY"),
            groq_api_key: get("GROQ_API_KEY"),
            perplexity_api_key: get("PERPLEXITY_API_KEY"),
            openrouter_api_key: get("OPENROUTER_API_KEY"),
        }
    }

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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_env_credentials_skip_blank_values() {
        let creds = EnvCredentials::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-env"),
            ("ANTHROPIC_API_KEY", ""),
            ("AZURE_GPT_35_TURBO_NAME", "dep-35"),
        ]));
        assert_eq!(creds.api_key_for(ProviderKind::OpenAI), Some("sk-env"));
        assert_eq!(creds.api_key_for(ProviderKind::Anthropic), None);
        assert_eq!(creds.azure_deployments.gpt_35_turbo.as_deref(), Some("dep-35"));
    }

    #[test]
    fn test_debug_does_not_print_keys() {
        let creds = EnvCredentials::from_lookup(lookup(&[("GROQ_API_KEY", "gsk-secret")]));
        let printed = format!("{:?}", creds);
        assert!(printed.contains("groq"));
        assert!(!printed.contains("gsk-secret"));
    }

    #[test]
    fn test_endpoint_overrides() {
        let endpoints = ProviderEndpoints::from_lookup(lookup(&[(
            "OPENROUTER_BASE_URL",
            "http://localhost:9000/",
        )]));
        assert_eq!(
            endpoints.base_url(ProviderKind::OpenRouter),
            Some("http://localhost:9000")
        );
        assert_eq!(
            endpoints.base_url(ProviderKind::OpenAI),
            Some("https://api.openai.com")
        );
        assert_eq!(endpoints.base_url(ProviderKind::Azure), None);
    }
}
