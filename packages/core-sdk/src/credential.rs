use std::fmt;

use crate::{
    config::EnvCredentials,
    error::{ChatError, ChatResult},
    models::{non_empty, AzureDeployments, Profile, ProviderKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Profile,
    Environment,
}

/**
 * \brief 单次请求使用的凭据，不落盘，随请求结束释放。
 */
#[derive(Clone)]
pub struct Credential {
    pub provider: ProviderKind,
    pub api_key: String,
    /** \brief OpenAI organization */
    pub organization: Option<String>,
    /** \brief Azure endpoint */
    pub endpoint: Option<String>,
    pub deployments: AzureDeployments,
    pub source: CredentialSource,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("provider", &self.provider)
            .field("api_key", &"<redacted>")
            .field("organization", &self.organization)
            .field("endpoint", &self.endpoint)
            .field("source", &self.source)
            .finish()
    }
}

/**
 * \brief 解析凭据：优先用户档案，其次进程环境变量。
 * \details 两者都没有可用密钥时返回 MissingCredential，调用方必须在发起网络请求前返回。
 */
pub fn resolve(
    kind: ProviderKind,
    profile: Option<&Profile>,
    env: &EnvCredentials,
) -> ChatResult<Credential> {
    if let Some(credential) = profile.and_then(|p| from_profile(kind, p)) {
        return Ok(credential);
    }
    from_env(kind, env).ok_or(ChatError::MissingCredential { provider: kind })
}

fn from_profile(kind: ProviderKind, profile: &Profile) -> Option<Credential> {
    let api_key = profile.api_key_for(kind)?.to_string();
    let mut credential = Credential {
        provider: kind,
        api_key,
        organization: None,
        endpoint: None,
        deployments: AzureDeployments::default(),
        source: CredentialSource::Profile,
    };
    match kind {
        ProviderKind::OpenAI => {
            credential.organization = owned(profile.openai_organization_id.as_deref());
        }
        ProviderKind::Azure => {
            credential.endpoint = Some(owned(profile.azure_openai_endpoint.as_deref())?);
            credential.deployments = profile.azure_deployments();
        }
        _ => {}
    }
    Some(credential)
}

fn from_env(kind: ProviderKind, env: &EnvCredentials) -> Option<Credential> {
    let api_key = env.api_key_for(kind)?.to_string();
    let mut credential = Credential {
        provider: kind,
        api_key,
        organization: None,
        endpoint: None,
        deployments: AzureDeployments::default(),
        source: CredentialSource::Environment,
    };
    match kind {
        ProviderKind::OpenAI => {
            credential.organization = owned(env.openai_organization_id.as_deref());
        }
        ProviderKind::Azure => {
            credential.endpoint = Some(owned(env.azure_openai_endpoint.as_deref())?);
            credential.deployments = env.azure_deployments.clone();
        }
        _ => {}
    }
    Some(credential)
}

fn owned(value: Option<&str>) -> Option<String> {
    non_empty(value).map(|s| s.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with_openai() -> EnvCredentials {
        EnvCredentials {
            openai_api_key: Some("sk-env".into()),
            openai_organization_id: Some("org-env".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_profile_key_wins_over_env() {
        let profile = Profile {
            user_id: "u1".into(),
            openai_api_key: Some("sk-profile".into()),
            openai_organization_id: Some("org-profile".into()),
            ..Default::default()
        };
        let cred = resolve(ProviderKind::OpenAI, Some(&profile), &env_with_openai())
            .expect("resolve");
        assert_eq!(cred.api_key, "sk-profile");
        assert_eq!(cred.organization.as_deref(), Some("org-profile"));
        assert_eq!(cred.source, CredentialSource::Profile);
    }

    #[test]
    fn test_empty_profile_key_falls_back_to_env() {
        let profile = Profile {
            user_id: "u1".into(),
            openai_api_key: Some(String::new()),
            ..Default::default()
        };
        let cred = resolve(ProviderKind::OpenAI, Some(&profile), &env_with_openai())
            .expect("resolve");
        assert_eq!(cred.api_key, "sk-env");
        assert_eq!(cred.organization.as_deref(), Some("org-env"));
        assert_eq!(cred.source, CredentialSource::Environment);
    }

    #[test]
    fn test_missing_everywhere_names_provider() {
        let err = resolve(ProviderKind::Perplexity, None, &EnvCredentials::default())
            .expect_err("no credential");
        match err {
            ChatError::MissingCredential { provider } => {
                assert_eq!(provider, ProviderKind::Perplexity)
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_azure_requires_endpoint() {
        let env = EnvCredentials {
            azure_openai_api_key: Some("az-key".into()),
            ..Default::default()
        };
        assert!(resolve(ProviderKind::Azure, None, &env).is_err());

        let env = EnvCredentials {
            azure_openai_endpoint: Some("https://example.openai.azure.com/".into()),
            ..env
        };
        let cred = resolve(ProviderKind::Azure, None, &env).expect("resolve azure");
        assert_eq!(
            cred.endpoint.as_deref(),
            Some("https://example.openai.azure.com")
        );
    }

    #[test]
    fn test_debug_redacts_key() {
        let cred = resolve(ProviderKind::OpenAI, None, &env_with_openai()).expect("resolve");
        assert!(!format!("{:?}", cred).contains("sk-env"));
    }
}
