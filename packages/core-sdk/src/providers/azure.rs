use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use super::{
    openai::{assistant_list, chat_body, parse_chat_delta},
    key_header, send_checked, ChatProvider, VendorRequest,
};
use crate::{
    compose::ComposedRequest,
    credential::Credential,
    error::{ChatError, ChatResult},
    models::ProviderKind,
    sse::{text_deltas, TextStream},
};

const CHAT_API_VERSION: &str = "2023-12-01-preview";
const ASSISTANTS_API_VERSION: &str = "2024-05-01-preview";

/**
 * \brief Azure OpenAI：地址与部署名来自凭据。
 */
pub struct AzureOpenAi {
    client: reqwest::Client,
}

impl AzureOpenAi {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn endpoint(credential: &Credential) -> ChatResult<&str> {
    credential
        .endpoint
        .as_deref()
        .ok_or(ChatError::MissingCredential {
            provider: ProviderKind::Azure,
        })
}

#[async_trait]
impl ChatProvider for AzureOpenAi {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Azure
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
        let deployment = credential.deployments.deployment_for(&request.model);
        let url = format!(
            "{}/openai/deployments/{}/chat/completions",
            endpoint(credential)?,
            deployment
        );
        let builder = self
            .client
            .post(url)
            .query(&[("api-version", CHAT_API_VERSION)])
            .header(CONTENT_TYPE, "application/json")
            .header("api-key", key_header(ProviderKind::Azure, &credential.api_key)?)
            .json(&request.body);
        let resp = send_checked(ProviderKind::Azure, builder).await?;
        Ok(text_deltas(resp.bytes_stream(), parse_chat_delta))
    }

    async fn list_assistants(&self, credential: &Credential) -> ChatResult<Vec<Value>> {
        let builder = self
            .client
            .get(format!("{}/openai/assistants", endpoint(credential)?))
            .query(&[("api-version", ASSISTANTS_API_VERSION), ("limit", "100")])
            .header("api-key", key_header(ProviderKind::Azure, &credential.api_key)?);
        let resp = send_checked(ProviderKind::Azure, builder).await?;
        let payload: Value = resp.json().await?;
        Ok(assistant_list(payload))
    }
}
