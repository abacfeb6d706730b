use crate::{
    error::{ChatError, ChatResult},
    models::{ChatSettings, Message},
};

/** \brief 多模态模型的固定输出上限。 */
pub const VISION_TOKEN_CEILING: u32 = 4096;

/**
 * \brief 与 Provider 无关的已组装请求。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedRequest {
    pub model: String,
    pub temperature: f64,
    /** \brief 输出 token 上限；None 表示不显式限制 */
    pub max_tokens: Option<u32>,
    /** \brief 首条为注入的 system 指令，其后为调用方消息 */
    pub messages: Vec<Message>,
    pub stream: bool,
}

/**
 * \brief 按模型名给出输出上限，仅对已知的多模态模型生效。
 */
pub fn token_ceiling(model: &str) -> Option<u32> {
    match model {
        "gpt-4-vision-preview" | "gpt-4o" => Some(VISION_TOKEN_CEILING),
        _ => None,
    }
}

/**
 * \brief 校验调用方参数。
 */
pub fn validate(settings: &ChatSettings) -> ChatResult<()> {
    if settings.model.trim().is_empty() {
        return Err(ChatError::MalformedRequestBody(
            "chatSettings.model must not be empty".to_string(),
        ));
    }
    if !settings.temperature.is_finite() || !(0.0..=2.0).contains(&settings.temperature) {
        return Err(ChatError::MalformedRequestBody(format!(
            "chatSettings.temperature must be between 0.0 and 2.0, got {}",
            settings.temperature
        )));
    }
    Ok(())
}

/**
 * \brief 组装请求：指令作为唯一的首条 system 消息，调用方消息原序追加。
 * \details 调用方自带的 system 消息保持原位，不与指令合并。
 */
pub fn compose(settings: &ChatSettings, directive: &str, messages: &[Message]) -> ComposedRequest {
    let mut outgoing = Vec::with_capacity(messages.len() + 1);
    outgoing.push(Message::system(directive));
    outgoing.extend_from_slice(messages);
    ComposedRequest {
        model: settings.model.clone(),
        temperature: settings.temperature,
        max_tokens: token_ceiling(&settings.model),
        messages: outgoing,
        stream: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageContent, Role};

    fn settings(model: &str) -> ChatSettings {
        ChatSettings {
            model: model.to_string(),
            temperature: 0.7,
            token_budget: Some(8192),
        }
    }

    #[test]
    fn test_directive_is_first_and_only_injected_message() {
        let caller = vec![
            Message::system("caller system"),
            Message::user("hi"),
            Message::assistant("hello"),
            Message::user("again"),
        ];
        let req = compose(&settings("gpt-3.5-turbo"), "FAQ text", &caller);
        assert_eq!(req.messages.len(), caller.len() + 1);
        assert_eq!(req.messages[0], Message::system("FAQ text"));
        assert_eq!(&req.messages[1..], caller.as_slice());
        let injected = req
            .messages
            .iter()
            .filter(|m| m.content == MessageContent::Text("FAQ text".into()))
            .count();
        assert_eq!(injected, 1);
        assert!(req.stream);
    }

    #[test]
    fn test_empty_history_still_gets_directive() {
        let req = compose(&settings("gpt-4"), "", &[]);
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, Role::System);
    }

    #[test]
    fn test_token_ceiling_only_for_vision_models() {
        assert_eq!(token_ceiling("gpt-4o"), Some(4096));
        assert_eq!(token_ceiling("gpt-4-vision-preview"), Some(4096));
        assert_eq!(token_ceiling("gpt-4-turbo"), None);
        let req = compose(&settings("gpt-4o"), "", &[]);
        assert_eq!(req.max_tokens, Some(4096));
        assert_eq!(req.temperature, 0.7);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        assert!(validate(&settings("gpt-4o")).is_ok());
        assert!(validate(&settings("  ")).is_err());
        let mut hot = settings("gpt-4o");
        hot.temperature = 2.5;
        assert!(matches!(
            validate(&hot),
            Err(ChatError::MalformedRequestBody(_))
        ));
        hot.temperature = f64::NAN;
        assert!(validate(&hot).is_err());
    }
}
