use std::{convert::Infallible, path::Path};

use async_stream::stream;
use axum::body::Body;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::watch;

use crate::{
    compose::{compose, validate},
    config::EnvCredentials,
    directive::load_directive,
    error::ChatResult,
    models::{ChatRequestBody, Profile, ProviderKind},
    providers::ChatProvider,
    sse::TextStream,
    telemetry,
};

/**
 * \brief 单次转发的生命周期状态。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    ResolvingCredential,
    Composing,
    Streaming,
    Completed,
    Failed,
}

impl RelayState {
    fn is_terminal(self) -> bool {
        matches!(self, RelayState::Completed | RelayState::Failed)
    }
}

/**
 * \brief 状态跟踪器：只允许前进，进入终态后不再变化。
 * \details 在 Streaming 状态被丢弃意味着客户端断开，此时记录日志。
 */
#[derive(Debug)]
pub struct RelayTracker {
    provider: ProviderKind,
    model: String,
    state: RelayState,
    published: watch::Sender<RelayState>,
}

impl RelayTracker {
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            state: RelayState::Idle,
            published: watch::Sender::new(RelayState::Idle),
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /** \brief 订阅状态变化；跟踪器丢弃后仍可读到最后的状态。 */
    pub fn subscribe(&self) -> watch::Receiver<RelayState> {
        self.published.subscribe()
    }

    fn set(&mut self, next: RelayState) {
        self.state = next;
        self.published.send_replace(next);
    }

    pub fn advance(&mut self, next: RelayState) {
        if self.state.is_terminal() || next.rank() <= self.state.rank() {
            return;
        }
        tracing::debug!(
            provider = self.provider.as_str(),
            model = %self.model,
            from = ?self.state,
            to = ?next,
            "relay state"
        );
        self.set(next);
    }

    pub fn fail(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        telemetry::log_error(
            "relay.failed",
            &format!(
                "{} relay failed in {:?} model={}: {}",
                self.provider, self.state, self.model, reason
            ),
        );
        self.set(RelayState::Failed);
    }
}

impl RelayState {
    fn rank(self) -> u8 {
        match self {
            RelayState::Idle => 0,
            RelayState::ResolvingCredential => 1,
            RelayState::Composing => 2,
            RelayState::Streaming => 3,
            RelayState::Completed | RelayState::Failed => 4,
        }
    }
}

impl Drop for RelayTracker {
    fn drop(&mut self) {
        if self.state == RelayState::Streaming {
            telemetry::log_event(
                "relay.disconnect",
                &format!(
                    "{} stream dropped before completion model={}",
                    self.provider, self.model
                ),
            );
        }
    }
}

/**
 * \brief 单次请求的上下文：调用方档案、环境凭据与指令文件位置。
 */
#[derive(Debug, Clone, Copy)]
pub struct RelayContext<'a> {
    pub profile: Option<&'a Profile>,
    pub credentials: &'a EnvCredentials,
    pub directive_path: &'a Path,
}

/**
 * \brief 完成凭据解析、指令加载与请求组装，并打开 Provider 流。
 * \details 任何一步失败都在发出首个字节之前返回，调用方据此构造错误响应。
 */
pub async fn open_relay(
    provider: &dyn ChatProvider,
    ctx: RelayContext<'_>,
    body: &ChatRequestBody,
) -> ChatResult<RelayStream> {
    let mut tracker = RelayTracker::new(provider.kind(), body.chat_settings.model.as_str());
    match start(provider, ctx, body, &mut tracker).await {
        Ok(inner) => {
            tracker.advance(RelayState::Streaming);
            Ok(RelayStream { inner, tracker })
        }
        Err(err) => {
            tracker.fail(&err.to_string());
            Err(err)
        }
    }
}

async fn start(
    provider: &dyn ChatProvider,
    ctx: RelayContext<'_>,
    body: &ChatRequestBody,
    tracker: &mut RelayTracker,
) -> ChatResult<TextStream> {
    validate(&body.chat_settings)?;

    tracker.advance(RelayState::ResolvingCredential);
    let credential = provider.resolve_credential(ctx.profile, ctx.credentials)?;

    tracker.advance(RelayState::Composing);
    let directive = load_directive(ctx.directive_path).await;
    let composed = compose(&body.chat_settings, &directive, &body.messages);
    let request = provider.compose_request(&composed);

    telemetry::log_event(
        "relay.start",
        &format!(
            "{} model={} messages={} source={:?}",
            provider.kind(),
            request.model,
            composed.messages.len(),
            credential.source
        ),
    );
    provider.stream_completion(&credential, request).await
}

/**
 * \brief 已打开的增量流。
 */
pub struct RelayStream {
    inner: TextStream,
    tracker: RelayTracker,
}

impl RelayStream {
    pub fn state(&self) -> RelayState {
        self.tracker.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<RelayState> {
        self.tracker.subscribe()
    }

    /**
     * \brief 按 Provider 发出的顺序转出文本片段。
     * \details 流中途出错时记录日志并直接结束，已发出的片段不撤回，也不追加错误标记。
     */
    pub fn fragments(self) -> impl Stream<Item = String> + Send {
        let RelayStream { mut inner, mut tracker } = self;
        stream! {
            while let Some(item) = inner.next().await {
                match item {
                    Ok(text) => {
                        yield text;
                    }
                    Err(err) => {
                        tracker.fail(&err.to_string());
                        break;
                    }
                }
            }
            tracker.advance(RelayState::Completed);
        }
    }

    /** \brief 作为 `text/plain` 分块响应体。 */
    pub fn into_body(self) -> Body {
        Body::from_stream(
            self.fragments()
                .map(|fragment| Ok::<_, Infallible>(Bytes::from(fragment))),
        )
    }
}
