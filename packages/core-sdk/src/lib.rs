pub mod compose;
pub mod config;
pub mod credential;
pub mod db;
pub mod directive;
pub mod error;
pub mod models;
pub mod providers;
pub mod relay;
pub mod server;
pub mod sse;
pub mod telemetry;

/** \brief 供调用方构造 Provider 时使用的 HTTP 客户端类型。 */
pub use reqwest::Client as HttpClient;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::ServerConfig;
    pub use crate::error::{ChatError, ChatResult};
    pub use crate::models::{ChatRequestBody, Message, Profile, ProviderKind};
    pub use crate::providers::{provider_for, ChatProvider};
    pub use crate::relay::{open_relay, RelayContext};
    pub use crate::{db, server, telemetry};
}
