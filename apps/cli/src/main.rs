use std::{io::Write, path::PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;

use chatrelay_core_sdk::{
    config::{self, EnvCredentials, ProviderEndpoints, ServerConfig},
    db,
    models::{ChatRequestBody, ChatSettings, Message, Profile, ProviderKind},
    providers::provider_for,
    relay::{open_relay, RelayContext},
    server, telemetry, HttpClient,
};

/**
 * \brief CLI 程序入口：启动服务、命令行对话、管理用户档案。
 */
#[derive(Parser, Debug)]
#[command(name = "chatrelay", version, about = "Streaming chat relay for hosted LLM providers")]
struct Cli {
    /** \brief 用户档案数据库路径 */
    #[arg(long, global = true, env = "CHATRELAY_DB", default_value = config::DEFAULT_DB_PATH)]
    db: PathBuf,

    /** \brief 日志过滤级别，`RUST_LOG` 优先 */
    #[arg(long, global = true, env = "CHATRELAY_LOG", default_value = "info")]
    log: String,

    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动 HTTP 服务。
     */
    Serve {
        #[arg(long, env = "CHATRELAY_ADDR", default_value = config::DEFAULT_ADDR)]
        addr: String,
        #[arg(long, env = "CHATRELAY_DIRECTIVE", default_value = config::DEFAULT_DIRECTIVE_PATH)]
        directive: PathBuf,
        #[arg(long, env = "CHATRELAY_UI_DIR")]
        ui_dir: Option<PathBuf>,
        #[arg(long, env = "CHATRELAY_USER_HEADER", default_value = config::DEFAULT_USER_HEADER)]
        user_header: String,
        /** \brief 请求体字节上限，内联图片较大时调高 */
        #[arg(long, env = "CHATRELAY_MAX_BODY_BYTES", default_value_t = config::DEFAULT_MAX_BODY_BYTES)]
        max_body_bytes: usize,
    },

    /**
     * \brief 走完整转发管线发送一条消息，流式打印回复。
     */
    Chat {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        model: String,
        #[arg(long, default_value_t = 0.5)]
        temperature: f64,
        /** \brief 使用该用户档案中的密钥 */
        #[arg(long)]
        user: Option<String>,
        #[arg(long, env = "CHATRELAY_DIRECTIVE", default_value = config::DEFAULT_DIRECTIVE_PATH)]
        directive: PathBuf,
        #[arg(long)]
        prompt: String,
    },

    /**
     * \brief 管理用户档案。
     */
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
}

#[derive(Subcommand, Debug)]
enum ProfileAction {
    /** \brief 写入档案；只覆盖给出的字段，空字符串清除该字段。 */
    Set(ProfileArgs),
    Show {
        #[arg(long)]
        user: String,
    },
    Delete {
        #[arg(long)]
        user: String,
    },
    List,
}

#[derive(Args, Debug)]
struct ProfileArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long)]
    openai_key: Option<String>,
    #[arg(long)]
    openai_org: Option<String>,
    #[arg(long)]
    azure_key: Option<String>,
    #[arg(long)]
    azure_endpoint: Option<String>,
    #[arg(long)]
    azure_35_turbo_id: Option<String>,
    #[arg(long)]
    azure_45_turbo_id: Option<String>,
    #[arg(long)]
    azure_45_vision_id: Option<String>,
    #[arg(long)]
    anthropic_key: Option<String>,
    #[arg(long)]
    google_key: Option<String>,
    #[arg(long)]
    mistral_key: Option<String>,
    #[arg(long)]
    groq_key: Option<String>,
    #[arg(long)]
    perplexity_key: Option<String>,
    #[arg(long)]
    openrouter_key: Option<String>,
}

impl ProfileArgs {
    fn apply(self, profile: &mut Profile) {
        fn merge(slot: &mut Option<String>, value: Option<String>) {
            if let Some(v) = value {
                *slot = if v.trim().is_empty() { None } else { Some(v) };
            }
        }
        if let Some(name) = self.display_name {
            profile.display_name = name;
        }
        merge(&mut profile.openai_api_key, self.openai_key);
        merge(&mut profile.openai_organization_id, self.openai_org);
        merge(&mut profile.azure_openai_api_key, self.azure_key);
        merge(&mut profile.azure_openai_endpoint, self.azure_endpoint);
        merge(&mut profile.azure_openai_35_turbo_id, self.azure_35_turbo_id);
        merge(&mut profile.azure_openai_45_turbo_id, self.azure_45_turbo_id);
        merge(&mut profile.azure_openai_45_vision_id, self.azure_45_vision_id);
        merge(&mut profile.anthropic_api_key, self.anthropic_key);
        merge(&mut profile.google_gemini_api_key, self.google_key);
        merge(&mut profile.mistral_api_key, self.mistral_key);
        merge(&mut profile.groq_api_key, self.groq_key);
        merge(&mut profile.perplexity_api_key, self.perplexity_key);
        merge(&mut profile.openrouter_api_key, self.openrouter_key);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&cli.log, cli.log_json)?;

    match cli.command {
        Commands::Serve {
            addr,
            directive,
            ui_dir,
            user_header,
            max_body_bytes,
        } => {
            let config = ServerConfig {
                addr,
                db_path: cli.db,
                directive_path: directive,
                ui_dir,
                user_header,
                max_body_bytes,
                ..ServerConfig::from_env()
            };
            server::run(config).await?;
        }
        Commands::Chat {
            provider,
            model,
            temperature,
            user,
            directive,
            prompt,
        } => {
            let kind: ProviderKind = provider.parse().map_err(|e| anyhow!("{}", e))?;
            let profile = match user {
                Some(user_id) => {
                    let conn = db::open(&cli.db).context("open profile store failed")?;
                    db::get_profile(&conn, &user_id).context("load profile failed")?
                }
                None => None,
            };
            let env = EnvCredentials::from_env();
            let body = ChatRequestBody {
                chat_settings: ChatSettings {
                    model,
                    temperature,
                    token_budget: None,
                },
                messages: vec![Message::user(prompt)],
            };

            let provider = provider_for(kind, &ProviderEndpoints::from_env(), HttpClient::new());
            let ctx = RelayContext {
                profile: profile.as_ref(),
                credentials: &env,
                directive_path: &directive,
            };
            let relay = open_relay(provider.as_ref(), ctx, &body)
                .await
                .map_err(|e| anyhow!("{}", e.user_message()))?;

            let fragments = relay.fragments();
            futures_util::pin_mut!(fragments);
            let mut stdout = std::io::stdout();
            while let Some(fragment) = fragments.next().await {
                print!("{}", fragment);
                stdout.flush().ok();
            }
            println!();
        }
        Commands::Profile { action } => {
            let conn = db::open(&cli.db).context("open profile store failed")?;
            match action {
                ProfileAction::Set(args) => {
                    let mut profile = db::get_profile(&conn, &args.user)
                        .context("load profile failed")?
                        .unwrap_or_else(|| Profile {
                            user_id: args.user.clone(),
                            ..Profile::default()
                        });
                    args.apply(&mut profile);
                    let stored = db::upsert_profile(&conn, &profile).context("save profile failed")?;
                    println!("Saved profile user={}", stored.user_id);
                    print_profile(&stored);
                }
                ProfileAction::Show { user } => {
                    match db::get_profile(&conn, &user).context("load profile failed")? {
                        Some(profile) => print_profile(&profile),
                        None => println!("No profile for user={}", user),
                    }
                }
                ProfileAction::Delete { user } => {
                    let deleted = db::delete_profile(&conn, &user).context("delete profile failed")?;
                    println!("Deleted user={} existed={}", user, deleted);
                }
                ProfileAction::List => {
                    for user_id in db::list_profile_ids(&conn).context("list profiles failed")? {
                        println!("{}", user_id);
                    }
                }
            }
        }
    }

    Ok(())
}

/** \brief 打印档案，密钥只显示是否已设置。 */
fn print_profile(profile: &Profile) {
    println!("user:         {}", profile.user_id);
    if !profile.display_name.is_empty() {
        println!("display name: {}", profile.display_name);
    }
    if let Some(org) = profile.openai_organization_id.as_deref() {
        println!("openai org:   {}", org);
    }
    if let Some(endpoint) = profile.azure_openai_endpoint.as_deref() {
        println!("azure:        {}", endpoint);
    }
    for kind in ProviderKind::ALL {
        let state = if profile.api_key_for(kind).is_some() {
            "set"
        } else {
            "-"
        };
        println!("  {:<14} {}", kind.display_name(), state);
    }
    if let Some(ts) = profile.updated_at.as_deref() {
        println!("updated:      {}", ts);
    }
}
