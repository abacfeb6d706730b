use anyhow::{bail, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{path::Path, thread, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::models::Profile;

const PROFILE_COLUMNS: &str = "user_id, display_name, openai_api_key, openai_organization_id, \
     azure_openai_api_key, azure_openai_endpoint, azure_openai_35_turbo_id, \
     azure_openai_45_turbo_id, azure_openai_45_vision_id, anthropic_api_key, \
     google_gemini_api_key, mistral_api_key, groq_api_key, perplexity_api_key, \
     openrouter_api_key, updated_at";

/**
 * \brief 打开档案数据库文件并完成迁移。
 */
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    migrate(&conn)?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建 profiles 表。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS profiles (
            user_id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL DEFAULT '',
            openai_api_key TEXT,
            openai_organization_id TEXT,
            azure_openai_api_key TEXT,
            azure_openai_endpoint TEXT,
            azure_openai_35_turbo_id TEXT,
            azure_openai_45_turbo_id TEXT,
            azure_openai_45_vision_id TEXT,
            anthropic_api_key TEXT,
            google_gemini_api_key TEXT,
            mistral_api_key TEXT,
            groq_api_key TEXT,
            perplexity_api_key TEXT,
            openrouter_api_key TEXT,
            updated_at TEXT NOT NULL
        );
        "#,
        )
    })
}

/**
 * \brief 写入或整体替换一个用户档案，返回带更新时间的结果。
 */
pub fn upsert_profile(conn: &Connection, profile: &Profile) -> Result<Profile> {
    if profile.user_id.trim().is_empty() {
        bail!("profile user_id must not be empty");
    }
    let mut stored = profile.clone();
    stored.updated_at = Some(OffsetDateTime::now_utc().format(&Rfc3339)?);
    let sql = format!(
        "INSERT INTO profiles ({PROFILE_COLUMNS}) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16) \
         ON CONFLICT(user_id) DO UPDATE SET \
            display_name=excluded.display_name, \
            openai_api_key=excluded.openai_api_key, \
            openai_organization_id=excluded.openai_organization_id, \
            azure_openai_api_key=excluded.azure_openai_api_key, \
            azure_openai_endpoint=excluded.azure_openai_endpoint, \
            azure_openai_35_turbo_id=excluded.azure_openai_35_turbo_id, \
            azure_openai_45_turbo_id=excluded.azure_openai_45_turbo_id, \
            azure_openai_45_vision_id=excluded.azure_openai_45_vision_id, \
            anthropic_api_key=excluded.anthropic_api_key, \
            google_gemini_api_key=excluded.google_gemini_api_key, \
            mistral_api_key=excluded.mistral_api_key, \
            groq_api_key=excluded.groq_api_key, \
            perplexity_api_key=excluded.perplexity_api_key, \
            openrouter_api_key=excluded.openrouter_api_key, \
            updated_at=excluded.updated_at"
    );
    retry_on_locked(|| {
        conn.execute(
            &sql,
            params![
                stored.user_id,
                stored.display_name,
                stored.openai_api_key,
                stored.openai_organization_id,
                stored.azure_openai_api_key,
                stored.azure_openai_endpoint,
                stored.azure_openai_35_turbo_id,
                stored.azure_openai_45_turbo_id,
                stored.azure_openai_45_vision_id,
                stored.anthropic_api_key,
                stored.google_gemini_api_key,
                stored.mistral_api_key,
                stored.groq_api_key,
                stored.perplexity_api_key,
                stored.openrouter_api_key,
                stored.updated_at,
            ],
        )
    })?;
    Ok(stored)
}

/**
 * \brief 按用户 ID 读取档案。
 */
pub fn get_profile(conn: &Connection, user_id: &str) -> Result<Option<Profile>> {
    let sql = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE user_id=?1");
    conn.query_row(&sql, params![user_id], map_profile)
        .optional()
        .map_err(Into::into)
}

/**
 * \brief 删除档案，返回是否存在过。
 */
pub fn delete_profile(conn: &Connection, user_id: &str) -> Result<bool> {
    let affected =
        retry_on_locked(|| conn.execute("DELETE FROM profiles WHERE user_id=?1", params![user_id]))?;
    Ok(affected > 0)
}

pub fn list_profile_ids(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT user_id FROM profiles ORDER BY user_id")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn map_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<Profile> {
    Ok(Profile {
        user_id: row.get(0)?,
        display_name: row.get(1)?,
        openai_api_key: row.get(2)?,
        openai_organization_id: row.get(3)?,
        azure_openai_api_key: row.get(4)?,
        azure_openai_endpoint: row.get(5)?,
        azure_openai_35_turbo_id: row.get(6)?,
        azure_openai_45_turbo_id: row.get(7)?,
        azure_openai_45_vision_id: row.get(8)?,
        anthropic_api_key: row.get(9)?,
        google_gemini_api_key: row.get(10)?,
        mistral_api_key: row.get(11)?,
        groq_api_key: row.get(12)?,
        perplexity_api_key: row.get(13)?,
        openrouter_api_key: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并线性退避，最多尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
