use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::{now_str, parse_ts, Database, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub salt: String,
    pub llm_endpoint: Option<String>,
    pub llm_model: Option<String>,
    pub embedding_model: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        salt: row.get(3)?,
        llm_endpoint: row.get(4)?,
        llm_model: row.get(5)?,
        embedding_model: row.get(6)?,
        created_at: parse_ts(&row.get::<_, String>(7)?),
    })
}

const USER_COLUMNS: &str =
    "id, username, password_hash, salt, llm_endpoint, llm_model, embedding_model, created_at";

impl Database {
    pub fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        salt: &str,
    ) -> StoreResult<UserRecord> {
        let id = Uuid::new_v4().to_string();
        let created_at = now_str();
        self.with(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO users (id, username, password_hash, salt, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, username, password_hash, salt, created_at],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!(
                    "username '{}' is already taken",
                    username
                )));
            }
            Ok(())
        })?;
        self.user_by_id(&id)
    }

    pub fn user_by_id(&self, id: &str) -> StoreResult<UserRecord> {
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
                params![id],
                map_user,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
        })
    }

    pub fn user_by_username(&self, username: &str) -> StoreResult<UserRecord> {
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS),
                params![username],
                map_user,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
        })
    }

    pub fn update_password(&self, user_id: &str, password_hash: &str, salt: &str) -> StoreResult<()> {
        self.with(|conn| {
            let changed = conn.execute(
                "UPDATE users SET password_hash = ?2, salt = ?3 WHERE id = ?1",
                params![user_id, password_hash, salt],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    pub fn update_llm_settings(
        &self,
        user_id: &str,
        endpoint: Option<&str>,
        model: Option<&str>,
        embedding_model: Option<&str>,
    ) -> StoreResult<()> {
        self.with(|conn| {
            let changed = conn.execute(
                "UPDATE users SET llm_endpoint = ?2, llm_model = ?3, embedding_model = ?4
                 WHERE id = ?1",
                params![user_id, endpoint, model, embedding_model],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    // ── Tokens ──────────────────────────────────────────────────

    pub fn insert_token(
        &self,
        token_hash: &str,
        user_id: &str,
        ttl_hours: i64,
    ) -> StoreResult<DateTime<Utc>> {
        let expires = Utc::now() + Duration::hours(ttl_hours);
        self.with(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO auth_tokens (token_hash, user_id, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![token_hash, user_id, expires.to_rfc3339(), now_str()],
            )?;
            Ok(expires)
        })
    }

    /// Resolve a token hash to its user, enforcing expiry. Expired tokens
    /// are removed as a side effect.
    pub fn user_for_token(&self, token_hash: &str) -> StoreResult<UserRecord> {
        let user_id: String = self.with(|conn| {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT user_id, expires_at FROM auth_tokens WHERE token_hash = ?1",
                    params![token_hash],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let (user_id, expires_at) = row.ok_or(StoreError::NotFound)?;
            if parse_ts(&expires_at) < Utc::now() {
                conn.execute(
                    "DELETE FROM auth_tokens WHERE token_hash = ?1",
                    params![token_hash],
                )?;
                return Err(StoreError::NotFound);
            }
            Ok(user_id)
        })?;
        self.user_by_id(&user_id)
    }

    pub fn delete_tokens_for_user(&self, user_id: &str) -> StoreResult<()> {
        self.with(|conn| {
            conn.execute(
                "DELETE FROM auth_tokens WHERE user_id = ?1",
                params![user_id],
            )?;
            Ok(())
        })
    }
}
