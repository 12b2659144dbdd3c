//! 会话数据访问层（DAO）
//!
//! 所有写入均为幂等 upsert：同一会话 id 重复保存只会合并字段，
//! 不会产生重复行，created_at 在冲突时保持首次写入值。

use crate::tg::chat::models::LocalChat;
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{Pool, Row, Sqlite};
use tracing::debug;

/// 会话 DAO（基于 sqlx）
#[derive(Clone)]
pub struct ChatDao {
    db: Pool<Sqlite>,
}

impl ChatDao {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    /// 插入或更新会话
    pub async fn upsert_chat(&self, chat: &LocalChat) -> Result<()> {
        let now = Utc::now();
        let sql = r#"
            INSERT INTO chats (
                id, chat_type, title, username,
                is_verified, is_scam, is_fake, member_count,
                raw_data, created_at, updated_at
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?)
            ON CONFLICT(id) DO UPDATE SET
                chat_type = excluded.chat_type,
                title = excluded.title,
                username = excluded.username,
                is_verified = excluded.is_verified,
                is_scam = excluded.is_scam,
                is_fake = excluded.is_fake,
                member_count = excluded.member_count,
                raw_data = excluded.raw_data,
                updated_at = excluded.updated_at
        "#;
        sqlx::query(sql)
            .bind(chat.id)
            .bind(&chat.chat_type)
            .bind(&chat.title)
            .bind(&chat.username)
            .bind(if chat.is_verified { 1 } else { 0 })
            .bind(if chat.is_scam { 1 } else { 0 })
            .bind(if chat.is_fake { 1 } else { 0 })
            .bind(chat.member_count)
            .bind(Json(&chat.raw_data))
            .bind(now)
            .bind(now)
            .execute(&self.db)
            .await
            .context("插入或更新会话失败")?;

        debug!("[ChatDAO] 会话已落库: id={}, 类型={}", chat.id, chat.chat_type);
        Ok(())
    }

    /// 按 id 查询单个会话
    pub async fn get_chat(&self, chat_id: i64) -> Result<Option<LocalChat>> {
        let row = sqlx::query(
            r#"
            SELECT id, chat_type, title, username,
                   is_verified, is_scam, is_fake, member_count, raw_data
            FROM chats
            WHERE id = ?
            "#,
        )
        .bind(chat_id)
        .fetch_optional(&self.db)
        .await
        .context("查询单个会话失败")?;

        Ok(row.map(Self::row_to_chat))
    }

    /// 获取全部会话（按标题排序）
    pub async fn list_chats(&self) -> Result<Vec<LocalChat>> {
        let rows = sqlx::query(
            r#"
            SELECT id, chat_type, title, username,
                   is_verified, is_scam, is_fake, member_count, raw_data
            FROM chats
            ORDER BY title
            "#,
        )
        .fetch_all(&self.db)
        .await
        .context("查询会话列表失败")?;

        Ok(rows.into_iter().map(Self::row_to_chat).collect())
    }

    fn row_to_chat(row: sqlx::sqlite::SqliteRow) -> LocalChat {
        let is_verified: i64 = row.get("is_verified");
        let is_scam: i64 = row.get("is_scam");
        let is_fake: i64 = row.get("is_fake");
        LocalChat {
            id: row.get("id"),
            chat_type: row.get("chat_type"),
            title: row.get("title"),
            username: row.get("username"),
            is_verified: is_verified != 0,
            is_scam: is_scam != 0,
            is_fake: is_fake != 0,
            member_count: row.get("member_count"),
            raw_data: row.get::<Json<Value>, _>("raw_data").0,
        }
    }
}
