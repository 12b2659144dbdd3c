//! 用户数据访问层（DAO）

use crate::tg::user::models::LocalUser;
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;

/// 用户 DAO（基于 sqlx）
#[derive(Clone)]
pub struct UserDao {
    db: Pool<Sqlite>,
}

impl UserDao {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    /// 插入或更新用户
    pub async fn upsert_user(&self, user: &LocalUser) -> Result<()> {
        let now = Utc::now();
        let sql = r#"
            INSERT INTO users (
                id, username, first_name, last_name,
                is_bot, is_verified, is_scam, is_fake, is_premium,
                raw_data, created_at, updated_at
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?)
            ON CONFLICT(id) DO UPDATE SET
                username = excluded.username,
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                is_bot = excluded.is_bot,
                is_verified = excluded.is_verified,
                is_scam = excluded.is_scam,
                is_fake = excluded.is_fake,
                is_premium = excluded.is_premium,
                raw_data = excluded.raw_data,
                updated_at = excluded.updated_at
        "#;
        sqlx::query(sql)
            .bind(user.id)
            .bind(&user.username)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(if user.is_bot { 1 } else { 0 })
            .bind(if user.is_verified { 1 } else { 0 })
            .bind(if user.is_scam { 1 } else { 0 })
            .bind(if user.is_fake { 1 } else { 0 })
            .bind(if user.is_premium { 1 } else { 0 })
            .bind(Json(&user.raw_data))
            .bind(now)
            .bind(now)
            .execute(&self.db)
            .await
            .context("插入或更新用户失败")?;
        Ok(())
    }

    /// 按 id 查询单个用户
    pub async fn get_user(&self, user_id: i64) -> Result<Option<LocalUser>> {
        let row = sqlx::query(
            r#"
            SELECT id, username, first_name, last_name,
                   is_bot, is_verified, is_scam, is_fake, is_premium, raw_data
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await
        .context("查询单个用户失败")?;

        Ok(row.map(Self::row_to_user))
    }

    /// 批量按 id 查询，返回 id -> 用户 的映射（提示词展示名用）
    pub async fn get_users_by_ids(&self, ids: &[i64]) -> Result<HashMap<i64, LocalUser>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            r#"
            SELECT id, username, first_name, last_name,
                   is_bot, is_verified, is_scam, is_fake, is_premium, raw_data
            FROM users
            WHERE id IN ({})
            "#,
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&self.db)
            .await
            .context("批量查询用户失败")?;

        Ok(rows
            .into_iter()
            .map(Self::row_to_user)
            .map(|u| (u.id, u))
            .collect())
    }

    fn row_to_user(row: sqlx::sqlite::SqliteRow) -> LocalUser {
        let is_bot: i64 = row.get("is_bot");
        let is_verified: i64 = row.get("is_verified");
        let is_scam: i64 = row.get("is_scam");
        let is_fake: i64 = row.get("is_fake");
        let is_premium: i64 = row.get("is_premium");
        LocalUser {
            id: row.get("id"),
            username: row.get("username"),
            first_name: row.get("first_name"),
            last_name: row.get("last_name"),
            is_bot: is_bot != 0,
            is_verified: is_verified != 0,
            is_scam: is_scam != 0,
            is_fake: is_fake != 0,
            is_premium: is_premium != 0,
            raw_data: row.get::<Json<Value>, _>("raw_data").0,
        }
    }
}
