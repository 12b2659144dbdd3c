//! 消息数据访问层（DAO）
//!
//! 两条写入路径：实时钩子走 `save_message`（全量 upsert，后写覆盖），
//! 历史回灌走 `save_messages_batch`（冲突即忽略，绝不覆盖实时路径
//! 可能已写入的更完整记录）。删除是软删除，行永远保留。

use crate::tg::message::models::LocalMessage;
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashSet;
use tracing::debug;

/// 消息存储（基于 sqlx / SQLite）
#[derive(Clone)]
pub struct MessageStore {
    db: Pool<Sqlite>,
}

impl MessageStore {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    fn placeholders(n: usize) -> String {
        vec!["?"; n].join(",")
    }

    /// 插入或更新单条消息（实时路径）
    ///
    /// 冲突时覆盖所有可变字段；created_at 与 is_deleted 保持原值，
    /// 重新摄取不会复活已软删除的消息
    pub async fn save_message(&self, msg: &LocalMessage) -> Result<()> {
        let now = Utc::now();
        let sql = r#"
            INSERT INTO messages (
                chat_id, message_id, sender_id, date, message_type,
                is_read, is_deleted, raw_data, created_at, updated_at
            ) VALUES (?,?,?,?,?,?,?,?,?,?)
            ON CONFLICT(chat_id, message_id) DO UPDATE SET
                sender_id = excluded.sender_id,
                date = excluded.date,
                message_type = excluded.message_type,
                is_read = excluded.is_read,
                raw_data = excluded.raw_data,
                updated_at = excluded.updated_at
        "#;
        sqlx::query(sql)
            .bind(msg.chat_id)
            .bind(msg.message_id)
            .bind(msg.sender_id)
            .bind(msg.date)
            .bind(&msg.message_type)
            .bind(if msg.is_read { 1 } else { 0 })
            .bind(if msg.is_deleted { 1 } else { 0 })
            .bind(Json(&msg.raw_data))
            .bind(now)
            .bind(now)
            .execute(&self.db)
            .await
            .context("插入或更新消息失败")?;
        Ok(())
    }

    /// 批量插入消息（回灌路径，冲突即忽略）
    ///
    /// 返回实际新增的行数
    pub async fn save_messages_batch(&self, msgs: &[LocalMessage]) -> Result<u64> {
        if msgs.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let sql = r#"
            INSERT INTO messages (
                chat_id, message_id, sender_id, date, message_type,
                is_read, is_deleted, raw_data, created_at, updated_at
            ) VALUES (?,?,?,?,?,?,?,?,?,?)
            ON CONFLICT(chat_id, message_id) DO NOTHING
        "#;
        let mut tx = self.db.begin().await.context("开启批量写入事务失败")?;
        let mut inserted = 0u64;
        for msg in msgs {
            let res = sqlx::query(sql)
                .bind(msg.chat_id)
                .bind(msg.message_id)
                .bind(msg.sender_id)
                .bind(msg.date)
                .bind(&msg.message_type)
                .bind(if msg.is_read { 1 } else { 0 })
                .bind(if msg.is_deleted { 1 } else { 0 })
                .bind(Json(&msg.raw_data))
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await
                .context("批量插入消息失败")?;
            inserted += res.rows_affected();
        }
        tx.commit().await.context("提交批量写入事务失败")?;

        debug!("[MsgDAO] 批量落库 {} 条，实际新增 {} 条", msgs.len(), inserted);
        Ok(inserted)
    }

    /// 按复合键查询单条消息
    pub async fn get_message(&self, chat_id: i64, message_id: i64) -> Result<Option<LocalMessage>> {
        let row = sqlx::query(
            r#"
            SELECT chat_id, message_id, sender_id, date, message_type,
                   is_read, is_deleted, raw_data
            FROM messages
            WHERE chat_id = ? AND message_id = ?
            "#,
        )
        .bind(chat_id)
        .bind(message_id)
        .fetch_optional(&self.db)
        .await
        .context("查询单条消息失败")?;

        Ok(row.map(Self::row_to_message))
    }

    /// 已存储的最小消息 id（回灌水位线），无消息时返回 0
    pub async fn get_first_message_id(&self, chat_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT MIN(message_id) AS min_id FROM messages WHERE chat_id = ?")
            .bind(chat_id)
            .fetch_one(&self.db)
            .await
            .context("查询最小消息 id 失败")?;
        let min_id: Option<i64> = row.get("min_id");
        Ok(min_id.unwrap_or(0))
    }

    /// 批量软删除：置 is_deleted 标记并触碰 updated_at，不存在的 id 直接忽略
    ///
    /// 返回受影响的行数
    pub async fn delete_messages(&self, chat_id: i64, message_ids: &[i64]) -> Result<u64> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE messages SET is_deleted = 1, updated_at = ? WHERE chat_id = ? AND message_id IN ({})",
            Self::placeholders(message_ids.len())
        );
        let mut query = sqlx::query(&sql).bind(Utc::now()).bind(chat_id);
        for id in message_ids {
            query = query.bind(id);
        }
        let res = query
            .execute(&self.db)
            .await
            .context("软删除消息失败")?;
        Ok(res.rows_affected())
    }

    /// 替换原始快照（编辑事件），分类字段不动
    ///
    /// 返回是否命中已有行；未命中由调用方按 no-op 处理
    pub async fn replace_raw_data(
        &self,
        chat_id: i64,
        message_id: i64,
        raw_data: &Value,
    ) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE messages SET raw_data = ?, updated_at = ? WHERE chat_id = ? AND message_id = ?",
        )
        .bind(Json(raw_data))
        .bind(Utc::now())
        .bind(chat_id)
        .bind(message_id)
        .execute(&self.db)
        .await
        .context("替换消息原始快照失败")?;
        Ok(res.rows_affected() > 0)
    }

    /// 沿 reply_to 引用回溯重建回复链
    ///
    /// 返回按时间正序（旧在前）的链条，不含目标消息本身；
    /// 引用缺失即终止，已访问集合保证引用成环时也能终止
    pub async fn get_messages_thread(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Vec<LocalMessage>> {
        let mut chain: Vec<LocalMessage> = Vec::new();
        let mut visited: HashSet<i64> = HashSet::new();
        let mut current = Some(message_id);

        while let Some(id) = current {
            if !visited.insert(id) {
                break;
            }
            match self.get_message(chat_id, id).await? {
                Some(msg) => {
                    current = msg.reply_to_msg_id();
                    chain.push(msg);
                }
                None => break,
            }
        }

        chain.retain(|m| m.message_id != message_id);
        chain.sort_by_key(|m| m.message_id);
        Ok(chain)
    }

    /// 目标消息之前最近的 n 条消息（严格小于目标 id，旧在前）
    pub async fn get_previous_n_messages(
        &self,
        chat_id: i64,
        message_id: i64,
        n: i64,
    ) -> Result<Vec<LocalMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT chat_id, message_id, sender_id, date, message_type,
                   is_read, is_deleted, raw_data
            FROM messages
            WHERE chat_id = ? AND message_id < ?
            ORDER BY message_id DESC
            LIMIT ?
            "#,
        )
        .bind(chat_id)
        .bind(message_id)
        .bind(n)
        .fetch_all(&self.db)
        .await
        .context("查询前序消息失败")?;

        let mut messages: Vec<LocalMessage> = rows.into_iter().map(Self::row_to_message).collect();
        messages.reverse();
        Ok(messages)
    }

    /// 反连接查询：尚无增强记录的消息 id（新消息优先）
    pub async fn get_unenriched_messages(&self, chat_id: i64, limit: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT m.message_id AS message_id
            FROM messages m
            LEFT JOIN messages_enriched e
                ON e.chat_id = m.chat_id AND e.message_id = m.message_id
            WHERE m.chat_id = ? AND e.message_id IS NULL
            ORDER BY m.message_id DESC
            LIMIT ?
            "#,
        )
        .bind(chat_id)
        .bind(limit)
        .fetch_all(&self.db)
        .await
        .context("查询未增强消息失败")?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<i64, _>("message_id"))
            .collect())
    }

    fn row_to_message(row: sqlx::sqlite::SqliteRow) -> LocalMessage {
        let is_read: i64 = row.get("is_read");
        let is_deleted: i64 = row.get("is_deleted");
        LocalMessage {
            chat_id: row.get("chat_id"),
            message_id: row.get("message_id"),
            sender_id: row.get("sender_id"),
            date: row.get("date"),
            message_type: row.get("message_type"),
            is_read: is_read != 0,
            is_deleted: is_deleted != 0,
            raw_data: row.get::<Json<Value>, _>("raw_data").0,
        }
    }
}
