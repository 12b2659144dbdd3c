//! 会话配置：流水线对每个会话做什么的唯一权威
//!
//! 没有配置行（或开关为 false）即表示对该会话不做任何事。
//! 配置行随所属会话级联删除。

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};

/// 本地会话配置
#[derive(Debug, Clone)]
pub struct LocalChatConfig {
    pub chat_id: i64,
    /// 是否回灌并保存历史消息
    pub save_messages: bool,
    /// 是否对消息做语义增强
    pub enrich_messages: bool,
    /// 是否识别图片内容（由核心外的识别流程消费）
    pub recognize_photo: bool,
    /// 回灌下界：早于该时刻的消息不落库（不阻挡水位线推进）
    pub load_from_date: Option<DateTime<Utc>>,
    /// 增强调用的系统提示词覆盖
    pub system_prompt: Option<String>,
    /// 应答置信度阈值（由核心外的应答流程消费）
    pub answer_threshold: Option<f64>,
}

impl LocalChatConfig {
    /// 默认配置：三个开关全开，与上游管理面的默认值一致
    pub fn new(chat_id: i64) -> Self {
        Self {
            chat_id,
            save_messages: true,
            enrich_messages: true,
            recognize_photo: true,
            load_from_date: None,
            system_prompt: None,
            answer_threshold: None,
        }
    }
}

/// 会话配置 DAO（基于 sqlx）
#[derive(Clone)]
pub struct ChatConfigDao {
    db: Pool<Sqlite>,
}

impl ChatConfigDao {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    /// 获取全部会话配置
    pub async fn list_all(&self) -> Result<Vec<LocalChatConfig>> {
        let rows = sqlx::query(
            r#"
            SELECT chat_id, save_messages, enrich_messages, recognize_photo,
                   load_from_date, system_prompt, answer_threshold
            FROM chat_configs
            "#,
        )
        .fetch_all(&self.db)
        .await
        .context("查询会话配置列表失败")?;

        Ok(rows.into_iter().map(Self::row_to_config).collect())
    }

    /// 按会话 id 查询配置
    pub async fn get(&self, chat_id: i64) -> Result<Option<LocalChatConfig>> {
        let row = sqlx::query(
            r#"
            SELECT chat_id, save_messages, enrich_messages, recognize_photo,
                   load_from_date, system_prompt, answer_threshold
            FROM chat_configs
            WHERE chat_id = ?
            "#,
        )
        .bind(chat_id)
        .fetch_optional(&self.db)
        .await
        .context("查询会话配置失败")?;

        Ok(row.map(Self::row_to_config))
    }

    /// 插入或更新配置
    pub async fn create_or_update(&self, config: &LocalChatConfig) -> Result<()> {
        let sql = r#"
            INSERT INTO chat_configs (
                chat_id, save_messages, enrich_messages, recognize_photo,
                load_from_date, system_prompt, answer_threshold
            ) VALUES (?,?,?,?,?,?,?)
            ON CONFLICT(chat_id) DO UPDATE SET
                save_messages = excluded.save_messages,
                enrich_messages = excluded.enrich_messages,
                recognize_photo = excluded.recognize_photo,
                load_from_date = excluded.load_from_date,
                system_prompt = excluded.system_prompt,
                answer_threshold = excluded.answer_threshold
        "#;
        sqlx::query(sql)
            .bind(config.chat_id)
            .bind(if config.save_messages { 1 } else { 0 })
            .bind(if config.enrich_messages { 1 } else { 0 })
            .bind(if config.recognize_photo { 1 } else { 0 })
            .bind(config.load_from_date)
            .bind(&config.system_prompt)
            .bind(config.answer_threshold)
            .execute(&self.db)
            .await
            .context("插入或更新会话配置失败")?;
        Ok(())
    }

    /// 删除配置
    pub async fn delete(&self, chat_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM chat_configs WHERE chat_id = ?")
            .bind(chat_id)
            .execute(&self.db)
            .await
            .context("删除会话配置失败")?;
        Ok(())
    }

    fn row_to_config(row: sqlx::sqlite::SqliteRow) -> LocalChatConfig {
        let save_messages: i64 = row.get("save_messages");
        let enrich_messages: i64 = row.get("enrich_messages");
        let recognize_photo: i64 = row.get("recognize_photo");
        LocalChatConfig {
            chat_id: row.get("chat_id"),
            save_messages: save_messages != 0,
            enrich_messages: enrich_messages != 0,
            recognize_photo: recognize_photo != 0,
            load_from_date: row.get("load_from_date"),
            system_prompt: row.get("system_prompt"),
            answer_threshold: row.get("answer_threshold"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tg::chat::models::LocalChat;
    use crate::tg::chat::ChatDao;
    use crate::tg::db::test_pool;

    async fn seed_chat(pool: &Pool<Sqlite>, chat_id: i64) {
        ChatDao::new(pool.clone())
            .upsert_chat(&LocalChat::placeholder(chat_id))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_or_update_then_get() {
        let pool = test_pool().await;
        seed_chat(&pool, 42).await;
        let dao = ChatConfigDao::new(pool);

        let mut config = LocalChatConfig::new(42);
        config.enrich_messages = false;
        config.system_prompt = Some("自定义提示词".to_string());
        dao.create_or_update(&config).await.unwrap();

        let stored = dao.get(42).await.unwrap().unwrap();
        assert!(stored.save_messages);
        assert!(!stored.enrich_messages);
        assert_eq!(stored.system_prompt.as_deref(), Some("自定义提示词"));

        // 再次写入覆盖而非新增
        config.enrich_messages = true;
        dao.create_or_update(&config).await.unwrap();
        assert_eq!(dao.list_all().await.unwrap().len(), 1);
        assert!(dao.get(42).await.unwrap().unwrap().enrich_messages);
    }

    #[tokio::test]
    async fn test_delete_and_missing_config() {
        let pool = test_pool().await;
        seed_chat(&pool, 7).await;
        let dao = ChatConfigDao::new(pool);

        assert!(dao.get(7).await.unwrap().is_none());
        dao.create_or_update(&LocalChatConfig::new(7)).await.unwrap();
        dao.delete(7).await.unwrap();
        assert!(dao.get(7).await.unwrap().is_none());
    }
}
