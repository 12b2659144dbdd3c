//! 增强记录数据访问层（DAO）

use crate::tg::enriched::models::{
    embedding_from_bytes, embedding_to_bytes, LocalEnrichedMessage, EMBEDDING_DIM,
};
use anyhow::{Context, Result};
use sqlx::{Pool, Row, Sqlite};
use tracing::debug;

/// 增强记录存储（基于 sqlx）
#[derive(Clone)]
pub struct EnrichedMessageStore {
    db: Pool<Sqlite>,
}

impl EnrichedMessageStore {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    /// 插入或更新增强记录
    ///
    /// 同一 (chat_id, message_id) 重复写入覆盖而非新增，定期重算是安全的；
    /// 向量维度不等于声明维度时写入失败
    pub async fn save(&self, enriched: &LocalEnrichedMessage) -> Result<()> {
        if enriched.embedding.len() != EMBEDDING_DIM {
            return Err(anyhow::anyhow!(
                "嵌入向量维度不匹配: 期望 {}, 实际 {}",
                EMBEDDING_DIM,
                enriched.embedding.len()
            ));
        }
        let sql = r#"
            INSERT INTO messages_enriched (chat_id, message_id, context, meaning, embedding)
            VALUES (?,?,?,?,?)
            ON CONFLICT(chat_id, message_id) DO UPDATE SET
                context = excluded.context,
                meaning = excluded.meaning,
                embedding = excluded.embedding
        "#;
        sqlx::query(sql)
            .bind(enriched.chat_id)
            .bind(enriched.message_id)
            .bind(&enriched.context)
            .bind(&enriched.meaning)
            .bind(embedding_to_bytes(&enriched.embedding))
            .execute(&self.db)
            .await
            .context("插入或更新增强记录失败")?;

        debug!(
            "[EnrichedDAO] 增强记录已落库: chat_id={}, message_id={}",
            enriched.chat_id, enriched.message_id
        );
        Ok(())
    }

    /// 按复合键查询单条增强记录
    pub async fn get_one(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Option<LocalEnrichedMessage>> {
        let row = sqlx::query(
            r#"
            SELECT chat_id, message_id, context, meaning, embedding
            FROM messages_enriched
            WHERE chat_id = ? AND message_id = ?
            "#,
        )
        .bind(chat_id)
        .bind(message_id)
        .fetch_optional(&self.db)
        .await
        .context("查询增强记录失败")?;

        Ok(row.map(Self::row_to_enriched))
    }

    /// 获取全部增强记录
    pub async fn get_all(&self) -> Result<Vec<LocalEnrichedMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT chat_id, message_id, context, meaning, embedding
            FROM messages_enriched
            "#,
        )
        .fetch_all(&self.db)
        .await
        .context("查询增强记录列表失败")?;

        Ok(rows.into_iter().map(Self::row_to_enriched).collect())
    }

    fn row_to_enriched(row: sqlx::sqlite::SqliteRow) -> LocalEnrichedMessage {
        let context: Option<String> = row.get("context");
        let meaning: Option<String> = row.get("meaning");
        let embedding: Option<Vec<u8>> = row.get("embedding");
        LocalEnrichedMessage {
            chat_id: row.get("chat_id"),
            message_id: row.get("message_id"),
            context: context.unwrap_or_default(),
            meaning: meaning.unwrap_or_default(),
            embedding: embedding
                .map(|bytes| embedding_from_bytes(&bytes))
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tg::chat::models::LocalChat;
    use crate::tg::chat::ChatDao;
    use crate::tg::db::test_pool;

    fn make_enriched(chat_id: i64, message_id: i64, context: &str) -> LocalEnrichedMessage {
        LocalEnrichedMessage {
            chat_id,
            message_id,
            context: context.to_string(),
            meaning: "含义".to_string(),
            embedding: vec![0.5; EMBEDDING_DIM],
        }
    }

    #[tokio::test]
    async fn test_save_twice_keeps_single_row_with_last_content() {
        let pool = test_pool().await;
        ChatDao::new(pool.clone())
            .upsert_chat(&LocalChat::placeholder(42))
            .await
            .unwrap();
        let store = EnrichedMessageStore::new(pool.clone());

        store.save(&make_enriched(42, 7, "第一次")).await.unwrap();
        store.save(&make_enriched(42, 7, "第二次")).await.unwrap();

        let count: i64 = sqlx::query("SELECT COUNT(*) AS cnt FROM messages_enriched")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("cnt");
        assert_eq!(count, 1);

        let stored = store.get_one(42, 7).await.unwrap().unwrap();
        assert_eq!(stored.context, "第二次");
        assert_eq!(stored.embedding.len(), EMBEDDING_DIM);
    }

    #[tokio::test]
    async fn test_save_rejects_wrong_dimension() {
        let pool = test_pool().await;
        ChatDao::new(pool.clone())
            .upsert_chat(&LocalChat::placeholder(42))
            .await
            .unwrap();
        let store = EnrichedMessageStore::new(pool);

        let mut enriched = make_enriched(42, 7, "x");
        enriched.embedding = vec![0.5; 8];
        assert!(store.save(&enriched).await.is_err());
        assert!(store.get_one(42, 7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_all() {
        let pool = test_pool().await;
        ChatDao::new(pool.clone())
            .upsert_chat(&LocalChat::placeholder(1))
            .await
            .unwrap();
        let store = EnrichedMessageStore::new(pool);
        store.save(&make_enriched(1, 1, "a")).await.unwrap();
        store.save(&make_enriched(1, 2, "b")).await.unwrap();
        assert_eq!(store.get_all().await.unwrap().len(), 2);
    }
}
