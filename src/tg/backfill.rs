//! 历史消息回灌作业
//!
//! 对每个 save_messages=true 且在花名册里的会话，从已存储的最旧消息 id
//! （水位线，0 表示还没有任何消息）开始逆时序分页拉取，一路走向会话
//! 历史的真正起点。落库走冲突即忽略的批量路径，绝不覆盖实时路径已
//! 写入的记录。`load_from_date` 只决定哪些行入库，从不阻挡水位线推进。

use crate::tg::chat::ChatDao;
use crate::tg::chat_config::{ChatConfigDao, LocalChatConfig};
use crate::tg::client::SourceApi;
use crate::tg::message::models::LocalMessage;
use crate::tg::message::MessageStore;
use anyhow::Result;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 单页拉取条数
pub const DEFAULT_PAGE_SIZE: i64 = 200;
/// 相邻两页之间的停顿（对源 API 的限速礼貌）
pub const DEFAULT_PAGE_PAUSE_MS: u64 = 500;

/// 回灌执行器
pub struct BackfillRunner {
    api: Arc<dyn SourceApi>,
    chats: ChatDao,
    configs: ChatConfigDao,
    messages: MessageStore,
    pub page_size: i64,
    pub page_pause_ms: u64,
}

impl BackfillRunner {
    pub fn new(db: Pool<Sqlite>, api: Arc<dyn SourceApi>) -> Self {
        Self {
            api,
            chats: ChatDao::new(db.clone()),
            configs: ChatConfigDao::new(db.clone()),
            messages: MessageStore::new(db),
            page_size: DEFAULT_PAGE_SIZE,
            page_pause_ms: DEFAULT_PAGE_PAUSE_MS,
        }
    }

    /// 对所有开启保存的会话执行一轮回灌
    ///
    /// 单个会话的拉取失败记录日志后放弃到下个调度周期，不做即时重试
    pub async fn run(&self) -> Result<()> {
        let configs = self.configs.list_all().await?;
        let active: Vec<LocalChatConfig> =
            configs.into_iter().filter(|c| c.save_messages).collect();
        if active.is_empty() {
            info!("[Backfill] 没有开启保存的会话，跳过回灌");
            return Ok(());
        }

        info!("[Backfill] 🔄 开始回灌，待处理会话数: {}", active.len());
        for cfg in active.iter() {
            match self.backfill_chat(cfg).await {
                Ok(count) => {
                    info!(
                        "[Backfill] ✅ 会话回灌完成: chat_id={}, 新增 {} 条",
                        cfg.chat_id, count
                    );
                }
                Err(e) => {
                    warn!(
                        "[Backfill] ⚠️ 会话回灌失败（留待下个周期）: chat_id={}, 错误: {}",
                        cfg.chat_id, e
                    );
                }
            }
        }
        Ok(())
    }

    /// 回灌单个会话，返回新增条数
    pub async fn backfill_chat(&self, cfg: &LocalChatConfig) -> Result<u64> {
        // 花名册核对：会话记录由对话同步维护，尚未同步到的会话留待下轮
        if self.chats.get_chat(cfg.chat_id).await?.is_none() {
            warn!(
                "[Backfill] 花名册中没有会话 {}，等待对话同步补齐",
                cfg.chat_id
            );
            return Ok(0);
        }

        let mut watermark = self.messages.get_first_message_id(cfg.chat_id).await?;
        let mut total = 0u64;
        info!(
            "[Backfill] 会话 {} 从水位线 {} 开始回灌",
            cfg.chat_id, watermark
        );

        loop {
            let page = self
                .api
                .get_history(cfg.chat_id, watermark, self.page_size)
                .await?;
            if page.is_empty() {
                debug!("[Backfill] 会话 {} 已到达历史起点", cfg.chat_id);
                break;
            }

            let mut batch: Vec<LocalMessage> = Vec::new();
            let mut min_id = i64::MAX;
            for raw in page.iter() {
                let msg = match LocalMessage::from_raw(raw) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("[Backfill] ⚠️ 跳过无法解析的消息: {}", e);
                        continue;
                    }
                };
                min_id = min_id.min(msg.message_id);
                // 无内容的系统动作不入库
                if msg.is_service_action() {
                    continue;
                }
                // 日期下界只过滤入库行，水位线照常推进
                if let Some(floor) = cfg.load_from_date {
                    if msg.date < floor {
                        continue;
                    }
                }
                batch.push(msg);
            }

            if min_id == i64::MAX {
                warn!("[Backfill] 会话 {} 整页消息均无法解析，放弃本轮", cfg.chat_id);
                break;
            }
            // 水位线必须严格下降，循环才能收敛
            if watermark != 0 && min_id >= watermark {
                warn!(
                    "[Backfill] 会话 {} 水位线未推进 ({} -> {})，终止本轮",
                    cfg.chat_id, watermark, min_id
                );
                break;
            }

            total += self.messages.save_messages_batch(&batch).await?;
            watermark = min_id;
            debug!(
                "[Backfill] 会话 {} 水位线推进到 {}，累计新增 {} 条",
                cfg.chat_id, watermark, total
            );

            tokio::time::sleep(Duration::from_millis(self.page_pause_ms)).await;
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tg::chat::models::LocalChat;
    use crate::tg::db::test_pool;
    use crate::tg::types::{ConnectStatus, GatewayDialog};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn raw_message(chat_id: i64, id: i64, date: &str) -> Value {
        json!({
            "_": "Message",
            "id": id,
            "peer_id": {"channel_id": chat_id},
            "from_id": {"user_id": 5},
            "date": date,
            "message": format!("msg-{}", id)
        })
    }

    fn raw_action(chat_id: i64, id: i64) -> Value {
        json!({
            "_": "MessageService",
            "id": id,
            "peer_id": {"channel_id": chat_id},
            "date": "2024-01-01T00:00:00+00:00",
            "action": {"_": "MessageActionChatAddUser"}
        })
    }

    /// 桩消息源：按会话持有全量历史，按逆时序分页应答
    struct StubSource {
        history: HashMap<i64, Vec<Value>>,
        fail_for: Option<i64>,
        history_calls: AtomicUsize,
    }

    impl StubSource {
        fn new(history: HashMap<i64, Vec<Value>>) -> Self {
            Self {
                history,
                fail_for: None,
                history_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SourceApi for StubSource {
        async fn get_status(&self) -> Result<ConnectStatus> {
            Ok(ConnectStatus {
                connected: true,
                authorized: true,
                username: None,
            })
        }

        async fn get_dialogs(&self) -> Result<Vec<GatewayDialog>> {
            Ok(Vec::new())
        }

        async fn get_history(&self, chat_id: i64, offset_id: i64, limit: i64) -> Result<Vec<Value>> {
            self.history_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_for == Some(chat_id) {
                return Err(anyhow::anyhow!("网络超时"));
            }
            let mut page: Vec<Value> = self
                .history
                .get(&chat_id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|m| offset_id == 0 || m["id"].as_i64().unwrap() < offset_id)
                .collect();
            page.sort_by_key(|m| -m["id"].as_i64().unwrap());
            page.truncate(limit as usize);
            Ok(page)
        }

        async fn get_participants(&self, _chat_id: i64) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }

        async fn get_chat(&self, _chat_id: i64) -> Result<Value> {
            Err(anyhow::anyhow!("未实现"))
        }

        async fn get_user(&self, _user_id: i64) -> Result<Value> {
            Err(anyhow::anyhow!("未实现"))
        }

        async fn mark_read(&self, _chat_id: i64, _message_id: i64) -> Result<()> {
            Ok(())
        }
    }

    async fn seed_chat_with_config(pool: &Pool<Sqlite>, cfg: &LocalChatConfig) {
        ChatDao::new(pool.clone())
            .upsert_chat(&LocalChat::placeholder(cfg.chat_id))
            .await
            .unwrap();
        ChatConfigDao::new(pool.clone())
            .create_or_update(cfg)
            .await
            .unwrap();
    }

    fn runner(pool: &Pool<Sqlite>, source: Arc<StubSource>) -> BackfillRunner {
        let mut runner = BackfillRunner::new(pool.clone(), source);
        runner.page_size = 2;
        runner.page_pause_ms = 0;
        runner
    }

    #[tokio::test]
    async fn test_virgin_chat_walks_to_history_start() {
        let pool = test_pool().await;
        seed_chat_with_config(&pool, &LocalChatConfig::new(42)).await;

        let history: Vec<Value> = (1..=5)
            .map(|id| raw_message(42, id, "2024-01-01T00:00:00+00:00"))
            .collect();
        let source = Arc::new(StubSource::new(HashMap::from([(42, history)])));
        runner(&pool, source).run().await.unwrap();

        let store = MessageStore::new(pool);
        assert_eq!(store.get_first_message_id(42).await.unwrap(), 1);
        for id in 1..=5 {
            assert!(store.get_message(42, id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_resume_fills_only_older_gap() {
        let pool = test_pool().await;
        seed_chat_with_config(&pool, &LocalChatConfig::new(42)).await;
        let store = MessageStore::new(pool.clone());
        for id in [10_i64, 11, 12] {
            let live = json!({
                "id": id,
                "peer_id": {"channel_id": 42},
                "date": "2024-01-02T00:00:00+00:00",
                "message": format!("live-{}", id)
            });
            store
                .save_message(&LocalMessage::from_raw(&live).unwrap())
                .await
                .unwrap();
        }

        let history: Vec<Value> = (8..=12)
            .map(|id| raw_message(42, id, "2024-01-01T00:00:00+00:00"))
            .collect();
        let source = Arc::new(StubSource::new(HashMap::from([(42, history)])));
        runner(&pool, source).run().await.unwrap();

        assert_eq!(store.get_first_message_id(42).await.unwrap(), 8);
        // 实时路径已写入的记录未被回灌覆盖
        assert_eq!(
            store.get_message(42, 10).await.unwrap().unwrap().text(),
            "live-10"
        );
    }

    #[tokio::test]
    async fn test_service_actions_skipped_but_watermark_advances() {
        let pool = test_pool().await;
        seed_chat_with_config(&pool, &LocalChatConfig::new(42)).await;

        let history = vec![
            raw_action(42, 1),
            raw_message(42, 2, "2024-01-01T00:00:00+00:00"),
            raw_message(42, 3, "2024-01-01T00:00:00+00:00"),
        ];
        let source = Arc::new(StubSource::new(HashMap::from([(42, history)])));
        runner(&pool, source).run().await.unwrap();

        let store = MessageStore::new(pool);
        assert!(store.get_message(42, 1).await.unwrap().is_none());
        assert!(store.get_message(42, 2).await.unwrap().is_some());
        assert!(store.get_message(42, 3).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_load_from_date_filters_rows_without_blocking_walk() {
        let pool = test_pool().await;
        let mut cfg = LocalChatConfig::new(42);
        cfg.load_from_date = Some(
            chrono::DateTime::parse_from_rfc3339("2024-06-01T00:00:00+00:00")
                .unwrap()
                .with_timezone(&chrono::Utc),
        );
        seed_chat_with_config(&pool, &cfg).await;

        let history = vec![
            raw_message(42, 1, "2024-01-01T00:00:00+00:00"), // 早于下界
            raw_message(42, 2, "2024-07-01T00:00:00+00:00"),
            raw_message(42, 3, "2024-07-02T00:00:00+00:00"),
        ];
        let source = Arc::new(StubSource::new(HashMap::from([(42, history)])));
        runner(&pool, source).run().await.unwrap();

        let store = MessageStore::new(pool);
        assert!(store.get_message(42, 1).await.unwrap().is_none());
        assert!(store.get_message(42, 2).await.unwrap().is_some());
        assert!(store.get_message(42, 3).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fetch_failure_abandons_chat_but_not_cycle() {
        let pool = test_pool().await;
        seed_chat_with_config(&pool, &LocalChatConfig::new(1)).await;
        seed_chat_with_config(&pool, &LocalChatConfig::new(2)).await;

        let mut source = StubSource::new(HashMap::from([
            (1, vec![raw_message(1, 1, "2024-01-01T00:00:00+00:00")]),
            (2, vec![raw_message(2, 1, "2024-01-01T00:00:00+00:00")]),
        ]));
        source.fail_for = Some(1);
        runner(&pool, Arc::new(source)).run().await.unwrap();

        let store = MessageStore::new(pool);
        assert!(store.get_message(1, 1).await.unwrap().is_none());
        assert!(store.get_message(2, 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_save_messages_off_means_no_fetch() {
        let pool = test_pool().await;
        let mut cfg = LocalChatConfig::new(42);
        cfg.save_messages = false;
        seed_chat_with_config(&pool, &cfg).await;

        let source = Arc::new(StubSource::new(HashMap::from([(
            42,
            vec![raw_message(42, 1, "2024-01-01T00:00:00+00:00")],
        )])));
        runner(&pool, source.clone()).run().await.unwrap();

        assert_eq!(source.history_calls.load(Ordering::SeqCst), 0);
        assert!(MessageStore::new(pool).get_message(42, 1).await.unwrap().is_none());
    }
}
