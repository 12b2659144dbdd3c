//! 实时事件钩子
//!
//! 事件状态机：接收 -> 规整 -> 落库 -> [触发增强 | 跳过增强] -> 确认。
//! 四类事件显式分发；任何单个事件的处理失败都被捕获并记录，
//! 事件流必须继续流动，一个毒事件不能卡住后续事件。

use crate::tg::chat::models::LocalChat;
use crate::tg::chat::ChatDao;
use crate::tg::chat_config::ChatConfigDao;
use crate::tg::client::SourceApi;
use crate::tg::enrich::EnrichmentEngine;
use crate::tg::message::models::LocalMessage;
use crate::tg::message::MessageStore;
use crate::tg::types::SourceEvent;
use crate::tg::user::models::LocalUser;
use crate::tg::user::UserDao;
use anyhow::Result;
use serde_json::Value;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 实时事件钩子
pub struct EventHooks {
    api: Arc<dyn SourceApi>,
    chats: ChatDao,
    users: UserDao,
    messages: MessageStore,
    configs: ChatConfigDao,
    engine: Arc<EnrichmentEngine>,
    /// 落库后是否向上游回执已读
    mark_as_read: bool,
}

impl EventHooks {
    pub fn new(
        db: Pool<Sqlite>,
        api: Arc<dyn SourceApi>,
        engine: Arc<EnrichmentEngine>,
        mark_as_read: bool,
    ) -> Self {
        Self {
            api,
            chats: ChatDao::new(db.clone()),
            users: UserDao::new(db.clone()),
            messages: MessageStore::new(db.clone()),
            configs: ChatConfigDao::new(db),
            engine,
            mark_as_read,
        }
    }

    /// 事件分发入口：按标签匹配到对应处理器，失败只记录不上抛
    pub async fn dispatch(&self, event: SourceEvent) {
        let result = match &event {
            SourceEvent::NewMessage { raw } => self.handle_new_message(raw).await,
            SourceEvent::EditedMessage { raw } => self.handle_edited_message(raw).await,
            SourceEvent::DeletedMessages {
                chat_id,
                message_ids,
            } => self.handle_deleted_messages(*chat_id, message_ids).await,
            SourceEvent::ChatAction { chat, user, action } => {
                self.handle_chat_action(chat, user.as_ref(), action).await
            }
        };
        if let Err(e) = result {
            error!("[Hook] ❌ 事件处理失败（事件流继续）: {:#}", e);
        }
    }

    /// 新消息：懒 upsert 会话与发送者 -> 落库 -> 可选回执 -> 按配置触发增强
    async fn handle_new_message(&self, raw: &Value) -> Result<()> {
        let msg = LocalMessage::from_raw(raw)?;
        info!(
            "[Hook] 📥 新消息: chat_id={}, message_id={}, 类型={}",
            msg.chat_id, msg.message_id, msg.message_type
        );

        // 通过消息源解析归属会话；解析失败时仅在本地无记录时写占位行，
        // 保证消息外键始终有归属，且绝不覆盖已有的完整会话快照
        match self.api.get_chat(msg.chat_id).await {
            Ok(entity) => match LocalChat::from_raw(&entity) {
                Ok(chat) => self.chats.upsert_chat(&chat).await?,
                Err(e) => {
                    warn!("[Hook] ⚠️ 会话实体解析失败: {}", e);
                    self.ensure_chat_exists(msg.chat_id).await?;
                }
            },
            Err(e) => {
                warn!("[Hook] ⚠️ 会话实体拉取失败: chat_id={}, 错误: {}", msg.chat_id, e);
                self.ensure_chat_exists(msg.chat_id).await?;
            }
        }

        // 发送者解析失败不阻塞消息落库
        if let Some(sender_id) = msg.sender_id {
            match self.api.get_user(sender_id).await {
                Ok(entity) => match LocalUser::from_raw(&entity) {
                    Ok(user) => self.users.upsert_user(&user).await?,
                    Err(e) => warn!("[Hook] ⚠️ 发送者实体解析失败: {}", e),
                },
                Err(e) => warn!(
                    "[Hook] ⚠️ 发送者实体拉取失败: user_id={}, 错误: {}",
                    sender_id, e
                ),
            }
        }

        self.messages.save_message(&msg).await?;

        if self.mark_as_read {
            if let Err(e) = self.api.mark_read(msg.chat_id, msg.message_id).await {
                warn!("[Hook] ⚠️ 已读回执失败: {}", e);
            }
        }

        // 没有配置行等同于 enrich_messages=false
        let enrich = self
            .configs
            .get(msg.chat_id)
            .await?
            .map(|c| c.enrich_messages)
            .unwrap_or(false);
        if enrich {
            if let Err(e) = self.engine.process_message(msg.chat_id, msg.message_id).await {
                warn!(
                    "[Hook] ⚠️ 内联增强失败: chat_id={}, message_id={}, 错误: {}",
                    msg.chat_id, msg.message_id, e
                );
            }
        } else {
            debug!("[Hook] 会话未开启增强，跳过: chat_id={}", msg.chat_id);
        }
        Ok(())
    }

    async fn ensure_chat_exists(&self, chat_id: i64) -> Result<()> {
        if self.chats.get_chat(chat_id).await?.is_none() {
            self.chats
                .upsert_chat(&LocalChat::placeholder(chat_id))
                .await?;
        }
        Ok(())
    }

    /// 编辑事件：只替换原始快照；尚未摄取的消息静默丢弃，回灌终会补齐现状
    async fn handle_edited_message(&self, raw: &Value) -> Result<()> {
        let msg = LocalMessage::from_raw(raw)?;
        let updated = self
            .messages
            .replace_raw_data(msg.chat_id, msg.message_id, &msg.raw_data)
            .await?;
        if updated {
            info!(
                "[Hook] ✏️ 消息已编辑: chat_id={}, message_id={}",
                msg.chat_id, msg.message_id
            );
        } else {
            debug!(
                "[Hook] 编辑事件命中未知消息，按 no-op 处理: chat_id={}, message_id={}",
                msg.chat_id, msg.message_id
            );
        }
        Ok(())
    }

    /// 删除事件：批量软删除，未命中的 id 直接忽略
    async fn handle_deleted_messages(&self, chat_id: i64, message_ids: &[i64]) -> Result<()> {
        let affected = self.messages.delete_messages(chat_id, message_ids).await?;
        info!(
            "[Hook] 🗑️ 删除事件: chat_id={}, 请求 {} 条, 实际标记 {} 条",
            chat_id,
            message_ids.len(),
            affected
        );
        Ok(())
    }

    /// 会话动作：刷新会话快照，动作发起者一并 upsert
    async fn handle_chat_action(
        &self,
        chat: &Value,
        user: Option<&Value>,
        action: &str,
    ) -> Result<()> {
        let local_chat = LocalChat::from_raw(chat)?;
        self.chats.upsert_chat(&local_chat).await?;
        if let Some(user_entity) = user {
            match LocalUser::from_raw(user_entity) {
                Ok(local_user) => self.users.upsert_user(&local_user).await?,
                Err(e) => warn!("[Hook] ⚠️ 动作发起者解析失败: {}", e),
            }
        }
        info!(
            "[Hook] 👥 会话动作: chat_id={}, action={}",
            local_chat.id, action
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tg::chat_config::LocalChatConfig;
    use crate::tg::db::test_pool;
    use crate::tg::enrich::{EnrichedMessageData, EnrichmentModel};
    use crate::tg::enriched::{EnrichedMessageStore, EMBEDDING_DIM};
    use crate::tg::types::{ConnectStatus, GatewayDialog};
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, Once};

    static INIT_LOGGER: Once = Once::new();

    fn init_test_logger() {
        INIT_LOGGER.call_once(|| {
            use tracing_subscriber::prelude::*;
            use tracing_subscriber::EnvFilter;

            // 测试中默认打开当前 crate 和 sqlx 的 debug，关闭底层 HTTP 客户端的 debug 噪音
            let filter_layer = EnvFilter::new(
                "info,tg_pipeline_rust=debug,sqlx=debug,hyper_util::client=info,reqwest=info",
            );

            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(false)
                .with_test_writer();

            tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt_layer)
                .init();
        });
    }

    /// 桩消息源：按固定实体应答，记录已读回执
    struct StubSource {
        read_acks: Mutex<Vec<(i64, i64)>>,
    }

    impl StubSource {
        fn new() -> Self {
            Self {
                read_acks: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SourceApi for StubSource {
        async fn get_status(&self) -> Result<ConnectStatus> {
            Ok(ConnectStatus {
                connected: true,
                authorized: true,
                username: Some("stub".to_string()),
            })
        }

        async fn get_dialogs(&self) -> Result<Vec<GatewayDialog>> {
            Ok(Vec::new())
        }

        async fn get_history(
            &self,
            _chat_id: i64,
            _offset_id: i64,
            _limit: i64,
        ) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }

        async fn get_participants(&self, _chat_id: i64) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }

        async fn get_chat(&self, chat_id: i64) -> Result<Value> {
            Ok(json!({"_": "Channel", "id": chat_id, "title": "测试群", "megagroup": true}))
        }

        async fn get_user(&self, user_id: i64) -> Result<Value> {
            Ok(json!({"_": "User", "id": user_id, "username": "ada"}))
        }

        async fn mark_read(&self, chat_id: i64, message_id: i64) -> Result<()> {
            self.read_acks.lock().unwrap().push((chat_id, message_id));
            Ok(())
        }
    }

    /// 桩模型：计数并返回固定结果
    struct StubModel {
        infer_calls: AtomicUsize,
    }

    #[async_trait]
    impl EnrichmentModel for StubModel {
        async fn infer(&self, _system_prompt: &str, _context: &str) -> Result<EnrichedMessageData> {
            self.infer_calls.fetch_add(1, Ordering::SeqCst);
            Ok(EnrichedMessageData {
                context: "上下文".to_string(),
                meaning: "含义".to_string(),
            })
        }

        async fn embed(&self, _input: &str) -> Result<Vec<f32>> {
            Ok(vec![0.1; EMBEDDING_DIM])
        }
    }

    struct Fixture {
        pool: Pool<Sqlite>,
        hooks: EventHooks,
        source: Arc<StubSource>,
        model: Arc<StubModel>,
    }

    async fn fixture(mark_as_read: bool) -> Fixture {
        init_test_logger();
        let pool = test_pool().await;
        let source = Arc::new(StubSource::new());
        let model = Arc::new(StubModel {
            infer_calls: AtomicUsize::new(0),
        });
        let engine = Arc::new(EnrichmentEngine::new(pool.clone(), model.clone()));
        let hooks = EventHooks::new(pool.clone(), source.clone(), engine, mark_as_read);
        Fixture {
            pool,
            hooks,
            source,
            model,
        }
    }

    async fn seed_config(pool: &Pool<Sqlite>, chat_id: i64, enrich: bool) {
        ChatDao::new(pool.clone())
            .upsert_chat(&LocalChat::placeholder(chat_id))
            .await
            .unwrap();
        let mut cfg = LocalChatConfig::new(chat_id);
        cfg.enrich_messages = enrich;
        ChatConfigDao::new(pool.clone())
            .create_or_update(&cfg)
            .await
            .unwrap();
    }

    fn new_message_event(chat_id: i64, message_id: i64, text: &str) -> SourceEvent {
        SourceEvent::NewMessage {
            raw: json!({
                "_": "Message",
                "id": message_id,
                "peer_id": {"channel_id": chat_id},
                "from_id": {"user_id": 5},
                "date": "2024-01-01T12:00:00+00:00",
                "message": text
            }),
        }
    }

    #[tokio::test]
    async fn test_new_message_with_enrichment_enabled() {
        let f = fixture(false).await;
        seed_config(&f.pool, 42, true).await;

        f.hooks.dispatch(new_message_event(42, 7, "hello")).await;

        // 会话被消息源的完整快照覆盖
        let chat = ChatDao::new(f.pool.clone()).get_chat(42).await.unwrap().unwrap();
        assert_eq!(chat.chat_type, "supergroup");
        assert_eq!(chat.title.as_deref(), Some("测试群"));

        let user = UserDao::new(f.pool.clone()).get_user(5).await.unwrap().unwrap();
        assert_eq!(user.username.as_deref(), Some("ada"));

        let msg = MessageStore::new(f.pool.clone())
            .get_message(42, 7)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.message_type, "text");
        assert_eq!(msg.text(), "hello");

        let enriched = EnrichedMessageStore::new(f.pool.clone())
            .get_all()
            .await
            .unwrap();
        assert_eq!(enriched.len(), 1);
        assert_eq!(enriched[0].message_id, 7);
        assert_eq!(enriched[0].embedding.len(), EMBEDDING_DIM);
        assert_eq!(f.model.infer_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_new_message_with_enrichment_disabled() {
        let f = fixture(false).await;
        seed_config(&f.pool, 42, false).await;

        f.hooks.dispatch(new_message_event(42, 7, "hello")).await;

        assert!(MessageStore::new(f.pool.clone())
            .get_message(42, 7)
            .await
            .unwrap()
            .is_some());
        assert!(EnrichedMessageStore::new(f.pool.clone())
            .get_all()
            .await
            .unwrap()
            .is_empty());
        assert_eq!(f.model.infer_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_new_message_without_config_skips_enrichment() {
        let f = fixture(false).await;
        f.hooks.dispatch(new_message_event(42, 7, "hello")).await;
        assert!(MessageStore::new(f.pool.clone())
            .get_message(42, 7)
            .await
            .unwrap()
            .is_some());
        assert_eq!(f.model.infer_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mark_as_read_ack_is_sent() {
        let f = fixture(true).await;
        f.hooks.dispatch(new_message_event(42, 7, "hello")).await;
        assert_eq!(*f.source.read_acks.lock().unwrap(), vec![(42, 7)]);
    }

    #[tokio::test]
    async fn test_edited_message_replaces_raw_only() {
        let f = fixture(false).await;
        f.hooks.dispatch(new_message_event(42, 7, "原文")).await;

        f.hooks
            .dispatch(SourceEvent::EditedMessage {
                raw: json!({
                    "id": 7,
                    "peer_id": {"channel_id": 42},
                    "message": "改过的正文",
                    "edit_date": 1704110400
                }),
            })
            .await;

        let msg = MessageStore::new(f.pool.clone())
            .get_message(42, 7)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.text(), "改过的正文");
        // 分类字段不随编辑变化
        assert_eq!(msg.message_type, "text");
    }

    #[tokio::test]
    async fn test_edited_unknown_message_is_noop() {
        let f = fixture(false).await;
        f.hooks
            .dispatch(SourceEvent::EditedMessage {
                raw: json!({"id": 99, "peer_id": {"channel_id": 42}, "message": "x"}),
            })
            .await;
        assert!(MessageStore::new(f.pool.clone())
            .get_message(42, 99)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_deleted_messages_soft_delete() {
        let f = fixture(false).await;
        f.hooks.dispatch(new_message_event(42, 7, "bye")).await;
        f.hooks
            .dispatch(SourceEvent::DeletedMessages {
                chat_id: 42,
                message_ids: vec![7, 999],
            })
            .await;
        let msg = MessageStore::new(f.pool.clone())
            .get_message(42, 7)
            .await
            .unwrap()
            .unwrap();
        assert!(msg.is_deleted);
    }

    #[tokio::test]
    async fn test_chat_action_upserts_chat_and_user() {
        let f = fixture(false).await;
        f.hooks
            .dispatch(SourceEvent::ChatAction {
                chat: json!({"_": "Chat", "id": 9, "title": "动作群"}),
                user: Some(json!({"_": "User", "id": 5, "username": "joiner"})),
                action: "user_joined".to_string(),
            })
            .await;
        assert!(ChatDao::new(f.pool.clone()).get_chat(9).await.unwrap().is_some());
        assert!(UserDao::new(f.pool.clone()).get_user(5).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_poisoned_event_does_not_stop_the_stream() {
        let f = fixture(false).await;
        // 缺 id 的畸形消息：处理失败但不 panic，后续事件照常处理
        f.hooks
            .dispatch(SourceEvent::NewMessage {
                raw: json!({"peer_id": {"channel_id": 42}}),
            })
            .await;
        f.hooks.dispatch(new_message_event(42, 8, "仍然活着")).await;
        assert!(MessageStore::new(f.pool.clone())
            .get_message(42, 8)
            .await
            .unwrap()
            .is_some());
    }
}
