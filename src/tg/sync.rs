//! 对话同步作业
//!
//! 遍历消息源可见的全部对话，刷新会话花名册与参与者名单。
//! 花名册是回灌作业的依据：回灌只处理花名册里且配置开启的会话。

use crate::tg::chat::models::LocalChat;
use crate::tg::chat::ChatDao;
use crate::tg::client::SourceApi;
use crate::tg::user::models::LocalUser;
use crate::tg::user::UserDao;
use anyhow::Result;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use tracing::{info, warn};

/// 对话同步器
pub struct DialogSyncer {
    api: Arc<dyn SourceApi>,
    chats: ChatDao,
    users: UserDao,
}

impl DialogSyncer {
    pub fn new(db: Pool<Sqlite>, api: Arc<dyn SourceApi>) -> Self {
        Self {
            api,
            chats: ChatDao::new(db.clone()),
            users: UserDao::new(db),
        }
    }

    /// 全量同步一轮：每个对话 upsert 会话，单人对话的对端与参与者 upsert 为用户
    ///
    /// 单个对话的失败（包括参与者枚举无权限）只记录日志，整轮继续
    pub async fn sync_dialogs(&self) -> Result<()> {
        info!("[DialogSync] 🔄 开始同步对话...");
        let dialogs = self.api.get_dialogs().await?;

        let mut chat_count = 0usize;
        let mut user_count = 0usize;
        for dialog in dialogs.iter() {
            match self.sync_one_dialog(&dialog.entity).await {
                Ok(users) => {
                    chat_count += 1;
                    user_count += users;
                }
                Err(e) => {
                    warn!("[DialogSync] ⚠️ 单个对话同步失败（跳过）: {}", e);
                }
            }
        }

        info!(
            "[DialogSync] ✅ 对话同步完成 - 会话: {}, 用户: {}",
            chat_count, user_count
        );
        Ok(())
    }

    async fn sync_one_dialog(&self, entity: &serde_json::Value) -> Result<usize> {
        let chat = LocalChat::from_raw(entity)?;
        info!(
            "[DialogSync] 处理对话: {} (id={}, 类型={})",
            chat.title.as_deref().unwrap_or("<无标题>"),
            chat.id,
            chat.chat_type
        );
        self.chats.upsert_chat(&chat).await?;

        let mut user_count = 0usize;

        // 单人对话的对端本身也是用户
        if chat.chat_type == "user" {
            match LocalUser::from_raw(entity) {
                Ok(user) => {
                    self.users.upsert_user(&user).await?;
                    user_count += 1;
                }
                Err(e) => warn!("[DialogSync] ⚠️ 对端用户解析失败: {}", e),
            }
        }

        // 参与者枚举可能因权限不足失败，按对话粒度隔离
        match self.api.get_participants(chat.id).await {
            Ok(participants) => {
                for participant in participants.iter() {
                    match LocalUser::from_raw(participant) {
                        Ok(user) => {
                            self.users.upsert_user(&user).await?;
                            user_count += 1;
                        }
                        Err(e) => warn!("[DialogSync] ⚠️ 参与者解析失败: {}", e),
                    }
                }
            }
            Err(e) => {
                warn!(
                    "[DialogSync] ⚠️ 参与者枚举失败: chat_id={}, 错误: {}",
                    chat.id, e
                );
            }
        }

        Ok(user_count)
    }
}
