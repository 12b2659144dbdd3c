//! 消息语义增强引擎
//!
//! 对每条 (chat_id, message_id) 恰好产出一条增强记录：
//! 先重建对话上下文（回复链 + 最近窗口 + 目标消息），
//! 再调用模型归纳上下文与含义，最后对归纳结果求嵌入向量并落库。
//! 只有两次模型调用全部成功后才写库，失败不会留下半成品。

pub mod api;

use crate::tg::chat_config::ChatConfigDao;
use crate::tg::enriched::models::{LocalEnrichedMessage, EMBEDDING_DIM};
use crate::tg::enriched::EnrichedMessageStore;
use crate::tg::message::models::LocalMessage;
use crate::tg::message::MessageStore;
use crate::tg::user::UserDao;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sqlx::{Pool, Sqlite};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

/// 最近窗口默认长度（目标消息之前的消息条数）
pub const DEFAULT_CONTEXT_WINDOW: i64 = 50;

/// 默认系统提示词（可被 ChatConfig.system_prompt 按会话覆盖）
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"你是群聊档案助手，负责归纳聊天记录。
输入的每一行格式为：
消息 {编号}: 来自 {用户名}: "{内容}"
或（当该消息是回复时）：
消息 {编号}: 来自 {用户名} 回复 id={被回复编号}: "{内容}"
编号只用来帮助你理解消息的先后顺序与回复关系，聊天参与者看不到它们。
如果当前消息处在一条回复链上，归纳上下文时必须体现这条链。
你要完成两件事：
1. 归纳当前消息之前的对话上下文（context）；
2. 归纳当前消息本身的含义（meaning）。
输出 JSON 对象，仅包含 context 与 meaning 两个字符串字段。"#;

/// 模型约定的结构化输出（两个自由文本字段）
#[derive(Debug, Clone, Deserialize)]
pub struct EnrichedMessageData {
    pub context: String,
    pub meaning: String,
}

impl EnrichedMessageData {
    /// 结构化输出的 JSON Schema（guided_json 约束用）
    pub fn json_schema() -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "context": {"type": "string"},
                "meaning": {"type": "string"}
            },
            "required": ["context", "meaning"]
        })
    }
}

/// 增强模型的窄接口
///
/// 生产实现为 OpenAI 兼容端点的 HTTP 客户端，单测用桩实现替换
#[async_trait]
pub trait EnrichmentModel: Send + Sync {
    /// 结构化补全：归纳上下文与含义，输出不符合约定结构即为硬失败
    async fn infer(&self, system_prompt: &str, context: &str) -> Result<EnrichedMessageData>;

    /// 文本嵌入：返回定长稠密向量
    async fn embed(&self, input: &str) -> Result<Vec<f32>>;
}

/// 把一条消息渲染成提示词里的一行
///
/// 该格式稳定且可复现，会原样进入模型提示词
pub fn format_message_line(msg: &LocalMessage, names: &HashMap<i64, String>) -> String {
    let name = match msg.sender_id {
        Some(id) => names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| format!("用户 {}", id)),
        None => "未知发送者".to_string(),
    };
    match msg.reply_to_msg_id() {
        Some(reply) => format!(
            "消息 {}: 来自 {} 回复 id={}: \"{}\"",
            msg.message_id,
            name,
            reply,
            msg.text()
        ),
        None => format!("消息 {}: 来自 {}: \"{}\"", msg.message_id, name, msg.text()),
    }
}

/// 增强引擎
pub struct EnrichmentEngine {
    messages: MessageStore,
    users: UserDao,
    configs: ChatConfigDao,
    enriched: EnrichedMessageStore,
    model: Arc<dyn EnrichmentModel>,
    context_window: i64,
}

impl EnrichmentEngine {
    pub fn new(db: Pool<Sqlite>, model: Arc<dyn EnrichmentModel>) -> Self {
        Self {
            messages: MessageStore::new(db.clone()),
            users: UserDao::new(db.clone()),
            configs: ChatConfigDao::new(db.clone()),
            enriched: EnrichedMessageStore::new(db),
            model,
            context_window: DEFAULT_CONTEXT_WINDOW,
        }
    }

    /// 重建目标消息的对话上下文文本
    ///
    /// 三段拼接：回复链（旧在前，不含目标）、最近窗口（旧在前）、目标消息。
    /// 目标消息不存在时返回 None
    pub async fn collect_message_context(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Option<String>> {
        let target = match self.messages.get_message(chat_id, message_id).await? {
            Some(msg) => msg,
            None => return Ok(None),
        };
        let thread = self.messages.get_messages_thread(chat_id, message_id).await?;
        let window = self
            .messages
            .get_previous_n_messages(chat_id, message_id, self.context_window)
            .await?;

        // 汇总涉及的发送者，一次性取展示名
        let sender_ids: HashSet<i64> = thread
            .iter()
            .chain(window.iter())
            .chain(std::iter::once(&target))
            .filter_map(|m| m.sender_id)
            .collect();
        let sender_ids: Vec<i64> = sender_ids.into_iter().collect();
        let users = self.users.get_users_by_ids(&sender_ids).await?;
        let names: HashMap<i64, String> = users
            .iter()
            .map(|(id, user)| (*id, user.display_name()))
            .collect();

        let thread_lines = thread
            .iter()
            .map(|m| format_message_line(m, &names))
            .collect::<Vec<_>>()
            .join("\n");
        let window_lines = window
            .iter()
            .map(|m| format_message_line(m, &names))
            .collect::<Vec<_>>()
            .join("\n");
        let target_line = format_message_line(&target, &names);

        Ok(Some(format!(
            "回复链：\n{}\n\n最近的消息：\n{}\n\n当前消息：\n{}",
            thread_lines, window_lines, target_line
        )))
    }

    /// 对单条消息执行完整增强流程
    pub async fn process_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        let context = self
            .collect_message_context(chat_id, message_id)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "待增强的消息不存在: chat_id={}, message_id={}",
                    chat_id,
                    message_id
                )
            })?;

        let system_prompt = self
            .configs
            .get(chat_id)
            .await?
            .and_then(|c| c.system_prompt)
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

        let data = self
            .model
            .infer(&system_prompt, &context)
            .await
            .context("结构化补全调用失败")?;

        let embedding_input = format!("上下文\n{}\n\n含义\n{}", data.context, data.meaning);
        let embedding = self
            .model
            .embed(&embedding_input)
            .await
            .context("嵌入调用失败")?;
        if embedding.len() != EMBEDDING_DIM {
            return Err(anyhow::anyhow!(
                "嵌入向量维度不匹配: 期望 {}, 实际 {}",
                EMBEDDING_DIM,
                embedding.len()
            ));
        }

        self.enriched
            .save(&LocalEnrichedMessage {
                chat_id,
                message_id,
                context: data.context,
                meaning: data.meaning,
                embedding,
            })
            .await?;

        info!(
            "[Enrich] ✅ 消息增强完成: chat_id={}, message_id={}",
            chat_id, message_id
        );
        Ok(())
    }

    /// 历史消息增强扫描：补齐所有尚无增强记录的消息
    ///
    /// 单条消息失败只记录日志，扫描继续推进
    pub async fn sweep_unenriched(&self, limit: i64) -> Result<()> {
        let configs = self.configs.list_all().await?;
        let active: Vec<_> = configs.iter().filter(|c| c.enrich_messages).collect();
        if active.is_empty() {
            info!("[Enrich] 没有开启增强的会话，跳过扫描");
            return Ok(());
        }

        for cfg in active {
            let ids = match self
                .messages
                .get_unenriched_messages(cfg.chat_id, limit)
                .await
            {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(
                        "[Enrich] ⚠️ 查询未增强消息失败: chat_id={}, 错误: {}",
                        cfg.chat_id, e
                    );
                    continue;
                }
            };
            if ids.is_empty() {
                continue;
            }
            info!(
                "[Enrich] 🔄 开始增强扫描: chat_id={}, 待处理 {} 条",
                cfg.chat_id,
                ids.len()
            );
            let mut done = 0usize;
            for message_id in ids {
                match self.process_message(cfg.chat_id, message_id).await {
                    Ok(_) => done += 1,
                    Err(e) => warn!(
                        "[Enrich] ⚠️ 单条消息增强失败: chat_id={}, message_id={}, 错误: {}",
                        cfg.chat_id, message_id, e
                    ),
                }
            }
            info!(
                "[Enrich] ✅ 增强扫描完成: chat_id={}, 成功 {} 条",
                cfg.chat_id, done
            );
        }
        Ok(())
    }
}
