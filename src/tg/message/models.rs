//! 消息本地模型定义与原始对象适配

use crate::tg::serialization::normalize;
use crate::tg::types::extract_peer_id;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// 本地消息结构体
#[derive(Debug, Clone)]
pub struct LocalMessage {
    pub chat_id: i64,
    pub message_id: i64,
    /// 发送者 id（服务消息没有发送者）
    pub sender_id: Option<i64>,
    pub date: DateTime<Utc>,
    /// 粗粒度分类：text / photo / document / video / audio / voice / sticker / action / media
    pub message_type: String,
    pub is_read: bool,
    pub is_deleted: bool,
    /// 规整后的完整原始快照
    pub raw_data: Value,
}

impl LocalMessage {
    /// 从网关透传的消息原始对象构造本地消息
    ///
    /// 缺省值约定：发送者缺失为 None，时间缺失取当前时刻，已读标记缺失为 false
    pub fn from_raw(raw: &Value) -> Result<LocalMessage> {
        let message_id = raw
            .get("id")
            .and_then(Value::as_i64)
            .context("消息缺少 id 字段")?;
        let chat_id = extract_peer_id(raw.get("peer_id")).context("消息缺少 peer_id 字段")?;
        let sender_id = extract_peer_id(raw.get("from_id"))
            .or_else(|| raw.get("sender_id").and_then(Value::as_i64));

        Ok(LocalMessage {
            chat_id,
            message_id,
            sender_id,
            date: parse_date(raw),
            message_type: classify_message(raw).to_string(),
            is_read: raw.get("read").and_then(Value::as_bool).unwrap_or(false),
            is_deleted: false,
            raw_data: normalize(raw),
        })
    }

    /// 消息正文（非文本消息为空串）
    pub fn text(&self) -> &str {
        self.raw_data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// 被回复消息的 id（非回复消息为 None）
    pub fn reply_to_msg_id(&self) -> Option<i64> {
        self.raw_data
            .get("reply_to")
            .and_then(|r| r.get("reply_to_msg_id"))
            .and_then(Value::as_i64)
    }

    /// 是否为无内容的系统动作消息（回灌时跳过）
    pub fn is_service_action(&self) -> bool {
        self.message_type == "action"
    }
}

/// 粗粒度消息分类
///
/// 与上游的约定一致：action 优先，media 按 photo/document/video/audio/voice/sticker
/// 的顺序匹配内部键，都不命中时归为 media，无媒体则为 text
pub fn classify_message(raw: &Value) -> &'static str {
    if raw.get("action").map(|a| !a.is_null()).unwrap_or(false) {
        return "action";
    }
    if let Some(media) = raw.get("media").filter(|m| !m.is_null()) {
        for (key, kind) in [
            ("photo", "photo"),
            ("document", "document"),
            ("video", "video"),
            ("audio", "audio"),
            ("voice", "voice"),
            ("sticker", "sticker"),
        ] {
            if media.get(key).map(|v| !v.is_null()).unwrap_or(false) {
                return kind;
            }
        }
        return "media";
    }
    "text"
}

fn parse_date(raw: &Value) -> DateTime<Utc> {
    match raw.get("date") {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        Some(v) if v.is_i64() => Utc
            .timestamp_opt(v.as_i64().unwrap(), 0)
            .single()
            .unwrap_or_else(Utc::now),
        _ => Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_raw_text_message() {
        let raw = json!({
            "_": "Message",
            "id": 7,
            "peer_id": {"channel_id": 42},
            "from_id": {"user_id": 5},
            "date": "2024-01-01T12:00:00+00:00",
            "message": "hello"
        });
        let msg = LocalMessage::from_raw(&raw).unwrap();
        assert_eq!(msg.chat_id, 42);
        assert_eq!(msg.message_id, 7);
        assert_eq!(msg.sender_id, Some(5));
        assert_eq!(msg.message_type, "text");
        assert_eq!(msg.text(), "hello");
        assert_eq!(msg.reply_to_msg_id(), None);
        assert!(!msg.is_deleted);
    }

    #[test]
    fn test_from_raw_service_message_has_no_sender() {
        let raw = json!({
            "id": 8,
            "peer_id": {"chat_id": 1},
            "action": {"_": "MessageActionChatAddUser"}
        });
        let msg = LocalMessage::from_raw(&raw).unwrap();
        assert_eq!(msg.sender_id, None);
        assert!(msg.is_service_action());
    }

    #[test]
    fn test_classify_message_media_kinds() {
        assert_eq!(
            classify_message(&json!({"id": 1, "media": {"photo": {"id": 9}}})),
            "photo"
        );
        assert_eq!(
            classify_message(&json!({"id": 1, "media": {"document": {"id": 9}}})),
            "document"
        );
        assert_eq!(
            classify_message(&json!({"id": 1, "media": {"webpage": {}}})),
            "media"
        );
        assert_eq!(classify_message(&json!({"id": 1, "message": "x"})), "text");
        assert_eq!(
            classify_message(&json!({"id": 1, "media": {"photo": {}}, "action": {"_": "a"}})),
            "action"
        );
    }

    #[test]
    fn test_reply_to_extraction() {
        let raw = json!({
            "id": 9,
            "peer_id": {"channel_id": 42},
            "message": "re",
            "reply_to": {"reply_to_msg_id": 7}
        });
        let msg = LocalMessage::from_raw(&raw).unwrap();
        assert_eq!(msg.reply_to_msg_id(), Some(7));
    }
}
