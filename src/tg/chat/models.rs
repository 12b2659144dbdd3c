//! 会话本地模型定义与原始对象适配

use crate::tg::serialization::normalize;
use anyhow::{Context, Result};
use serde_json::Value;

/// 本地会话数据结构
#[derive(Debug, Clone)]
pub struct LocalChat {
    pub id: i64,
    /// 会话形态：user / group / channel / supergroup / unknown
    pub chat_type: String,
    pub title: Option<String>,
    pub username: Option<String>,
    pub is_verified: bool,
    pub is_scam: bool,
    pub is_fake: bool,
    pub member_count: Option<i64>,
    /// 规整后的原始快照
    pub raw_data: Value,
}

impl LocalChat {
    /// 从网关透传的实体原始对象构造本地会话
    ///
    /// 缺省值约定：布尔标记缺失视为 false，成员数缺失视为未知
    pub fn from_raw(entity: &Value) -> Result<LocalChat> {
        let id = entity
            .get("id")
            .and_then(Value::as_i64)
            .context("会话实体缺少 id 字段")?;
        let tag = entity.get("_").and_then(Value::as_str).unwrap_or("");

        let (chat_type, title, username) = match tag {
            "User" => {
                let first = entity.get("first_name").and_then(Value::as_str).unwrap_or("");
                let last = entity.get("last_name").and_then(Value::as_str).unwrap_or("");
                let full = format!("{} {}", first, last).trim().to_string();
                let title = if full.is_empty() { None } else { Some(full) };
                ("user", title, string_field(entity, "username"))
            }
            "Channel" => {
                let kind = if entity
                    .get("megagroup")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                {
                    "supergroup"
                } else {
                    "channel"
                };
                (kind, string_field(entity, "title"), string_field(entity, "username"))
            }
            "Chat" => ("group", string_field(entity, "title"), None),
            _ => (
                "unknown",
                string_field(entity, "title"),
                string_field(entity, "username"),
            ),
        };

        Ok(LocalChat {
            id,
            chat_type: chat_type.to_string(),
            title,
            username,
            is_verified: bool_field(entity, "verified"),
            is_scam: bool_field(entity, "scam"),
            is_fake: bool_field(entity, "fake"),
            member_count: entity.get("participants_count").and_then(Value::as_i64),
            raw_data: normalize(entity),
        })
    }

    /// 实体解析失败时的占位会话，保证消息外键始终有归属
    pub fn placeholder(chat_id: i64) -> LocalChat {
        LocalChat {
            id: chat_id,
            chat_type: "unknown".to_string(),
            title: None,
            username: None,
            is_verified: false,
            is_scam: false,
            is_fake: false,
            member_count: None,
            raw_data: serde_json::json!({ "id": chat_id }),
        }
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

fn bool_field(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}
