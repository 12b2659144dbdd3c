//! 用户本地模型定义与原始对象适配

use crate::tg::serialization::normalize;
use anyhow::{Context, Result};
use serde_json::Value;

/// 本地用户数据结构
#[derive(Debug, Clone)]
pub struct LocalUser {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_bot: bool,
    pub is_verified: bool,
    pub is_scam: bool,
    pub is_fake: bool,
    pub is_premium: bool,
    /// 规整后的原始快照
    pub raw_data: Value,
}

impl LocalUser {
    /// 从网关透传的用户原始对象构造本地用户
    ///
    /// 缺省值约定：名字字段缺失为 None，布尔标记缺失为 false
    pub fn from_raw(entity: &Value) -> Result<LocalUser> {
        let id = entity
            .get("id")
            .and_then(Value::as_i64)
            .context("用户实体缺少 id 字段")?;
        Ok(LocalUser {
            id,
            username: string_field(entity, "username"),
            first_name: string_field(entity, "first_name"),
            last_name: string_field(entity, "last_name"),
            is_bot: bool_field(entity, "bot"),
            is_verified: bool_field(entity, "verified"),
            is_scam: bool_field(entity, "scam"),
            is_fake: bool_field(entity, "fake"),
            is_premium: bool_field(entity, "premium"),
            raw_data: normalize(entity),
        })
    }

    /// 提示词中使用的展示名
    ///
    /// 优先级：username -> "first last" -> "用户 <id>"
    pub fn display_name(&self) -> String {
        if let Some(username) = &self.username {
            if !username.is_empty() {
                return username.clone();
            }
        }
        let full = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or(""),
            self.last_name.as_deref().unwrap_or("")
        )
        .trim()
        .to_string();
        if !full.is_empty() {
            return full;
        }
        format!("用户 {}", self.id)
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
