//! 序列化工具：原始对象规整、gzip 压缩与 base64 适配
//!
//! `normalize` 负责把网关透传的 Telegram 原始对象整理成可直接入库的
//! JSON 快照。规整策略（两种历史做法中选定其一）：
//! - 二进制字段统一编码为 base64 文本（网关以 `{"_": "bytes", "value": ...}`
//!   标记二进制字段）；
//! - 以 `_` 开头的私有键全部丢弃，唯一例外是类型标记键 `"_"` 本身；
//! - `date` / `edit_date` 若为 unix 秒数则转成 ISO-8601 文本；
//! - 其余标量原样保留。该函数永不失败，兜底为字符串化。

use base64::Engine;
use chrono::TimeZone;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::io::{Read, Write};

/// 递归规整原始对象为 JSON 安全的快照
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            // 网关对二进制字段的约定标记：{"_": "bytes", "value": ...}
            if map.get("_").and_then(Value::as_str) == Some("bytes") {
                return Value::String(encode_bytes_field(map.get("value")));
            }
            let mut cleaned = Map::new();
            for (key, val) in map.iter() {
                if key.starts_with('_') && key != "_" {
                    continue;
                }
                if (key == "date" || key == "edit_date") && val.is_i64() {
                    cleaned.insert(key.clone(), Value::String(unix_to_iso(val.as_i64().unwrap())));
                    continue;
                }
                cleaned.insert(key.clone(), normalize(val));
            }
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

/// 把二进制标记字段编码为 base64 文本
///
/// `value` 可能是整数数组（逐字节），也可能已经是 base64 字符串
fn encode_bytes_field(value: Option<&Value>) -> String {
    match value {
        Some(Value::Array(items)) => {
            let bytes: Vec<u8> = items
                .iter()
                .filter_map(Value::as_u64)
                .map(|b| (b & 0xff) as u8)
                .collect();
            base64::engine::general_purpose::STANDARD.encode(bytes)
        }
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// unix 秒数转 ISO-8601 文本，越界时退化为原始数字的字符串
fn unix_to_iso(secs: i64) -> String {
    match chrono::Utc.timestamp_opt(secs, 0).single() {
        Some(dt) => dt.to_rfc3339(),
        None => secs.to_string(),
    }
}

/// Base64 反序列化函数（支持 null 值）
pub fn deserialize_base64<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    // 先尝试反序列化为 Option<String>，以支持 null 值
    let opt_s: Option<String> = Deserialize::deserialize(deserializer)?;
    let s = match opt_s {
        Some(s) => s,
        None => return Ok(Vec::new()), // null 或缺失时返回空 Vec
    };
    if s.is_empty() {
        return Ok(Vec::new());
    }
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(serde::de::Error::custom)
}

/// 解压 gzip 数据
pub fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// 压缩数据为 gzip 格式
pub fn compress_gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
