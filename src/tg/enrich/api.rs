//! 增强模型 HTTP API 客户端
//!
//! 面向 OpenAI 兼容端点：chat/completions 做结构化补全（guided_json 约束），
//! embeddings 做文本嵌入。端点返回结构不符合约定时按硬失败处理，不重试。

use crate::tg::enrich::{EnrichedMessageData, EnrichmentModel};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

/// 模型端点配置
#[derive(Clone, Debug)]
pub struct LlmConfig {
    /// OpenAI 兼容端点基础地址
    pub api_base_url: String,
    /// API 密钥
    pub api_key: String,
    /// 结构化补全使用的模型
    pub chat_model: String,
    /// 嵌入使用的模型
    pub embedding_model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// 出站请求超时（秒）
    pub request_timeout_secs: u64,
}

impl LlmConfig {
    /// 创建默认配置
    pub fn new(api_key: String) -> Self {
        Self {
            api_base_url: "https://api.studio.nebius.com/v1".to_string(),
            api_key,
            chat_model: "deepseek-ai/DeepSeek-V3".to_string(),
            embedding_model: "Qwen/Qwen3-Embedding-8B".to_string(),
            temperature: 0.6,
            max_tokens: 1024,
            request_timeout_secs: 30,
        }
    }
}

/// 增强模型 API 客户端
pub struct LlmApi {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmApi {
    pub fn new(config: LlmConfig) -> Result<Self> {
        // 创建带认证拦截器的 HTTP 客户端（密钥通过 default_headers 自动添加）
        let client = reqwest::ClientBuilder::new()
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    reqwest::header::HeaderValue::from_str(&format!(
                        "Bearer {}",
                        config.api_key
                    ))
                    .context("无效的 API 密钥")?,
                );
                headers
            })
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self { client, config })
    }

    /// 发送请求并把响应体解析为 JSON，非 2xx 一律报错
    async fn post_json(&self, path: &str, payload: &Value, operation_name: &str) -> Result<Value> {
        let url = format!("{}{}", self.config.api_base_url, path);
        debug!("[LlmAPI] 📡 请求 {}", url);
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await
            .context("请求失败")?;

        let status = response.status();
        let text = response.text().await.context("读取响应失败")?;
        if !status.is_success() {
            error!(
                "[LlmAPI] {}请求失败，HTTP状态: {}, 响应: {}",
                operation_name, status, text
            );
            return Err(anyhow::anyhow!("HTTP 错误 {}: {}", status, text));
        }
        serde_json::from_str(&text).map_err(|e| {
            error!(
                "[LlmAPI] {}响应解析失败: {}, 原始响应: {}",
                operation_name, e, text
            );
            anyhow::anyhow!("解析 JSON 失败: {}", e)
        })
    }
}

#[async_trait]
impl EnrichmentModel for LlmApi {
    async fn infer(&self, system_prompt: &str, context: &str) -> Result<EnrichedMessageData> {
        let payload = serde_json::json!({
            "model": self.config.chat_model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": context},
            ],
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "guided_json": EnrichedMessageData::json_schema(),
        });
        let body = self
            .post_json("/chat/completions", &payload, "结构化补全")
            .await?;

        let content = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("响应中缺少 choices[0].message.content"))?;

        // 约定结构校验：缺字段即硬失败，绝不凑合入库
        let data: EnrichedMessageData = serde_json::from_str(content)
            .map_err(|e| anyhow::anyhow!("模型输出不符合约定结构: {}, 原始输出: {}", e, content))?;
        Ok(data)
    }

    async fn embed(&self, input: &str) -> Result<Vec<f32>> {
        let payload = serde_json::json!({
            "model": self.config.embedding_model,
            "input": input,
        });
        let body = self.post_json("/embeddings", &payload, "文本嵌入").await?;

        let embedding = body
            .get("data")
            .and_then(|d| d.get(0))
            .and_then(|d| d.get("embedding"))
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow::anyhow!("响应中缺少 data[0].embedding"))?;

        Ok(embedding
            .iter()
            .filter_map(Value::as_f64)
            .map(|f| f as f32)
            .collect())
    }
}
