//! Telegram 网关客户端核心实现模块
//!
//! 流水线不直接触碰上游协议，只通过网关暴露的窄接口消费数据：
//! HTTP 负责状态查询 / 对话枚举 / 历史分页 / 参与者枚举 / 已读回执，
//! WebSocket 负责实时事件推送。客户端是显式构造、按依赖注入传递的
//! 上下文对象，生命周期为 连接 -> 等待授权 -> 就绪 -> 断开。

use crate::tg::hooks::EventHooks;
use crate::tg::serialization::decompress_gzip;
use crate::tg::types::{
    handle_http_response, ConnectStatus, DialogsResp, EntityResp, GatewayDialog,
    GatewayEventFrame, HistoryResp, ParticipantsResp, SourceEvent, WebSocketConnectResp,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// WebSocket 写入端类型别名
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// WebSocket 读取端类型别名
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// 客户端配置
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// 网关会话令牌（对应上游已授权的长期会话）
    pub session_token: String,
    /// HTTP API 基础地址
    pub api_base_url: String,
    /// WebSocket 事件推送地址
    pub ws_url: String,
    /// 压缩方式，例如 "gzip" 或空字符串表示不压缩
    pub compression: String,
    /// 收到新消息后是否向上游回执已读
    pub mark_as_read: bool,
    /// 出站请求超时（秒），所有外呼都必须有界
    pub request_timeout_secs: u64,
}

impl GatewayConfig {
    /// 创建默认配置
    pub fn new(session_token: String) -> Self {
        Self {
            session_token,
            api_base_url: "http://localhost:8081".to_string(),
            ws_url: "ws://localhost:8082".to_string(),
            compression: "gzip".to_string(),
            mark_as_read: false,
            request_timeout_secs: 30,
        }
    }
}

/// 消息源的窄接口
///
/// 实时事件之外的全部上游能力都收敛在这里，作业与钩子只依赖该 trait
#[async_trait]
pub trait SourceApi: Send + Sync {
    /// 连接/授权状态查询（启动时据此决定流水线是否运行）
    async fn get_status(&self) -> Result<ConnectStatus>;

    /// 枚举全部对话（会话花名册的来源）
    async fn get_dialogs(&self) -> Result<Vec<GatewayDialog>>;

    /// 拉取一页历史消息（逆时序，id 严格小于 offset_id；offset_id 为 0 表示从最新开始）
    async fn get_history(&self, chat_id: i64, offset_id: i64, limit: i64) -> Result<Vec<Value>>;

    /// 枚举会话参与者
    async fn get_participants(&self, chat_id: i64) -> Result<Vec<Value>>;

    /// 解析单个会话实体
    async fn get_chat(&self, chat_id: i64) -> Result<Value>;

    /// 解析单个用户实体
    async fn get_user(&self, user_id: i64) -> Result<Value>;

    /// 向上游回执已读
    async fn mark_read(&self, chat_id: i64, message_id: i64) -> Result<()>;
}

/// 网关 HTTP API 客户端
///
/// `client` 应该已经在外部配置好认证拦截器与请求超时
pub struct GatewayApi {
    client: reqwest::Client,
    api_base_url: String,
}

impl GatewayApi {
    pub fn new(client: reqwest::Client, api_base_url: String) -> Self {
        Self {
            client,
            api_base_url,
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<reqwest::Response> {
        let operation_id = Uuid::new_v4().to_string();
        let url = format!("{}{}", self.api_base_url, path);
        debug!("[GatewayAPI] 📡 请求 {}, 操作ID: {}", url, operation_id);
        self.client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("operationID", &operation_id)
            .json(&body)
            .send()
            .await
            .context("请求失败")
    }
}

#[async_trait]
impl SourceApi for GatewayApi {
    async fn get_status(&self) -> Result<ConnectStatus> {
        let response = self.post("/status/get_status", serde_json::json!({})).await?;
        let api_resp = handle_http_response::<ConnectStatus>(response, "网关状态查询").await?;
        api_resp
            .data
            .ok_or_else(|| anyhow::anyhow!("响应中缺少 data 字段"))
    }

    async fn get_dialogs(&self) -> Result<Vec<GatewayDialog>> {
        let response = self.post("/dialog/get_dialogs", serde_json::json!({})).await?;
        let api_resp = handle_http_response::<DialogsResp>(response, "对话列表").await?;
        let data = api_resp
            .data
            .ok_or_else(|| anyhow::anyhow!("响应中缺少 data 字段"))?;
        info!("[GatewayAPI] ✅ 对话列表响应，对话数: {}", data.dialogs.len());
        Ok(data.dialogs)
    }

    async fn get_history(&self, chat_id: i64, offset_id: i64, limit: i64) -> Result<Vec<Value>> {
        let response = self
            .post(
                "/message/get_history",
                serde_json::json!({
                    "chatID": chat_id,
                    "offsetID": offset_id,
                    "limit": limit,
                }),
            )
            .await?;
        let api_resp = handle_http_response::<HistoryResp>(response, "历史消息分页").await?;
        let data = api_resp
            .data
            .ok_or_else(|| anyhow::anyhow!("响应中缺少 data 字段"))?;
        debug!(
            "[GatewayAPI] 历史消息分页: chat_id={}, offset_id={}, 返回 {} 条",
            chat_id,
            offset_id,
            data.messages.len()
        );
        Ok(data.messages)
    }

    async fn get_participants(&self, chat_id: i64) -> Result<Vec<Value>> {
        let response = self
            .post(
                "/dialog/get_participants",
                serde_json::json!({ "chatID": chat_id }),
            )
            .await?;
        let api_resp = handle_http_response::<ParticipantsResp>(response, "参与者列表").await?;
        let data = api_resp
            .data
            .ok_or_else(|| anyhow::anyhow!("响应中缺少 data 字段"))?;
        Ok(data.users)
    }

    async fn get_chat(&self, chat_id: i64) -> Result<Value> {
        let response = self
            .post("/entity/get_chat", serde_json::json!({ "chatID": chat_id }))
            .await?;
        let api_resp = handle_http_response::<EntityResp>(response, "会话实体解析").await?;
        let data = api_resp
            .data
            .ok_or_else(|| anyhow::anyhow!("响应中缺少 data 字段"))?;
        Ok(data.entity)
    }

    async fn get_user(&self, user_id: i64) -> Result<Value> {
        let response = self
            .post("/entity/get_user", serde_json::json!({ "userID": user_id }))
            .await?;
        let api_resp = handle_http_response::<EntityResp>(response, "用户实体解析").await?;
        let data = api_resp
            .data
            .ok_or_else(|| anyhow::anyhow!("响应中缺少 data 字段"))?;
        Ok(data.entity)
    }

    async fn mark_read(&self, chat_id: i64, message_id: i64) -> Result<()> {
        let response = self
            .post(
                "/message/mark_read",
                serde_json::json!({ "chatID": chat_id, "maxID": message_id }),
            )
            .await?;
        handle_http_response::<Value>(response, "已读回执").await?;
        Ok(())
    }
}

/// Telegram 网关客户端
///
/// 持有 HTTP API 与 WebSocket 写入端，实时事件经由 `EventHooks` 分发
pub struct GatewayClient {
    config: GatewayConfig,
    api: Arc<GatewayApi>,
    writer: Option<Arc<Mutex<WsWriter>>>,
}

impl GatewayClient {
    /// 创建新的客户端
    /// - `config`: 客户端配置
    pub fn new(config: GatewayConfig) -> Result<Self> {
        // 创建带认证拦截器的 HTTP 客户端（token 通过 default_headers 自动添加）
        let http_client = reqwest::ClientBuilder::new()
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::HeaderName::from_static("token"),
                    reqwest::header::HeaderValue::from_str(&config.session_token)
                        .context("无效的 token")?,
                );
                headers
            })
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("创建 HTTP 客户端失败")?;

        let api = Arc::new(GatewayApi::new(http_client, config.api_base_url.clone()));
        Ok(Self {
            config,
            api,
            writer: None,
        })
    }

    /// 共享 HTTP API 客户端（供作业与钩子注入）
    pub fn api(&self) -> Arc<GatewayApi> {
        self.api.clone()
    }

    /// 构建 WebSocket 连接 URL
    fn build_url(&self, operation_id: &str) -> String {
        let compression_param = if self.config.compression.is_empty() {
            String::new()
        } else {
            format!("&compression={}", self.config.compression)
        };
        format!(
            "{}/?token={}&operationID={}{}",
            self.config.ws_url, self.config.session_token, operation_id, compression_param
        )
    }

    /// 轮询网关直到已连接且已授权
    ///
    /// 授权失败只说明实时侧不可用，调用方据此降级而不是退出进程
    pub async fn wait_until_authorized(&self, max_attempts: u32) -> Result<ConnectStatus> {
        for attempt in 1..=max_attempts {
            match self.api.get_status().await {
                Ok(status) if status.connected && status.authorized => {
                    info!(
                        "[Client] ✅ 网关已授权，账号: {}",
                        status.username.as_deref().unwrap_or("<未知>")
                    );
                    return Ok(status);
                }
                Ok(status) => {
                    info!(
                        "[Client] ⏳ 等待网关授权中... (第 {} 次, connected={}, authorized={})",
                        attempt, status.connected, status.authorized
                    );
                }
                Err(e) => {
                    warn!("[Client] ⚠️ 网关状态查询失败 (第 {} 次): {}", attempt, e);
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(anyhow::anyhow!("等待网关授权超时"))
    }

    /// 连接到网关并在内部启动事件处理
    pub async fn connect(&mut self, hooks: Arc<EventHooks>) -> Result<()> {
        let operation_id = format!("{}", chrono::Utc::now().timestamp_millis());
        let url = self.build_url(&operation_id);

        info!("[Client] 🔗 连接到 Telegram 网关: {}", self.config.ws_url);

        let (ws_stream, response) = connect_async(&url).await?;
        info!("[Client] ✅ WebSocket 连接成功, 状态: {}", response.status());

        let (write, mut read) = ws_stream.split();
        let writer = Arc::new(Mutex::new(write));
        self.writer = Some(writer.clone());

        // 等待连接成功响应
        if let Some(Ok(WsMessage::Text(text))) = read.next().await {
            debug!("[Client] 📥 WebSocket 连接响应: {}", text);
            match serde_json::from_str::<WebSocketConnectResp>(&text) {
                Ok(resp) => {
                    if resp.err_code == 0 {
                        info!("[Client] ✅ 网关连接鉴权成功");
                    } else {
                        let error_msg = if !resp.err_dlt.is_empty() {
                            format!("{} (详情: {})", resp.err_msg, resp.err_dlt)
                        } else {
                            resp.err_msg.clone()
                        };
                        error!(
                            "[Client] ❌ WebSocket 连接失败，错误码: {}, 错误信息: {}",
                            resp.err_code, error_msg
                        );
                        return Err(anyhow::anyhow!(
                            "WebSocket 连接失败，错误码: {}, 错误信息: {}",
                            resp.err_code,
                            error_msg
                        ));
                    }
                }
                Err(e) => {
                    error!(
                        "[Client] ❌ WebSocket 响应解析失败: {}, 原始响应: {}",
                        e, text
                    );
                    return Err(anyhow::anyhow!(
                        "WebSocket 响应解析失败: {}, 原始响应: {}",
                        e,
                        text
                    ));
                }
            }
        } else {
            error!("[Client] ❌ 未收到 WebSocket 连接响应");
            return Err(anyhow::anyhow!("未收到 WebSocket 连接响应"));
        }

        // 启动心跳
        info!("[Client] 💓 启动心跳");
        let writer_for_heartbeat = writer.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(25));
            loop {
                ticker.tick().await;
                let mut w = writer_for_heartbeat.lock().await;
                if w.send(WsMessage::Ping(vec![])).await.is_err() {
                    break;
                }
            }
        });

        // 在内部启动事件处理任务
        info!("[Client] 📥 开始监听网关事件");
        let compression = self.config.compression.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::handle_events(read, hooks, compression).await {
                error!("[Client] 事件处理错误: {}", e);
            }
        });

        Ok(())
    }

    /// 事件分发循环：解包帧 -> 构造事件 -> 交给钩子
    ///
    /// 单个帧的解析失败只记录日志，绝不中断循环
    async fn handle_events(
        mut read: WsReader,
        hooks: Arc<EventHooks>,
        compression: String,
    ) -> Result<()> {
        while let Some(frame) = read.next().await {
            let frame = match frame {
                Ok(f) => f,
                Err(e) => {
                    error!("[Client] ❌ WebSocket 读取失败: {}", e);
                    break;
                }
            };
            match frame {
                WsMessage::Text(text) => {
                    Self::handle_event_frame(text.as_str(), &hooks, &compression).await;
                }
                WsMessage::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => Self::handle_event_frame(&text, &hooks, &compression).await,
                    Err(_) => warn!("[Client] ⚠️ 丢弃非 UTF-8 的二进制帧"),
                },
                WsMessage::Close(_) => {
                    info!("[Client] 🔌 网关关闭连接");
                    break;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn handle_event_frame(text: &str, hooks: &Arc<EventHooks>, compression: &str) {
        let frame: GatewayEventFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                warn!("[Client] ⚠️ 事件帧解析失败: {}, 原始帧: {}", e, text);
                return;
            }
        };
        let payload_bytes = if compression == "gzip" && !frame.data.is_empty() {
            match decompress_gzip(&frame.data) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("[Client] ⚠️ 事件负载解压失败: {}", e);
                    return;
                }
            }
        } else {
            frame.data.clone()
        };
        let payload: Value = match serde_json::from_slice(&payload_bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!("[Client] ⚠️ 事件负载解析失败: {}", e);
                return;
            }
        };
        match SourceEvent::parse(&frame.event, payload) {
            Ok(event) => hooks.dispatch(event).await,
            Err(e) => warn!("[Client] ⚠️ 事件构造失败: {}", e),
        }
    }

    /// 断开连接（幂等）
    pub async fn disconnect(&mut self) {
        if let Some(writer) = self.writer.take() {
            let mut w = writer.lock().await;
            if let Err(e) = w.send(WsMessage::Close(None)).await {
                debug!("[Client] 断开连接时发送 Close 失败: {}", e);
            }
            info!("[Client] 🔌 已断开网关连接");
        }
    }
}
