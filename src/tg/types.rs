//! 网关通用类型：HTTP 响应包装、WebSocket 帧与实时事件联合体

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;

/// WebSocket 连接响应结构（文本消息）
/// 用于 WebSocket 连接时的文本响应，包含 errDlt 字段
#[derive(Debug, Deserialize)]
pub struct WebSocketConnectResp {
    #[serde(rename = "errCode")]
    pub err_code: i32,
    #[serde(rename = "errMsg")]
    pub err_msg: String,
    #[serde(rename = "errDlt", default)]
    pub err_dlt: String,
    /// data 字段可能为 null、缺失或包含实际数据
    #[serde(default)]
    pub data: Option<Value>,
}

/// 统一的 API 响应包装结构体（包含 errCode、errMsg、data）
/// data 字段可能为 null 或缺失，因此使用 Option<T>
/// serde 会自动将缺失或 null 的字段反序列化为 None
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(rename = "errCode")]
    pub err_code: i32,
    #[serde(rename = "errMsg")]
    pub err_msg: String,
    pub data: Option<T>,
}

/// 通用 HTTP 响应处理函数：直接反序列化为统一的响应结构体
/// 返回 `ApiResponse<T>`，调用方可以根据需要处理 `data` 字段（可能为 None）
/// 所有 API 都可以共用此方法
pub async fn handle_http_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> Result<ApiResponse<T>> {
    use anyhow::Context;
    use tracing::{debug, error};

    let status = response.status();

    // 读取 body bytes（只能读取一次）
    let body_bytes = response.bytes().await.context("读取响应 body 失败")?;
    let body_str = String::from_utf8_lossy(&body_bytes);

    if !status.is_success() {
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, body_str
        );
        return Err(anyhow::anyhow!("HTTP 错误 {}: {}", status, body_str));
    }
    debug!("[HTTP] {}请求成功，HTTP状态: {}", operation_name, status);

    // 从 bytes 反序列化（因为 body 已经被消费了）
    let api_resp: ApiResponse<T> = serde_json::from_slice(&body_bytes).map_err(|e| {
        error!(
            "[HTTP] {}反序列化失败: {:?}\n原始响应: {}",
            operation_name, e, body_str
        );
        anyhow::anyhow!("反序列化响应失败: {:?}", e)
    })?;

    // 检查错误码
    if api_resp.err_code != 0 {
        error!(
            "[HTTP] {}服务器错误，错误码: {}, 错误信息: {}",
            operation_name, api_resp.err_code, api_resp.err_msg
        );
        return Err(anyhow::anyhow!(
            "服务器错误 {}: {}",
            api_resp.err_code,
            api_resp.err_msg
        ));
    }

    Ok(api_resp)
}

// ========== 网关状态与数据结构 ==========

/// 网关连接/授权状态（启动时据此决定流水线是否运行）
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectStatus {
    pub connected: bool,
    pub authorized: bool,
    /// 已登录账号的用户名（未授权时缺失）
    #[serde(default)]
    pub username: Option<String>,
}

/// 对话列表响应
#[derive(Debug, Deserialize)]
pub struct DialogsResp {
    pub dialogs: Vec<GatewayDialog>,
}

/// 单个对话条目：网关透传的对端实体原始对象
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayDialog {
    pub entity: Value,
}

/// 历史消息分页响应（逆时序：最新在前）
#[derive(Debug, Deserialize)]
pub struct HistoryResp {
    pub messages: Vec<Value>,
}

/// 参与者列表响应
#[derive(Debug, Deserialize)]
pub struct ParticipantsResp {
    pub users: Vec<Value>,
}

/// 单实体响应（会话或用户的原始对象）
#[derive(Debug, Deserialize)]
pub struct EntityResp {
    pub entity: Value,
}

// ========== 实时事件 ==========

/// WebSocket 事件帧外壳
///
/// `data` 为 base64 编码的事件负载，网关按 `compression` 配置可能先 gzip
#[derive(Debug, Deserialize)]
pub struct GatewayEventFrame {
    pub event: String,
    #[serde(
        default,
        deserialize_with = "crate::tg::serialization::deserialize_base64"
    )]
    pub data: Vec<u8>,
}

/// 实时事件联合体
///
/// 以带标签的枚举做显式分发，取代按事件种类多次注册同一回调的做法
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// 新消息：负载为 Telegram 消息原始对象
    NewMessage { raw: Value },
    /// 消息被编辑：负载同上，id 指向已有消息
    EditedMessage { raw: Value },
    /// 一批消息被删除
    DeletedMessages { chat_id: i64, message_ids: Vec<i64> },
    /// 会话动作（成员变动 / 元数据变更）
    ChatAction {
        chat: Value,
        user: Option<Value>,
        action: String,
    },
}

impl SourceEvent {
    /// 由事件种类标签和解包后的负载构造事件
    pub fn parse(kind: &str, payload: Value) -> Result<SourceEvent> {
        match kind {
            "newMessage" => Ok(SourceEvent::NewMessage { raw: payload }),
            "editedMessage" => Ok(SourceEvent::EditedMessage { raw: payload }),
            "deletedMessages" => {
                #[derive(Deserialize)]
                struct DeletedPayload {
                    #[serde(rename = "chatID")]
                    chat_id: i64,
                    #[serde(rename = "messageIDs")]
                    message_ids: Vec<i64>,
                }
                let p: DeletedPayload = serde_json::from_value(payload)
                    .map_err(|e| anyhow::anyhow!("deletedMessages 负载解析失败: {:?}", e))?;
                Ok(SourceEvent::DeletedMessages {
                    chat_id: p.chat_id,
                    message_ids: p.message_ids,
                })
            }
            "chatAction" => {
                #[derive(Deserialize)]
                struct ActionPayload {
                    chat: Value,
                    #[serde(default)]
                    user: Option<Value>,
                    #[serde(default)]
                    action: String,
                }
                let p: ActionPayload = serde_json::from_value(payload)
                    .map_err(|e| anyhow::anyhow!("chatAction 负载解析失败: {:?}", e))?;
                Ok(SourceEvent::ChatAction {
                    chat: p.chat,
                    user: p.user,
                    action: p.action,
                })
            }
            other => Err(anyhow::anyhow!("未知事件种类: {}", other)),
        }
    }
}

/// 从 Telethon 风格的 peer 对象里取出数值 id
///
/// 兼容 `{"channel_id": ..}` / `{"chat_id": ..}` / `{"user_id": ..}` 与裸数字
pub fn extract_peer_id(peer: Option<&Value>) -> Option<i64> {
    let peer = peer?;
    if let Some(id) = peer.as_i64() {
        return Some(id);
    }
    for key in ["channel_id", "chat_id", "user_id"] {
        if let Some(id) = peer.get(key).and_then(Value::as_i64) {
            return Some(id);
        }
    }
    None
}
