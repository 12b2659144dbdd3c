//! 消息模块
//!
//! 消息 id 只在单个会话内唯一，所有访问都以 (chat_id, message_id) 复合键进行

pub mod dao;
pub mod models;

pub use dao::MessageStore;
pub use models::LocalMessage;
