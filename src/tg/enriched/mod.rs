//! 消息增强结果模块
//!
//! 每条消息至多一条增强记录，与源消息共用 (chat_id, message_id) 复合键

pub mod dao;
pub mod models;

pub use dao::EnrichedMessageStore;
pub use models::{LocalEnrichedMessage, EMBEDDING_DIM};
