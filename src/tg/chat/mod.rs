//! 会话（chat）模块
//!
//! 覆盖用户对话、普通群、频道与超级群四种会话形态

pub mod dao;
pub mod models;

pub use dao::ChatDao;
pub use models::LocalChat;
