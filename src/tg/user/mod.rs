//! 用户（user）模块

pub mod dao;
pub mod models;

pub use dao::UserDao;
pub use models::LocalUser;
