pub mod backfill;
pub mod chat;
pub mod chat_config;
pub mod client;
pub mod db;
pub mod enrich;
pub mod enriched;
pub mod hooks;
pub mod message;
pub mod scheduler;
pub mod serialization;
pub mod sync;
pub mod types;
pub mod user;

// 重新导出各子模块的核心类型
pub use backfill::BackfillRunner;
pub use client::{GatewayApi, GatewayClient, GatewayConfig, SourceApi};
pub use hooks::EventHooks;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use sync::DialogSyncer;
pub use types::SourceEvent;
