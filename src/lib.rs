pub mod tg;

// 重新导出常用类型和函数，方便外部使用
pub use tg::{
    client::{GatewayClient, GatewayConfig, SourceApi},
    enrich::{EnrichmentEngine, EnrichmentModel},
    hooks::EventHooks,
    scheduler::{Scheduler, SchedulerConfig},
};
