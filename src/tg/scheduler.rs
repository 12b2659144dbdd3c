//! 周期作业调度器
//!
//! 对话同步、历史回灌、增强扫描各自独立的节拍并发运行，
//! 单次作业失败只记录日志，下个节拍照常触发。
//! 源侧作业（同步/回灌）未注入时只跑增强扫描（降级模式）。

use crate::tg::backfill::BackfillRunner;
use crate::tg::enrich::EnrichmentEngine;
use crate::tg::sync::DialogSyncer;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info};

/// 调度配置
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// 对话同步节拍（秒）：频繁且便宜
    pub sync_interval_secs: u64,
    /// 历史回灌节拍（秒）：中等频率
    pub backfill_interval_secs: u64,
    /// 增强扫描节拍（秒）：频繁、小批量
    pub sweep_interval_secs: u64,
    /// 单轮扫描每个会话的消息条数上限
    pub sweep_limit: i64,
}

impl SchedulerConfig {
    /// 创建默认配置
    pub fn new() -> Self {
        Self {
            sync_interval_secs: 300,
            backfill_interval_secs: 3600,
            sweep_interval_secs: 600,
            sweep_limit: 100,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// 周期作业调度器
pub struct Scheduler {
    config: SchedulerConfig,
    engine: Arc<EnrichmentEngine>,
    syncer: Option<Arc<DialogSyncer>>,
    backfill: Option<Arc<BackfillRunner>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, engine: Arc<EnrichmentEngine>) -> Self {
        Self {
            config,
            engine,
            syncer: None,
            backfill: None,
        }
    }

    /// 注入源侧作业（网关已授权时才注入）
    pub fn with_source_jobs(
        mut self,
        syncer: Arc<DialogSyncer>,
        backfill: Arc<BackfillRunner>,
    ) -> Self {
        self.syncer = Some(syncer);
        self.backfill = Some(backfill);
        self
    }

    /// 启动全部作业循环，返回各循环的句柄
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(syncer) = self.syncer.clone() {
            let period = self.config.sync_interval_secs;
            info!("[Scheduler] ⏱️ 对话同步节拍: {}s", period);
            handles.push(tokio::spawn(async move {
                let mut ticker = interval(Duration::from_secs(period));
                loop {
                    ticker.tick().await;
                    if let Err(e) = syncer.sync_dialogs().await {
                        error!("[Scheduler] ❌ 对话同步作业失败: {:#}", e);
                    }
                }
            }));
        }

        if let Some(backfill) = self.backfill.clone() {
            let period = self.config.backfill_interval_secs;
            info!("[Scheduler] ⏱️ 历史回灌节拍: {}s", period);
            handles.push(tokio::spawn(async move {
                let mut ticker = interval(Duration::from_secs(period));
                loop {
                    ticker.tick().await;
                    if let Err(e) = backfill.run().await {
                        error!("[Scheduler] ❌ 历史回灌作业失败: {:#}", e);
                    }
                }
            }));
        }

        let engine = self.engine.clone();
        let period = self.config.sweep_interval_secs;
        let limit = self.config.sweep_limit;
        info!("[Scheduler] ⏱️ 增强扫描节拍: {}s, 单轮上限 {}", period, limit);
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(period));
            loop {
                ticker.tick().await;
                if let Err(e) = engine.sweep_unenriched(limit).await {
                    error!("[Scheduler] ❌ 增强扫描作业失败: {:#}", e);
                }
            }
        }));

        handles
    }
}
