//! Telegram 流水线 CLI
//!
//! 非交互式 CLI：run 启动完整流水线（实时钩子 + 周期作业），
//! 其余子命令单独执行一轮作业，便于排障与手工补数。

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tg_pipeline_rust::tg::backfill::BackfillRunner;
use tg_pipeline_rust::tg::client::{GatewayClient, GatewayConfig, SourceApi};
use tg_pipeline_rust::tg::db::{create_sqlite_pool, init_db};
use tg_pipeline_rust::tg::enrich::api::{LlmApi, LlmConfig};
use tg_pipeline_rust::tg::enrich::EnrichmentEngine;
use tg_pipeline_rust::tg::hooks::EventHooks;
use tg_pipeline_rust::tg::scheduler::{Scheduler, SchedulerConfig};
use tg_pipeline_rust::tg::sync::DialogSyncer;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// Telegram 消息摄取与增强流水线
#[derive(Parser, Debug)]
#[command(name = "tgpipe-cli")]
#[command(about = "Telegram 消息摄取与增强流水线", long_about = None)]
struct Args {
    /// SQLite 数据库 URL
    #[arg(long, default_value = "sqlite://tg_pipeline.db?mode=rwc")]
    db_url: String,

    /// 网关 HTTP API 基础地址
    #[arg(long, default_value = "http://localhost:8081")]
    api_base_url: String,

    /// 网关 WebSocket 地址
    #[arg(long, default_value = "ws://localhost:8082")]
    ws_url: String,

    /// 网关会话令牌（缺省读环境变量 GATEWAY_SESSION_TOKEN）
    #[arg(long)]
    session_token: Option<String>,

    /// 模型 API 密钥（缺省读环境变量 NEBIUS_STUDIO_API_KEY）
    #[arg(long)]
    llm_api_key: Option<String>,

    /// 收到新消息后是否向上游回执已读
    #[arg(long, default_value_t = false)]
    mark_as_read: bool,

    /// 运行时长（秒），0 表示持续运行
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// 日志级别
    #[arg(long, default_value = "info,tg_pipeline_rust=debug")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 运行完整流水线
    Run,
    /// 执行一轮对话同步后退出
    Sync,
    /// 执行一轮历史回灌后退出
    Backfill,
    /// 执行一轮增强扫描后退出
    Sweep {
        /// 每个会话本轮处理的消息条数上限
        #[arg(long, default_value = "100")]
        limit: i64,
    },
    /// 查询网关状态后退出
    Status,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // 创建日志文件（追加模式）
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .expect("无法创建日志文件 debug.log");

    // 输出到 stdout（控制台），保留 ANSI 颜色代码用于终端显示
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 输出到文件，禁用 ANSI 颜色代码（文件不需要颜色）
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args.log_level);

    let session_token = args
        .session_token
        .clone()
        .or_else(|| std::env::var("GATEWAY_SESSION_TOKEN").ok())
        .unwrap_or_default();
    let llm_api_key = args
        .llm_api_key
        .clone()
        .or_else(|| std::env::var("NEBIUS_STUDIO_API_KEY").ok())
        .unwrap_or_default();
    if llm_api_key.is_empty() {
        warn!("[CLI] ⚠️ 未配置模型 API 密钥，增强调用将全部失败");
    }

    // 数据层
    let pool = create_sqlite_pool(&args.db_url).await?;
    init_db(&pool).await?;

    // 模型与增强引擎
    let llm = Arc::new(LlmApi::new(LlmConfig::new(llm_api_key))?);
    let engine = Arc::new(EnrichmentEngine::new(pool.clone(), llm));

    // 网关客户端（显式构造，按依赖注入传递）
    let mut gateway_config = GatewayConfig::new(session_token);
    gateway_config.api_base_url = args.api_base_url.clone();
    gateway_config.ws_url = args.ws_url.clone();
    gateway_config.mark_as_read = args.mark_as_read;
    let mut client = GatewayClient::new(gateway_config)?;
    let api = client.api();

    match args.command {
        Command::Status => {
            let status = api.get_status().await?;
            info!(
                "[CLI] 网关状态: connected={}, authorized={}, 账号={}",
                status.connected,
                status.authorized,
                status.username.as_deref().unwrap_or("<未知>")
            );
        }
        Command::Sync => {
            DialogSyncer::new(pool.clone(), api).sync_dialogs().await?;
        }
        Command::Backfill => {
            BackfillRunner::new(pool.clone(), api).run().await?;
        }
        Command::Sweep { limit } => {
            engine.sweep_unenriched(limit).await?;
        }
        Command::Run => {
            // 连接 -> 等待授权 -> 就绪；授权失败降级为只跑增强扫描
            let scheduler = match client.wait_until_authorized(30).await {
                Ok(_) => {
                    let hooks = Arc::new(EventHooks::new(
                        pool.clone(),
                        api.clone(),
                        engine.clone(),
                        args.mark_as_read,
                    ));
                    if let Err(e) = client.connect(hooks).await {
                        error!("[CLI] ❌ 网关连接失败: {:#}", e);
                        return Err(e);
                    }
                    let syncer = Arc::new(DialogSyncer::new(pool.clone(), api.clone()));
                    let backfill = Arc::new(BackfillRunner::new(pool.clone(), api.clone()));
                    Scheduler::new(SchedulerConfig::new(), engine.clone())
                        .with_source_jobs(syncer, backfill)
                }
                Err(e) => {
                    warn!(
                        "[CLI] ⚠️ 网关未授权，实时钩子/同步/回灌停用，仅运行增强扫描: {}",
                        e
                    );
                    Scheduler::new(SchedulerConfig::new(), engine.clone())
                }
            };
            let handles = scheduler.start();

            if args.duration > 0 {
                info!("[CLI] ⏲️ 将运行 {} 秒后退出", args.duration);
                sleep(Duration::from_secs(args.duration)).await;
            } else {
                info!("[CLI] 🚀 流水线已启动，Ctrl-C 退出");
                tokio::signal::ctrl_c().await.ok();
            }

            for handle in &handles {
                handle.abort();
            }
            client.disconnect().await;
        }
    }

    Ok(())
}
