//! SQLite 数据库工具：统一创建连接池并初始化表结构
//!
//! 约定：所有表结构由 `init_db` 以 `CREATE TABLE IF NOT EXISTS` 维护，
//! 外键级联依赖每个连接开启 `PRAGMA foreign_keys`。

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use tracing::info;

/// 创建 SQLite 连接池（开启外键约束）
pub async fn create_sqlite_pool(db_url: &str) -> Result<Pool<Sqlite>> {
    let options = SqliteConnectOptions::from_str(db_url)
        .context(format!("解析数据库 URL 失败: {}", db_url))?
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context(format!("连接 SQLite 数据库失败: {}", db_url))?;
    Ok(pool)
}

/// 初始化数据库表结构
///
/// chats 为聚合根：messages / messages_enriched / chat_configs 均随其级联删除。
/// messages 与 messages_enriched 使用 (chat_id, message_id) 复合主键，
/// 消息 id 只在单个会话内唯一。
pub async fn init_db(db: &Pool<Sqlite>) -> Result<()> {
    info!("[DB] 📋 初始化数据库表结构");

    let chats_sql = r#"
        CREATE TABLE IF NOT EXISTS chats (
            id INTEGER PRIMARY KEY,
            chat_type TEXT NOT NULL,
            title TEXT,
            username TEXT,
            is_verified INTEGER NOT NULL DEFAULT 0,
            is_scam INTEGER NOT NULL DEFAULT 0,
            is_fake INTEGER NOT NULL DEFAULT 0,
            member_count INTEGER,
            raw_data TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
    "#;
    sqlx::query(chats_sql)
        .execute(db)
        .await
        .context("创建会话表失败")?;

    let users_sql = r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            username TEXT,
            first_name TEXT,
            last_name TEXT,
            is_bot INTEGER NOT NULL DEFAULT 0,
            is_verified INTEGER NOT NULL DEFAULT 0,
            is_scam INTEGER NOT NULL DEFAULT 0,
            is_fake INTEGER NOT NULL DEFAULT 0,
            is_premium INTEGER NOT NULL DEFAULT 0,
            raw_data TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
    "#;
    sqlx::query(users_sql)
        .execute(db)
        .await
        .context("创建用户表失败")?;

    let messages_sql = r#"
        CREATE TABLE IF NOT EXISTS messages (
            chat_id INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            message_id INTEGER NOT NULL,
            sender_id INTEGER,
            date TEXT NOT NULL,
            message_type TEXT NOT NULL DEFAULT 'text',
            is_read INTEGER NOT NULL DEFAULT 0,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            raw_data TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (chat_id, message_id)
        )
    "#;
    sqlx::query(messages_sql)
        .execute(db)
        .await
        .context("创建消息表失败")?;

    // sqlx 预编译只执行第一条语句，索引必须逐条创建
    let index_sqls = [
        "CREATE INDEX IF NOT EXISTS idx_messages_chat_date ON messages(chat_id, date)",
        "CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender_id)",
        "CREATE INDEX IF NOT EXISTS idx_messages_type ON messages(message_type)",
    ];
    for sql in index_sqls {
        sqlx::query(sql)
            .execute(db)
            .await
            .context("创建消息索引失败")?;
    }

    let enriched_sql = r#"
        CREATE TABLE IF NOT EXISTS messages_enriched (
            chat_id INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            message_id INTEGER NOT NULL,
            context TEXT,
            meaning TEXT,
            embedding BLOB,
            PRIMARY KEY (chat_id, message_id)
        )
    "#;
    sqlx::query(enriched_sql)
        .execute(db)
        .await
        .context("创建消息增强表失败")?;

    let configs_sql = r#"
        CREATE TABLE IF NOT EXISTS chat_configs (
            chat_id INTEGER PRIMARY KEY REFERENCES chats(id) ON DELETE CASCADE,
            save_messages INTEGER NOT NULL DEFAULT 1,
            enrich_messages INTEGER NOT NULL DEFAULT 1,
            recognize_photo INTEGER NOT NULL DEFAULT 1,
            load_from_date TEXT,
            system_prompt TEXT,
            answer_threshold REAL
        )
    "#;
    sqlx::query(configs_sql)
        .execute(db)
        .await
        .context("创建会话配置表失败")?;

    info!("[DB] 数据库表初始化完成");
    Ok(())
}

/// 单测专用：内存库连接池（单连接，避免各连接看到不同的内存库）
#[cfg(test)]
pub(crate) async fn test_pool() -> Pool<Sqlite> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    init_db(&pool).await.unwrap();
    pool
}
