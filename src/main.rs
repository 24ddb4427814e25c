//! MCP 监管层 - 本地运行入口
//!
//! 从 stdin 逐行读取 JSON 消息交给监管者处理，所有出站消息逐行写到 stdout；
//! 日志写 stderr。stdin 结束、Ctrl+C 或 SIGTERM 时优雅关闭。
//!
//! 用法：`mcp-supervisor [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mcp_supervisor::config::load_config;
use mcp_supervisor::core::{ShutdownManager, ShutdownReason};
use mcp_supervisor::observability;
use mcp_supervisor::protocol::Message;
use mcp_supervisor::transport::InMemoryBus;
use mcp_supervisor::SupervisorBuilder;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;
    let grace = Duration::from_millis(config.supervisor.shutdown_grace_ms);

    let (bus, outbox) = InMemoryBus::new();
    let bus = Arc::new(bus);
    let supervisor = SupervisorBuilder::new(config, bus.clone())
        .with_echo_agents()
        .build();
    supervisor
        .initialize()
        .await
        .context("Failed to initialize supervisor")?;

    let writer = tokio::spawn(write_outbox(outbox));

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        supervisor.handle_raw(line).await;
                    }
                }
                Ok(None) => {
                    // 输入结束：先让在途任务跑完再关闭
                    if !supervisor.wait_idle(grace).await {
                        tracing::warn!("tasks still running at end of input");
                    }
                    shutdown.shutdown(ShutdownReason::InputClosed);
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to read stdin");
                    shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
                    break;
                }
            }
        }
    }

    supervisor.shutdown().await;
    drop(supervisor);
    drop(bus);
    if tokio::time::timeout(grace, writer).await.is_err() {
        tracing::warn!("outbox writer did not finish in time");
    }
    Ok(())
}

/// 出站消息逐行写 stdout；所有发送端释放后结束
async fn write_outbox(mut outbox: mpsc::UnboundedReceiver<Message>) {
    let mut stdout = tokio::io::stdout();
    while let Some(message) = outbox.recv().await {
        let line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize outbound message");
                continue;
            }
        };
        if stdout.write_all(line.as_bytes()).await.is_err()
            || stdout.write_all(b"\n").await.is_err()
            || stdout.flush().await.is_err()
        {
            tracing::error!("stdout closed, stopping outbox writer");
            break;
        }
    }
}
