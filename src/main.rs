mod ai_service;
mod chat;
mod common;
mod error;
mod gateway;
mod http_client;
mod identity;
mod inference;
mod model;
mod rate_limit;

#[cfg(test)]
mod test_support;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use model::arg::{Args, Role};
use model::config::Config;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env 不存在时忽略
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config_path = args
        .config
        .unwrap_or_else(|| Config::default_config_path().to_string());
    let mut config = Config::load(&config_path).context("加载配置失败")?;
    config
        .apply_env_overrides()
        .context("应用环境变量覆盖失败")?;

    let app: Router = match args.role {
        Role::Gateway => gateway::build_gateway_router(&config)?,
        Role::Chat => chat::build_chat_router(&config)?,
        Role::Ai => ai_service::build_ai_router(&config)?,
    };

    let host = args.host.unwrap_or_else(|| config.host.clone());
    let port = args
        .port
        .or(config.port)
        .unwrap_or_else(|| args.role.default_port());
    let addr = format!("{}:{}", host, port);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("绑定地址失败: {}", addr))?;
    tracing::info!(role = ?args.role, "启动服务: {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    tracing::info!("服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("监听退出信号失败: {}", e);
    }
}
