//! 测试辅助：在随机端口上启动临时 axum 服务

use std::net::SocketAddr;

use axum::Router;

/// 启动一个临时服务并返回监听地址
pub async fn spawn_app(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// 获取一个当前没有进程监听的本地地址
pub async fn closed_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
