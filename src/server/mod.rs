// Web服务器模块（排队下载 API）

pub mod handlers;
pub mod state;

pub use state::AppState;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// 构建路由
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/download", post(handlers::create_download))
        .route("/downloads", get(handlers::get_all_downloads))
        .route(
            "/downloads/:id",
            get(handlers::get_download).delete(handlers::delete_download),
        )
        .route("/downloads/:id/pause", post(handlers::pause_download))
        .route("/downloads/:id/resume", post(handlers::resume_download))
        .route("/downloads/clear/completed", delete(handlers::clear_completed))
        .route("/downloads/clear/failed", delete(handlers::clear_failed))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// 在 `listener` 上运行服务，`shutdown` 完成后优雅退出并取消所有任务
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!("服务器启动在: http://{}", addr);
    info!("提交任务: POST http://{}/download", addr);

    let app = build_router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("正在取消未完成的下载任务...");
    state.shutdown();
    Ok(())
}
