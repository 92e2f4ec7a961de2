// src/monitor/mod.rs
//! 监控：采集计数 + 可选的 Prometheus 文本接口
mod metrics;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tracing::info;
use warp::Filter;

pub use metrics::{BackendCounters, Metrics};

/// 在后台启动 `GET /metrics`，返回实际监听的地址
pub fn spawn_http(metrics: Arc<Metrics>, port: u16) -> Result<SocketAddr> {
    let route = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .map(move || {
            warp::reply::with_header(
                metrics.to_prometheus(),
                "content-type",
                "text/plain; version=0.0.4",
            )
        });

    let (addr, server) = warp::serve(route)
        .try_bind_ephemeral(([0, 0, 0, 0], port))
        .with_context(|| format!("failed to bind metrics endpoint on port {}", port))?;
    tokio::spawn(server);

    info!(%addr, "metrics endpoint listening on /metrics");
    Ok(addr)
}
