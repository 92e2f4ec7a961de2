// src/pool/mod.rs

//! 每个 backend 一个连接池
//!
//! 池子在启动时就创建好，但连接是懒建立的：第一次 `acquire()` 才会拨号，
//! 所以配置里列出的 backend 暂时连不上也不影响采集器启动。
mod manager;

pub use manager::{PoolSettings, RedisManager};

use anyhow::{Context, Result};
use async_trait::async_trait;
use deadpool::managed::{self, PoolError};
use tracing::debug;

use crate::error::CollectError;
use crate::protocol::Commands;

type Pool = managed::Pool<RedisManager>;

/// 连接池状态，给日志和监控用
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub available: usize,
    pub size: usize,
    pub max_size: usize,
}

/// 连接来源的能力接口：取连接、作废连接
///
/// 归还连接就是把它 drop 掉；测试里用假的实现替换真实的 backend。
#[async_trait]
pub trait ConnectionProvider: Send + Sync + 'static {
    type Conn: Commands;

    /// 拿到的连接一定已经认证过，并且慢日志参数已经下发过
    async fn acquire(&self) -> Result<Self::Conn, CollectError>;

    /// 丢弃连接，不再放回池子
    fn invalidate(&self, conn: Self::Conn);

    fn status(&self) -> PoolStatus;
}

/// 基于 deadpool 的真实连接池
#[derive(Debug, Clone)]
pub struct BackendPool {
    addr: String,
    pool: Pool,
}

impl BackendPool {
    pub fn new(addr: &str, settings: PoolSettings) -> Result<Self> {
        let max_size = settings.max_size;
        let wait = settings.connect_timeout;
        let manager = RedisManager::new(addr.to_string(), settings);
        let pool = Pool::builder(manager)
            .max_size(max_size)
            .runtime(deadpool::Runtime::Tokio1)
            .wait_timeout(Some(wait))
            .build()
            .with_context(|| format!("failed to build connection pool for {}", addr))?;

        debug!(backend = %addr, max_size, "connection pool created");
        Ok(BackendPool { addr: addr.to_string(), pool })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// 关闭后所有 acquire 都会失败，空闲连接随之释放
    pub fn close(&self) {
        self.pool.close();
    }
}

#[async_trait]
impl ConnectionProvider for BackendPool {
    type Conn = managed::Object<RedisManager>;

    async fn acquire(&self) -> Result<Self::Conn, CollectError> {
        self.pool.get().await.map_err(|e| match e {
            PoolError::Backend(e) => e,
            other => CollectError::Pool {
                addr: self.addr.clone(),
                reason: other.to_string(),
            },
        })
    }

    fn invalidate(&self, conn: Self::Conn) {
        // take 之后连接脱离池子，drop 时关闭 socket
        drop(managed::Object::take(conn));
        debug!(backend = %self.addr, "connection invalidated");
    }

    fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            available: status.available,
            size: status.size,
            max_size: status.max_size,
        }
    }
}
