// src/pool/manager.rs

use std::time::Duration;

use async_trait::async_trait;
use deadpool::managed::{self, RecycleError};
use tokio::{net::TcpStream, time::timeout};
use tracing::{debug, info, warn};

use crate::error::CollectError;
use crate::protocol::{Commands, Reply, RespConn};

/// 建连与复用相关的参数，来自配置，启动后不再变化
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub password: Option<String>,
    /// slowlog-log-slower-than（微秒）；<= 0 表示不改动远端设置
    pub slower_than: i64,
    pub max_len: u64,
    pub max_size: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            password: None,
            slower_than: 10_000,
            max_len: 500,
            max_size: 3,
            idle_timeout: Duration::from_secs(240),
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(3),
        }
    }
}

/// deadpool 的连接管理器：负责拨号、认证、下发慢日志参数、复用前的 PING
#[derive(Debug)]
pub struct RedisManager {
    addr: String,
    settings: PoolSettings,
}

impl RedisManager {
    pub fn new(addr: String, settings: PoolSettings) -> Self {
        RedisManager { addr, settings }
    }

    fn connect_error(&self, reason: impl ToString) -> CollectError {
        CollectError::Connect {
            addr: self.addr.clone(),
            reason: reason.to_string(),
        }
    }

    fn push_error(&self, reason: impl ToString) -> CollectError {
        CollectError::ConfigPush {
            addr: self.addr.clone(),
            reason: reason.to_string(),
        }
    }

    async fn dial(&self) -> Result<RespConn<TcpStream>, CollectError> {
        let limit = self.settings.connect_timeout;
        let stream = match timeout(limit, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.connect_error(e)),
            Err(_) => return Err(self.connect_error(format!("timed out after {:?}", limit))),
        };
        stream.set_nodelay(true).map_err(|e| self.connect_error(e))?;
        Ok(RespConn::new(stream, self.settings.read_timeout))
    }

    /// 配了密码就先 AUTH，失败时连接直接丢弃
    async fn authenticate<C: Commands>(&self, conn: &mut C) -> Result<(), CollectError> {
        let Some(password) = self.settings.password.as_deref() else {
            return Ok(());
        };
        match conn.request(&["AUTH", password]).await {
            Ok(Reply::Error(e)) => Err(self.connect_error(format!("AUTH rejected: {}", e))),
            Ok(_) => Ok(()),
            Err(e) => Err(self.connect_error(format!("AUTH failed: {}", e))),
        }
    }

    /// MULTI / CONFIG SET x2 / SLOWLOG RESET / EXEC 一次发出
    ///
    /// 放在事务里，远端要么全部生效要么都不生效；最后的 RESET 保证第一轮采集窗口是干净的。
    async fn apply_settings<C: Commands>(&self, conn: &mut C) -> Result<(), CollectError> {
        let slower_than = self.settings.slower_than.to_string();
        let max_len = self.settings.max_len.to_string();

        // MULTI 和 SLOWLOG RESET 各一条回复，CONFIG SET 另算
        conn.send(&["MULTI"]);
        let mut queued = 2;
        if self.settings.slower_than > 0 {
            conn.send(&["CONFIG", "SET", "slowlog-log-slower-than", slower_than.as_str()]);
            conn.send(&["CONFIG", "SET", "slowlog-max-len", max_len.as_str()]);
            queued += 2;
        }
        conn.send(&["SLOWLOG", "RESET"]);
        conn.send(&["EXEC"]);
        conn.flush().await.map_err(|e| self.push_error(e))?;

        // MULTI 的 +OK 和每条命令的 +QUEUED；出错也要读完，直到 EXEC 的回复
        let mut rejected = None;
        for _ in 0..queued {
            let reply = conn.receive().await.map_err(|e| self.push_error(e))?;
            if let Reply::Error(e) = reply {
                rejected.get_or_insert(e);
            }
        }
        let exec = conn.receive().await.map_err(|e| self.push_error(e))?;

        if let Some(e) = rejected {
            return Err(self.push_error(format!("command rejected inside MULTI: {}", e)));
        }
        match exec {
            Reply::Error(e) => Err(self.push_error(format!("EXEC failed: {}", e))),
            Reply::Array(None) => Err(self.push_error("transaction aborted")),
            Reply::Array(Some(results)) => match results.iter().find(|r| r.is_error()) {
                Some(failed) => Err(self.push_error(format!("EXEC result {}", failed.describe()))),
                None => Ok(()),
            },
            other => Err(self.push_error(format!("unexpected EXEC reply {}", other.describe()))),
        }
    }
}

impl managed::Manager for RedisManager {
    type Type = RespConn<TcpStream>;
    type Error = CollectError;

    async fn create(&self) -> Result<RespConn<TcpStream>, CollectError> {
        debug!(backend = %self.addr, "dialing new connection");
        let mut conn = self.dial().await.inspect_err(|e| {
            warn!(backend = %self.addr, error = %e, "connect failed");
        })?;
        self.authenticate(&mut conn).await?;
        self.apply_settings(&mut conn).await?;

        info!(
            backend = %self.addr,
            slower_than = self.settings.slower_than,
            max_len = self.settings.max_len,
            "connection ready, slowlog settings applied"
        );
        Ok(conn)
    }

    async fn recycle(
        &self,
        conn: &mut RespConn<TcpStream>,
        metrics: &managed::Metrics,
    ) -> managed::RecycleResult<CollectError> {
        if metrics.last_used() > self.settings.idle_timeout {
            debug!(backend = %self.addr, "idle connection expired");
            return Err(RecycleError::Message("idle timeout exceeded".into()));
        }

        match conn.request(&["PING"]).await {
            Ok(Reply::Error(e)) => Err(RecycleError::Message(format!("PING rejected: {}", e).into())),
            Ok(_) => Ok(()),
            Err(e) => {
                debug!(backend = %self.addr, error = %e, "PING failed, redialing");
                Err(RecycleError::Backend(e))
            }
        }
    }
}

/// 池子里拿出来的连接直接当作 `Commands` 用
#[async_trait]
impl Commands for managed::Object<RedisManager> {
    fn send(&mut self, args: &[&str]) {
        (**self).send(args)
    }

    async fn flush(&mut self) -> Result<(), CollectError> {
        (**self).flush().await
    }

    async fn receive(&mut self) -> Result<Reply, CollectError> {
        (**self).receive().await
    }
}
