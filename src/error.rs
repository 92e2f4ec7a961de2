// src/error.rs

//! 采集链路上的错误分类
//!
//! 所有错误都只影响所属的 backend：worker 记录后结束本轮，下一个 tick 照常重试。
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollectError {
    /// 拨号或 AUTH 失败，连接不会进入池子
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    /// MULTI/CONFIG SET/SLOWLOG RESET/EXEC 事务失败
    #[error("applying slowlog settings on {addr} failed: {reason}")]
    ConfigPush { addr: String, reason: String },

    /// 字节流不是合法的 RESP，或在回复中途被关闭
    #[error("protocol error: {0}")]
    Protocol(String),

    /// 合法的 RESP，但形状不对（包括后端返回的 -ERR）
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pool for {addr} unavailable: {reason}")]
    Pool { addr: String, reason: String },
}

impl CollectError {
    /// 连接上的协议状态是否已经不可信，需要丢弃而不是放回池子
    pub fn breaks_connection(&self) -> bool {
        !matches!(self, CollectError::UnexpectedReply(_))
    }
}
