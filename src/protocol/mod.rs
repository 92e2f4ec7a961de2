// src/protocol/mod.rs

//! 协议编解码：RESP2 请求编码与回复解析
//!
//! - `Reply`：一条解析完成的回复
//! - `Commands`：连接能力接口（send 只入缓冲，flush 一次写出，receive 按顺序读回复），
//!   流水线交互和测试里的假连接都基于它
//! - `RespConn`：任意异步字节流上的实现
mod resp;

pub use resp::RespConn;

use async_trait::async_trait;
use crate::error::CollectError;

/// RESP2 回复
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// 整数；bulk 里装的十进制数字也算
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            Reply::Bulk(Some(b)) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
            Reply::Simple(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// 文本（非 UTF-8 字节按 lossy 处理）
    pub fn as_text(&self) -> Option<String> {
        match self {
            Reply::Simple(s) => Some(s.clone()),
            Reply::Bulk(Some(b)) => Some(String::from_utf8_lossy(b).into_owned()),
            Reply::Integer(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Reply::Array(Some(items)) => Some(items),
            Reply::Array(None) => Some(Vec::new()),
            _ => None,
        }
    }

    /// 日志 / 错误信息用的简短描述
    pub fn describe(&self) -> String {
        match self {
            Reply::Simple(s) => format!("+{}", s),
            Reply::Error(e) => format!("-{}", e),
            Reply::Integer(n) => format!(":{}", n),
            Reply::Bulk(None) => "nil bulk".into(),
            Reply::Bulk(Some(b)) => format!("bulk({} bytes)", b.len()),
            Reply::Array(None) => "nil array".into(),
            Reply::Array(Some(items)) => format!("array({} items)", items.len()),
        }
    }
}

/// 一条后端连接能做的事情
#[async_trait]
pub trait Commands: Send {
    /// 编码一条命令放进发送缓冲，不触发 I/O
    fn send(&mut self, args: &[&str]);

    /// 把缓冲里的命令一次性写出
    async fn flush(&mut self) -> Result<(), CollectError>;

    /// 按发送顺序读取下一条回复
    async fn receive(&mut self) -> Result<Reply, CollectError>;

    /// send + flush + receive
    async fn request(&mut self, args: &[&str]) -> Result<Reply, CollectError> {
        self.send(args);
        self.flush().await?;
        self.receive().await
    }
}
