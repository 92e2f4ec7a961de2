// src/event.rs

//! 事件归一化：把一条慢日志记录转换成对外发布的结构化事件
//!
//! `normalize` 是纯函数，不做 I/O，也不会失败：源记录缺什么字段，事件里就用空串 / 0 补上。
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::slowlog::RawLogEntry;

/// 事件的 type 字段
pub const EVENT_TYPE: &str = "slowbeat";

/// 对外发布的事件，字段名沿用 beat 风格
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedEvent {
    #[serde(rename = "type")]
    pub kind: String,
    /// 采集时间
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    /// 慢日志里记录的时间（UTC）
    #[serde(rename = "@log_timestamp")]
    pub log_timestamp: DateTime<Utc>,
    pub slow_id: i64,
    pub cmd: String,
    pub key: String,
    /// argument[2..] 的 JSON 数组；不足 3 个参数时为空串
    pub args: String,
    /// 微秒
    pub duration: i64,
    /// 来源 backend 的 host:port
    pub ip_port: String,
    pub clientip: String,
    pub clientport: String,
    pub clientname: String,
}

/// 以当前时间作为采集时间
pub fn normalize(entry: &RawLogEntry, backend: &str) -> NormalizedEvent {
    normalize_at(entry, backend, Utc::now())
}

pub fn normalize_at(
    entry: &RawLogEntry,
    backend: &str,
    collected_at: DateTime<Utc>,
) -> NormalizedEvent {
    let arg = |i: usize| entry.args.get(i).cloned().unwrap_or_default();

    let args = if entry.args.len() >= 3 {
        serde_json::to_string(&entry.args[2..]).unwrap_or_default()
    } else {
        String::new()
    };

    let (clientip, clientport) = split_client_addr(&entry.client_addr);

    NormalizedEvent {
        kind: EVENT_TYPE.to_string(),
        timestamp: collected_at,
        // 超出 chrono 可表示范围的时间戳回落到 epoch
        log_timestamp: DateTime::from_timestamp(entry.timestamp, 0).unwrap_or_default(),
        slow_id: entry.id,
        cmd: arg(0),
        key: arg(1),
        args,
        duration: entry.duration,
        ip_port: backend.to_string(),
        clientip,
        clientport,
        clientname: entry.client_name.clone(),
    }
}

/// 按最后一个 ':' 拆分；没有分隔符时两边都是空串
fn split_client_addr(addr: &str) -> (String, String) {
    match addr.rsplit_once(':') {
        Some((ip, port)) => (ip.to_string(), port.to_string()),
        None => (String::new(), String::new()),
    }
}
