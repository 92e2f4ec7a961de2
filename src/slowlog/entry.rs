// src/slowlog/entry.rs

use crate::protocol::Reply;

/// SLOWLOG GET 里的一条记录，只在一轮采集中存在
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawLogEntry {
    pub id: i64,
    /// unix 秒
    pub timestamp: i64,
    /// 微秒
    pub duration: i64,
    pub args: Vec<String>,
    /// ip:port
    pub client_addr: String,
    /// 老版本没有这个字段
    pub client_name: String,
}

/// `[id, timestamp, duration, [args...], clientAddr, clientName?]`
///
/// 尽量解析：字段缺失或类型不对就保持默认值，不丢整条记录。
pub fn parse_entry(record: Reply) -> RawLogEntry {
    let fields = record.into_array().unwrap_or_default();
    let int_at = |i: usize| fields.get(i).and_then(Reply::as_int).unwrap_or_default();
    let text_at = |i: usize| fields.get(i).and_then(Reply::as_text).unwrap_or_default();

    let args = match fields.get(3) {
        Some(Reply::Array(Some(items))) => items
            .iter()
            .map(|arg| arg.as_text().unwrap_or_default())
            .collect(),
        _ => Vec::new(),
    };

    RawLogEntry {
        id: int_at(0),
        timestamp: int_at(1),
        duration: int_at(2),
        args,
        client_addr: text_at(4),
        client_name: text_at(5),
    }
}
