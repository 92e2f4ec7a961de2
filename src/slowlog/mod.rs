// src/slowlog/mod.rs

//! 慢日志读取
//!
//! `SLOWLOG GET` 与 `SLOWLOG RESET` 放在同一次 flush 里发出，两条回复都读完才把连接交回去，
//! 中间没有别的请求能插进来观察或丢掉日志。
mod entry;

pub use entry::{parse_entry, RawLogEntry};

use crate::error::CollectError;
use crate::protocol::{Commands, Reply};

/// 一次 GET + RESET 交互的结果
#[derive(Debug)]
pub enum FetchOutcome {
    /// 取到并清空
    Entries(Vec<RawLogEntry>),
    /// GET 失败；`connection_ok` 表示 RESET 的回复是否已经正常读走
    GetFailed {
        error: CollectError,
        connection_ok: bool,
    },
    /// GET 成功但 RESET 失败，日志可能没被清空
    ResetFailed {
        entries: Vec<RawLogEntry>,
        error: CollectError,
    },
}

impl FetchOutcome {
    /// 连接能否放回池子继续用
    pub fn connection_ok(&self) -> bool {
        match self {
            FetchOutcome::Entries(_) => true,
            FetchOutcome::GetFailed { connection_ok, .. } => *connection_ok,
            FetchOutcome::ResetFailed { error, .. } => !error.breaks_connection(),
        }
    }

    /// 只关心「要么完整的结果，要么错误」时用
    pub fn into_result(self) -> Result<Vec<RawLogEntry>, CollectError> {
        match self {
            FetchOutcome::Entries(entries) => Ok(entries),
            FetchOutcome::GetFailed { error, .. } => Err(error),
            FetchOutcome::ResetFailed { error, .. } => Err(error),
        }
    }
}

/// 取出并清空慢日志
pub async fn fetch_and_clear<C>(conn: &mut C) -> FetchOutcome
where
    C: Commands + ?Sized,
{
    conn.send(&["SLOWLOG", "GET"]);
    conn.send(&["SLOWLOG", "RESET"]);
    if let Err(error) = conn.flush().await {
        return FetchOutcome::GetFailed { error, connection_ok: false };
    }

    let get = match conn.receive().await {
        Ok(reply) => parse_get_reply(reply),
        // 流已经坏了，RESET 的回复读不到
        Err(error) => return FetchOutcome::GetFailed { error, connection_ok: false },
    };

    // 不管 GET 解析成不成功，RESET 的回复都要读走，保证连接上的请求/回复还是对齐的
    let reset = conn.receive().await;

    match (get, reset) {
        (Ok(entries), Ok(Reply::Error(e))) => FetchOutcome::ResetFailed {
            entries,
            error: CollectError::UnexpectedReply(format!("SLOWLOG RESET: {}", e)),
        },
        (Ok(entries), Ok(_)) => FetchOutcome::Entries(entries),
        (Ok(entries), Err(error)) => FetchOutcome::ResetFailed { entries, error },
        (Err(error), reset) => FetchOutcome::GetFailed {
            error,
            connection_ok: reset.is_ok(),
        },
    }
}

/// GET 的回复必须是数组，否则整批作废
fn parse_get_reply(reply: Reply) -> Result<Vec<RawLogEntry>, CollectError> {
    if let Reply::Error(e) = &reply {
        return Err(CollectError::UnexpectedReply(format!("SLOWLOG GET: {}", e)));
    }
    let describe = reply.describe();
    let records = reply.into_array().ok_or_else(|| {
        CollectError::UnexpectedReply(format!("SLOWLOG GET returned {}", describe))
    })?;
    Ok(records.into_iter().map(parse_entry).collect())
}
