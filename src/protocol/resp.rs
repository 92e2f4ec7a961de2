// src/protocol/resp.rs

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    time::timeout,
};

use super::{Commands, Reply};
use crate::error::CollectError;

/// 任意异步字节流上的 RESP 连接
///
/// 请求先编码进 `pending`，`flush` 时一次写出，这样 GET + RESET 可以在同一个包里发出去。
pub struct RespConn<S> {
    stream: BufReader<S>,
    pending: Vec<u8>,
    read_timeout: Duration,
}

impl<S> fmt::Debug for RespConn<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RespConn")
            .field("pending_bytes", &self.pending.len())
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

/// 单条 bulk string 的上限，与 Redis 的 proto-max-bulk-len 默认值一致
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
/// 数组嵌套层数上限；SLOWLOG GET 只有 3 层
const MAX_DEPTH: usize = 16;
const MAX_LINE_LEN: u64 = 64 * 1024;
const READ_CHUNK: usize = 64 * 1024;

type ReplyFuture<'a> = Pin<Box<dyn Future<Output = Result<Reply, CollectError>> + Send + 'a>>;

impl<S> RespConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, read_timeout: Duration) -> Self {
        RespConn {
            stream: BufReader::new(stream),
            pending: Vec::new(),
            read_timeout,
        }
    }

    /// 编码成 Array + Bulk String：*<N>\r\n$<len>\r\n<arg>\r\n...
    fn encode(&mut self, args: &[&str]) {
        self.pending.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
        for arg in args {
            self.pending.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            self.pending.extend_from_slice(arg.as_bytes());
            self.pending.extend_from_slice(b"\r\n");
        }
    }

    /// 读一行，去掉结尾的 "\r\n"
    async fn read_line(&mut self) -> Result<Vec<u8>, CollectError> {
        let mut line = Vec::new();
        let n = (&mut self.stream)
            .take(MAX_LINE_LEN)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Err(CollectError::Protocol("connection closed by backend".into()));
        }
        if !line.ends_with(b"\r\n") {
            return Err(CollectError::Protocol("reply line not terminated by CRLF".into()));
        }
        line.truncate(line.len() - 2);
        Ok(line)
    }

    // 数组元素需要递归读取，async fn 不能直接递归，所以手动装箱
    fn read_reply(&mut self, depth: usize) -> ReplyFuture<'_> {
        Box::pin(async move {
            if depth > MAX_DEPTH {
                return Err(CollectError::Protocol("reply nested too deeply".into()));
            }
            let line = self.read_line().await?;
            let Some((&kind, body)) = line.split_first() else {
                return Err(CollectError::Protocol("empty reply line".into()));
            };

            match kind {
                b'+' => Ok(Reply::Simple(String::from_utf8_lossy(body).into_owned())),
                b'-' => Ok(Reply::Error(String::from_utf8_lossy(body).into_owned())),
                b':' => parse_len(body).map(Reply::Integer),
                b'$' => {
                    let len = parse_len(body)?;
                    if len < 0 {
                        return Ok(Reply::Bulk(None));
                    }
                    if len > MAX_BULK_LEN {
                        return Err(CollectError::Protocol(format!("bulk length {} too large", len)));
                    }
                    // 长度来自对端，不预先分配，按实际到达的数据增长
                    let len = len as usize;
                    let mut buf = Vec::with_capacity(len.min(READ_CHUNK));
                    (&mut self.stream).take(len as u64).read_to_end(&mut buf).await?;
                    if buf.len() < len {
                        return Err(CollectError::Protocol("connection closed inside bulk string".into()));
                    }
                    let mut crlf = [0u8; 2];
                    self.stream.read_exact(&mut crlf).await?;
                    if &crlf != b"\r\n" {
                        return Err(CollectError::Protocol("bulk string not terminated by CRLF".into()));
                    }
                    Ok(Reply::Bulk(Some(buf)))
                }
                b'*' => {
                    let count = parse_len(body)?;
                    if count < 0 {
                        return Ok(Reply::Array(None));
                    }
                    let mut items = Vec::with_capacity((count as usize).min(1024));
                    for _ in 0..count {
                        items.push(self.read_reply(depth + 1).await?);
                    }
                    Ok(Reply::Array(Some(items)))
                }
                other => Err(CollectError::Protocol(format!(
                    "unknown reply type byte {:?}",
                    other as char
                ))),
            }
        })
    }
}

fn parse_len(body: &[u8]) -> Result<i64, CollectError> {
    std::str::from_utf8(body)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            CollectError::Protocol(format!(
                "invalid integer {:?}",
                String::from_utf8_lossy(body)
            ))
        })
}

#[async_trait]
impl<S> Commands for RespConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn send(&mut self, args: &[&str]) {
        self.encode(args);
    }

    async fn flush(&mut self) -> Result<(), CollectError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let out = std::mem::take(&mut self.pending);
        let writer = self.stream.get_mut();
        writer.write_all(&out).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Reply, CollectError> {
        let limit = self.read_timeout;
        match timeout(limit, self.read_reply(0)).await {
            Ok(reply) => reply,
            Err(_) => Err(CollectError::Timeout(limit)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    fn pair() -> (RespConn<DuplexStream>, DuplexStream) {
        let (client, server) = duplex(4096);
        (RespConn::new(client, Duration::from_secs(1)), server)
    }

    // 命令按 Array + Bulk String 编码，flush 前不写出
    #[tokio::test]
    async fn test_send_flush_encoding() -> anyhow::Result<()> {
        let (mut conn, mut server) = pair();
        conn.send(&["SLOWLOG", "GET"]);
        conn.send(&["SLOWLOG", "RESET"]);
        conn.flush().await?;
        drop(conn);

        let mut wire = Vec::new();
        server.read_to_end(&mut wire).await?;
        assert_eq!(
            wire,
            b"*2\r\n$7\r\nSLOWLOG\r\n$3\r\nGET\r\n*2\r\n$7\r\nSLOWLOG\r\n$5\r\nRESET\r\n".to_vec()
        );
        Ok(())
    }

    // 各种回复类型，包括嵌套数组
    #[tokio::test]
    async fn test_receive_reply_kinds() -> anyhow::Result<()> {
        let (mut conn, mut server) = pair();
        server
            .write_all(b"+OK\r\n-ERR boom\r\n:12\r\n$-1\r\n*-1\r\n*2\r\n:1\r\n*1\r\n$3\r\nGET\r\n")
            .await?;

        assert_eq!(conn.receive().await?, Reply::Simple("OK".into()));
        assert_eq!(conn.receive().await?, Reply::Error("ERR boom".into()));
        assert_eq!(conn.receive().await?, Reply::Integer(12));
        assert_eq!(conn.receive().await?, Reply::Bulk(None));
        assert_eq!(conn.receive().await?, Reply::Array(None));
        assert_eq!(
            conn.receive().await?,
            Reply::Array(Some(vec![
                Reply::Integer(1),
                Reply::Array(Some(vec![Reply::Bulk(Some(b"GET".to_vec()))])),
            ]))
        );
        Ok(())
    }

    // bulk 内容里可以带 \r\n
    #[tokio::test]
    async fn test_bulk_with_crlf_inside() -> anyhow::Result<()> {
        let (mut conn, mut server) = pair();
        server.write_all(b"$4\r\na\r\nb\r\n").await?;
        assert_eq!(conn.receive().await?, Reply::Bulk(Some(b"a\r\nb".to_vec())));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_type_byte() -> anyhow::Result<()> {
        let (mut conn, mut server) = pair();
        server.write_all(b"?what\r\n").await?;
        let err = conn.receive().await.unwrap_err();
        assert!(matches!(err, CollectError::Protocol(_)));
        Ok(())
    }

    // 对端声明的 bulk 长度超过上限：报错，不去分配
    #[tokio::test]
    async fn test_oversized_bulk_rejected() -> anyhow::Result<()> {
        let (mut conn, mut server) = pair();
        server
            .write_all(b"*1\r\n*6\r\n:1\r\n:2\r\n:3\r\n*1\r\n$100000000000000\r\n")
            .await?;
        let err = conn.receive().await.unwrap_err();
        assert!(matches!(err, CollectError::Protocol(_)));
        Ok(())
    }

    // bulk 没收完连接就断了
    #[tokio::test]
    async fn test_truncated_bulk() -> anyhow::Result<()> {
        let (mut conn, mut server) = pair();
        server.write_all(b"$10\r\nabc").await?;
        drop(server);
        let err = conn.receive().await.unwrap_err();
        assert!(matches!(err, CollectError::Protocol(_)));
        Ok(())
    }

    // 嵌套过深直接报错，不会递归到栈溢出
    #[tokio::test]
    async fn test_deep_nesting_rejected() -> anyhow::Result<()> {
        let (mut conn, mut server) = pair();
        let mut wire = b"*1\r\n".repeat(200);
        wire.extend_from_slice(b":1\r\n");
        server.write_all(&wire).await?;
        let err = conn.receive().await.unwrap_err();
        assert!(matches!(err, CollectError::Protocol(ref m) if m.contains("nested")));
        Ok(())
    }

    // 超长的一行（没有换行）
    #[tokio::test]
    async fn test_overlong_line_rejected() -> anyhow::Result<()> {
        let (client, mut server) = duplex(256 * 1024);
        let mut conn = RespConn::new(client, Duration::from_secs(1));
        let mut line = vec![b'+'];
        line.extend(std::iter::repeat(b'x').take(100 * 1024));
        server.write_all(&line).await?;
        let err = conn.receive().await.unwrap_err();
        assert!(matches!(err, CollectError::Protocol(_)));
        Ok(())
    }

    // 对端关闭 -> Protocol 错误，而不是挂住
    #[tokio::test]
    async fn test_closed_stream() -> anyhow::Result<()> {
        let (mut conn, server) = pair();
        drop(server);
        let err = conn.receive().await.unwrap_err();
        assert!(err.breaks_connection());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout() -> anyhow::Result<()> {
        let (mut conn, _server) = pair();
        let err = conn.receive().await.unwrap_err();
        assert!(matches!(err, CollectError::Timeout(_)));
        Ok(())
    }
}
