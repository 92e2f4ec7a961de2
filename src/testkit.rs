// src/testkit.rs

//! 测试工具：脚本化的假连接、假连接池、内存 sink，以及一个够用的假 Redis
//!
//! 单元测试和 tests/ 下的集成测试共用（集成测试通过 `testkit` feature 打开）。
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::error::CollectError;
use crate::event::NormalizedEvent;
use crate::pool::{ConnectionProvider, PoolStatus};
use crate::protocol::{Commands, Reply};
use crate::sink::EventSink;

/// 拼一条 SLOWLOG GET 里的记录
pub fn record(
    id: i64,
    timestamp: i64,
    duration: i64,
    args: &[&str],
    client: &str,
    name: Option<&str>,
) -> Reply {
    let mut fields = vec![
        Reply::Integer(id),
        Reply::Integer(timestamp),
        Reply::Integer(duration),
        Reply::Array(Some(args.iter().map(|a| bulk(a)).collect())),
        bulk(client),
    ];
    if let Some(name) = name {
        fields.push(bulk(name));
    }
    Reply::Array(Some(fields))
}

fn bulk(s: &str) -> Reply {
    Reply::Bulk(Some(s.as_bytes().to_vec()))
}

// ---------------- ScriptedConn ----------------

/// 按脚本依次返回回复的假连接
#[derive(Debug, Default)]
pub struct ScriptedConn {
    script: VecDeque<Result<Reply, CollectError>>,
    pending: Vec<Vec<String>>,
    sent: Vec<Vec<String>>,
    flushes: usize,
    reads: usize,
    delay: Option<Duration>,
    live: Option<Arc<AtomicUsize>>,
}

impl ScriptedConn {
    pub fn new(script: Vec<Result<Reply, CollectError>>) -> Self {
        // 实现了 Drop，不能用 ..Default::default()
        let mut conn = ScriptedConn::default();
        conn.script = script.into();
        conn
    }

    /// 每次 receive 之前先睡一会儿
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn reads(&self) -> usize {
        self.reads
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// 已经 flush 出去的命令
    pub fn sent(&self) -> Vec<Vec<String>> {
        self.sent.clone()
    }
}

impl Drop for ScriptedConn {
    fn drop(&mut self) {
        if let Some(live) = &self.live {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Commands for ScriptedConn {
    fn send(&mut self, args: &[&str]) {
        self.pending.push(args.iter().map(|a| a.to_string()).collect());
    }

    async fn flush(&mut self) -> Result<(), CollectError> {
        self.flushes += 1;
        self.sent.append(&mut self.pending);
        Ok(())
    }

    async fn receive(&mut self) -> Result<Reply, CollectError> {
        self.reads += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .pop_front()
            .unwrap_or_else(|| Err(CollectError::Protocol("script exhausted".into())))
    }
}

// ---------------- FakeProvider ----------------

type Factory = dyn Fn() -> Result<ScriptedConn, CollectError> + Send + Sync;

/// 每次 acquire 调一次工厂函数，不做复用
pub struct FakeProvider {
    factory: Box<Factory>,
    acquired: AtomicUsize,
    invalidated: AtomicUsize,
    live: Arc<AtomicUsize>,
    max_live: AtomicUsize,
}

impl FakeProvider {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<ScriptedConn, CollectError> + Send + Sync + 'static,
    {
        FakeProvider {
            factory: Box::new(factory),
            acquired: AtomicUsize::new(0),
            invalidated: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            max_live: AtomicUsize::new(0),
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn invalidated(&self) -> usize {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// 当前还没被 drop 的连接数
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// 同时存活连接数的峰值
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionProvider for FakeProvider {
    type Conn = ScriptedConn;

    async fn acquire(&self) -> Result<ScriptedConn, CollectError> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let mut conn = (self.factory)()?;

        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(now, Ordering::SeqCst);
        conn.live = Some(Arc::clone(&self.live));
        Ok(conn)
    }

    fn invalidate(&self, conn: ScriptedConn) {
        self.invalidated.fetch_add(1, Ordering::SeqCst);
        drop(conn);
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            available: 0,
            size: self.live(),
            max_size: usize::MAX,
        }
    }
}

// ---------------- MemorySink ----------------

/// 事件收在内存里
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<NormalizedEvent>>,
    closed: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    pub fn events(&self) -> Vec<NormalizedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: NormalizedEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ---------------- FakeRedis ----------------

#[derive(Debug, Clone, Default)]
pub struct FakeOptions {
    /// 设置后所有命令都要先 AUTH
    pub password: Option<String>,
    /// 模拟托管服务禁用了 CONFIG
    pub reject_config: bool,
}

#[derive(Default)]
struct FakeState {
    slowlog: VecDeque<Reply>,
    next_id: i64,
    config: HashMap<String, String>,
    commands: Vec<Vec<String>>,
    accepts: usize,
}

/// 只会 AUTH / PING / MULTI / EXEC / CONFIG SET / SLOWLOG 的 TCP 服务
pub struct FakeRedis {
    addr: SocketAddr,
    state: Arc<Mutex<FakeState>>,
    kill: watch::Sender<u64>,
    task: JoinHandle<()>,
}

impl FakeRedis {
    pub async fn start(options: FakeOptions) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(FakeState::default()));
        let (kill, kill_rx) = watch::channel(0u64);

        let task = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                // JoinSet 跟着监听任务一起被 abort，连接任务也就都结束了
                let mut conns = JoinSet::new();
                while let Ok((stream, _)) = listener.accept().await {
                    if let Ok(mut s) = state.lock() {
                        s.accepts += 1;
                    }
                    // 之前的断开请求与新连接无关
                    let mut conn_kill = kill_rx.clone();
                    conn_kill.borrow_and_update();
                    conns.spawn(serve_conn(stream, Arc::clone(&state), options.clone(), conn_kill));
                }
            })
        };

        Ok(FakeRedis { addr, state, kill, task })
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// 往慢日志里塞一条记录（最新的排在最前）
    pub fn push_entry(&self, duration: i64, args: &[&str], client: &str, name: Option<&str>) {
        if let Ok(mut s) = self.state.lock() {
            s.next_id += 1;
            let entry = record(
                s.next_id,
                chrono::Utc::now().timestamp(),
                duration,
                args,
                client,
                name,
            );
            s.slowlog.push_front(entry);
        }
    }

    pub fn slowlog_len(&self) -> usize {
        self.state.lock().map(|s| s.slowlog.len()).unwrap_or(0)
    }

    /// 一共接受过多少个 TCP 连接
    pub fn accepts(&self) -> usize {
        self.state.lock().map(|s| s.accepts).unwrap_or(0)
    }

    /// 收到过的全部命令，按到达顺序
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state.lock().map(|s| s.commands.clone()).unwrap_or_default()
    }

    pub fn config(&self, name: &str) -> Option<String> {
        self.state.lock().ok()?.config.get(name).cloned()
    }

    /// 断开当前所有客户端连接，监听不受影响
    pub fn drop_connections(&self) {
        self.kill.send_modify(|generation| *generation += 1);
    }
}

impl Drop for FakeRedis {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// 每个连接一份的状态
#[derive(Default)]
struct Session {
    authed: bool,
    multi: Option<Vec<Vec<String>>>,
    aborted: bool,
}

async fn serve_conn(
    stream: TcpStream,
    state: Arc<Mutex<FakeState>>,
    options: FakeOptions,
    mut kill: watch::Receiver<u64>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut session = Session {
        authed: options.password.is_none(),
        ..Default::default()
    };

    loop {
        let parts = tokio::select! {
            biased;
            _ = kill.changed() => break,
            read = read_command(&mut reader) => match read {
                Ok(Some(parts)) => parts,
                _ => break,
            },
        };
        if parts.is_empty() {
            continue;
        }

        if let Ok(mut s) = state.lock() {
            s.commands.push(parts.clone());
        }
        let reply = dispatch(&parts, &mut session, &state, &options);

        let mut out = Vec::new();
        encode_reply(&reply, &mut out);
        if writer.write_all(&out).await.is_err() {
            break;
        }
    }
}

/// 读一条 RESP 数组形式的命令；对端关闭返回 None
async fn read_command<R>(reader: &mut R) -> std::io::Result<Option<Vec<String>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut first = [0u8; 1];
    match reader.read_exact(&mut first).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    if first[0] != b'*' {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "expected array",
        ));
    }

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let count: usize = line.trim().parse().map_err(invalid)?;

    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).await?;
        let len: usize = line.trim_start_matches('$').trim().parse().map_err(invalid)?;

        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        parts.push(String::from_utf8_lossy(&buf).into_owned());
    }
    Ok(Some(parts))
}

fn invalid(e: std::num::ParseIntError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

fn dispatch(
    parts: &[String],
    session: &mut Session,
    state: &Mutex<FakeState>,
    options: &FakeOptions,
) -> Reply {
    let name = parts[0].to_uppercase();

    if name == "AUTH" {
        return match (&options.password, parts.get(1)) {
            (Some(expected), Some(given)) if expected == given => {
                session.authed = true;
                Reply::Simple("OK".into())
            }
            (None, _) => Reply::Error(
                "ERR AUTH <password> called without any password configured for the default user"
                    .into(),
            ),
            _ => Reply::Error("WRONGPASS invalid username-password pair or user is disabled.".into()),
        };
    }
    if !session.authed {
        session.aborted |= session.multi.is_some();
        return Reply::Error("NOAUTH Authentication required.".into());
    }

    match (name.as_str(), session.multi.is_some()) {
        ("MULTI", true) => Reply::Error("ERR MULTI calls can not be nested".into()),
        ("MULTI", false) => {
            session.multi = Some(Vec::new());
            session.aborted = false;
            Reply::Simple("OK".into())
        }
        ("EXEC", false) => Reply::Error("ERR EXEC without MULTI".into()),
        ("EXEC", true) => {
            let queued = session.multi.take().unwrap_or_default();
            if std::mem::take(&mut session.aborted) {
                return Reply::Error(
                    "EXECABORT Transaction discarded because of previous errors.".into(),
                );
            }
            let results = queued
                .iter()
                .map(|cmd| execute(cmd, state, options))
                .collect();
            Reply::Array(Some(results))
        }
        (_, true) => {
            if name == "CONFIG" && options.reject_config {
                session.aborted = true;
                return Reply::Error(format!("ERR unknown command '{}'", parts[0]));
            }
            if let Some(queue) = session.multi.as_mut() {
                queue.push(parts.to_vec());
            }
            Reply::Simple("QUEUED".into())
        }
        (_, false) => execute(parts, state, options),
    }
}

fn execute(parts: &[String], state: &Mutex<FakeState>, options: &FakeOptions) -> Reply {
    let Ok(mut s) = state.lock() else {
        return Reply::Error("ERR state poisoned".into());
    };
    let name = parts[0].to_uppercase();
    let sub = parts.get(1).map(|p| p.to_uppercase()).unwrap_or_default();

    match (name.as_str(), sub.as_str()) {
        ("PING", _) => Reply::Simple("PONG".into()),
        ("CONFIG", _) if options.reject_config => {
            Reply::Error(format!("ERR unknown command '{}'", parts[0]))
        }
        ("CONFIG", "SET") if parts.len() == 4 => {
            s.config.insert(parts[2].clone(), parts[3].clone());
            Reply::Simple("OK".into())
        }
        ("SLOWLOG", "GET") => Reply::Array(Some(s.slowlog.iter().cloned().collect())),
        ("SLOWLOG", "RESET") => {
            s.slowlog.clear();
            Reply::Simple("OK".into())
        }
        ("SLOWLOG", "LEN") => Reply::Integer(s.slowlog.len() as i64),
        _ => Reply::Error(format!("ERR unknown command '{}'", parts.join(" "))),
    }
}

fn encode_reply(reply: &Reply, out: &mut Vec<u8>) {
    match reply {
        Reply::Simple(s) => out.extend_from_slice(format!("+{}\r\n", s).as_bytes()),
        Reply::Error(e) => out.extend_from_slice(format!("-{}\r\n", e).as_bytes()),
        Reply::Integer(n) => out.extend_from_slice(format!(":{}\r\n", n).as_bytes()),
        Reply::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
        Reply::Bulk(Some(b)) => {
            out.extend_from_slice(format!("${}\r\n", b.len()).as_bytes());
            out.extend_from_slice(b);
            out.extend_from_slice(b"\r\n");
        }
        Reply::Array(None) => out.extend_from_slice(b"*-1\r\n"),
        Reply::Array(Some(items)) => {
            out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                encode_reply(item, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 按脚本回放，脚本用完后报错
    #[tokio::test]
    async fn test_scripted_conn_replays_script() {
        let mut conn = ScriptedConn::new(vec![Ok(Reply::Integer(1))]);
        conn.send(&["PING"]);
        conn.flush().await.unwrap();

        assert_eq!(conn.receive().await.unwrap(), Reply::Integer(1));
        assert!(matches!(conn.receive().await, Err(CollectError::Protocol(_))));
        assert_eq!(conn.reads(), 2);
        assert_eq!(conn.sent(), vec![vec!["PING"]]);
    }

    // 连接 drop 后 live 计数回落
    #[tokio::test]
    async fn test_fake_provider_tracks_live() {
        let provider = FakeProvider::new(|| Ok(ScriptedConn::new(vec![])));
        let a = provider.acquire().await.unwrap();
        let b = provider.acquire().await.unwrap();
        assert_eq!(provider.live(), 2);
        drop(a);
        provider.invalidate(b);
        assert_eq!(provider.live(), 0);
        assert_eq!(provider.max_live(), 2);
        assert_eq!(provider.invalidated(), 1);
    }
}
