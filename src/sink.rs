// src/sink.rs

//! 事件出口
//!
//! 核心只需要 `publish`：发出去就不管了，不关心确认结果。多个 worker 会同时调用，
//! 实现自己负责并发安全。
use std::fs::OpenOptions;
use std::io::{self, LineWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::event::NormalizedEvent;

pub trait EventSink: Send + Sync {
    fn publish(&self, event: NormalizedEvent);

    /// 关闭前刷新缓冲；在停机信号之后才调用
    fn close(&self) {}
}

/// 每个事件一行 JSON
pub struct JsonLinesSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        JsonLinesSink {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// 追加写入文件，不存在则创建
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open event output {:?}", path))?;
        info!(path = ?path, "writing events to file");
        Ok(Self::new(LineWriter::new(file)))
    }

    /// 没配置输出路径就写 stdout
    pub fn from_output(output: Option<&Path>) -> Result<Self> {
        match output {
            Some(path) => Self::open(path),
            None => Ok(Self::stdout()),
        }
    }
}

impl EventSink for JsonLinesSink {
    fn publish(&self, event: NormalizedEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, backend = %event.ip_port, "failed to encode event");
                return;
            }
        };
        let Ok(mut writer) = self.writer.lock() else {
            error!("event writer poisoned, dropping event");
            return;
        };
        if let Err(e) = writeln!(writer, "{}", line) {
            warn!(error = %e, "failed to write event");
        }
    }

    fn close(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            if let Err(e) = writer.flush() {
                warn!(error = %e, "failed to flush events on close");
            }
        }
    }
}
