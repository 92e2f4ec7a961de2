// src/worker.rs

//! 单个 backend 的一轮采集
//!
//! idle -> acquiring -> reading -> normalizing -> publishing -> idle，
//! acquiring / reading 出错就记录、释放连接，本轮结束，下一个 tick 照常来。
//!
//! 同一个 backend 同时最多只有一轮在跑：两个并发的 GET + RESET 会互相抢日志，
//! 导致重复或丢失。`try_begin` 拿到的 `InFlight` 就是这把门闩，drop 时（包括 panic 展开）自动放开。
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::event::normalize;
use crate::monitor::Metrics;
use crate::pool::ConnectionProvider;
use crate::sink::EventSink;
use crate::slowlog::{self, FetchOutcome};

/// 一轮采集的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// 发布了多少条事件
    Published(usize),
    Failed,
}

/// backend 正在采集中的凭证
#[derive(Debug)]
pub struct InFlight {
    busy: Arc<AtomicBool>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

pub struct Collector<P> {
    addr: String,
    /// 计数和日志里区分 backend 用；同一地址配置多次时各不相同
    label: String,
    provider: P,
    busy: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
}

impl<P: ConnectionProvider> Collector<P> {
    pub fn new(addr: impl Into<String>, provider: P, metrics: Arc<Metrics>) -> Self {
        let addr = addr.into();
        Collector {
            label: addr.clone(),
            addr,
            provider,
            busy: Arc::new(AtomicBool::new(false)),
            metrics,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// 上一轮还没结束就返回 None
    pub fn try_begin(&self) -> Option<InFlight> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight { busy: Arc::clone(&self.busy) })
    }

    /// 执行一轮采集；`permit` 在本轮结束时释放
    pub async fn collect(&self, permit: InFlight, sink: &dyn EventSink) -> CycleOutcome {
        let outcome = self.run_cycle(sink).await;
        drop(permit);
        outcome
    }

    async fn run_cycle(&self, sink: &dyn EventSink) -> CycleOutcome {
        // acquiring
        let mut conn = match self.provider.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(backend = %self.label, error = %e, "failed to acquire connection");
                self.metrics.record_failure(&self.label);
                return CycleOutcome::Failed;
            }
        };

        // reading
        let outcome = slowlog::fetch_and_clear(&mut conn).await;
        if outcome.connection_ok() {
            drop(conn);
        } else {
            self.provider.invalidate(conn);
        }

        let entries = match outcome {
            FetchOutcome::Entries(entries) => entries,
            FetchOutcome::ResetFailed { entries, error } => {
                // 已经取到的照样发布，下一轮可能会重复出现
                warn!(
                    backend = %self.label,
                    error = %error,
                    entries = entries.len(),
                    "slowlog reset failed, entries may be reported again"
                );
                self.metrics.record_failure(&self.label);
                entries
            }
            FetchOutcome::GetFailed { error, .. } => {
                warn!(backend = %self.label, error = %error, "failed to read slowlog");
                self.metrics.record_failure(&self.label);
                return CycleOutcome::Failed;
            }
        };

        // normalizing -> publishing，每条记录各自独立
        let count = entries.len();
        for entry in &entries {
            let event = normalize(entry, &self.addr);
            self.metrics.record_event(&self.label, &event.cmd);
            sink.publish(event);
        }

        self.metrics.record_cycle_ok(&self.label);
        debug!(backend = %self.label, events = count, "collection cycle finished");
        CycleOutcome::Published(count)
    }
}
