// src/scheduler.rs

//! 定时调度：每个 tick 给每个 backend 派发一轮采集
//!
//! - 采集跑在各自的 tokio 任务里，慢的 backend 拖不住定时器，也拖不住别的 backend
//! - 上一轮还没结束的 backend 本次跳过并记录，不会排队叠加
//! - 收到停机信号后不再派发；已经在跑的任务自然结束，由 `drain` 等待
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::{
    sync::watch,
    time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::monitor::Metrics;
use crate::pool::{BackendPool, ConnectionProvider};
use crate::sink::EventSink;
use crate::worker::Collector;

pub struct Scheduler<P> {
    period: Duration,
    collectors: Vec<Arc<Collector<P>>>,
    sink: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
}

impl Scheduler<BackendPool> {
    /// 每个配置的地址建一个池子；池子立即创建，连接等第一次采集时再建
    pub fn from_config(cfg: &Config, sink: Arc<dyn EventSink>, metrics: Arc<Metrics>) -> Result<Self> {
        cfg.validate()?;
        let settings = cfg.pool_settings();

        let mut collectors = Vec::with_capacity(cfg.redis.len());
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for addr in &cfg.redis {
            // 重复的地址各自独立计数：第二次出现记为 addr#2，依此类推
            let n = seen.entry(addr.as_str()).or_default();
            *n += 1;
            let label = match *n {
                1 => addr.clone(),
                n => format!("{}#{}", addr, n),
            };

            let pool = BackendPool::new(addr, settings.clone())?;
            info!(backend = %label, "backend registered");
            let collector = Collector::new(addr.clone(), pool, Arc::clone(&metrics)).with_label(label);
            collectors.push(Arc::new(collector));
        }

        Ok(Scheduler::new(cfg.period(), collectors, sink, metrics))
    }

    pub fn close_pools(&self) {
        for collector in &self.collectors {
            collector.provider().close();
        }
    }
}

impl<P: ConnectionProvider> Scheduler<P> {
    pub fn new(
        period: Duration,
        collectors: Vec<Arc<Collector<P>>>,
        sink: Arc<dyn EventSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Scheduler { period, collectors, sink, metrics }
    }

    pub fn collectors(&self) -> &[Arc<Collector<P>>] {
        &self.collectors
    }

    /// 运行到停机信号为止；第一个 tick 在启动一个周期之后
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }

        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(backends = self.collectors.len(), period = ?self.period, "scheduler started");

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    // 发送端被丢弃也当作停机
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }

        info!("scheduler stopped, no further ticks will be issued");
    }

    /// 派发一轮，返回实际派发的 backend 数
    pub fn tick(&self) -> usize {
        let mut dispatched = 0;
        for collector in &self.collectors {
            let Some(permit) = collector.try_begin() else {
                warn!(backend = %collector.label(), "cycle skipped, backend busy");
                self.metrics.record_skipped(collector.label());
                continue;
            };

            debug!(backend = %collector.label(), "dispatching collection cycle");
            let collector = Arc::clone(collector);
            let sink = Arc::clone(&self.sink);
            tokio::spawn(async move {
                collector.collect(permit, sink.as_ref()).await;
            });
            dispatched += 1;
        }
        dispatched
    }

    /// 等待所有在跑的采集结束，超时返回 false
    pub async fn drain(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            let busy = self.collectors.iter().filter(|c| c.is_busy()).count();
            if busy == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(busy, "drain timed out with cycles still in flight");
                return false;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Reply;
    use crate::testkit::{record, FakeProvider, MemorySink, ScriptedConn};

    fn one_entry_conn() -> Result<ScriptedConn, crate::error::CollectError> {
        Ok(ScriptedConn::new(vec![
            Ok(Reply::Array(Some(vec![record(1, 1_700_000_000, 100, &["GET", "k"], "1.1.1.1:1", None)]))),
            Ok(Reply::Simple("OK".into())),
        ]))
    }

    fn scheduler(
        providers: Vec<(&str, FakeProvider)>,
        sink: Arc<MemorySink>,
        metrics: Arc<Metrics>,
    ) -> Scheduler<FakeProvider> {
        let collectors = providers
            .into_iter()
            .map(|(addr, p)| Arc::new(Collector::new(addr, p, Arc::clone(&metrics))))
            .collect();
        Scheduler::new(Duration::from_secs(1), collectors, sink, metrics)
    }

    // 每个 backend 一个任务
    #[tokio::test]
    async fn test_tick_fans_out() {
        let sink = Arc::new(MemorySink::new());
        let s = scheduler(
            vec![
                ("a:1", FakeProvider::new(one_entry_conn)),
                ("b:2", FakeProvider::new(one_entry_conn)),
            ],
            Arc::clone(&sink),
            Arc::new(Metrics::new()),
        );

        assert_eq!(s.tick(), 2);
        assert!(s.drain(Duration::from_secs(2)).await);

        let mut sources: Vec<String> = sink.events().into_iter().map(|e| e.ip_port).collect();
        sources.sort();
        assert_eq!(sources, vec!["a:1", "b:2"]);
    }

    // 上一轮没结束：跳过并计数，另一个 backend 不受影响
    #[tokio::test(start_paused = true)]
    async fn test_busy_backend_is_skipped() {
        let sink = Arc::new(MemorySink::new());
        let metrics = Arc::new(Metrics::new());
        let slow = FakeProvider::new(|| {
            one_entry_conn().map(|c| c.with_delay(Duration::from_secs(5)))
        });
        let s = scheduler(
            vec![("slow:1", slow), ("fast:2", FakeProvider::new(one_entry_conn))],
            Arc::clone(&sink),
            Arc::clone(&metrics),
        );

        assert_eq!(s.tick(), 2);
        tokio::task::yield_now().await;
        assert_eq!(s.tick(), 1);
        assert_eq!(metrics.backend("slow:1").cycles_skipped, 1);
        assert_eq!(metrics.backend("fast:2").cycles_skipped, 0);

        assert!(s.drain(Duration::from_secs(30)).await);
        assert_eq!(s.collectors()[0].provider().max_live(), 1);
    }

    // 任务里 panic 不影响门闩和后续 tick
    #[tokio::test]
    async fn test_panic_in_cycle_releases_gate() {
        let sink = Arc::new(MemorySink::new());
        let s = scheduler(
            vec![("boom:1", FakeProvider::new(|| panic!("dial exploded")))],
            Arc::clone(&sink),
            Arc::new(Metrics::new()),
        );

        assert_eq!(s.tick(), 1);
        assert!(s.drain(Duration::from_secs(2)).await);
        assert_eq!(s.tick(), 1);
        assert!(s.drain(Duration::from_secs(2)).await);
    }

    // 停机信号之后 run 返回，不再 tick
    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let sink = Arc::new(MemorySink::new());
        let metrics = Arc::new(Metrics::new());
        let s = Arc::new(scheduler(
            vec![("a:1", FakeProvider::new(one_entry_conn))],
            Arc::clone(&sink),
            Arc::clone(&metrics),
        ));
        let (tx, rx) = watch::channel(false);

        let runner = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.run(rx).await })
        };

        // 第一次 tick 在 1 秒后
        sleep(Duration::from_millis(3500)).await;
        tx.send(true).unwrap();
        runner.await.unwrap();
        assert!(s.drain(Duration::from_secs(1)).await);

        let acquired = s.collectors()[0].provider().acquired();
        assert_eq!(acquired, 3);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(s.collectors()[0].provider().acquired(), acquired);
        assert_eq!(sink.events().len(), 3);
    }

    // 启动前就已经停机：直接返回
    #[tokio::test]
    async fn test_run_returns_if_already_shut_down() {
        let s = scheduler(
            vec![("a:1", FakeProvider::new(one_entry_conn))],
            Arc::new(MemorySink::new()),
            Arc::new(Metrics::new()),
        );
        let (_tx, rx) = watch::channel(true);
        s.run(rx).await;
        assert_eq!(s.collectors()[0].provider().acquired(), 0);
    }
}
