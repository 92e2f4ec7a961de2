// src/main.rs
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use slowbeat::{
    config,
    monitor::{self, Metrics},
    scheduler::Scheduler,
    sink::{EventSink, JsonLinesSink},
};

#[derive(Parser, Debug)]
#[command(name = "slowbeat", version, about = "Collects Redis slow logs and ships them as JSON events")]
struct Args {
    /// 配置文件路径，不存在时写出默认配置
    #[arg(short, long, default_value = "slowbeat.json")]
    config: PathBuf,

    /// 覆盖配置里的日志级别
    #[arg(long)]
    log_level: Option<String>,

    /// 只采集一轮就退出
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = config::load(&args.config)?;
    cfg.logging.init(args.log_level.as_deref());

    let metrics = Arc::new(Metrics::new());
    let sink: Arc<dyn EventSink> = Arc::new(JsonLinesSink::from_output(cfg.output.as_deref())?);
    // 配置不合法时这里直接退出，采集器不启动
    let scheduler = Arc::new(Scheduler::from_config(&cfg, Arc::clone(&sink), Arc::clone(&metrics))?);

    if cfg.metrics_enabled {
        monitor::spawn_http(Arc::clone(&metrics), cfg.metrics_port)?;
    }

    if args.once {
        let dispatched = scheduler.tick();
        info!(dispatched, "single collection round dispatched");
    } else {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run(shutdown_rx).await })
        };

        wait_for_shutdown(tokio::signal::ctrl_c()).await;
        let _ = shutdown_tx.send(true);
        if let Err(e) = runner.await {
            error!(error = %e, "scheduler task failed");
        }
    }

    if !scheduler.drain(cfg.drain_timeout()).await {
        warn!("exiting with collection cycles still in flight");
    }
    scheduler.close_pools();
    sink.close();
    info!("slowbeat stopped");
    Ok(())
}

/// 等停机信号；信号监听装不上时继续采集，只记一条错误
async fn wait_for_shutdown<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => {
            error!(error = %e, "failed to listen for shutdown signal, running until killed");
            std::future::pending::<()>().await;
        }
    }
}
