// src/lib.rs
//! slowbeat 库：周期性采集多个 Redis 的慢日志，规整成事件后交给 sink

pub mod error;      // 错误类型
pub mod protocol;   // RESP2 编解码 & 连接能力接口
pub mod pool;       // 每个 backend 的连接池（拨号 / AUTH / 下发慢日志参数）
pub mod slowlog;    // SLOWLOG GET + RESET 及记录解析
pub mod event;      // 记录 -> 事件
pub mod worker;     // 单个 backend 的一轮采集
pub mod scheduler;  // 定时派发 & 停机
pub mod sink;       // 事件出口
pub mod monitor;    // 采集计数 & Prometheus 接口
pub mod config;     // 配置文件
pub mod logging;    // 日志初始化

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;    // 测试用的假连接 / 假 Redis
