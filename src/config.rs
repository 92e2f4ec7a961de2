use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use anyhow::{bail, Context, Result};

use crate::logging::LoggingConfig;
use crate::pool::PoolSettings;

/// 进程启动后，从配置文件中读到的全局配置
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// backend 地址列表（host:port），顺序保留
    pub redis: Vec<String>,
    /// 采集周期（秒）
    pub period_secs: u64,
    /// slowlog-log-slower-than（微秒），<= 0 时不修改远端设置
    pub slower_than: i64,
    /// slowlog-max-len
    pub max_len: u64,
    /// 所有 backend 共用的 AUTH 密码
    pub password: Option<String>,
    /// 事件输出文件，未设置时写 stdout
    pub output: Option<PathBuf>,
    pub pool: PoolConfig,
    pub logging: LoggingConfig,
    // 监控配置
    pub metrics_enabled: bool,
    pub metrics_port: u16,
    /// 停机时等待在跑采集结束的时间（秒）
    pub drain_timeout_secs: u64,
}

/// 每个 backend 连接池的参数
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct PoolConfig {
    pub max_size: usize,
    pub idle_timeout_secs: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            redis: vec!["127.0.0.1:6379".to_string()],
            period_secs: 1,
            slower_than: 10_000,
            max_len: 500,
            password: None,
            output: None,
            pool: PoolConfig::default(),
            logging: LoggingConfig::default(),
            metrics_enabled: false,
            metrics_port: 9090,
            drain_timeout_secs: 5,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_size: 3,
            idle_timeout_secs: 240,
            connect_timeout_ms: 3000,
            read_timeout_ms: 3000,
        }
    }
}

impl Config {
    /// 启动前的检查；这里失败采集器就不启动
    pub fn validate(&self) -> Result<()> {
        if self.redis.is_empty() {
            bail!("no redis backends configured");
        }
        if self.period_secs == 0 {
            bail!("period_secs must be greater than 0");
        }
        if self.pool.max_size == 0 {
            bail!("pool.max_size must be greater than 0");
        }
        if let Some(addr) = self.redis.iter().find(|a| a.trim().is_empty()) {
            bail!("invalid backend address {:?}", addr);
        }

        let mut seen = HashSet::new();
        for addr in &self.redis {
            if !seen.insert(addr) {
                tracing::warn!(backend = %addr, "duplicate backend address, it gets its own pool");
            }
        }
        Ok(())
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            password: self.password.clone().filter(|p| !p.is_empty()),
            slower_than: self.slower_than,
            max_len: self.max_len,
            max_size: self.pool.max_size,
            idle_timeout: Duration::from_secs(self.pool.idle_timeout_secs),
            connect_timeout: Duration::from_millis(self.pool.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.pool.read_timeout_ms),
        }
    }
}

/// 从指定路径读取并反序列化 JSON 配置
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path_ref = path.as_ref();

    // 如果配置文件不存在，创建默认配置
    // 这时日志还没初始化，提示直接写 stderr，stdout 留给事件
    if !path_ref.exists() {
        eprintln!("Config file not found, creating default configuration...");

        let default_cfg = Config::default();
        let default_json = serde_json::to_string_pretty(&default_cfg)?;
        fs::write(path_ref, default_json)
            .with_context(|| format!("Failed to write default config {:?}", path_ref))?;
        eprintln!("Default config created at {:?}", path_ref);

        return Ok(default_cfg);
    }

    let data = fs::read_to_string(path_ref)
        .with_context(|| format!("Failed to read config file {:?}", path_ref))?;
    let cfg: Config = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse config file {:?}", path_ref))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // 配置文件不存在：写出默认配置并返回
    #[test]
    fn test_load_creates_default() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("slowbeat.json");

        let cfg = load(&path)?;
        assert!(path.exists());
        assert_eq!(cfg.redis, vec!["127.0.0.1:6379"]);
        assert_eq!(cfg.pool.max_size, 3);

        // 再读一次得到同样的内容
        let again = load(&path)?;
        assert_eq!(again.max_len, 500);
        assert_eq!(again.period_secs, 1);
        Ok(())
    }

    // 只写部分字段，其余用默认值
    #[test]
    fn test_load_partial() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("cfg.json");
        fs::write(
            &path,
            r#"{"redis": ["10.0.0.1:6379", "10.0.0.2:6380"], "slower_than": -1, "password": "s3cret", "pool": {"read_timeout_ms": 500}}"#,
        )?;

        let cfg = load(&path)?;
        cfg.validate()?;
        assert_eq!(cfg.redis.len(), 2);
        assert_eq!(cfg.period(), Duration::from_secs(1));

        let settings = cfg.pool_settings();
        assert_eq!(settings.slower_than, -1);
        assert_eq!(settings.password.as_deref(), Some("s3cret"));
        assert_eq!(settings.read_timeout, Duration::from_millis(500));
        assert_eq!(settings.connect_timeout, Duration::from_secs(3));
        assert_eq!(settings.idle_timeout, Duration::from_secs(240));
        Ok(())
    }

    #[test]
    fn test_load_invalid_json() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json")?;
        assert!(load(&path).is_err());
        Ok(())
    }

    // 没有 backend / 周期为 0：致命
    #[test]
    fn test_validate() {
        let mut cfg = Config::default();
        assert!(cfg.validate().is_ok());

        cfg.redis.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.period_secs = 0;
        assert!(cfg.validate().is_err());
    }

    // 重复的地址允许，各自独立
    #[test]
    fn test_validate_allows_duplicates() {
        let cfg = Config {
            redis: vec!["a:1".into(), "a:1".into()],
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
    }

    // 空密码等于没有密码
    #[test]
    fn test_empty_password_ignored() {
        let cfg = Config { password: Some(String::new()), ..Config::default() };
        assert!(cfg.pool_settings().password.is_none());
    }
}
