//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RELAY__*` 覆盖（双下划线表示嵌套，如 `RELAY__SESSION__MAX_RETRIES=5`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub backend: BackendSection,
    pub session: SessionSection,
    pub queue: QueueSection,
    pub auth: AuthSection,
    pub protocol: ProtocolSection,
    pub shutdown: ShutdownSection,
}

/// [server] 段：控制 API 与扫码推送通道的监听地址
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub push_bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3001".to_string(),
            push_bind: "0.0.0.0:3002".to_string(),
        }
    }
}

/// [backend] 段：AI 后端地址、超时与兜底回复
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    pub url: String,
    pub path: String,
    pub timeout_secs: u64,
    pub fallback_reply: String,
}

pub const DEFAULT_FALLBACK_REPLY: &str = "Désolé, je rencontre un problème technique temporaire. Un de nos conseillers va vous répondre rapidement.";

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            path: "/api/process-message".to_string(),
            timeout_secs: 15,
            fallback_reply: DEFAULT_FALLBACK_REPLY.to_string(),
        }
    }
}

impl BackendSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// [session] 段：重连预算、退避参数、发送节奏
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// 每条消息发送前「正在输入」的持续时间
    pub typing_delay_ms: u64,
    /// 连续两条消息之间的间隔
    pub pacing_ms: u64,
    /// 视为注销 / 取消授权的断开码
    pub terminal_codes: Vec<u16>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 5000,
            backoff_max_ms: 60_000,
            typing_delay_ms: 1500,
            pacing_ms: 1000,
            terminal_codes: vec![401, 403],
        }
    }
}

/// [queue] 段：每租户待发队列上限与过期时间
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub max_len: usize,
    pub max_age_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_len: 1000,
            max_age_secs: 24 * 3600,
        }
    }
}

/// [auth] 段：凭证根目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub dir: PathBuf,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./auth_sessions"),
        }
    }
}

/// [protocol] 段：协议 sidecar 地址与单次发送确认超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolSection {
    pub bridge_url: String,
    pub send_timeout_secs: u64,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            bridge_url: "ws://127.0.0.1:3010".to_string(),
            send_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownSection {
    pub timeout_secs: u64,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

/// 从 config 目录加载配置，环境变量 RELAY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RELAY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RELAY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.session.max_retries, 3);
        assert_eq!(cfg.session.terminal_codes, vec![401, 403]);
        assert_eq!(cfg.backend.timeout(), Duration::from_secs(15));
        assert_eq!(cfg.server.bind, "0.0.0.0:3001");
        assert_eq!(cfg.queue.max_len, 1000);
    }

    #[test]
    fn test_load_config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[session]\nmax_retries = 7\n\n[backend]\nurl = \"http://ai:9000\"").unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.session.max_retries, 7);
        assert_eq!(cfg.session.backoff_base_ms, 5000);
        assert_eq!(cfg.backend.url, "http://ai:9000");
        assert_eq!(cfg.backend.fallback_reply, DEFAULT_FALLBACK_REPLY);
    }
}
