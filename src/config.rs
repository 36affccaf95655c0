use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Enable rate limiting
    #[arg(long, env = "RATE_LIMIT_ENABLED")]
    pub rate_limit_enabled: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub ocr: OcrConfig,
    pub resilience: ResilienceConfig,
    pub sessions: SessionsConfig,
    pub skills: SkillsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub body_limit_bytes: usize,
}

/// Which upstream implementation answers questions.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Direct token streaming from the Messages API.
    Direct,
    /// Tool-augmented agent CLI.
    Agent,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub backend: BackendKind,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub max_tokens: u32,
    pub agent_command: String,
    /// Idle deadline between upstream events; 0 disables it.
    pub upstream_timeout_secs: u64,
}

impl LlmConfig {
    /// The API key, if set to something non-blank.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }

    pub fn upstream_timeout(&self) -> Option<Duration> {
        (self.upstream_timeout_secs > 0).then(|| Duration::from_secs(self.upstream_timeout_secs))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl OcrConfig {
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResilienceConfig {
    pub rate_limit_enabled: bool,
    pub rate_limit_max_requests: usize,
    pub rate_limit_window_secs: u64,
}

impl ResilienceConfig {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionsConfig {
    pub max_sessions: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SkillsConfig {
    pub dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    /// `compact` or `json`.
    pub format: String,
}

/// Conventional variable names mapped onto config keys.
const DIRECT_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("ANTHROPIC_API_KEY", "llm.api_key"),
    ("ANTHROPIC_MODEL", "llm.model"),
    ("ANTHROPIC_BASE_URL", "llm.base_url"),
    ("GEMINI_API_KEY", "ocr.api_key"),
    ("LOG_LEVEL", "logging.level"),
];

/// Conventional numeric variables; a value that does not parse fails loading.
const NUMERIC_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("RATE_LIMIT_MAX_REQUESTS", "resilience.rate_limit_max_requests"),
    ("RATE_LIMIT_WINDOW_SECS", "resilience.rate_limit_window_secs"),
];

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder();

        // 1. Defaults
        builder = builder
            .set_default("server.port", 8020)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.body_limit_bytes", 25 * 1024 * 1024)?
            .set_default("llm.backend", "direct")?
            .set_default("llm.model", "claude-haiku-4-5-20251001")?
            .set_default("llm.base_url", "https://api.anthropic.com")?
            .set_default("llm.max_tokens", 8192)?
            .set_default("llm.agent_command", "claude")?
            .set_default("llm.upstream_timeout_secs", 300)?
            .set_default("ocr.model", "gemini-2.5-flash")?
            .set_default("ocr.base_url", "https://generativelanguage.googleapis.com")?
            .set_default("resilience.rate_limit_enabled", true)?
            .set_default("resilience.rate_limit_max_requests", 10)?
            .set_default("resilience.rate_limit_window_secs", 3600)?
            .set_default("sessions.max_sessions", 50)?
            .set_default("skills.dir", "skills")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "compact")?;

        // 2. Config file: explicit path, else ./config.yaml when present
        if let Some(path) = &cli.config {
            builder = builder.add_source(File::from(Path::new(path)).required(true));
        } else if Path::new("config.yaml").exists() {
            builder = builder.add_source(File::with_name("config.yaml").required(false));
        }

        // 3. Prefixed environment, e.g. PDF_ASK__LLM__MODEL=claude-sonnet-4-5
        builder = builder.add_source(
            Environment::with_prefix("PDF_ASK")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        // 4. Conventional environment names
        for (var, key) in DIRECT_ENV_OVERRIDES {
            if let Ok(val) = env::var(var) {
                builder = builder.set_override(*key, val)?;
            }
        }
        if let Ok(val) = env::var("USE_AGENT_SDK") {
            let backend = if val.trim().eq_ignore_ascii_case("true") {
                "agent"
            } else {
                "direct"
            };
            builder = builder.set_override("llm.backend", backend)?;
        }
        for (var, key) in NUMERIC_ENV_OVERRIDES {
            if let Ok(val) = env::var(var) {
                let n = val.trim().parse::<u64>().map_err(|e| {
                    config::ConfigError::Message(format!("{var}={val:?} is not a valid number: {e}"))
                })?;
                builder = builder.set_override(*key, n)?;
            }
        }

        // 5. CLI flags (and their env fallbacks)
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(rl) = cli.rate_limit_enabled {
            builder = builder.set_override("resilience.rate_limit_enabled", rl)?;
        }

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would silently disable a component.
    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.resilience.rate_limit_window_secs == 0 {
            return Err(config::ConfigError::Message(
                "resilience.rate_limit_window_secs must be greater than 0".to_string(),
            ));
        }
        if self.resilience.rate_limit_max_requests == 0 {
            return Err(config::ConfigError::Message(
                "resilience.rate_limit_max_requests must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
