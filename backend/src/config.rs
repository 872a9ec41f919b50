use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub vlm: VlmConfig,
    pub graph: GraphConfig,
    pub registry: RegistryConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub host: String,
    pub model: String,
    /// Request timeout in seconds; the runner owns this budget.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VlmConfig {
    pub host: String,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// HTTP transaction endpoint of the property-graph store.
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Directory holding the seeded imaging/findings CSVs.
    pub dummy_dir: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory for debug-only normalised VLM bundles. Empty disables caching.
    pub debug_cache_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Config {
    /// Load configuration with environment variable override support
    ///
    /// Loading order:
    /// 1. Load from config.toml file
    /// 2. Override with environment variables
    /// 3. Validate the final configuration
    pub fn load() -> Result<Self, anyhow::Error> {
        let mut config = if let Some(config_path) = Self::find_config_file() {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - APP_SERVER_HOST / APP_SERVER_PORT: HTTP bind address
    /// - APP_LOG_LEVEL: logging filter (e.g., "info,grounded_ai=debug")
    /// - LLM_HOST / LLM_MODEL / LLM_TIMEOUT: text LLM runner
    /// - VLM_HOST / VLM_MODEL / VLM_TIMEOUT: vision-language runner
    /// - GRAPH_URI / GRAPH_USER / GRAPH_PASS / GRAPH_DATABASE: graph store
    /// - MEDICAL_DUMMY_DIR: seeded registry CSV directory
    /// - VISION_DEBUG_CACHE_DIR: normalised-bundle cache directory
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("APP_SERVER_HOST") {
            self.server.host = host;
            tracing::info!("Override server.host from env: {}", self.server.host);
        }

        if let Ok(port) = std::env::var("APP_SERVER_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
                tracing::info!("Override server.port from env: {}", self.server.port);
            }
        }

        if let Ok(level) = std::env::var("APP_LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }

        if let Ok(host) = std::env::var("LLM_HOST") {
            self.llm.host = host;
            tracing::info!("Override llm.host from env: {}", self.llm.host);
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            self.llm.model = model;
            tracing::info!("Override llm.model from env: {}", self.llm.model);
        }
        if let Ok(timeout) = std::env::var("LLM_TIMEOUT") {
            match timeout.parse() {
                Ok(val) => self.llm.timeout_secs = val,
                Err(e) => tracing::warn!(
                    "Invalid LLM_TIMEOUT '{}': {} (keep {})",
                    timeout,
                    e,
                    self.llm.timeout_secs
                ),
            }
        }

        if let Ok(host) = std::env::var("VLM_HOST") {
            self.vlm.host = host;
            tracing::info!("Override vlm.host from env: {}", self.vlm.host);
        }
        if let Ok(model) = std::env::var("VLM_MODEL") {
            self.vlm.model = model;
            tracing::info!("Override vlm.model from env: {}", self.vlm.model);
        }
        if let Ok(timeout) = std::env::var("VLM_TIMEOUT") {
            match timeout.parse() {
                Ok(val) => self.vlm.timeout_secs = val,
                Err(e) => tracing::warn!(
                    "Invalid VLM_TIMEOUT '{}': {} (keep {})",
                    timeout,
                    e,
                    self.vlm.timeout_secs
                ),
            }
        }

        if let Ok(uri) = std::env::var("GRAPH_URI") {
            self.graph.uri = uri;
            tracing::info!("Override graph.uri from env");
        }
        if let Ok(user) = std::env::var("GRAPH_USER") {
            self.graph.user = user;
        }
        if let Ok(pass) = std::env::var("GRAPH_PASS") {
            self.graph.password = pass;
            tracing::info!("Override graph.password from env");
        }
        if let Ok(database) = std::env::var("GRAPH_DATABASE") {
            self.graph.database = database;
        }

        if let Ok(dir) = std::env::var("MEDICAL_DUMMY_DIR") {
            self.registry.dummy_dir = dir;
            tracing::info!("Override registry.dummy_dir from env: {}", self.registry.dummy_dir);
        }
        if let Ok(dir) = std::env::var("VISION_DEBUG_CACHE_DIR") {
            self.cache.debug_cache_dir = Some(dir);
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.graph.password == "test1234" {
            tracing::warn!("⚠️  WARNING: Using default graph credentials!");
            tracing::warn!("⚠️  Please set GRAPH_PASS for any non-local deployment");
        }

        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }
        if self.graph.uri.is_empty() {
            anyhow::bail!("Graph URI cannot be empty");
        }
        if self.llm.timeout_secs == 0 || self.vlm.timeout_secs == 0 {
            anyhow::bail!("Runner timeouts must be > 0");
        }

        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            model: "qwen2.5:7b-instruct-q4_K_M".to_string(),
            timeout_secs: 120,
        }
    }
}

impl Default for VlmConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            model: "qwen2-vl:2b-instruct-q4_0".to_string(),
            timeout_secs: 60,
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: "http://localhost:7474".to_string(),
            user: "neo4j".to_string(),
            password: "test1234".to_string(),
            database: "neo4j".to_string(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { dummy_dir: "data/medical_dummy".to_string() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,grounded_ai=debug".to_string(),
            file: Some("logs/grounded-ai.log".to_string()),
        }
    }
}
