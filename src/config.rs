//! Application configuration.
//!
//! Settings are layered: built-in defaults, then `.code-agent/config.toml`,
//! then environment variables (a `.env` file is loaded first when present).
//!
//! ```toml
//! [server]
//! port = 3141
//! db_path = ".code-agent/app.db"
//! public_host = "localhost"
//!
//! [model]
//! api_base = "https://generativelanguage.googleapis.com/v1beta/openai"
//! model = "gemini-2.5-pro"
//! temperature = 0.1
//!
//! [sandbox]
//! template = "nextjs"
//! memory = "4g"
//!
//! [sandbox.images]
//! nextjs = "code-agent/nextjs:latest"
//!
//! [agent]
//! max_iterations = 15
//! provision_retries = 3
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const CONFIG_DIR: &str = ".code-agent";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
    pub db_path: PathBuf,
    /// Host name under which published sandbox ports are reachable.
    pub public_host: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 3141,
            db_path: PathBuf::from(CONFIG_DIR).join("app.db"),
            public_host: "localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    /// Base URL of an OpenAI-compatible chat completions endpoint.
    pub api_base: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub timeout_secs: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            api_base: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            model: "gemini-2.5-pro".to_string(),
            api_key: None,
            temperature: 0.1,
            max_tokens: None,
            timeout_secs: 180,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    /// Template provisioned for every job.
    pub template: String,
    /// Template name to container image.
    pub images: HashMap<String, String>,
    pub preview_port: u16,
    pub workdir: String,
    pub memory: String,
    pub cpus: f64,
    pub env: HashMap<String, String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        let mut images = HashMap::new();
        images.insert("nextjs".to_string(), "code-agent/nextjs:latest".to_string());
        Self {
            template: "nextjs".to_string(),
            images,
            preview_port: 3000,
            workdir: "/home/user".to_string(),
            memory: "4g".to_string(),
            cpus: 2.0,
            env: HashMap::new(),
        }
    }
}

impl SandboxSettings {
    /// Image for a template; unknown templates are treated as image names.
    pub fn image_for(&self, template: &str) -> String {
        self.images
            .get(template)
            .cloned()
            .unwrap_or_else(|| template.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub max_iterations: u32,
    pub provision_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            provision_retries: 3,
            retry_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoggingSettings {
    /// Directory for daily-rotated log files. Console only when unset.
    pub dir: Option<PathBuf>,
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub model: ModelSettings,
    pub sandbox: SandboxSettings,
    pub agent: AgentSettings,
    pub logging: LoggingSettings,
}

// ── Raw TOML structure ────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    server: Option<ServerSection>,
    model: Option<ModelSection>,
    sandbox: Option<SandboxSection>,
    agent: Option<AgentSection>,
    logging: Option<LoggingSection>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    port: Option<u16>,
    db_path: Option<PathBuf>,
    public_host: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelSection {
    api_base: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    template: Option<String>,
    images: Option<HashMap<String, String>>,
    preview_port: Option<u16>,
    workdir: Option<String>,
    memory: Option<String>,
    cpus: Option<f64>,
    env: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct AgentSection {
    max_iterations: Option<u32>,
    provision_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LoggingSection {
    dir: Option<PathBuf>,
    filter: Option<String>,
}

impl AppConfig {
    /// Default config file location relative to `base`.
    pub fn default_path(base: &Path) -> PathBuf {
        base.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Load configuration from `path` and apply environment overrides.
    /// A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::load_file(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Parse a TOML document on top of the defaults.
    pub fn parse(content: &str) -> Result<Self> {
        let raw: ConfigToml = toml::from_str(content).context("Invalid config TOML")?;
        let mut config = Self::default();

        if let Some(s) = raw.server {
            if let Some(port) = s.port {
                config.server.port = port;
            }
            if let Some(db_path) = s.db_path {
                config.server.db_path = db_path;
            }
            if let Some(host) = s.public_host {
                config.server.public_host = host;
            }
        }

        if let Some(m) = raw.model {
            if let Some(api_base) = m.api_base {
                config.model.api_base = api_base;
            }
            if let Some(model) = m.model {
                config.model.model = model;
            }
            if m.api_key.is_some() {
                config.model.api_key = m.api_key;
            }
            if let Some(temperature) = m.temperature {
                config.model.temperature = temperature;
            }
            if m.max_tokens.is_some() {
                config.model.max_tokens = m.max_tokens;
            }
            if let Some(timeout) = m.timeout_secs {
                config.model.timeout_secs = timeout;
            }
        }

        if let Some(s) = raw.sandbox {
            if let Some(template) = s.template {
                config.sandbox.template = template;
            }
            if let Some(images) = s.images {
                config.sandbox.images.extend(images);
            }
            if let Some(port) = s.preview_port {
                config.sandbox.preview_port = port;
            }
            if let Some(workdir) = s.workdir {
                config.sandbox.workdir = workdir;
            }
            if let Some(memory) = s.memory {
                config.sandbox.memory = memory;
            }
            if let Some(cpus) = s.cpus {
                config.sandbox.cpus = cpus;
            }
            if let Some(env) = s.env {
                config.sandbox.env = env;
            }
        }

        if let Some(a) = raw.agent {
            if let Some(max) = a.max_iterations {
                config.agent.max_iterations = max;
            }
            if let Some(retries) = a.provision_retries {
                config.agent.provision_retries = retries;
            }
            if let Some(backoff) = a.retry_backoff_ms {
                config.agent.retry_backoff_ms = backoff;
            }
        }

        if let Some(l) = raw.logging {
            config.logging.dir = l.dir;
            config.logging.filter = l.filter;
        }

        Ok(config)
    }

    /// Apply environment overrides. `lookup` is injected so tests do not
    /// touch the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup("CODE_AGENT_MODEL") {
            self.model.model = model;
        }
        if let Some(base) = lookup("CODE_AGENT_API_BASE") {
            self.model.api_base = base;
        }
        let key = lookup("CODE_AGENT_API_KEY")
            .or_else(|| lookup("OPENAI_API_KEY"))
            .or_else(|| lookup("GEMINI_API_KEY"));
        if key.is_some() {
            self.model.api_key = key;
        }
        if let Some(db) = lookup("CODE_AGENT_DB") {
            self.server.db_path = PathBuf::from(db);
        }
        if let Some(host) = lookup("CODE_AGENT_PUBLIC_HOST") {
            self.server.public_host = host;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 3141);
        assert_eq!(config.server.db_path, PathBuf::from(".code-agent/app.db"));
        assert_eq!(config.model.model, "gemini-2.5-pro");
        assert_eq!(config.sandbox.preview_port, 3000);
        assert_eq!(config.sandbox.image_for("nextjs"), "code-agent/nextjs:latest");
        assert_eq!(config.agent.max_iterations, 15);
        assert!(config.logging.dir.is_none());
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_file(&AppConfig::default_path(dir.path())).unwrap();
        assert_eq!(config.agent.max_iterations, 15);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = AppConfig::default_path(dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            r#"
[agent]
max_iterations = 5

[sandbox]
template = "vite"

[sandbox.images]
vite = "node:22-slim"
"#,
        )
        .unwrap();

        let config = AppConfig::load_file(&path).unwrap();
        assert_eq!(config.agent.max_iterations, 5);
        assert_eq!(config.agent.provision_retries, 3); // default
        assert_eq!(config.sandbox.template, "vite");
        assert_eq!(config.sandbox.image_for("vite"), "node:22-slim");
        assert_eq!(config.sandbox.image_for("nextjs"), "code-agent/nextjs:latest");
    }

    #[test]
    fn test_unknown_template_used_as_image() {
        let config = AppConfig::default();
        assert_eq!(config.sandbox.image_for("python:3.12"), "python:3.12");
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(AppConfig::parse("not valid toml {{{{").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config.apply_env(|key| match key {
            "CODE_AGENT_MODEL" => Some("gpt-4.1".to_string()),
            "OPENAI_API_KEY" => Some("sk-test".to_string()),
            "CODE_AGENT_PUBLIC_HOST" => Some("preview.example.com".to_string()),
            _ => None,
        });
        assert_eq!(config.model.model, "gpt-4.1");
        assert_eq!(config.model.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.server.public_host, "preview.example.com");
    }

    #[test]
    fn test_explicit_api_key_wins_over_fallbacks() {
        let mut config = AppConfig::default();
        config.apply_env(|key| match key {
            "CODE_AGENT_API_KEY" => Some("primary".to_string()),
            "GEMINI_API_KEY" => Some("fallback".to_string()),
            _ => None,
        });
        assert_eq!(config.model.api_key.as_deref(), Some("primary"));
    }
}
