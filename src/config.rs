//! Engine and provider configuration
//!
//! Configuration is plain serde data with defaults. Credentials can be
//! pulled from the environment with [`ProviderConfig::from_env`]; reading
//! and merging configuration files is left to the embedding application.

use crate::error::{ConverseError, Result};
use crate::orchestrator::OrchestratorConfig;
use crate::permissions::PermissionPolicy;
use crate::provider::{GenerationParams, RetryConfig, SecretString, DEFAULT_MAX_TOKENS};
use crate::tools::ToolRegistry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Supported backend families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    Bedrock,
}

impl FromStr for ProviderKind {
    type Err = ConverseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            "bedrock" | "aws" => Ok(Self::Bedrock),
            other => Err(ConverseError::Config(format!("Unknown provider: {}", other))),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic => write!(f, "anthropic"),
            Self::OpenAi => write!(f, "openai"),
            Self::Bedrock => write!(f, "bedrock"),
        }
    }
}

/// AWS credentials for signed requests
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: SecretString,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<SecretString>,
}

impl AwsCredentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: SecretString::new(secret_access_key),
            session_token: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(SecretString::new(token));
        self
    }
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("session_token", &self.session_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Which backend to talk to and how to authenticate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub model: String,
    #[serde(default)]
    pub api_key: SecretString,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsCredentials>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            api_key: SecretString::default(),
            base_url: None,
            region: None,
            aws: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = SecretString::new(api_key);
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Populate credentials from the process environment
    pub fn from_env(kind: ProviderKind, model: impl Into<String>) -> Result<Self> {
        Self::from_lookup(kind, model, |key| std::env::var(key).ok())
    }

    /// Populate credentials through an arbitrary variable lookup
    pub fn from_lookup<F>(kind: ProviderKind, model: impl Into<String>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new(kind, model);
        let require = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ConverseError::Config(format!("{} is not set", key)))
        };

        match kind {
            ProviderKind::Anthropic => {
                config.api_key = SecretString::new(require("ANTHROPIC_API_KEY")?);
                config.base_url = lookup("ANTHROPIC_BASE_URL");
            }
            ProviderKind::OpenAi => {
                config.api_key = SecretString::new(require("OPENAI_API_KEY")?);
                config.base_url = lookup("OPENAI_BASE_URL");
            }
            ProviderKind::Bedrock => {
                let mut credentials = AwsCredentials::new(
                    require("AWS_ACCESS_KEY_ID")?,
                    require("AWS_SECRET_ACCESS_KEY")?,
                );
                if let Some(token) = lookup("AWS_SESSION_TOKEN").filter(|t| !t.is_empty()) {
                    credentials = credentials.with_session_token(token);
                }
                config.aws = Some(credentials);
                config.region = lookup("AWS_REGION").or_else(|| lookup("AWS_DEFAULT_REGION"));
            }
        }
        Ok(config)
    }
}

/// Default on-disk location for session snapshots
pub fn default_session_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("a3s-converse")
        .join("sessions")
}

/// Tunables for the conversation engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on model turns per user request
    pub max_turns: usize,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: u32,
    /// Session directory; `None` uses [`default_session_dir`]
    pub session_dir: Option<PathBuf>,
    pub permissions: PermissionPolicy,
    /// Default wall-clock limit for shell commands
    pub bash_timeout_secs: u64,
    /// How long an unanswered confirmation or question waits before denying
    pub prompt_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_turns: crate::orchestrator::DEFAULT_MAX_TURNS,
            system_prompt: None,
            temperature: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            session_dir: None,
            permissions: PermissionPolicy::default(),
            bash_timeout_secs: crate::tools::builtin::bash::DEFAULT_TIMEOUT_SECS,
            prompt_timeout_secs: 300,
        }
    }
}

impl EngineConfig {
    pub fn session_dir(&self) -> PathBuf {
        self.session_dir.clone().unwrap_or_else(default_session_dir)
    }

    /// Orchestrator settings for the given model
    pub fn orchestrator_config(&self, model: &str) -> OrchestratorConfig {
        let mut params = GenerationParams::new(model);
        params.temperature = self.temperature;
        params.max_tokens = self.max_tokens;
        OrchestratorConfig {
            max_turns: self.max_turns,
            system_prompt: self.system_prompt.clone(),
            params,
            ..OrchestratorConfig::default()
        }
    }

    /// Registry with every built-in tool, honoring the configured shell timeout
    pub fn tool_registry(&self) -> ToolRegistry {
        ToolRegistry::with_builtins_and_timeout(Duration::from_secs(self.bash_timeout_secs))
    }
}
