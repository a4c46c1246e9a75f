//! Provider detection and credential resolution for the LLM gateway.
//!
//! Resolution order on every call: per-request user override -> system
//! settings (admin store) -> environment bootstrap.

use crate::error::{AppError, AppResult};
use crate::models::{Config, SystemSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderType {
    OpenAi,
    Anthropic,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::OpenAi => "openai",
            ProviderType::Anthropic => "anthropic",
        }
    }
}

/// Detect the provider from the model name. `claude*` routes to Anthropic;
/// everything else (gpt-*, o-series, local models) is OpenAI-compatible.
pub fn detect_provider(model: &str) -> ProviderType {
    if model.to_ascii_lowercase().starts_with("claude") {
        ProviderType::Anthropic
    } else {
        ProviderType::OpenAi
    }
}

/// Key + base URL for one provider family.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderCredentials {
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: Option<String>,
}

impl ProviderCredentials {
    pub fn is_empty(&self) -> bool {
        self.openai_api_key.is_none()
            && self.openai_base_url.is_none()
            && self.anthropic_api_key.is_none()
            && self.anthropic_base_url.is_none()
    }

    pub fn from_settings(settings: &SystemSettings) -> Self {
        Self {
            openai_api_key: settings.openai_api_key.clone(),
            openai_base_url: settings.openai_base_url.clone(),
            anthropic_api_key: settings.anthropic_api_key.clone(),
            anthropic_base_url: settings.anthropic_base_url.clone(),
        }
    }

    pub fn from_env_config(config: &Config) -> Self {
        Self {
            openai_api_key: config.openai_api_key.clone(),
            openai_base_url: config.openai_base_url.clone(),
            anthropic_api_key: config.anthropic_api_key.clone(),
            anthropic_base_url: config.anthropic_base_url.clone(),
        }
    }
}

/// Fully resolved configuration for constructing one provider instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProvider {
    pub provider_type: ProviderType,
    pub api_key: String,
    pub base_url: Option<String>,
    /// True when every credential came from the environment bootstrap;
    /// only these instances may be cached for connection reuse.
    pub env_sourced: bool,
}

impl ResolvedProvider {
    pub fn cache_key(&self) -> String {
        format!(
            "{}:{}",
            self.provider_type.as_str(),
            self.base_url.as_deref().unwrap_or("default")
        )
    }
}

/// Resolve credentials for `model` through the three layers.
pub fn resolve_provider(
    model: &str,
    user: Option<&ProviderCredentials>,
    system: Option<&ProviderCredentials>,
    env: &ProviderCredentials,
) -> AppResult<ResolvedProvider> {
    let provider_type = detect_provider(model);

    let field = |creds: Option<&ProviderCredentials>,
                 get: fn(&ProviderCredentials) -> Option<&String>|
     -> Option<String> { creds.and_then(get).cloned() };

    let (get_key, get_url): (
        fn(&ProviderCredentials) -> Option<&String>,
        fn(&ProviderCredentials) -> Option<&String>,
    ) = match provider_type {
        ProviderType::OpenAi => (
            |c| c.openai_api_key.as_ref(),
            |c| c.openai_base_url.as_ref(),
        ),
        ProviderType::Anthropic => (
            |c| c.anthropic_api_key.as_ref(),
            |c| c.anthropic_base_url.as_ref(),
        ),
    };

    let user_key = field(user, get_key);
    let system_key = field(system, get_key);
    let env_key = field(Some(env), get_key);

    let user_url = field(user, get_url);
    let system_url = field(system, get_url);
    let env_url = field(Some(env), get_url);

    // Cache only when nothing user- or admin-scoped participated: those
    // credentials may rotate at any time.
    let env_sourced = user_key.is_none()
        && system_key.is_none()
        && user_url.is_none()
        && system_url.is_none();

    let api_key = user_key.or(system_key).or(env_key);
    let base_url = user_url.or(system_url).or(env_url);

    let api_key = api_key.ok_or_else(|| {
        AppError::Validation(format!(
            "no {} API key configured for model '{}'; set one in admin settings",
            provider_type.as_str(),
            model
        ))
    })?;

    Ok(ResolvedProvider {
        provider_type,
        api_key,
        base_url,
        env_sourced,
    })
}
