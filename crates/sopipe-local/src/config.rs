//! Layered settings: user file < workspace file < environment < explicit overrides.
//!
//! Also derives the proxy info (search endpoint base + credentials) and hands it to models that
//! are routed through the proxy.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use sopipe_core::{Error, Result};

use crate::{env, env_flag};

pub const DEFAULT_CONTEXT_LENGTH: usize = 8_192;
pub const PROXY_PROVIDER: &str = "proxy";
pub const OPENAI_COMPAT_PROVIDER: &str = "openai_compat";

const CONFIG_DIR: &str = "sopipe";
const WORKSPACE_DIR: &str = ".sopipe";
const CONFIG_FILE: &str = "config.json";

/// One settings source. Every field is optional; later layers win field by field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsLayer {
    pub proxy_url: Option<String>,
    pub workspace_id: Option<String>,
    pub access_token: Option<String>,
    pub allow_anonymous_telemetry: Option<bool>,
    pub model: Option<ModelLayer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelLayer {
    pub provider: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub context_length: Option<usize>,
}

impl ModelLayer {
    fn merge(self, over: ModelLayer) -> ModelLayer {
        ModelLayer {
            provider: over.provider.or(self.provider),
            base_url: over.base_url.or(self.base_url),
            api_key: over.api_key.or(self.api_key),
            model: over.model.or(self.model),
            context_length: over.context_length.or(self.context_length),
        }
    }
}

impl SettingsLayer {
    /// `over` wins wherever it sets a field.
    pub fn merge(self, over: SettingsLayer) -> SettingsLayer {
        let model = match (self.model, over.model) {
            (Some(a), Some(b)) => Some(a.merge(b)),
            (a, b) => b.or(a),
        };
        SettingsLayer {
            proxy_url: over.proxy_url.or(self.proxy_url),
            workspace_id: over.workspace_id.or(self.workspace_id),
            access_token: over.access_token.or(self.access_token),
            allow_anonymous_telemetry: over
                .allow_anonymous_telemetry
                .or(self.allow_anonymous_telemetry),
            model,
        }
    }

    /// Read the `SOPIPE_*` variables. A context length that is not a number is a config error.
    pub fn from_env() -> Result<SettingsLayer> {
        let context_length = match env("SOPIPE_CONTEXT_LENGTH") {
            Some(raw) => Some(raw.parse::<usize>().map_err(|e| {
                Error::Config(format!("SOPIPE_CONTEXT_LENGTH={raw:?}: {e}"))
            })?),
            None => None,
        };
        let model = ModelLayer {
            provider: env("SOPIPE_MODEL_PROVIDER"),
            base_url: env("SOPIPE_OPENAI_COMPAT_BASE_URL"),
            api_key: env("SOPIPE_OPENAI_COMPAT_API_KEY"),
            model: env("SOPIPE_OPENAI_COMPAT_MODEL"),
            context_length,
        };
        Ok(SettingsLayer {
            proxy_url: env("SOPIPE_PROXY_URL"),
            workspace_id: env("SOPIPE_WORKSPACE_ID"),
            access_token: env("SOPIPE_ACCESS_TOKEN"),
            allow_anonymous_telemetry: None,
            model: (model != ModelLayer::default()).then_some(model),
        })
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ModelSettings {
    pub provider: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub context_length: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            provider: OPENAI_COMPAT_PROVIDER.to_string(),
            base_url: None,
            api_key: None,
            model: None,
            context_length: DEFAULT_CONTEXT_LENGTH,
        }
    }
}

impl std::fmt::Debug for ModelSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSettings")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("context_length", &self.context_length)
            .finish()
    }
}

/// Where the search proxy lives and how to authenticate against it.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyInfo {
    pub workspace_id: Option<String>,
    /// Always ends with `/` so relative joins keep any path prefix.
    pub proxy_url: url::Url,
    pub access_token: Option<String>,
}

impl std::fmt::Debug for ProxyInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyInfo")
            .field("workspace_id", &self.workspace_id)
            .field("proxy_url", &self.proxy_url.as_str())
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ProxyInfo {
    pub fn new(
        proxy_url: &str,
        workspace_id: Option<String>,
        access_token: Option<String>,
    ) -> Result<Self> {
        let mut raw = proxy_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let proxy_url = url::Url::parse(&raw).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        Ok(Self {
            workspace_id,
            proxy_url,
            access_token,
        })
    }
}

/// Route proxy-backed models through the proxy with its credentials.
pub fn inject_proxy_info(model: &mut ModelSettings, proxy: &ProxyInfo) {
    if model.provider != PROXY_PROVIDER {
        return;
    }
    model.base_url = Some(proxy.proxy_url.as_str().trim_end_matches('/').to_string());
    model.api_key = proxy.access_token.clone();
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub proxy: Option<ProxyInfo>,
    pub model: ModelSettings,
    pub telemetry_enabled: bool,
}

impl Settings {
    pub fn require_proxy(&self) -> Result<&ProxyInfo> {
        self.proxy.as_ref().ok_or_else(|| {
            Error::NotConfigured(
                "missing search proxy (set SOPIPE_PROXY_URL or proxy_url)".to_string(),
            )
        })
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub settings: Settings,
    /// Non-fatal problems (unreadable or unparsable settings files).
    pub warnings: Vec<String>,
    /// Settings files that were found and applied, lowest precedence first.
    pub sources: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    pub user: Option<PathBuf>,
    pub workspace: Option<PathBuf>,
}

impl ConfigPaths {
    /// `SOPIPE_CONFIG` overrides the user file; the workspace file lives under `<dir>/.sopipe/`.
    pub fn discover(workspace_dir: Option<&Path>) -> Self {
        let user = env("SOPIPE_CONFIG")
            .map(PathBuf::from)
            .or_else(|| dirs::config_dir().map(|d| d.join(CONFIG_DIR).join(CONFIG_FILE)));
        let workspace = workspace_dir
            .map(Path::to_path_buf)
            .or_else(|| std::env::current_dir().ok())
            .map(|d| d.join(WORKSPACE_DIR).join(CONFIG_FILE));
        Self { user, workspace }
    }
}

fn read_layer(path: &Path, warnings: &mut Vec<String>) -> Option<SettingsLayer> {
    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read settings file");
            warnings.push(format!("failed to read {}: {e}", path.display()));
            return None;
        }
    };
    match serde_json::from_str::<SettingsLayer>(&raw) {
        Ok(layer) => Some(layer),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to parse settings file");
            warnings.push(format!("failed to parse {}: {e}", path.display()));
            None
        }
    }
}

pub fn load_config(paths: &ConfigPaths, overrides: SettingsLayer) -> Result<LoadedConfig> {
    let telemetry_env = env_flag("SOPIPE_TELEMETRY");
    load_config_with(paths, SettingsLayer::from_env()?, telemetry_env, overrides)
}

fn load_config_with(
    paths: &ConfigPaths,
    env_layer: SettingsLayer,
    telemetry_env: Option<bool>,
    overrides: SettingsLayer,
) -> Result<LoadedConfig> {
    let mut warnings = Vec::new();
    let mut sources = Vec::new();
    let mut merged = SettingsLayer::default();

    for path in [paths.user.as_deref(), paths.workspace.as_deref()]
        .into_iter()
        .flatten()
    {
        if let Some(layer) = read_layer(path, &mut warnings) {
            merged = merged.merge(layer);
            sources.push(path.to_path_buf());
        }
    }
    let merged = merged.merge(env_layer).merge(overrides);

    let model_layer = merged.model.unwrap_or_default();
    let defaults = ModelSettings::default();
    let mut model = ModelSettings {
        provider: model_layer.provider.unwrap_or(defaults.provider),
        base_url: model_layer.base_url,
        api_key: model_layer.api_key,
        model: model_layer.model,
        context_length: model_layer
            .context_length
            .unwrap_or(defaults.context_length),
    };
    if model.context_length == 0 {
        return Err(Error::Config("context_length must be > 0".to_string()));
    }

    let proxy = match merged.proxy_url.as_deref() {
        Some(u) => Some(
            ProxyInfo::new(u, merged.workspace_id, merged.access_token)
                .map_err(|e| Error::Config(format!("proxy_url: {e}")))?,
        ),
        None => None,
    };
    if let Some(p) = &proxy {
        inject_proxy_info(&mut model, p);
    }

    // Telemetry only when both the settings and the environment allow it.
    let telemetry_enabled =
        merged.allow_anonymous_telemetry.unwrap_or(true) && telemetry_env.unwrap_or(true);

    Ok(LoadedConfig {
        settings: Settings {
            proxy,
            model,
            telemetry_enabled,
        },
        warnings,
        sources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        k: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(k: &'static str, v: &str) -> Self {
            let prev = std::env::var(k).ok();
            std::env::set_var(k, v);
            Self { k, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(v) = self.prev.take() {
                std::env::set_var(self.k, v);
            } else {
                std::env::remove_var(self.k);
            }
        }
    }

    fn write(dir: &Path, rel: &str, body: &str) -> PathBuf {
        let p = dir.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(&p, body).unwrap();
        p
    }

    #[test]
    fn proxy_url_gets_trailing_slash() {
        let p = ProxyInfo::new("https://proxy.example.com/team", None, None).unwrap();
        assert_eq!(p.proxy_url.as_str(), "https://proxy.example.com/team/");
        let p = ProxyInfo::new("https://proxy.example.com/", None, None).unwrap();
        assert_eq!(p.proxy_url.as_str(), "https://proxy.example.com/");
    }

    #[test]
    fn workspace_overrides_user_and_env_overrides_both() {
        let tmp = tempfile::tempdir().unwrap();
        let user = write(
            tmp.path(),
            "user/config.json",
            r#"{"proxy_url":"https://user.example","model":{"model":"user-model","context_length":4096}}"#,
        );
        let ws = write(
            tmp.path(),
            "ws/.sopipe/config.json",
            r#"{"proxy_url":"https://ws.example","model":{"base_url":"http://llm.local"}}"#,
        );
        let paths = ConfigPaths {
            user: Some(user.clone()),
            workspace: Some(ws.clone()),
        };
        let env_layer = SettingsLayer {
            model: Some(ModelLayer {
                model: Some("env-model".to_string()),
                ..ModelLayer::default()
            }),
            ..SettingsLayer::default()
        };

        let cfg = load_config_with(&paths, env_layer, None, SettingsLayer::default()).unwrap();
        let s = &cfg.settings;
        assert_eq!(
            s.proxy.as_ref().unwrap().proxy_url.as_str(),
            "https://ws.example/"
        );
        assert_eq!(s.model.model.as_deref(), Some("env-model"));
        assert_eq!(s.model.base_url.as_deref(), Some("http://llm.local"));
        assert_eq!(s.model.context_length, 4096);
        assert_eq!(cfg.sources, vec![user, ws]);
        assert!(cfg.warnings.is_empty());
    }

    #[test]
    fn broken_settings_file_is_a_warning_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = write(tmp.path(), ".sopipe/config.json", "{ not json");
        let paths = ConfigPaths {
            user: Some(tmp.path().join("missing.json")),
            workspace: Some(ws),
        };
        let cfg = load_config_with(
            &paths,
            SettingsLayer::default(),
            None,
            SettingsLayer::default(),
        )
        .unwrap();
        assert_eq!(cfg.warnings.len(), 1);
        assert!(cfg.sources.is_empty());
        assert!(cfg.settings.proxy.is_none());
        assert_eq!(cfg.settings.model.context_length, DEFAULT_CONTEXT_LENGTH);
    }

    #[test]
    fn proxy_models_receive_proxy_info() {
        let overrides = SettingsLayer {
            proxy_url: Some("https://proxy.example/api".to_string()),
            access_token: Some("tok".to_string()),
            workspace_id: Some("ws-1".to_string()),
            model: Some(ModelLayer {
                provider: Some(PROXY_PROVIDER.to_string()),
                base_url: Some("http://ignored".to_string()),
                model: Some("m".to_string()),
                ..ModelLayer::default()
            }),
            ..SettingsLayer::default()
        };
        let cfg = load_config_with(
            &ConfigPaths::default(),
            SettingsLayer::default(),
            None,
            overrides,
        )
        .unwrap();
        let s = cfg.settings;
        assert_eq!(s.model.base_url.as_deref(), Some("https://proxy.example/api"));
        assert_eq!(s.model.api_key.as_deref(), Some("tok"));
        assert_eq!(s.proxy.unwrap().workspace_id.as_deref(), Some("ws-1"));
    }

    #[test]
    fn non_proxy_models_are_left_alone() {
        let proxy = ProxyInfo::new("https://p", None, Some("tok".to_string())).unwrap();
        let mut m = ModelSettings {
            base_url: Some("http://llm".to_string()),
            ..ModelSettings::default()
        };
        inject_proxy_info(&mut m, &proxy);
        assert_eq!(m.base_url.as_deref(), Some("http://llm"));
        assert!(m.api_key.is_none());
    }

    #[test]
    fn telemetry_requires_both_settings_and_env() {
        let on = SettingsLayer {
            allow_anonymous_telemetry: Some(true),
            ..SettingsLayer::default()
        };
        let off = SettingsLayer {
            allow_anonymous_telemetry: Some(false),
            ..SettingsLayer::default()
        };
        let p = ConfigPaths::default();
        let e = SettingsLayer::default;
        assert!(load_config_with(&p, e(), None, on.clone()).unwrap().settings.telemetry_enabled);
        assert!(!load_config_with(&p, e(), Some(false), on).unwrap().settings.telemetry_enabled);
        assert!(!load_config_with(&p, e(), Some(true), off).unwrap().settings.telemetry_enabled);
    }

    #[test]
    fn invalid_proxy_url_is_a_config_error() {
        let overrides = SettingsLayer {
            proxy_url: Some("not a url".to_string()),
            ..SettingsLayer::default()
        };
        let err = load_config_with(
            &ConfigPaths::default(),
            SettingsLayer::default(),
            None,
            overrides,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn empty_env_values_are_treated_as_missing() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _g1 = EnvGuard::set("SOPIPE_PROXY_URL", "   ");
        let _g2 = EnvGuard::set("SOPIPE_OPENAI_COMPAT_MODEL", "");
        let _g3 = EnvGuard::set("SOPIPE_CONTEXT_LENGTH", "16000");
        let layer = SettingsLayer::from_env().unwrap();
        assert!(layer.proxy_url.is_none());
        let model = layer.model.unwrap();
        assert!(model.model.is_none());
        assert_eq!(model.context_length, Some(16_000));
    }

    #[test]
    fn unparseable_context_length_is_a_config_error() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _g = EnvGuard::set("SOPIPE_CONTEXT_LENGTH", "abc");
        let err = SettingsLayer::from_env().unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("SOPIPE_CONTEXT_LENGTH")));

        let err = load_config(&ConfigPaths::default(), SettingsLayer::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
