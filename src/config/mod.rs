//! Configuration loading from TOML files and environment variables.
//!
//! Precedence (highest wins):
//! 1. Environment variables (`STEWARD_API_KEY`, `STEWARD_BASE_URL`,
//!    `STEWARD_MODEL`, `STEWARD_TURN_TIMEOUT_SECS`, `STEWARD_MODE`)
//! 2. TOML file given with `--config`
//! 3. `./steward.toml`
//! 4. `$XDG_CONFIG_HOME/steward/steward.toml` (or `~/.config/steward/steward.toml`)
//! 5. Built-in defaults

use crate::error::ConfigError;
use crate::operation::ChatMode;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

mod defaults;
mod types;

use defaults::DEFAULT_CONFIG_TEMPLATE;
pub use types::{
    AgentConfig, Config, ConfigInitResult, DisplayConfig, ModelConfig, StorageConfig,
};

const LOCAL_CONFIG_FILE: &str = "steward.toml";

/// Load configuration from disk and environment.
///
/// `path_override` is an explicit config file path (from `--config`).
pub fn load_config(path_override: Option<&str>) -> Result<Config, ConfigError> {
    load_config_from_sources(
        path_override,
        |path| std::fs::read_to_string(path),
        |name| std::env::var(name).ok(),
        config_root_dir,
    )
}

fn load_config_from_sources<FRead, FEnv, FRoot>(
    path_override: Option<&str>,
    read_file: FRead,
    env_lookup: FEnv,
    config_root: FRoot,
) -> Result<Config, ConfigError>
where
    FRead: Fn(&Path) -> Result<String, std::io::Error>,
    FEnv: Fn(&str) -> Option<String>,
    FRoot: Fn() -> Option<PathBuf>,
{
    let (text, source) = read_config_text(path_override, &read_file, &config_root)?;
    tracing::debug!(source = %source, "loading configuration");
    let mut config: Config = toml::from_str(&text)?;
    resolve_api_key(&mut config.model, &env_lookup);
    apply_env_overrides(&mut config, &env_lookup)?;
    validate(&config)?;
    Ok(config)
}

fn read_config_text<FRead, FRoot>(
    path_override: Option<&str>,
    read_file: &FRead,
    config_root: &FRoot,
) -> Result<(String, String), ConfigError>
where
    FRead: Fn(&Path) -> Result<String, std::io::Error>,
    FRoot: Fn() -> Option<PathBuf>,
{
    if let Some(p) = path_override {
        let path = PathBuf::from(p);
        let text = read_file(&path)?;
        return Ok((text, path.display().to_string()));
    }
    if let Ok(text) = read_file(Path::new(LOCAL_CONFIG_FILE)) {
        return Ok((text, LOCAL_CONFIG_FILE.to_string()));
    }
    if let Some(dir) = config_root() {
        let global = dir.join("steward").join(LOCAL_CONFIG_FILE);
        if let Ok(text) = read_file(&global) {
            return Ok((text, global.display().to_string()));
        }
    }
    Ok((String::new(), "built-in defaults".to_string()))
}

fn resolve_api_key<FEnv>(model: &mut ModelConfig, env_lookup: &FEnv)
where
    FEnv: Fn(&str) -> Option<String>,
{
    model.api_key = model.api_key.trim().to_string();
    if !model.api_key.is_empty() {
        return;
    }
    if let Some(name) = model.api_key_env.as_deref().and_then(normalized_string) {
        model.api_key = env_lookup(&name).unwrap_or_default().trim().to_string();
    }
}

fn apply_env_overrides<FEnv>(config: &mut Config, env_lookup: &FEnv) -> Result<(), ConfigError>
where
    FEnv: Fn(&str) -> Option<String>,
{
    if let Some(key) = env_lookup("STEWARD_API_KEY").and_then(|v| normalized_string(&v)) {
        config.model.api_key = key;
    }
    if let Some(url) = env_lookup("STEWARD_BASE_URL").and_then(|v| normalized_string(&v)) {
        config.model.base_url = url;
    }
    if let Some(model) = env_lookup("STEWARD_MODEL").and_then(|v| normalized_string(&v)) {
        config.model.model = model;
    }
    if let Some(timeout) = env_lookup("STEWARD_TURN_TIMEOUT_SECS") {
        let parsed = timeout.trim().parse::<u64>().map_err(|_| {
            ConfigError::Invalid(format!(
                "invalid STEWARD_TURN_TIMEOUT_SECS value `{timeout}`: expected positive integer seconds"
            ))
        })?;
        config.agent.turn_timeout_secs = parsed.max(1);
    }
    if let Some(mode) = env_lookup("STEWARD_MODE") {
        config.agent.default_mode = mode
            .parse::<ChatMode>()
            .map_err(|e| ConfigError::Invalid(format!("STEWARD_MODE: {e}")))?;
    }
    Ok(())
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.model.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("model.base_url must not be empty".into()));
    }
    if config.model.model.trim().is_empty() {
        return Err(ConfigError::Invalid("model.model must not be empty".into()));
    }
    if config.agent.turn_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "agent.turn_timeout_secs must be at least 1".into(),
        ));
    }
    if config.agent.max_message_chars == 0 {
        return Err(ConfigError::Invalid(
            "agent.max_message_chars must be at least 1".into(),
        ));
    }
    Ok(())
}

fn normalized_string(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Default per-user config path (`~/.config/steward/steward.toml`).
pub fn default_global_config_path() -> Option<PathBuf> {
    config_root_dir().map(|dir| dir.join("steward").join(LOCAL_CONFIG_FILE))
}

/// Write the default template to `path`.
///
/// Without `force`, an existing file is left untouched.
pub fn initialize_config_at(path: &Path, force: bool) -> Result<ConfigInitResult, ConfigError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        if !force {
            return Ok(ConfigInitResult::AlreadyInitialized {
                path: path.to_path_buf(),
            });
        }
        std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;
        return Ok(ConfigInitResult::Overwritten {
            path: path.to_path_buf(),
        });
    }
    // create_new avoids clobbering if another process wins a race to create.
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(DEFAULT_CONFIG_TEMPLATE.as_bytes())?;
            Ok(ConfigInitResult::Created {
                path: path.to_path_buf(),
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Ok(ConfigInitResult::AlreadyInitialized {
                path: path.to_path_buf(),
            })
        }
        Err(e) => Err(ConfigError::Io(e)),
    }
}

pub fn config_root_dir() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".config"))
        .or_else(dirs::config_dir)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::TestTempDir;
    use std::collections::BTreeMap;

    fn load_for_test(
        path_override: Option<&str>,
        files: BTreeMap<String, String>,
        env: BTreeMap<String, String>,
        config_root: Option<PathBuf>,
    ) -> Result<Config, ConfigError> {
        load_config_from_sources(
            path_override,
            move |path| {
                let key = path.to_string_lossy().into_owned();
                files
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, key))
            },
            move |name| env.get(name).cloned(),
            move || config_root.clone(),
        )
    }

    #[test]
    fn defaults_are_sensible() {
        let c = Config::default();
        assert_eq!(c.model.base_url, "https://api.openai.com/v1");
        assert_eq!(c.model.api_key_env.as_deref(), Some("OPENAI_API_KEY"));
        assert_eq!(c.agent.default_mode, ChatMode::Read);
        assert_eq!(c.agent.max_followup_turns, 1);
        assert_eq!(c.agent.max_message_chars, 2000);
        assert_eq!(c.storage.workspace, PathBuf::from("."));
        assert!(c.display.color);
    }

    #[test]
    fn template_parses_to_defaults() {
        let parsed: Config = toml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let mut files = BTreeMap::new();
        files.insert(
            "steward.toml".to_string(),
            r#"
            [agent]
            default_mode = "update"
            max_followup_turns = 3
            "#
            .to_string(),
        );
        let c = load_for_test(None, files, BTreeMap::new(), None).unwrap();
        assert_eq!(c.agent.default_mode, ChatMode::Update);
        assert_eq!(c.agent.max_followup_turns, 3);
        assert_eq!(c.agent.turn_timeout_secs, 300);
        assert_eq!(c.model.model, "gpt-4o-mini");
    }

    #[test]
    fn local_file_wins_over_global() {
        let mut files = BTreeMap::new();
        files.insert(
            "steward.toml".to_string(),
            "[model]\nmodel = \"local-model\"\n".to_string(),
        );
        files.insert(
            "/cfg/steward/steward.toml".to_string(),
            "[model]\nmodel = \"global-model\"\n".to_string(),
        );
        let c = load_for_test(None, files, BTreeMap::new(), Some(PathBuf::from("/cfg"))).unwrap();
        assert_eq!(c.model.model, "local-model");
    }

    #[test]
    fn global_file_used_when_no_local() {
        let mut files = BTreeMap::new();
        files.insert(
            "/cfg/steward/steward.toml".to_string(),
            "[model]\nmodel = \"global-model\"\n".to_string(),
        );
        let c = load_for_test(None, files, BTreeMap::new(), Some(PathBuf::from("/cfg"))).unwrap();
        assert_eq!(c.model.model, "global-model");
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let err = load_for_test(Some("nope.toml"), BTreeMap::new(), BTreeMap::new(), None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn api_key_env_is_resolved_and_steward_key_wins() {
        let mut env = BTreeMap::new();
        env.insert("OPENAI_API_KEY".to_string(), " sk-env \n".to_string());
        let c = load_for_test(None, BTreeMap::new(), env.clone(), None).unwrap();
        assert_eq!(c.model.api_key, "sk-env");

        env.insert("STEWARD_API_KEY".to_string(), "sk-steward".to_string());
        let c = load_for_test(None, BTreeMap::new(), env, None).unwrap();
        assert_eq!(c.model.api_key, "sk-steward");
    }

    #[test]
    fn env_overrides_apply() {
        let mut env = BTreeMap::new();
        env.insert(
            "STEWARD_BASE_URL".to_string(),
            "https://override.example/v1".to_string(),
        );
        env.insert("STEWARD_MODEL".to_string(), "override-model".to_string());
        env.insert("STEWARD_TURN_TIMEOUT_SECS".to_string(), "9".to_string());
        env.insert("STEWARD_MODE".to_string(), "delete".to_string());
        let c = load_for_test(None, BTreeMap::new(), env, None).unwrap();
        assert_eq!(c.model.base_url, "https://override.example/v1");
        assert_eq!(c.model.model, "override-model");
        assert_eq!(c.agent.turn_timeout_secs, 9);
        assert_eq!(c.agent.default_mode, ChatMode::Delete);
    }

    #[test]
    fn invalid_env_values_are_rejected() {
        let mut env = BTreeMap::new();
        env.insert("STEWARD_TURN_TIMEOUT_SECS".to_string(), "soon".to_string());
        let err = load_for_test(None, BTreeMap::new(), env, None).unwrap_err();
        assert!(err.to_string().contains("STEWARD_TURN_TIMEOUT_SECS"));

        let mut env = BTreeMap::new();
        env.insert("STEWARD_MODE".to_string(), "yolo".to_string());
        assert!(load_for_test(None, BTreeMap::new(), env, None).is_err());
    }

    #[test]
    fn invalid_mode_in_file_is_a_toml_error() {
        let mut files = BTreeMap::new();
        files.insert(
            "steward.toml".to_string(),
            "[agent]\ndefault_mode = \"all\"\n".to_string(),
        );
        let err = load_for_test(None, files, BTreeMap::new(), None).unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn initialize_writes_template_once() {
        let dir = TestTempDir::new("config-init");
        let path = dir.path().join("nested").join("steward.toml");
        assert_eq!(
            initialize_config_at(&path, false).unwrap(),
            ConfigInitResult::Created { path: path.clone() }
        );
        std::fs::write(&path, "# edited").unwrap();
        assert_eq!(
            initialize_config_at(&path, false).unwrap(),
            ConfigInitResult::AlreadyInitialized { path: path.clone() }
        );
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# edited");
        assert_eq!(
            initialize_config_at(&path, true).unwrap(),
            ConfigInitResult::Overwritten { path: path.clone() }
        );
        assert_eq!(std::fs::read_to_string(&path).unwrap(), DEFAULT_CONFIG_TEMPLATE);
    }
}
