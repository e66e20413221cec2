use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PLATFORMS: &[(&str, &str)] = &[
    ("fic", "Invoicing (Fatture in Cloud)"),
    ("sevdesk", "Bookkeeping (sevDesk)"),
    ("hr", "Human resources"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSpec {
    pub id: String,

    #[serde(default)]
    pub display_name: String,

    pub ddl_path: PathBuf,
    pub store_path: PathBuf,
}

impl PlatformSpec {
    #[must_use]
    pub fn in_data_dir(id: &str, display_name: &str, data_dir: &Path) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            ddl_path: data_dir.join(format!("{id}.sql")),
            store_path: data_dir.join(format!("{id}.db")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanLimits {
    pub max_estimated_rows: u64,
    pub max_join_fan_out: f64,
    pub max_joins: usize,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            max_estimated_rows: 100_000,
            max_join_fan_out: 1_000.0,
            max_joins: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    pub row_cap: usize,
    pub timeout_ms: u64,
    pub max_connections: usize,
}

impl ExecutionLimits {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            row_cap: 500,
            timeout_ms: 5_000,
            max_connections: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub platforms: Vec<PlatformSpec>,
    pub max_plan_attempts: u32,
    pub transcript_window: usize,
    pub digest_token_budget: usize,
    pub max_question_chars: usize,
    pub plan_limits: PlanLimits,
    pub execution: ExecutionLimits,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            platforms: Vec::new(),
            max_plan_attempts: 3,
            transcript_window: 6,
            digest_token_budget: 1_200,
            max_question_chars: 12_000,
            plan_limits: PlanLimits::default(),
            execution: ExecutionLimits::default(),
        }
    }
}

impl AgentConfig {
    /// Registers the default platform set, each backed by `<id>.sql` and `<id>.db` in `data_dir`.
    #[must_use]
    pub fn for_data_dir(data_dir: &Path) -> Self {
        Self {
            platforms: DEFAULT_PLATFORMS
                .iter()
                .map(|(id, name)| PlatformSpec::in_data_dir(id, name, data_dir))
                .collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_platform(mut self, spec: PlatformSpec) -> Self {
        self.platforms.retain(|existing| existing.id != spec.id);
        self.platforms.push(spec);
        self
    }

    #[must_use]
    pub fn platform(&self, id: &str) -> Option<&PlatformSpec> {
        self.platforms.iter().find(|spec| spec.id == id)
    }

    pub fn platform_ids(&self) -> impl Iterator<Item = &str> {
        self.platforms.iter().map(|spec| spec.id.as_str())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_plan_attempts == 0 {
            bail!("max_plan_attempts must be greater than zero");
        }
        if self.execution.row_cap == 0 {
            bail!("execution.row_cap must be greater than zero");
        }
        if self.execution.max_connections == 0 {
            bail!("execution.max_connections must be greater than zero");
        }
        if self.execution.timeout_ms == 0 {
            bail!("execution.timeout_ms must be greater than zero");
        }
        let mut seen = std::collections::BTreeSet::new();
        for spec in &self.platforms {
            if spec.id.trim().is_empty() {
                bail!("platform ids must not be empty");
            }
            if !seen.insert(spec.id.as_str()) {
                bail!("platform `{}` is configured more than once", spec.id);
            }
        }
        Ok(())
    }
}

/// Reads a JSON config file; platform paths inside it resolve against the file's directory.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let mut config: AgentConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config JSON: {}", path.display()))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for spec in &mut config.platforms {
        if spec.ddl_path.is_relative() {
            spec.ddl_path = normalize_lexical(&base.join(&spec.ddl_path));
        }
        if spec.store_path.is_relative() {
            spec.store_path = normalize_lexical(&base.join(&spec.store_path));
        }
    }
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub home_dir: PathBuf,
    pub cwd: PathBuf,
    pub data_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl RuntimePaths {
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.state_dir.join("sessions.sqlite")
    }
}

pub fn resolve_runtime_paths(
    home_dir: &Path,
    cwd: &Path,
    data_dir_override: Option<&Path>,
    state_dir_override: Option<&Path>,
) -> Result<RuntimePaths> {
    if !home_dir.is_absolute() {
        bail!("home_dir must be absolute: {}", home_dir.display());
    }
    if !cwd.is_absolute() {
        bail!("cwd must be absolute: {}", cwd.display());
    }

    let home_dir = normalize_lexical(home_dir);
    let cwd = normalize_lexical(cwd);
    let data_dir = match data_dir_override {
        Some(path) => resolve_user_path(path, &home_dir, &cwd)?,
        None => home_dir.join(".tabletalk").join("data"),
    };
    let state_dir = match state_dir_override {
        Some(path) => resolve_user_path(path, &home_dir, &cwd)?,
        None => home_dir.join(".tabletalk").join("state"),
    };

    Ok(RuntimePaths {
        home_dir,
        cwd,
        data_dir: normalize_lexical(&data_dir),
        state_dir: normalize_lexical(&state_dir),
    })
}

fn resolve_user_path(path: &Path, home_dir: &Path, cwd: &Path) -> Result<PathBuf> {
    let expanded = expand_tilde(path, home_dir)?;
    let resolved = if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    };

    Ok(normalize_lexical(&resolved))
}

fn expand_tilde(path: &Path, home_dir: &Path) -> Result<PathBuf> {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first)) if first == "~" => {
            let mut expanded = home_dir.to_path_buf();
            for component in components {
                expanded.push(component.as_os_str());
            }
            Ok(expanded)
        }
        Some(Component::Normal(first))
            if first
                .to_str()
                .is_some_and(|segment| segment.starts_with('~')) =>
        {
            bail!(
                "unsupported home expansion syntax (only `~` and `~/...` are supported): {}",
                path.display()
            )
        }
        _ => Ok(path.to_path_buf()),
    }
}

fn normalize_lexical(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component.as_os_str());
                }
            }
            _ => normalized.push(component.as_os_str()),
        }
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::{AgentConfig, PlatformSpec, load_config, resolve_runtime_paths};
    use std::path::Path;

    #[test]
    fn defaults_data_and_state_dirs_under_home() {
        let paths = resolve_runtime_paths(Path::new("/home/tester"), Path::new("/work"), None, None)
            .expect("paths should resolve");

        assert_eq!(paths.data_dir, Path::new("/home/tester/.tabletalk/data"));
        assert_eq!(paths.state_dir, Path::new("/home/tester/.tabletalk/state"));
        assert_eq!(
            paths.journal_path(),
            Path::new("/home/tester/.tabletalk/state/sessions.sqlite")
        );
    }

    #[test]
    fn expands_tilde_and_relative_overrides() {
        let paths = resolve_runtime_paths(
            Path::new("/home/tester"),
            Path::new("/work/repo"),
            Some(Path::new("~/schemas")),
            Some(Path::new("./state/../state/sessions")),
        )
        .expect("overrides should resolve");

        assert_eq!(paths.data_dir, Path::new("/home/tester/schemas"));
        assert_eq!(paths.state_dir, Path::new("/work/repo/state/sessions"));
    }

    #[test]
    fn rejects_tilde_username_syntax() {
        let err = resolve_runtime_paths(
            Path::new("/home/tester"),
            Path::new("/work/repo"),
            Some(Path::new("~someone/data")),
            None,
        )
        .expect_err("~username syntax must fail");

        assert!(
            err.to_string()
                .contains("unsupported home expansion syntax"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn default_platform_set_follows_data_dir_convention() {
        let config = AgentConfig::for_data_dir(Path::new("/srv/data"));
        let ids = config.platform_ids().collect::<Vec<_>>();
        assert_eq!(ids, vec!["fic", "sevdesk", "hr"]);

        let hr = config.platform("hr").expect("hr should be registered");
        assert_eq!(hr.ddl_path, Path::new("/srv/data/hr.sql"));
        assert_eq!(hr.store_path, Path::new("/srv/data/hr.db"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn with_platform_replaces_existing_id() {
        let config = AgentConfig::for_data_dir(Path::new("/srv/data")).with_platform(
            PlatformSpec::in_data_dir("hr", "People", Path::new("/other")),
        );
        assert_eq!(config.platforms.len(), 3);
        assert_eq!(
            config.platform("hr").map(|spec| spec.display_name.as_str()),
            Some("People")
        );
    }

    #[test]
    fn loads_partial_json_config_relative_to_file() {
        let dir = std::env::temp_dir().join(format!(
            "tabletalk-config-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should exist");
        let path = dir.join("config.json");
        std::fs::write(
            &path,
            r#"{
                "platforms": [{"id": "hr", "ddl_path": "schemas/hr.sql", "store_path": "hr.db"}],
                "execution": {"row_cap": 25}
            }"#,
        )
        .expect("config should be written");

        let config = load_config(&path).expect("config should load");
        assert_eq!(config.execution.row_cap, 25);
        assert_eq!(config.execution.timeout_ms, 5_000);
        assert_eq!(config.max_plan_attempts, 3);
        assert_eq!(config.platforms[0].ddl_path, dir.join("schemas/hr.sql"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_duplicate_platform_ids() {
        let mut config = AgentConfig::for_data_dir(Path::new("/srv"));
        let duplicate = config.platforms[0].clone();
        config.platforms.push(duplicate);
        assert!(config.validate().is_err());
    }
}
