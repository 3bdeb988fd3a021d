use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::mediawiki::{NS_DRAFT, NS_USER};

pub const DEFAULT_USER_AGENT: &str = "draftnocat/0.1";
pub const DEFAULT_TRACKING_CATEGORY: &str = "AfC_submissions_with_categories";
pub const DEFAULT_NAMESPACES: [i32; 2] = [NS_USER, NS_DRAFT];
pub const DEFAULT_EDIT_SUMMARY: &str = "Task 3: Disable the categories on this page while it is still a draft, per [[WP:DRAFTNOCAT]]/[[WP:USERNOCAT]]";
pub const DEFAULT_REPLICA_FILENAME: &str = "replica.db";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BotConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub task: TaskSection,
    #[serde(default)]
    pub replica: ReplicaSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct TaskSection {
    pub category: Option<String>,
    pub namespaces: Option<Vec<i32>>,
    pub edit_summary: Option<String>,
    pub minor: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ReplicaSection {
    pub db_path: Option<PathBuf>,
}

impl BotConfig {
    /// Resolve the wiki API URL: env WIKI_API_URL > config > None.
    pub fn api_url(&self) -> Option<String> {
        if let Some(value) = env_override("WIKI_API_URL") {
            return Some(value);
        }
        self.wiki
            .api_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        if let Some(value) = env_override("WIKI_USER_AGENT") {
            return value;
        }
        self.wiki
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Tracking category in database form (underscores, no namespace prefix).
    pub fn category(&self) -> String {
        let raw = self
            .task
            .category
            .as_deref()
            .unwrap_or(DEFAULT_TRACKING_CATEGORY);
        let trimmed = raw.trim();
        let without_prefix = trimmed
            .get(..9)
            .filter(|prefix| prefix.eq_ignore_ascii_case("Category:"))
            .map(|_| &trimmed[9..])
            .unwrap_or(trimmed);
        without_prefix.trim().replace(' ', "_")
    }

    pub fn namespaces(&self) -> Vec<i32> {
        match &self.task.namespaces {
            Some(namespaces) if !namespaces.is_empty() => namespaces.clone(),
            _ => DEFAULT_NAMESPACES.to_vec(),
        }
    }

    pub fn edit_summary(&self) -> &str {
        self.task
            .edit_summary
            .as_deref()
            .unwrap_or(DEFAULT_EDIT_SUMMARY)
    }

    pub fn minor(&self) -> bool {
        self.task.minor.unwrap_or(true)
    }

    /// Resolve the replica snapshot: env DRAFTNOCAT_REPLICA_DB > config >
    /// `<state_dir>/replica.db`. Relative paths hang off the project root.
    pub fn replica_db_path(&self, project_root: &Path, state_dir: &Path) -> PathBuf {
        let configured = env_override("DRAFTNOCAT_REPLICA_DB")
            .map(PathBuf::from)
            .or_else(|| self.replica.db_path.clone());
        match configured {
            Some(path) if path.is_absolute() => path,
            Some(path) => project_root.join(path),
            None => state_dir.join(DEFAULT_REPLICA_FILENAME),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.category().is_empty() {
            bail!("[task].category cannot be empty");
        }
        if self.edit_summary().trim().is_empty() {
            bail!("[task].edit_summary cannot be empty");
        }
        if let Some(namespace) = self.namespaces().iter().find(|ns| **ns < 0) {
            bail!("[task].namespaces contains a virtual namespace: {namespace}");
        }
        Ok(())
    }
}

/// Load and parse a BotConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<BotConfig> {
    if !config_path.exists() {
        return Ok(BotConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: BotConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    parsed
        .validate()
        .with_context(|| format!("invalid config in {}", config_path.display()))?;
    Ok(parsed)
}

fn env_override(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_targets_afc_tracking_category() {
        let config = BotConfig::default();
        assert_eq!(config.category(), "AfC_submissions_with_categories");
        assert_eq!(config.namespaces(), vec![2, 118]);
        assert!(config.minor());
        assert!(config.edit_summary().contains("[[WP:DRAFTNOCAT]]"));
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, BotConfig::default());
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[wiki]
api_url = "https://zh.wikipedia.org/w/api.php"
user_agent = "test-agent/1.0"

[task]
category = "Category:Drafts with live categories"
namespaces = [118]
edit_summary = "Disable categories"
minor = false

[replica]
db_path = "snapshots/zhwiki.db"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.wiki.api_url.as_deref(),
            Some("https://zh.wikipedia.org/w/api.php")
        );
        assert_eq!(config.wiki.user_agent.as_deref(), Some("test-agent/1.0"));
        assert_eq!(config.category(), "Drafts_with_live_categories");
        assert_eq!(config.namespaces(), vec![118]);
        assert_eq!(config.edit_summary(), "Disable categories");
        assert!(!config.minor());
        assert_eq!(
            config.replica.db_path.as_deref(),
            Some(Path::new("snapshots/zhwiki.db"))
        );
    }

    #[test]
    fn load_config_tolerates_partial_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[task]\nminor = true\n").expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert!(config.wiki.api_url.is_none());
        assert_eq!(config.namespaces(), vec![2, 118]);
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[wiki\napi_url = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn load_config_rejects_blank_summary() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[task]\nedit_summary = \"  \"\n").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(format!("{error:#}").contains("edit_summary cannot be empty"));
    }

    #[test]
    fn empty_namespace_list_falls_back_to_default() {
        let config = BotConfig {
            task: TaskSection {
                namespaces: Some(Vec::new()),
                ..TaskSection::default()
            },
            ..BotConfig::default()
        };
        assert_eq!(config.namespaces(), vec![2, 118]);
    }

    #[test]
    fn replica_path_resolves_relative_to_project_root() {
        let root = Path::new("/srv/bot");
        let state = root.join(".draftnocat");
        let config = BotConfig {
            replica: ReplicaSection {
                db_path: Some(PathBuf::from("data/replica.db")),
            },
            ..BotConfig::default()
        };
        if env::var("DRAFTNOCAT_REPLICA_DB").is_err() {
            assert_eq!(
                config.replica_db_path(root, &state),
                root.join("data/replica.db")
            );
            assert_eq!(
                BotConfig::default().replica_db_path(root, &state),
                state.join("replica.db")
            );
        }
    }
}
