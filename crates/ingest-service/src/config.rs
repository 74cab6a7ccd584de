use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ingest_core::{is_valid_project, is_valid_subrealm, split_realm};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub database: DatabaseConfig,
    /// Build service host used when a notification carries no hostname.
    #[serde(default = "default_build_host")]
    pub build_host: String,
    #[serde(default = "default_excluded_project_patterns")]
    pub excluded_project_patterns: Vec<String>,
    #[serde(default = "default_automation_owner_patterns")]
    pub automation_owner_patterns: Vec<String>,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Upper bound on result pages read by one ingestion task.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_max_clock_skew_hours")]
    pub max_clock_skew_hours: i64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            page_size: default_page_size(),
            retention_days: default_retention_days(),
            max_clock_skew_hours: default_max_clock_skew_hours(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub realms: Vec<RealmConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmConfig {
    /// Subrealm name, e.g. `ci` for realm `chromium:ci`.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_variant_analysis: Option<TestVariantAnalysisConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestVariantAnalysisConfig {
    /// Cadence of the follow-up update task.
    pub update_interval_secs: u64,
    /// How far back the update task looks when recomputing status.
    pub status_update_duration_secs: u64,
}

fn default_build_host() -> String {
    "cr-buildbucket.appspot.com".to_string()
}

fn default_excluded_project_patterns() -> Vec<String> {
    vec![r"^(chrome|chromium)-m[0-9]+$".to_string()]
}

fn default_automation_owner_patterns() -> Vec<String> {
    vec![r"@.*\.gserviceaccount\.com$".to_string()]
}

fn default_max_pages() -> usize {
    10
}

fn default_page_size() -> usize {
    1000
}

fn default_retention_days() -> i64 {
    90
}

fn default_max_clock_skew_hours() -> i64 {
    24
}

impl ServiceConfig {
    pub fn default_for(project: &str) -> Self {
        let mut projects = BTreeMap::new();
        projects.insert(
            project.to_string(),
            ProjectConfig {
                realms: vec![RealmConfig {
                    name: "ci".to_string(),
                    test_variant_analysis: Some(TestVariantAnalysisConfig {
                        update_interval_secs: 3600,
                        status_update_duration_secs: 24 * 3600,
                    }),
                }],
            },
        );
        Self {
            database: DatabaseConfig {
                path: ".ingest/ingest.db".to_string(),
            },
            build_host: default_build_host(),
            excluded_project_patterns: default_excluded_project_patterns(),
            automation_owner_patterns: default_automation_owner_patterns(),
            ingestion: IngestionConfig::default(),
            projects,
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: ServiceConfig = toml::from_str(&s).with_context(|| "parse ingest.toml")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, project) in &self.projects {
            if !is_valid_project(name) {
                bail!("invalid project name {name:?}");
            }
            for realm in &project.realms {
                if !is_valid_subrealm(&realm.name) {
                    bail!("project {name}: invalid realm name {:?}", realm.name);
                }
                if let Some(tva) = &realm.test_variant_analysis {
                    if tva.update_interval_secs == 0 {
                        bail!("realm {name}:{}: update_interval_secs must be positive", realm.name);
                    }
                }
            }
        }
        for p in self.excluded_project_patterns.iter().chain(&self.automation_owner_patterns) {
            Regex::new(p).with_context(|| format!("compile pattern {p:?}"))?;
        }
        if self.ingestion.max_pages == 0 || self.ingestion.page_size == 0 {
            bail!("ingestion.max_pages and ingestion.page_size must be positive");
        }
        Ok(())
    }

    pub fn is_enrolled(&self, project: &str) -> bool {
        self.projects.contains_key(project)
    }

    /// Looks up the config for a full `project:subrealm` realm name.
    pub fn realm(&self, realm: &str) -> Option<&RealmConfig> {
        let (project, sub) = split_realm(realm).ok()?;
        self.projects.get(project)?.realms.iter().find(|r| r.name == sub)
    }

    /// Database location; relative paths resolve against `root`.
    pub fn db_path(&self, root: &Path) -> PathBuf {
        let expanded = PathBuf::from(shellexpand::tilde(&self.database.path).to_string());
        if expanded.is_absolute() {
            expanded
        } else {
            root.join(expanded)
        }
    }

    pub fn config_path(root: &Path) -> PathBuf {
        root.join(".ingest").join("ingest.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = ServiceConfig::config_path(dir.path());
        let cfg = ServiceConfig::default_for("chromium");
        cfg.save_to(&path).unwrap();
        let back = ServiceConfig::load_from(&path).unwrap();
        assert_eq!(back.projects, cfg.projects);
        assert_eq!(back.ingestion, IngestionConfig::default());
        assert_eq!(back.db_path(dir.path()), dir.path().join(".ingest/ingest.db"));
    }

    #[test]
    fn parses_minimal_toml_with_defaults() {
        let cfg: ServiceConfig = toml::from_str(
            r#"
[database]
path = "/var/lib/ingest.db"

[projects.chromium]
[[projects.chromium.realms]]
name = "ci"
test_variant_analysis = { update_interval_secs = 3600, status_update_duration_secs = 86400 }

[[projects.chromium.realms]]
name = "try"
"#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.ingestion.page_size, 1000);
        assert_eq!(cfg.ingestion.retention_days, 90);
        assert!(cfg.realm("chromium:ci").unwrap().test_variant_analysis.is_some());
        assert!(cfg.realm("chromium:try").unwrap().test_variant_analysis.is_none());
        assert!(cfg.realm("chromium:other").is_none());
        assert!(cfg.realm("v8:ci").is_none());
        assert_eq!(cfg.db_path(Path::new("/tmp")), PathBuf::from("/var/lib/ingest.db"));
    }

    #[test]
    fn rejects_invalid_names() {
        let mut cfg = ServiceConfig::default_for("chromium");
        cfg.projects.insert("Bad Project".into(), ProjectConfig::default());
        assert!(cfg.validate().is_err());

        let mut cfg = ServiceConfig::default_for("chromium");
        cfg.excluded_project_patterns.push("(".into());
        assert!(cfg.validate().is_err());
    }
}
