use crate::cli::{CLI, DEFAULT_BASE_URL};
use anyhow::{Context, Result};
use burrow_storage::{PipelineSettings, StorageConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Options read from the `--config` JSON file.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub file_storage_path: Option<PathBuf>,
    #[serde(default)]
    pub database_dsn: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

#[derive(Debug)]
pub struct Settings {
    pub storage: StorageConfig,
    pub base_url: String,
    pub user: String,
}

impl Settings {
    /// Flags and environment win; the config file only fills what is still unset.
    pub fn resolve(cli: &CLI) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let file_path = non_empty_path(cli.file_storage_path.clone())
            .or_else(|| non_empty_path(file.file_storage_path));
        let database_dsn =
            non_empty(cli.database_dsn.clone()).or_else(|| non_empty(file.database_dsn));
        let base_url = non_empty(cli.base_url.clone())
            .or_else(|| non_empty(file.base_url))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let storage = StorageConfig {
            file_path,
            database_dsn,
            pipeline: PipelineSettings::builder()
                .batch_size(cli.batch_size.max(1))
                .build(),
        };

        Ok(Self {
            storage,
            base_url,
            user: cli.user.clone(),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn non_empty_path(value: Option<PathBuf>) -> Option<PathBuf> {
    value.filter(|v| !v.as_os_str().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_storage::Backend;
    use clap::Parser;
    use tempfile::NamedTempFile;

    fn parse(args: &[&str]) -> CLI {
        CLI::try_parse_from(std::iter::once("burrow").chain(args.iter().copied())).unwrap()
    }

    fn config_file(json: &str) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), json).unwrap();
        file
    }

    #[test]
    fn defaults_to_memory() {
        let settings = Settings::resolve(&parse(&["stats"])).unwrap();

        assert_eq!(settings.storage.backend(), Backend::Memory);
        assert_eq!(settings.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn file_fills_unset_options_only() {
        let file = config_file(
            r#"{"file_storage_path":"/tmp/urls.jsonl","base_url":"https://file.example/"}"#,
        );
        let cli = parse(&[
            "--config",
            file.path().to_str().unwrap(),
            "--base-url",
            "https://flag.example/",
            "stats",
        ]);

        let settings = Settings::resolve(&cli).unwrap();

        assert_eq!(settings.base_url, "https://flag.example/");
        assert_eq!(
            settings.storage.file_path,
            Some(PathBuf::from("/tmp/urls.jsonl"))
        );
    }

    #[test]
    fn dsn_from_file_selects_database() {
        let file = config_file(r#"{"database_dsn":"sqlite://urls.db"}"#);
        let cli = parse(&["--config", file.path().to_str().unwrap(), "ping"]);

        let settings = Settings::resolve(&cli).unwrap();

        assert_eq!(settings.storage.backend(), Backend::Database);
    }

    #[test]
    fn unreadable_config_is_an_error() {
        let file = config_file("{not json");
        let cli = parse(&["--config", file.path().to_str().unwrap(), "stats"]);

        assert!(Settings::resolve(&cli).is_err());
    }

    #[test]
    fn batch_size_feeds_the_pipeline() {
        let settings = Settings::resolve(&parse(&["--batch-size", "5", "list"])).unwrap();

        assert_eq!(settings.storage.pipeline.batch_size, 5);
    }
}
