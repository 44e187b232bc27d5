//! Effective settings for one CLI invocation: flags layered over the config
//! file layered over built-in defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use manuscript_core::config::{FileConfig, LoadedConfig};
use manuscript_core::engine::EngineSettings;
use manuscript_core::library::PolicyTable;
use manuscript_core::resolver::{JsonManifestResolver, ManifestCache, ResolverRegistry};
use manuscript_core::{Database, Orchestrator, QueueStore};
use tracing::debug;

use crate::cli::{DEFAULT_STATE_DIR, RunArgs};

/// Name of the queue database inside the state directory.
pub(crate) const QUEUE_DB_FILE: &str = "queue.db";

#[derive(Debug, Clone)]
pub(crate) struct AppContext {
    pub(crate) state_dir: PathBuf,
    pub(crate) config: FileConfig,
    pub(crate) config_path: Option<PathBuf>,
}

impl AppContext {
    pub(crate) fn new(state_dir_flag: Option<&Path>, loaded: LoadedConfig) -> Self {
        let state_dir = state_dir_flag
            .map(Path::to_path_buf)
            .or_else(|| loaded.config.state_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
        Self {
            state_dir,
            config: loaded.config,
            config_path: loaded.loaded_from_file.then_some(loaded.path).flatten(),
        }
    }

    pub(crate) fn db_path(&self) -> PathBuf {
        self.state_dir.join(QUEUE_DB_FILE)
    }

    /// Engine settings and policies with `run` flags applied last.
    pub(crate) fn engine_config(&self, run: &RunArgs) -> (EngineSettings, PolicyTable) {
        let mut config = self.config.clone();
        if let Some(retries) = run.retries {
            config.retry_limit = Some(retries);
            for library in config.libraries.values_mut() {
                library.retry_limit = Some(retries);
            }
        }

        let mut settings = EngineSettings::new(".", self.state_dir.clone());
        config.apply_to(&mut settings);
        if let Some(output_dir) = &run.output_dir {
            settings.output_dir.clone_from(output_dir);
        }
        if let Some(concurrency) = run.concurrency {
            settings.global_max_concurrent = concurrency;
        }
        if let Some(workers) = run.workers {
            settings.worker_count = workers;
        }
        (settings, config.policy_table())
    }

    /// Opens the state database, creating the state directory if needed.
    pub(crate) async fn open_database(&self) -> Result<Database> {
        tokio::fs::create_dir_all(&self.state_dir)
            .await
            .with_context(|| {
                format!("Failed to create state directory '{}'", self.state_dir.display())
            })?;
        let db_path = self.db_path();
        let db = Database::new(&db_path)
            .await
            .with_context(|| format!("Failed to open queue database '{}'", db_path.display()))?;
        debug!(db = %db_path.display(), "database opened");
        Ok(db)
    }

    /// Opens the persistent queue.
    pub(crate) async fn open_store(&self) -> Result<QueueStore> {
        let db = self.open_database().await?;
        QueueStore::sqlite(db)
            .await
            .context("Failed to load the download queue")
    }

    pub(crate) async fn open_orchestrator(&self, run: &RunArgs) -> Result<Orchestrator> {
        let db = self.open_database().await?;
        let store = QueueStore::sqlite(db.clone())
            .await
            .context("Failed to load the download queue")?;
        let (settings, policies) = self.engine_config(run);

        let mut resolvers = if self.config.manifest_cache_enabled() {
            ResolverRegistry::new()
                .with_cache(ManifestCache::new(db, self.config.manifest_cache_ttl()))
        } else {
            ResolverRegistry::new()
        };
        resolvers.register(Box::new(
            JsonManifestResolver::new().context("Failed to create manifest resolver")?,
        ));

        Orchestrator::open(settings, store, resolvers, policies)
            .await
            .context("Failed to start the download engine")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use manuscript_core::config::parse_config_str;

    fn loaded(raw: &str) -> LoadedConfig {
        LoadedConfig {
            path: Some(PathBuf::from("/cfg/config.toml")),
            config: parse_config_str(raw).unwrap(),
            loaded_from_file: true,
        }
    }

    #[test]
    fn test_state_dir_priority() {
        let ctx = AppContext::new(Some(Path::new("flag")), loaded("state_dir = \"file\""));
        assert_eq!(ctx.state_dir, PathBuf::from("flag"));

        let ctx = AppContext::new(None, loaded("state_dir = \"file\""));
        assert_eq!(ctx.state_dir, PathBuf::from("file"));
        assert_eq!(ctx.db_path(), PathBuf::from("file/queue.db"));

        let ctx = AppContext::new(None, loaded(""));
        assert_eq!(ctx.state_dir, PathBuf::from(DEFAULT_STATE_DIR));
    }

    #[test]
    fn test_flags_override_config() {
        let ctx = AppContext::new(
            None,
            loaded("output_dir = \"from-file\"\nglobal_max_concurrent = 3\nretry_limit = 2\n[library.bnf]\nretry_limit = 9"),
        );
        let run = RunArgs {
            output_dir: Some(PathBuf::from("from-flag")),
            concurrency: Some(10),
            workers: None,
            retries: Some(0),
        };
        let (settings, policies) = ctx.engine_config(&run);

        assert_eq!(settings.output_dir, PathBuf::from("from-flag"));
        assert_eq!(settings.global_max_concurrent, 10);
        assert_eq!(settings.work_dir, PathBuf::from(DEFAULT_STATE_DIR));
        assert_eq!(policies.default_policy().retry_limit, 0);
        assert_eq!(policies.get("bnf").retry_limit, 0);
    }

    #[test]
    fn test_config_used_without_flags() {
        let ctx = AppContext::new(None, loaded("output_dir = \"from-file\"\nretry_limit = 2"));
        let (settings, policies) = ctx.engine_config(&RunArgs::default());
        assert_eq!(settings.output_dir, PathBuf::from("from-file"));
        assert_eq!(policies.default_policy().retry_limit, 2);
    }
}
