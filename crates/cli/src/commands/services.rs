//! Process-wide services, built once per command and shared as `Arc`s.

use std::path::Path;
use std::sync::Arc;

use askdb_config::AppConfig;
use askdb_core::{History, ReasoningBackend};
use askdb_pipeline::ResolutionPipeline;
use askdb_reasoner::{OpenAiBackend, Reasoner, ReasonerSettings, RemoteContextStore};
use askdb_store::PostgresStore;
use tracing::info;

use super::CliResult;

pub fn load_config(path: Option<&Path>) -> CliResult<AppConfig> {
    AppConfig::load_with(path).map_err(|e| format!("Failed to load config: {e}").into())
}

pub struct Services {
    pub config: AppConfig,
    pub store: Arc<PostgresStore>,
    pub backend: Arc<OpenAiBackend>,
    pub reasoner: Arc<Reasoner>,
    pub pipeline: Arc<ResolutionPipeline>,
}

impl Services {
    /// Wire the store, the reasoning backend and the pipeline.
    pub fn build(config: AppConfig) -> CliResult<Self> {
        if !config.has_api_key() {
            return Err("No API key configured. Set OPENAI_API_KEY or reasoner.api_key.".into());
        }

        let store = Arc::new(PostgresStore::from_config(&config.database)?);
        let backend = Arc::new(OpenAiBackend::from_config(&config.reasoner)?);

        let raw: Arc<dyn ReasoningBackend> = backend.clone();
        let context = Arc::new(RemoteContextStore::new(raw.clone()));
        let settings = ReasonerSettings::from_config(&config.reasoner, &config.budget);
        let reasoner = Arc::new(Reasoner::new(raw, context, settings));

        let prompts = ResolutionPipeline::prompts_from_config(&config.reasoner, &config.budget);
        let pipeline = Arc::new(ResolutionPipeline::new(
            reasoner.clone(),
            store.clone(),
            store.clone(),
            prompts,
        ));

        Ok(Self {
            config,
            store,
            backend,
            reasoner,
            pipeline,
        })
    }

    /// Prepare the reasoning engine. Must run before the first resolution.
    pub async fn start(&self) -> CliResult {
        self.reasoner.init().await?;
        info!(
            model = %self.config.reasoner.model,
            schema = %self.store.schema(),
            "Services ready"
        );
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.store.close().await;
    }
}

/// Read prior turns from a JSON file.
pub fn history_from_file(path: &Path) -> CliResult<History> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| format!("Invalid history JSON in {}: {e}", path.display()))?;
    Ok(History::from_value(&value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn history_file_is_parsed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"user": "how many machines?", "bot": "twelve"}}, {{"user": "and in Inca?"}}]"#
        )
        .unwrap();

        let history = history_from_file(file.path()).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.to_messages().len(), 3);
    }

    #[test]
    fn bad_history_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(history_from_file(file.path()).is_err());
        assert!(history_from_file(Path::new("/nonexistent/askdb/history.json")).is_err());
    }

    #[test]
    fn build_requires_api_key() {
        let config = AppConfig::default();
        assert!(Services::build(config).is_err());
    }
}
