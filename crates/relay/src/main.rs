use std::sync::Arc;

use relay_openai::OpenAiCompatClient;

use relay_core::{config::Config, ports::PersistencePort, store::MemoryStore};

#[tokio::main]
async fn main() -> Result<(), relay_core::Error> {
    relay_core::logging::init("relay")?;

    let cfg = Arc::new(Config::load()?);

    let store = Arc::new(match &cfg.store_path {
        Some(path) => MemoryStore::open(cfg.history, path)?,
        None => MemoryStore::new(cfg.history),
    });
    let persistence: Arc<dyn PersistencePort> = store.clone();

    let llm = Arc::new(OpenAiCompatClient::new(&cfg.llm)?);

    let polled = relay_telegram::router::run_polling(cfg, llm, persistence).await;

    // Pending snapshot changes are written even when polling failed.
    if let Err(e) = store.flush().await {
        tracing::error!(error = %e, "final store snapshot not written");
    }
    polled.map_err(|e| relay_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}
