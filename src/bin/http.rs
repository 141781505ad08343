use study_scheduler::{Rescheduler, SchedulerConfig, SqliteStore, http_api, logging};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init("info")?;

    let config = match std::env::args().nth(1) {
        Some(path) => SchedulerConfig::load_from(std::path::Path::new(&path))?,
        None => SchedulerConfig::load()?,
    };
    let addr = config.socket_addr()?;

    let store = SqliteStore::open(&config.database_path)?
        .with_busy_timeout(config.busy_timeout());
    let engine = Rescheduler::new(store).with_default_policy(config.default_policy);
    let state = http_api::AppState::new(engine, config.trigger).with_workers(config.workers);

    if http_api::spawn_daily_trigger(state.clone()).is_none() {
        tracing::info!("daily closeout trigger disabled");
    }

    tracing::info!(
        %addr,
        db = %config.database_path.display(),
        "study-scheduler HTTP API listening"
    );
    http_api::serve(addr, state).await?;
    Ok(())
}
