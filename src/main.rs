mod autodelete;
mod callback;
mod catalog;
mod channels;
mod config;
mod fsio;
mod ingest;
mod requests;
mod text;
mod tg;
mod validate;

use dotenvy::dotenv;
use teloxide::prelude::*;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = config::Config::from_env()?;
    info!(
        data_dir = %config.data_dir.display(),
        channels = config.channels.len(),
        admins = config.admin_ids.len(),
        "starting movie catalog bot"
    );

    // хранилища создаются один раз и передаются хендлерам
    let catalog = catalog::CatalogStore::new(config.catalog_settings(), config.channels.clone());
    let requests = requests::RequestLedger::new(config.request_settings());
    let autodelete = autodelete::AutoDeleteLedger::in_dir(&config.data_dir, config.lock_timeout);

    let bot = Bot::from_env();
    let state = tg::BotState::new(config, catalog.clone(), requests, autodelete);
    tg::run(bot, state).await;

    // остаток буфера — на диск перед выходом
    match catalog.flush().await {
        Ok(written) => info!(written, "catalog buffer flushed on shutdown"),
        Err(e) => error!(error = %e, "catalog buffer lost on shutdown"),
    }
    Ok(())
}
