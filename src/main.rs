use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use ballotbox::bot::Dispatcher;
use ballotbox::clock::SystemClock;
use ballotbox::config::Config;
use ballotbox::controller::{ControllerSettings, SessionController};
use ballotbox::logging::{info, obj, v_int, v_str, warn, Domain};
use ballotbox::store::Store;
use ballotbox::telegram::BotApi;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let token = cfg.bot_token.clone().ok_or_else(|| anyhow!("BOT_TOKEN is not set"))?;

    // Schema failure is the one fatal condition; nothing is retried here.
    let store = Store::open(&cfg.sqlite_path)
        .with_context(|| format!("cannot open database at {}", cfg.sqlite_path))?;
    store.init().context("cannot initialise schema")?;

    let api = Arc::new(BotApi::new(
        &cfg.api_base,
        &token,
        Duration::from_secs(cfg.poll_timeout_secs + 10),
    )?);
    let engine = Arc::new(SessionController::new(
        store,
        api.clone(),
        Arc::new(SystemClock),
        ControllerSettings::from_config(&cfg),
    ));
    engine.seed_candidates(&cfg.seed_candidates)?;

    if cfg.admin_ids.is_empty() {
        warn(Domain::System, "no_admins", obj(&[("msg", v_str("ADMIN_IDS is empty; admin commands are disabled"))]));
    }
    info(
        Domain::System,
        "startup",
        obj(&[
            ("sqlite_path", v_str(&cfg.sqlite_path)),
            ("admins", v_int(cfg.admin_ids.len() as i64)),
            ("oracle_timeout_ms", v_int(cfg.oracle_timeout_ms as i64)),
        ]),
    );

    let dispatcher = Dispatcher::new(api, engine, cfg.vote_prompt.clone(), cfg.poll_timeout_secs);
    dispatcher.run(wait_for_signal()).await?;
    info(Domain::System, "shutdown", obj(&[]));
    Ok(())
}

async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // Without a signal handler the bot runs until the API stops it.
        warn(Domain::System, "signal_unavailable", obj(&[("error", v_str(&e.to_string()))]));
        std::future::pending::<()>().await;
    }
    info(Domain::System, "signal", obj(&[("msg", v_str("interrupt received, draining updates"))]));
}
