use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use relay_core::{
    config::Config,
    messaging::{
        port::TransportPort,
        throttled::{FloodGate, ThrottledTransport},
    },
    ports::{LlmGateway, PersistencePort},
    relay::{Relay, RelayConfig},
    reminder::ReminderLoop,
};

use crate::handlers;
use crate::TelegramTransport;

/// Who the bot is, for mention checks in group chats.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BotIdentity {
    pub id: u64,
    pub username: String,
}

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub me: BotIdentity,
    pub relay: Arc<Relay>,
    pub transport: Arc<dyn TransportPort>,
}

pub async fn run_polling(
    cfg: Arc<Config>,
    llm: Arc<dyn LlmGateway>,
    persistence: Arc<dyn PersistencePort>,
) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram.bot_token.clone());

    let me = bot.get_me().await?;
    let me = BotIdentity {
        id: me.id.0,
        username: me.username().to_string(),
    };
    tracing::info!(username = %me.username, "relay started");
    tracing::info!(
        admins = cfg.telegram.admin_users.len(),
        model = %cfg.llm.model,
        reminder_times = %relay_core::reminder::format_times(&cfg.reminders.default_times),
        "configuration loaded"
    );

    // Replies, broadcasts and reminders share one gate so they never race
    // each other into Telegram's flood limits, and a 429 pauses all of them.
    let gate = FloodGate::new(cfg.throttle);
    let raw: Arc<dyn TransportPort> = Arc::new(TelegramTransport::new(bot.clone()));
    let transport: Arc<dyn TransportPort> = Arc::new(ThrottledTransport::new(raw, gate.clone()));

    let relay = Relay::new(
        RelayConfig::from(cfg.as_ref()),
        llm,
        transport.clone(),
        persistence,
        gate,
    );
    let reminders = ReminderLoop::spawn(relay.clone());

    let state = Arc::new(AppState {
        cfg,
        me,
        relay,
        transport,
    });

    let handler =
        dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    if let Some(reminders) = reminders {
        reminders.shutdown().await;
    }
    Ok(())
}
