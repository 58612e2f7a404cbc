use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::FixedOffset;

use crate::{
    broadcast::BroadcastConfig,
    buffer::BufferConfig,
    errors::Error,
    messaging::throttled::ThrottleConfig,
    reminder::{parse_times, ReminderConfig},
    store::HistoryConfig,
    Result,
};

const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";
const DEFAULT_LLM_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Default system prompt. `{CURRENTDATE}` is substituted per request.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly and helpful assistant chatting with the user in Telegram. \
Answer concisely, in the language the user writes in. Today is {CURRENTDATE}.";

/// Typed configuration for the relay.
#[derive(Clone, Debug)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub llm: LlmConfig,
    pub history: HistoryConfig,
    pub buffer: BufferConfig,
    pub broadcast: BroadcastConfig,
    pub throttle: ThrottleConfig,
    pub reminders: ReminderConfig,

    /// Optional JSON snapshot of the in-memory store.
    pub store_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Users allowed to run admin commands (broadcast).
    pub admin_users: Vec<i64>,
    /// Chat that receives broadcast summaries, if any.
    pub admin_chat: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    /// Attempts on HTTP 429 before giving up.
    pub max_retries: u32,
    pub system_prompt: String,
}

impl Config {
    /// Load from the process environment (a `.env` file is read first and
    /// never overrides variables that are already set).
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let str_of = |key: &str| lookup(key).and_then(non_empty);
        let u64_of = |key: &str| str_of(key).and_then(|s| s.trim().parse::<u64>().ok());
        let usize_of = |key: &str| str_of(key).and_then(|s| s.trim().parse::<usize>().ok());
        let ms_of = |key: &str, default: u64| Duration::from_millis(u64_of(key).unwrap_or(default));

        // Required env vars
        let bot_token = str_of("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let admin_users = parse_csv_i64(str_of("ADMIN_USERS"));
        if admin_users.is_empty() {
            return Err(Error::Config(
                "ADMIN_USERS environment variable is required".to_string(),
            ));
        }

        let Some(api_key) = str_of("LLM_TOKEN") else {
            return Err(Error::Config(
                "LLM_TOKEN environment variable is required".to_string(),
            ));
        };

        let admin_chat = str_of("ADMIN_CHAT")
            .and_then(|s| s.trim().parse::<i64>().ok())
            .filter(|id| *id != 0);

        let llm = LlmConfig {
            api_key,
            model: str_of("MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: str_of("LLM_BASE_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string()),
            timeout: ms_of("LLM_TIMEOUT_MS", 60_000),
            max_retries: u64_of("LLM_RETRIES").unwrap_or(5).clamp(1, 20) as u32,
            system_prompt: str_of("SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        };

        let history = HistoryConfig {
            max_context: usize_of("MAX_CONTEXT").unwrap_or(10),
            max_storage: usize_of("MAX_STORAGE").unwrap_or(100).max(1),
        };

        let buffer = BufferConfig {
            debounce: ms_of("BUFFER_DEBOUNCE_MS", 3_000),
            grace: ms_of("BUFFER_GRACE_MS", 30_000),
        };

        let broadcast = BroadcastConfig {
            max_in_flight: usize_of("BROADCAST_CONCURRENCY").unwrap_or(8).max(1),
            transient_retries: u64_of("BROADCAST_TRANSIENT_RETRIES").unwrap_or(3) as u32,
            backoff_base: ms_of("BROADCAST_BACKOFF_MS", 500),
            max_rate_limit_waits: u64_of("BROADCAST_MAX_RATE_LIMIT_WAITS").unwrap_or(20) as u32,
        };

        let throttle = ThrottleConfig {
            default_pause: ms_of("BROADCAST_DEFAULT_RETRY_AFTER_MS", 1_000),
            ..ThrottleConfig::default()
        };

        let reminder_defaults = ReminderConfig::default();
        let utc_offset = match str_of("TIMEZONE_OFFSET") {
            Some(raw) => parse_utc_offset(&raw)?,
            None => reminder_defaults.utc_offset,
        };
        let reminders = ReminderConfig {
            default_times: match str_of("REMINDER_TIMES") {
                Some(raw) => parse_times(&raw)?,
                None => reminder_defaults.default_times,
            },
            utc_offset,
            check_interval: u64_of("REMINDER_CHECK_INTERVAL")
                .map(Duration::from_secs)
                .unwrap_or(reminder_defaults.check_interval),
            prompt: str_of("REMINDER_PROMPT").unwrap_or(reminder_defaults.prompt),
        };

        Ok(Self {
            telegram: TelegramConfig {
                bot_token,
                admin_users,
                admin_chat,
            },
            llm,
            history,
            buffer,
            broadcast,
            throttle,
            reminders,
            store_path: str_of("STORE_PATH").map(PathBuf::from),
        })
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim().trim_start_matches("export ").trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

/// Whole hours east of UTC, e.g. `3` or `-5`.
fn parse_utc_offset(raw: &str) -> Result<FixedOffset> {
    raw.trim()
        .parse::<i32>()
        .ok()
        .and_then(|hours| FixedOffset::east_opt(hours * 3600))
        .ok_or_else(|| Error::Config(format!("TIMEZONE_OFFSET must be whole hours, got {raw:?}")))
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
