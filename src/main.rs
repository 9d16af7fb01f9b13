use apk_courier::acquire::{Acquirer, HttpSource, ToolSource};
use apk_courier::broker::{Broker, BrokerOptions, Services};
use apk_courier::catalog::HttpCatalog;
use apk_courier::config::Settings;
use apk_courier::gateway::HttpAssetFetcher;
use apk_courier::storage::{MemoryStore, PgStore, Store};
use apk_courier::telegram::{self, TelegramGateway};
use dotenvy::dotenv;
use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use teloxide::Bot;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "apk_courier=info,hyper=warn,reqwest=warn,sqlx=warn,teloxide=warn";
const ASSET_CACHE_CAPACITY: u64 = 1_000;

/// Regex patterns for redacting secrets from log output
struct RedactionPatterns {
    token_url: Regex,
    token_bare: Regex,
    database_credentials: Regex,
}

impl RedactionPatterns {
    /// Initialize all regex patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            token_url: Regex::new(r"(https?://[^/]+/bot)([0-9]+:[A-Za-z0-9_-]+)")?,
            token_bare: Regex::new(r"[0-9]{8,10}:[A-Za-z0-9_-]{35}")?,
            database_credentials: Regex::new(r"(postgres(?:ql)?://)[^:/@\s]+:[^@\s]+@")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let output = self.token_url.replace_all(input, "$1[TELEGRAM_TOKEN]");
        let output = self.token_bare.replace_all(&output, "[TELEGRAM_TOKEN]");
        self.database_credentials
            .replace_all(&output, "$1[MASKED]@")
            .into_owned()
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let redacted = self.patterns.redact(&String::from_utf8_lossy(buf));
        self.inner.write_all(redacted.as_bytes())?;
        // Report the original length, the caller only cares that everything was consumed
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: (self.make_inner)(),
            patterns: self.patterns.clone(),
        }
    }
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter {
        make_inner: io::stderr,
        patterns,
    };
    let debug_mode = std::env::var("DEBUG_MODE")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false);
    let filter = if debug_mode {
        EnvFilter::new("apk_courier=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

fn init_settings() -> Settings {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            s
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

async fn init_store(settings: &Settings) -> Arc<dyn Store> {
    let Some(url) = settings.database_url.as_deref() else {
        warn!("DATABASE_URL not set, using in-memory store (abuse records are lost on restart)");
        return Arc::new(MemoryStore::new());
    };

    match PgStore::connect(url).await {
        Ok(store) => {
            if store.check_connection().await.is_err() {
                error!("Postgres connection check returned error.");
            }
            Arc::new(store)
        }
        Err(e) => {
            error!("Failed to initialize Postgres store: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_acquirer(settings: &Settings) -> Acquirer {
    info!(
        api_url = %settings.api_url,
        tool = %settings.fallback_tool,
        "Initializing acquirer"
    );
    Acquirer::new(
        Arc::new(HttpSource::new(&settings.api_url)),
        Arc::new(ToolSource::new(
            settings.fallback_tool.clone(),
            settings.fallback_args(),
        )),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize redaction patterns early (before logging)
    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile regex patterns: {e}");
        e
    })?);
    init_logging(patterns);

    info!("Starting apk-courier...");

    let settings = init_settings();
    let store = init_store(&settings).await;
    let bot = Bot::new(settings.telegram_token.clone());

    let services = Services {
        gateway: Arc::new(TelegramGateway::new(bot.clone())),
        assets: Arc::new(HttpAssetFetcher::new(ASSET_CACHE_CAPACITY)),
        catalog: Arc::new(HttpCatalog::new(&settings.catalog_url)),
        acquirer: init_acquirer(&settings),
        store,
    };
    let options = BrokerOptions::from_settings(&settings);
    if options.groups_only {
        info!("Groups-only mode: direct chats are rejected");
    }

    let broker = Arc::new(Broker::new(services, options));
    telegram::run(bot, broker).await;

    Ok(())
}
