use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;

use qbot_core::{
    accounts::AccountStore,
    assistant::TransportAssistant,
    audit::SubmissionLog,
    cache::{AnswerCache, JsonFileStore},
    config::{self, AssistantBackend, Config},
    domain::{Account, AccountId},
    ports::{Assistant, ChatTransport, SessionConnector},
    resolver::AnswerResolver,
    supervisor::Supervisor,
};
use qbot_openai::OpenAiAssistant;
use qbot_telegram::TelegramConnector;

#[derive(Parser)]
#[command(name = "qbot")]
#[command(about = "Watches quiz chats and answers them from every registered account", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start monitoring with every registered account (Ctrl-C stops)
    Run,

    /// Inspect the answer cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Manage registered accounts
    Accounts {
        #[command(subcommand)]
        command: AccountCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cached answers, most recently used first
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum AccountCommands {
    /// List registered accounts
    List,

    /// Register an account
    Add {
        name: String,

        /// Environment variable holding the bot token
        #[arg(long)]
        credential_ref: String,

        #[arg(long)]
        session_ref: Option<String>,
    },

    /// Remove an account
    Remove {
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    qbot_core::logging::init("qbot")?;

    match cli.command {
        Commands::Run => run().await,
        Commands::Cache {
            command: CacheCommands::List { json },
        } => list_cache(json).await,
        Commands::Accounts { command } => manage_accounts(command),
    }
}

async fn run() -> Result<()> {
    let cfg = Config::load().context("loading configuration")?;
    let store = AccountStore::load(&cfg.accounts_file).context("loading accounts")?;
    let accounts = store.list().to_vec();
    if accounts.is_empty() {
        bail!(
            "no accounts registered in {}; add one with `qbot accounts add`",
            store.path().display()
        );
    }

    let connector = Arc::new(SharedSessions::new(TelegramConnector::new()));
    let assistant = build_assistant(&cfg, &accounts, connector.as_ref()).await?;
    let cache = Arc::new(AnswerCache::open(Box::new(JsonFileStore::new(&cfg.cache_file))));
    let resolver = Arc::new(AnswerResolver::new(cache, assistant, cfg.resolver_settings()));
    let submissions = Arc::new(SubmissionLog::new(&cfg.submissions_log));

    let mut supervisor = Supervisor::new(
        connector,
        resolver,
        submissions,
        cfg.monitor_settings(),
        cfg.supervisor_settings(),
    );
    supervisor.start(&accounts);

    let mut report = tokio::time::interval(Duration::from_secs(60));
    report.tick().await;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("waiting for ctrl-c")?;
                tracing::info!("interrupt received");
                break;
            }
            _ = report.tick() => {
                for s in supervisor.statuses() {
                    tracing::info!(
                        account = %s.account,
                        connection = ?s.connection,
                        state = %s.monitor,
                        restarts = s.restarts,
                        "account status"
                    );
                }
                if supervisor.is_idle() {
                    tracing::warn!("every monitor has exited");
                    break;
                }
            }
        }
    }

    supervisor.stop().await.context("stopping monitors")?;
    Ok(())
}

async fn build_assistant(
    cfg: &Config,
    accounts: &[Account],
    connector: &dyn SessionConnector,
) -> Result<Arc<dyn Assistant>> {
    match &cfg.assistant {
        AssistantBackend::OpenAi {
            api_key,
            model,
            base_url,
        } => {
            let client = OpenAiAssistant::new(api_key, model, base_url, cfg.reply_timeout)?;
            tracing::info!(model = client.model(), "using openai assistant");
            Ok(Arc::new(client))
        }
        AssistantBackend::Transport {
            chat,
            assistant_id,
            account,
        } => {
            let owner = match account {
                Some(name) => accounts
                    .iter()
                    .find(|a| &a.name.0 == name)
                    .with_context(|| format!("assistant account '{name}' is not registered"))?,
                None => accounts.first().context("no accounts registered")?,
            };
            let transport = connector
                .connect(owner)
                .await
                .with_context(|| format!("connecting assistant account '{}'", owner.name))?;
            tracing::info!(account = %owner.name, chat = chat.0, "using chat assistant");

            let mut assistant = TransportAssistant::new(transport, *chat);
            if let Some(id) = assistant_id {
                assistant = assistant.with_assistant_id(*id);
            }
            Ok(Arc::new(assistant))
        }
    }
}

async fn list_cache(json: bool) -> Result<()> {
    let dir = config::data_dir()?;
    let cache = AnswerCache::open(Box::new(JsonFileStore::new(dir.join(config::CACHE_FILE))));
    let entries = cache.entries().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("answer cache is empty");
        return Ok(());
    }
    println!("{:<12}  {:<6}  {:>5}  {:<20}  QUESTION", "FINGERPRINT", "LETTER", "HITS", "LAST USED");
    for e in entries {
        let question = e
            .question
            .as_deref()
            .map(|q| qbot_core::audit::truncate_text(q, 60))
            .unwrap_or_default();
        println!(
            "{:<12}  {:<6}  {:>5}  {:<20}  {}",
            e.fingerprint.short(),
            e.letter.to_string(),
            e.hit_count,
            e.last_used_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            question
        );
    }
    Ok(())
}

fn manage_accounts(command: AccountCommands) -> Result<()> {
    let dir = config::data_dir()?;
    let mut store = AccountStore::load(dir.join(config::ACCOUNTS_FILE))?;

    match command {
        AccountCommands::List => {
            if store.list().is_empty() {
                println!("no accounts registered");
            }
            for a in store.list() {
                match &a.session_ref {
                    Some(session) => println!("{}  ({}, session {session})", a.name, a.credential_ref),
                    None => println!("{}  ({})", a.name, a.credential_ref),
                }
            }
        }
        AccountCommands::Add {
            name,
            credential_ref,
            session_ref,
        } => {
            store.add(Account {
                name: AccountId(name.clone()),
                credential_ref,
                session_ref,
            })?;
            println!("added account {name}");
        }
        AccountCommands::Remove { name } => {
            if store.remove(&AccountId(name.clone()))? {
                println!("removed account {name}");
            } else {
                bail!("no account named {name}");
            }
        }
    }
    Ok(())
}

/// Hands out one transport per account, so the assistant reader and that
/// account's monitor share a single update stream.
struct SharedSessions<C> {
    inner: C,
    sessions: Mutex<HashMap<AccountId, Arc<dyn ChatTransport>>>,
}

impl<C> SharedSessions<C> {
    fn new(inner: C) -> Self {
        Self {
            inner,
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<C: SessionConnector> SessionConnector for SharedSessions<C> {
    async fn connect(&self, account: &Account) -> qbot_core::Result<Arc<dyn ChatTransport>> {
        if let Some(t) = self.sessions.lock().await.get(&account.name) {
            return Ok(t.clone());
        }
        let transport = self.inner.connect(account).await?;
        let mut sessions = self.sessions.lock().await;
        Ok(sessions
            .entry(account.name.clone())
            .or_insert(transport)
            .clone())
    }
}
