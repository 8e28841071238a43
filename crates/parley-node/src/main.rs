//! parley — the marketplace CLI.
//!
//! One binary wiring the library crates together:
//!   parley docstore {create,add,search,ls}
//!   parley expert   {run,ls}
//!   parley wallet   {balance,pay,invoice}
//!   parley stream   {send,receive}
//!   parley chat     --question <q> --hashtags <t,...>
//!   parley http | scheduler | worker
//!   parley env show

use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use parley_client::{AskClient, AskExpertOptions, AskParams, ClientConfig, SessionOutcome};
use parley_core::payload::StreamMetadata;
use parley_crypto::Keys;
use parley_docstore::{DocStore, Document};
use parley_expert::{Embedder, ExpertConfig, ExpertServer, MarginPricing, RagContext};
use parley_http::{AdminDb, AllowAll, HttpServer};
use parley_payments::{PaymentClient, Wallet};
use parley_rag::{sync, QueryOptions, RagStore, SyncConfig};
use parley_relay::RelayPool;
use parley_scheduler::{Scheduler, SchedulerConfig, Worker, WorkerConfig};
use parley_stream::{ReaderLimits, StreamReader, StreamWriter, WriterConfig};

mod config;
mod import;
mod llm;
mod runner;
mod wallet;

use config::Config;
use llm::{OpenAiEmbedder, OpenAiEngine};
use runner::ExpertJobRunner;
use wallet::RelayWallet;

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Parley — ask experts, pay per answer")]
struct Args {
    /// Verbose debug logging.
    #[arg(short = 'd', long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage local docstores.
    Docstore {
        #[command(subcommand)]
        action: DocstoreCmd,
    },
    /// Run or list experts.
    Expert {
        #[command(subcommand)]
        action: ExpertCmd,
    },
    /// Operations on the connected wallet service.
    Wallet {
        #[command(subcommand)]
        action: WalletCmd,
    },
    /// Raw chunked-stream tooling.
    Stream {
        #[command(subcommand)]
        action: StreamCmd,
    },
    /// Ask a question on the marketplace and print the first answer.
    Chat {
        /// The question to send to the chosen expert.
        #[arg(long)]
        question: String,
        /// Hashtags the ask is discoverable under.
        #[arg(long, value_delimiter = ',')]
        hashtags: Vec<String>,
        /// Public one-line summary; defaults to the question itself.
        #[arg(long)]
        summary: Option<String>,
        /// Only talk to this expert pubkey if it bids.
        #[arg(long)]
        expert: Option<String>,
        /// Spending cap in sats.
        #[arg(long, default_value_t = 100)]
        max_amount: u64,
    },
    /// Serve the admin HTTP surface.
    Http,
    /// Run the central scheduler for remote workers.
    Scheduler {
        #[arg(long, default_value = "127.0.0.1:8481")]
        listen: String,
    },
    /// Run a worker executing dispatched experts.
    Worker {
        /// Scheduler URL (ws://host:port).
        #[arg(long)]
        url: String,
    },
    /// Local admin users.
    User {
        #[command(subcommand)]
        action: UserCmd,
    },
    /// Environment inspection.
    Env {
        #[command(subcommand)]
        action: EnvCmd,
    },
}

#[derive(Subcommand, Debug)]
enum DocstoreCmd {
    /// Create a docstore (idempotent on name).
    Create {
        name: String,
        #[arg(long, default_value = "text-embedding-3-small")]
        model: String,
        #[arg(long, default_value_t = 1536)]
        vector_size: usize,
    },
    /// List docstores.
    Ls,
    /// Add a document (embedded via the configured embedding backend).
    Add {
        docstore: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        data: String,
        #[arg(long, default_value = "note")]
        doc_type: String,
    },
    /// Similarity search over a docstore.
    Search {
        docstore: String,
        query: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Bulk import into a docstore.
    Import {
        #[command(subcommand)]
        source: ImportCmd,
    },
}

#[derive(Subcommand, Debug)]
enum ImportCmd {
    /// Import one markdown file, split on headings.
    Markdown {
        docstore: String,
        path: std::path::PathBuf,
    },
    /// Import every text file directly under a directory.
    Dir {
        docstore: String,
        path: std::path::PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ExpertCmd {
    /// Run an expert on the discovery relays.
    Run {
        #[arg(long, default_value = "expert")]
        nickname: String,
        #[arg(long, value_delimiter = ',')]
        hashtags: Vec<String>,
        #[arg(long, default_value = "openai/gpt-4o-mini")]
        model: String,
        /// Flat quote price in sats.
        #[arg(long, default_value_t = 10)]
        price: u64,
        /// Docstore to build RAG context from.
        #[arg(long)]
        docstore: Option<String>,
    },
    /// List locally registered experts.
    Ls,
}

#[derive(Subcommand, Debug)]
enum UserCmd {
    /// Register a user pubkey in the admin database.
    Add { pubkey: String },
    /// Print the local identity.
    Whoami,
}

#[derive(Subcommand, Debug)]
enum WalletCmd {
    /// Register a wallet connection string in the admin database.
    Add {
        name: String,
        nwc: String,
        #[arg(long)]
        default: bool,
    },
    /// List registered wallets.
    List,
    /// Print the spendable balance in sats.
    Balance,
    /// Pay a BOLT11 invoice.
    Pay { bolt11: String },
    /// Create an invoice.
    Invoice {
        amount_sats: u64,
        #[arg(long, default_value = "parley")]
        description: String,
    },
}

#[derive(Subcommand, Debug)]
enum StreamCmd {
    /// Read stdin, send it as a stream, print the metadata JSON.
    Send,
    /// Receive a stream described by metadata JSON (arg or stdin) to stdout.
    Receive {
        #[arg(long)]
        meta: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum EnvCmd {
    /// Print the resolved configuration.
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info,parley=debug" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.parse().expect("static filter parses")),
        )
        .init();

    dotenvy::dotenv().ok();
    let mut config = Config::from_env();
    std::fs::create_dir_all(&config.app_dir)
        .with_context(|| format!("creating app dir {}", config.app_dir.display()))?;
    // Secrets may live in the application directory; re-read if present.
    if dotenvy::from_path(config.app_dir.join(".env")).is_ok() {
        config = Config::from_env();
    }

    match args.command {
        Command::Docstore { action } => docstore_cmd(&config, action).await,
        Command::Expert { action } => expert_cmd(&config, action).await,
        Command::Wallet { action } => wallet_cmd(&config, action).await,
        Command::Stream { action } => stream_cmd(&config, action).await,
        Command::Chat { question, hashtags, summary, expert, max_amount } => {
            chat_cmd(&config, question, hashtags, summary, expert, max_amount).await
        }
        Command::User { action } => user_cmd(&config, action),
        Command::Http => http_cmd(&config).await,
        Command::Scheduler { listen } => scheduler_cmd(&config, &listen).await,
        Command::Worker { url } => worker_cmd(&config, &url).await,
        Command::Env { action: EnvCmd::Show } => {
            println!("{config:#?}");
            Ok(())
        }
    }
}

// ── Shared wiring ─────────────────────────────────────────────────────────────

fn require_relays(config: &Config) -> anyhow::Result<Vec<String>> {
    if config.discovery_relays.is_empty() {
        bail!("DISCOVERY_RELAYS is not set");
    }
    Ok(config.discovery_relays.clone())
}

fn connect_wallet(config: &Config, pool: Arc<RelayPool>) -> anyhow::Result<Arc<RelayWallet>> {
    let nwc = config.nwc_string.as_deref().context("NWC_STRING is not set")?;
    Ok(Arc::new(RelayWallet::from_connection_string(pool, nwc)?))
}

fn embedder(config: &Config) -> anyhow::Result<Arc<OpenAiEmbedder>> {
    let key = config
        .openai_api_key
        .as_deref()
        .or(config.openrouter_api_key.as_deref())
        .context("OPENAI_API_KEY or OPENROUTER_API_KEY is not set")?;
    Ok(Arc::new(OpenAiEmbedder::new(
        &config.openai_base_url,
        key,
        "text-embedding-3-small",
    )))
}

fn load_or_generate_keys(path: &Path) -> anyhow::Result<Keys> {
    if path.exists() {
        let hex = std::fs::read_to_string(path)?;
        Ok(Keys::from_secret_hex(hex.trim())?)
    } else {
        let keys = Keys::generate();
        std::fs::write(path, keys.secret_hex())
            .with_context(|| format!("writing keyfile {}", path.display()))?;
        info!(pubkey = %keys.public(), "generated new identity");
        Ok(keys)
    }
}

/// Mirror a docstore into the local RAG store and wait for the snapshot.
async fn sync_docstore(
    store: &DocStore,
    rag: &RagStore,
    docstore_id: &str,
    collection: &str,
) -> anyhow::Result<()> {
    let (eof_tx, eof_rx) = tokio::sync::oneshot::channel();
    let mut sync_config = SyncConfig::new(docstore_id, collection);
    sync_config.retry_interval = Duration::from_millis(200);
    let controller = sync(
        store,
        rag.clone(),
        sync_config,
        None,
        Some(Box::new(move || {
            let _ = eof_tx.send(());
        })),
    );
    eof_rx.await.ok();
    controller.stop();
    Ok(())
}

// ── Command handlers ──────────────────────────────────────────────────────────

async fn docstore_cmd(config: &Config, action: DocstoreCmd) -> anyhow::Result<()> {
    let store = DocStore::open(config.docstore_path())?;
    match action {
        DocstoreCmd::Create { name, model, vector_size } => {
            let id = store.create_docstore(&name, &model, vector_size, "")?;
            println!("{id}");
        }
        DocstoreCmd::Ls => {
            for ds in store.list_docstores()? {
                let count = store.count(&ds.id)?;
                let created = chrono::DateTime::from_timestamp(ds.timestamp, 0)
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!(
                    "{}  {}  model={} dims={} docs={} created={created}",
                    ds.id, ds.name, ds.model, ds.vector_size, count
                );
            }
        }
        DocstoreCmd::Add { docstore, id, data, doc_type } => {
            let ds = store
                .get_docstore_by_name(&docstore)?
                .with_context(|| format!("no docstore named {docstore}"))?;
            let embeddings = embedder(config)?.embed(&[data.clone()]).await?;
            let now = parley_core::types::now_unix();
            store.upsert(&Document {
                id,
                docstore_id: ds.id,
                timestamp: now,
                created_at: now,
                doc_type,
                data,
                embeddings,
                include: None,
            })?;
        }
        DocstoreCmd::Search { docstore, query, limit } => {
            let ds = store
                .get_docstore_by_name(&docstore)?
                .with_context(|| format!("no docstore named {docstore}"))?;
            let rag = RagStore::open(config.rag_path())?;
            sync_docstore(&store, &rag, &ds.id, &ds.name).await?;

            let vector = embedder(config)?
                .embed(&[query])
                .await?
                .pop()
                .context("embedder returned nothing")?;
            for hit in rag.search(&ds.name, &vector, limit, &QueryOptions::default())? {
                println!("{:.4}  {}  {}", hit.distance, hit.entry.id, hit.entry.data);
            }
        }
        DocstoreCmd::Import { source } => {
            let (name, count) = match source {
                ImportCmd::Markdown { docstore, path } => {
                    let ds = store
                        .get_docstore_by_name(&docstore)?
                        .with_context(|| format!("no docstore named {docstore}"))?;
                    let n =
                        import::import_markdown(&store, &ds, embedder(config)?.as_ref(), &path)
                            .await?;
                    (docstore, n)
                }
                ImportCmd::Dir { docstore, path } => {
                    let ds = store
                        .get_docstore_by_name(&docstore)?
                        .with_context(|| format!("no docstore named {docstore}"))?;
                    let n = import::import_dir(&store, &ds, embedder(config)?.as_ref(), &path)
                        .await?;
                    (docstore, n)
                }
            };
            println!("imported {count} chunks into {name}");
        }
    }
    Ok(())
}

fn user_cmd(config: &Config, action: UserCmd) -> anyhow::Result<()> {
    match action {
        UserCmd::Add { pubkey } => {
            let db = AdminDb::open(config.admin_db_path())?;
            let user = db.ensure_user(&pubkey)?;
            println!("user {} ({})", user.id, user.pubkey);
        }
        UserCmd::Whoami => {
            let keys = load_or_generate_keys(&config.keyfile_path())?;
            println!("{}", keys.public());
        }
    }
    Ok(())
}

async fn expert_cmd(config: &Config, action: ExpertCmd) -> anyhow::Result<()> {
    match action {
        ExpertCmd::Run { nickname, hashtags, model, price, docstore } => {
            let relays = require_relays(config)?;
            let pool = Arc::new(RelayPool::new());
            let keys = load_or_generate_keys(&config.keyfile_path())?;
            let wallet = connect_wallet(config, pool.clone())?;

            let llm_key = config
                .openrouter_api_key
                .as_deref()
                .or(config.openai_api_key.as_deref())
                .context("OPENROUTER_API_KEY or OPENAI_API_KEY is not set")?;
            let engine = Arc::new(OpenAiEngine::new(&config.openai_base_url, llm_key, &model));

            let rag_context = match docstore {
                Some(name) => {
                    let store = DocStore::open(config.docstore_path())?;
                    let ds = store
                        .get_docstore_by_name(&name)?
                        .with_context(|| format!("no docstore named {name}"))?;
                    let rag = RagStore::open(config.rag_path())?;
                    sync_docstore(&store, &rag, &ds.id, &ds.name).await?;
                    Some(RagContext::new(rag, &ds.name, embedder(config)?))
                }
                None => None,
            };

            let expert_config = ExpertConfig::new(&nickname, hashtags, relays);
            let server = ExpertServer::new(
                keys,
                pool,
                wallet,
                engine,
                Arc::new(MarginPricing::flat(price)),
                rag_context,
                expert_config,
            );
            info!(pubkey = %server.pubkey(), "expert starting; ctrl-c to stop");
            tokio::select! {
                result = server.run() => result?,
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        ExpertCmd::Ls => {
            let db = AdminDb::open(config.admin_db_path())?;
            let user = db.ensure_user("local")?;
            for expert in db.list_experts(user.id)? {
                println!(
                    "{}  {}  type={} disabled={}",
                    expert.pubkey, expert.nickname, expert.expert_type, expert.disabled
                );
            }
        }
    }
    Ok(())
}

async fn wallet_cmd(config: &Config, action: WalletCmd) -> anyhow::Result<()> {
    // Admin-db operations need no relay connection.
    match &action {
        WalletCmd::Add { name, nwc, default } => {
            let db = AdminDb::open(config.admin_db_path())?;
            let user = db.ensure_user("local")?;
            let wallet = db.add_wallet(user.id, name, nwc, *default)?;
            println!("wallet {} ({})", wallet.id, wallet.name);
            return Ok(());
        }
        WalletCmd::List => {
            let db = AdminDb::open(config.admin_db_path())?;
            let user = db.ensure_user("local")?;
            for wallet in db.list_wallets(user.id, None)? {
                let marker = if wallet.is_default { "*" } else { " " };
                println!("{marker} {}  {}", wallet.id, wallet.name);
            }
            return Ok(());
        }
        _ => {}
    }

    let pool = Arc::new(RelayPool::new());
    let wallet = connect_wallet(config, pool)?;
    match action {
        WalletCmd::Add { .. } | WalletCmd::List => unreachable!("handled above"),
        WalletCmd::Balance => println!("{} sats", wallet.balance().await?),
        WalletCmd::Pay { bolt11 } => {
            let parsed = parley_payments::parse_invoice(&bolt11)?;
            let preimage = wallet.pay_invoice(&bolt11).await?;
            println!("paid {} sats, preimage {preimage}", parsed.amount_sats);
        }
        WalletCmd::Invoice { amount_sats, description } => {
            println!("{}", wallet.make_invoice(amount_sats, &description).await?);
        }
    }
    Ok(())
}

async fn stream_cmd(config: &Config, action: StreamCmd) -> anyhow::Result<()> {
    let relays = require_relays(config)?;
    let pool = Arc::new(RelayPool::new());
    match action {
        StreamCmd::Send => {
            let mut data = Vec::new();
            std::io::stdin().read_to_end(&mut data)?;
            let (mut writer, meta) = StreamWriter::new(pool, WriterConfig::new(relays));
            println!("{}", serde_json::to_string(&meta)?);
            writer.write(&data, true).await?;
        }
        StreamCmd::Receive { meta } => {
            let raw = match meta {
                Some(raw) => raw,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let meta: StreamMetadata = serde_json::from_str(raw.trim())?;
            let mut reader = StreamReader::open(&pool, &meta, ReaderLimits::default()).await?;
            let bytes = reader.read_to_end().await?;
            use std::io::Write;
            std::io::stdout().write_all(&bytes)?;
        }
    }
    Ok(())
}

async fn chat_cmd(
    config: &Config,
    question: String,
    hashtags: Vec<String>,
    summary: Option<String>,
    expert: Option<String>,
    max_amount: u64,
) -> anyhow::Result<()> {
    let relays = require_relays(config)?;
    let pool = Arc::new(RelayPool::new());
    let wallet = connect_wallet(config, pool.clone())?;
    let payments = Arc::new(PaymentClient::new(wallet));

    let client = AskClient::new(pool, payments, ClientConfig::new(relays));
    let summary = summary.unwrap_or_else(|| question.clone());
    let bids = client.find_experts(&AskParams::new(&summary, hashtags)).await?;
    if bids.is_empty() {
        bail!("no bids arrived before the discovery deadline");
    }

    let bid = match expert {
        Some(pubkey) => bids
            .iter()
            .find(|b| b.expert_pubkey.to_hex() == pubkey)
            .with_context(|| format!("expert {pubkey} did not bid"))?,
        None => &bids[0],
    };
    info!(expert = %bid.expert_pubkey, offer = %bid.offer, "expert selected");

    let outcome = client
        .ask_expert(&bid.bid_id, &AskExpertOptions::new(&question, max_amount))
        .await?;
    match outcome {
        SessionOutcome::Answered(reply) => {
            println!("{}", reply.content);
            info!(amount_sats = reply.amount_sats, "answer paid for");
        }
        SessionOutcome::Declined { reason } => {
            bail!("expert declined: {}", reason.unwrap_or_else(|| "no reason".into()));
        }
    }
    Ok(())
}

async fn http_cmd(config: &Config) -> anyhow::Result<()> {
    let db = AdminDb::open(config.admin_db_path())?;
    let server = HttpServer::bind(
        &format!("0.0.0.0:{}", config.port),
        db,
        Arc::new(AllowAll),
    )
    .await?;
    info!(addr = %server.addr(), "admin http running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    server.stop();
    Ok(())
}

async fn scheduler_cmd(config: &Config, listen: &str) -> anyhow::Result<()> {
    let relays = require_relays(config)?;
    let pool = Arc::new(RelayPool::new());
    let scheduler = Scheduler::bind(listen, pool, SchedulerConfig::new(relays)).await?;
    info!(url = %scheduler.url(), "scheduler running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    scheduler.shutdown();
    Ok(())
}

async fn worker_cmd(config: &Config, url: &str) -> anyhow::Result<()> {
    let pool = Arc::new(RelayPool::new());
    let llm_key = config
        .openrouter_api_key
        .clone()
        .or_else(|| config.openai_api_key.clone())
        .unwrap_or_default();

    let runner = Arc::new(ExpertJobRunner {
        pool,
        discovery_relays: config.discovery_relays.clone(),
        llm_base_url: config.openai_base_url.clone(),
        llm_api_key: llm_key,
    });
    let worker = Worker::new(WorkerConfig::new(url), runner);
    let stopper = worker.stopper();

    tokio::select! {
        _ = worker.run() => {}
        _ = tokio::signal::ctrl_c() => {
            let _ = stopper.send(true);
        }
    }
    Ok(())
}
