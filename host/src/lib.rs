//! Coordinator host: the HTTP control surface in front of the task
//! manager, worker registry and store gateway.

pub mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use factorkeeper_lib::config::{TASK_CHECK_CYCLE_SECS, WORKER_ACK_TIMEOUT_SECS};
use factorkeeper_metadb::MetaDb;
use factorkeeper_scheduler::handlers::{FactorUpdateHandler, TickUpdateHandler};
use factorkeeper_scheduler::{HttpCommandTransport, TaskManager, WorkerRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder, Rotation};
use tracing_subscriber::EnvFilter;

fn default_address() -> String {
    "0.0.0.0:8910".to_string()
}

fn default_database_url() -> String {
    "postgres://factorkeeper@localhost/factorkeeper".to_string()
}

fn default_max_log() -> usize {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_db_pool_size() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(name = "factorkeeper-host", about = "The factorkeeper coordinator node", long_about = None)]
#[serde(default)]
pub struct Cli {
    #[arg(long, require_equals = true, default_value = "0.0.0.0:8910")]
    #[serde(default = "default_address")]
    /// Server bind address
    pub address: String,

    #[arg(
        long,
        require_equals = true,
        env = "FACTORKEEPER_DATABASE_URL",
        default_value = "postgres://factorkeeper@localhost/factorkeeper"
    )]
    #[serde(default = "default_database_url")]
    /// Postgres connection string shared with the executors
    pub database_url: String,

    #[arg(long, require_equals = true, default_value = "5")]
    #[serde(default = "default_db_pool_size")]
    pub db_pool_size: u32,

    #[arg(long, require_equals = true)]
    /// Log directory; stdout when unset
    pub log_path: Option<PathBuf>,

    #[arg(long, require_equals = true, default_value = "7")]
    #[serde(default = "default_max_log")]
    pub max_log: usize,

    #[arg(long, require_equals = true, env = "RUST_LOG", default_value = "info")]
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[arg(long, require_equals = true)]
    /// Optional JSON config file; command line arguments take precedence
    pub config_path: Option<PathBuf>,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            address: default_address(),
            database_url: default_database_url(),
            db_pool_size: default_db_pool_size(),
            log_path: None,
            max_log: default_max_log(),
            log_level: default_log_level(),
            config_path: None,
        }
    }
}

impl Cli {
    /// Merge the config file under the command line arguments.
    pub fn merge_from_file(&mut self) -> anyhow::Result<()> {
        let Some(path) = &self.config_path else {
            return Ok(());
        };
        let file = std::fs::File::open(path)
            .with_context(|| format!("open config {}", path.display()))?;
        let mut config: Value = serde_json::from_reader(std::io::BufReader::new(file))?;
        let this = serde_json::to_value(&self)?;
        merge(&mut config, &this);
        *self = serde_json::from_value(config)?;
        Ok(())
    }
}

/// Merge two json objects, overwriting `a` with the non-null values of `b`.
fn merge(a: &mut Value, b: &Value) {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, value) in b {
                merge(a.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (a, b) if !b.is_null() => *a = b.clone(),
        _ => {}
    }
}

/// Everything the route handlers need.
#[derive(Clone)]
pub struct AppState {
    pub opts: Arc<Cli>,
    pub store: MetaDb,
    pub registry: Arc<WorkerRegistry>,
    pub manager: TaskManager,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let mut opts = Cli::parse();
        opts.merge_from_file()?;
        Self::init_with(opts).await
    }

    pub async fn init_with(opts: Cli) -> anyhow::Result<Self> {
        info!("starting coordinator node...");

        let store = MetaDb::connect(&opts.database_url, opts.db_pool_size)
            .await
            .context("could not connect to the store")?;
        store.bootstrap().await.context("schema bootstrap failed")?;

        let registry = Arc::new(WorkerRegistry::new(
            Arc::new(HttpCommandTransport::default()),
            Duration::from_secs(WORKER_ACK_TIMEOUT_SECS),
        ));

        let manager = TaskManager::new(registry.clone(), Arc::new(store.clone()));
        manager.install_handler(Arc::new(FactorUpdateHandler::new(
            registry.clone(),
            store.clone(),
        )));
        manager.install_handler(Arc::new(TickUpdateHandler::new(
            registry.clone(),
            store.clone(),
        )));
        manager.spawn_scheduling_loop(Duration::from_secs(TASK_CHECK_CYCLE_SECS));

        info!("managers initialized");
        Ok(Self {
            opts: Arc::new(opts),
            store,
            registry,
            manager,
        })
    }
}

/// Route logs to stdout, or to daily-rotated files under `log_path`.
pub fn subscribe_log(
    log_path: &Option<PathBuf>,
    log_level: &str,
    max_log: usize,
    prefix: &str,
) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_path {
        Some(log_path) => {
            let appender = Builder::new()
                .rotation(Rotation::DAILY)
                .filename_prefix(prefix)
                .max_log_files(max_log)
                .build(log_path)
                .expect("initializing rolling file appender failed");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            builder.json().with_writer(non_blocking).init();
            Some(guard)
        }
        None => {
            builder.init();
            None
        }
    }
}
