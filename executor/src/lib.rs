//! Executor node: receives logical tasks from the coordinator, fans them
//! into per-day unit tasks on the worker pool, runs the user's generator
//! code in isolated OS processes and reports frames back.

pub mod code_cache;
pub mod planner;
pub mod runner;
pub mod sender;
pub mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use factorkeeper_lib::config::PROCESSOR_NUM;
use factorkeeper_metadb::MetaDb;
use factorkeeper_pool::WorkerPool;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::code_cache::CodeCache;
use crate::planner::UpdatePlanner;
use crate::runner::ExecutorRunner;
use crate::sender::CoordinatorClient;

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8911
}

fn default_coordinator_url() -> String {
    "http://localhost:8910".to_string()
}

fn default_database_url() -> String {
    "postgres://factorkeeper@localhost/factorkeeper".to_string()
}

fn default_processors() -> usize {
    PROCESSOR_NUM
}

fn default_generators_dir() -> PathBuf {
    PathBuf::from("generators")
}

fn default_max_log() -> usize {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(name = "factorkeeper-executor", about = "A factorkeeper worker node", long_about = None)]
#[serde(default)]
pub struct Cli {
    #[arg(long, require_equals = true, default_value = "localhost")]
    #[serde(default = "default_host")]
    /// Hostname the coordinator can reach this node under
    pub host: String,

    #[arg(long, require_equals = true, default_value = "8911")]
    #[serde(default = "default_port")]
    pub port: u16,

    #[arg(
        long,
        require_equals = true,
        env = "FACTORKEEPER_COORDINATOR_URL",
        default_value = "http://localhost:8910"
    )]
    #[serde(default = "default_coordinator_url")]
    pub coordinator_url: String,

    #[arg(
        long,
        require_equals = true,
        env = "FACTORKEEPER_DATABASE_URL",
        default_value = "postgres://factorkeeper@localhost/factorkeeper"
    )]
    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[arg(long, require_equals = true, default_value = "2")]
    #[serde(default = "default_processors")]
    /// Parallel unit-task slots
    pub processors: usize,

    #[arg(long, require_equals = true, default_value = "generators")]
    #[serde(default = "default_generators_dir")]
    /// Directory the generator executables are unpacked into
    pub generators_dir: PathBuf,

    #[arg(long, require_equals = true)]
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
            host: default_host(),
            port: default_port(),
            coordinator_url: default_coordinator_url(),
            database_url: default_database_url(),
            processors: default_processors(),
            generators_dir: default_generators_dir(),
            log_path: None,
            max_log: default_max_log(),
            log_level: default_log_level(),
            config_path: None,
        }
    }
}

impl Cli {
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

#[derive(Clone)]
pub struct ExecutorState {
    pub opts: Arc<Cli>,
    pub pool: WorkerPool,
    pub planner: Arc<UpdatePlanner>,
    pub client: Arc<CoordinatorClient>,
}

impl ExecutorState {
    pub async fn init_with(opts: Cli) -> anyhow::Result<Self> {
        info!("starting worker node...");

        let store = MetaDb::connect(&opts.database_url, opts.processors as u32 + 1)
            .await
            .context("could not connect to the store")?;
        store.bootstrap().await.context("schema bootstrap failed")?;

        let client = Arc::new(CoordinatorClient::new(
            &opts.coordinator_url,
            &opts.host,
            opts.port,
        ));
        let code_cache = CodeCache::new(&opts.generators_dir);
        let runner = Arc::new(ExecutorRunner::new(
            opts.database_url.clone(),
            code_cache.clone(),
            client.clone(),
        ));
        let pool = WorkerPool::new(opts.processors, runner, client.clone());
        let planner = Arc::new(UpdatePlanner::new(store, pool.clone(), code_cache));

        Ok(Self {
            opts: Arc::new(opts),
            pool,
            planner,
            client,
        })
    }
}
