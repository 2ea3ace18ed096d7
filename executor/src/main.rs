use std::time::Duration;

use clap::Parser;
use factorkeeper_executor::{server, Cli, ExecutorState};
use factorkeeper_lib::config::UPDATE_CYCLE_SECS;
use factorkeeper_lib::ErrorKind;
use tracing::warn;
use tracing_appender::rolling::{Builder, Rotation};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut opts = Cli::parse();
    opts.merge_from_file()?;

    let _guard = subscribe_log(&opts);

    let state = ExecutorState::init_with(opts).await?;

    let cores = state.opts.processors;
    state
        .client
        .register_with_retry(cores, Duration::from_secs(UPDATE_CYCLE_SECS))
        .await;

    spawn_heartbeat_loop(state.clone());
    server::serve(state).await
}

/// Report the live group ids every cycle; a `WORKER_NOT_EXISTS` reply
/// means the coordinator restarted and we must introduce ourselves again.
fn spawn_heartbeat_loop(state: ExecutorState) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(UPDATE_CYCLE_SECS)).await;

            let group_ids = state.pool.group_ids().await;
            match state.client.heartbeat(&group_ids).await {
                Ok(()) => {}
                Err(ErrorKind::WorkerNotExists) => {
                    warn!("coordinator restarted, registering again");
                    state
                        .client
                        .register_with_retry(
                            state.opts.processors,
                            Duration::from_secs(UPDATE_CYCLE_SECS),
                        )
                        .await;
                }
                Err(err) => warn!(%err, "heartbeat failed"),
            }
        }
    });
}

fn subscribe_log(opts: &Cli) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_new(&opts.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &opts.log_path {
        Some(log_path) => {
            let appender = Builder::new()
                .rotation(Rotation::DAILY)
                .filename_prefix("executor")
                .max_log_files(opts.max_log)
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
