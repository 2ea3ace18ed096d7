use clap::Parser;
use factorkeeper_host::{server, subscribe_log, AppState, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut opts = Cli::parse();
    opts.merge_from_file()?;

    let _guard = subscribe_log(&opts.log_path, &opts.log_level, opts.max_log, "coordinator");

    let state = AppState::init_with(opts).await?;
    server::serve(state).await
}
