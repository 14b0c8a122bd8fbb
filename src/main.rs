#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use marz_balancer::server;
use marz_balancer::server::bootstrap::{self, BootstrapArgs};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "marz-balancer", about = "Health-aware TCP balancer for Marzban nodes")]
struct Cli {
    /// Path to an optional TOML or JSON config file
    #[arg(short, long, default_value = "balancer.toml")]
    config: PathBuf,

    /// Path to a .env file merged into the environment
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Listen address, overrides APP_PORT and BALANCER_LISTEN
    #[arg(short, long)]
    listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_file_status = bootstrap::load_env_file(&cli.env_file);

    let (worker_threads, source) = server::runtime::worker_threads();
    eprintln!("[runtime] {} worker threads ({})", worker_threads, source);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(bootstrap::run(BootstrapArgs {
        config_path: cli.config,
        env_file: cli.env_file,
        env_file_status,
        listen: cli.listen,
    }))
}
