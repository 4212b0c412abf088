//! `infonomy-server`: the market's HTTP surface and worker pool binary.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use infonomy_agent::AgentBridge;
use infonomy_core::config::Config;
use infonomy_server::{build_router, spawn_worker_pool, start_server, AppState, JobRegistry};
use infonomy_store::{PgStore, Store};
use tracing_subscriber::EnvFilter;

/// CLI flags, layered over environment variables, layered over the
/// `Config` defaults.
#[derive(Parser, Debug)]
#[command(name = "infonomy-server", version)]
struct Args {
    /// Address to bind the HTTP server to.
    #[arg(long, env = "INFONOMY_BIND_ADDR", default_value = "127.0.0.1:8080")]
    bind_addr: SocketAddr,

    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// API key for the configured LLM provider, used by `AgentBridge`.
    #[arg(long, env = "OPENROUTER_API_KEY")]
    llm_api_key: String,

    /// Maximum jobs (fan-out/dispatch/inspect) running concurrently.
    #[arg(long, env = "INFONOMY_WORKER_CONCURRENCY", default_value_t = 8)]
    worker_concurrency: usize,

    #[arg(long, env = "INFONOMY_INSP_MAX_DEPTH", default_value_t = 3)]
    insp_max_depth: u32,

    #[arg(long, env = "INFONOMY_INSP_MAX_BREADTH", default_value_t = 3)]
    insp_max_breadth: u32,

    #[arg(long, env = "INFONOMY_AGENT_MAX_RETRIES", default_value_t = 4)]
    agent_max_retries: u32,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();

    let config = Arc::new(Config {
        insp_max_depth: args.insp_max_depth,
        insp_max_breadth: args.insp_max_breadth,
        agent_max_retries: args.agent_max_retries,
        ..Config::default()
    });

    let pg = PgStore::connect(&args.database_url).await.expect("failed to connect to database");
    pg.migrate().await.expect("failed to run migrations");
    let store: Arc<dyn Store> = Arc::new(pg);

    let agent = Arc::new(AgentBridge::new(args.llm_api_key).expect("failed to construct agent bridge"));
    let jobs = JobRegistry::new();
    let job_tx = spawn_worker_pool(store.clone(), agent.clone(), config.clone(), jobs.clone(), args.worker_concurrency);

    let app_state = AppState { store, agent, config, jobs, job_tx };
    let router = build_router(app_state);
    let addr: SocketAddr = start_server(router, args.bind_addr).await;
    tracing::info!("infonomy-server listening on http://{addr}");

    // Keep the process alive; the server itself runs on its own task.
    std::future::pending::<()>().await;
}
