use financial_statement_ingestor::server;
use financial_statement_ingestor::IngestorConfig;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = IngestorConfig::from_env();
    log::info!(
        "Starting statement ingestor (model {}, {} concurrent documents, store {})",
        config.default_model,
        config.max_concurrency,
        config.database_path.display()
    );

    if let Err(e) = server::serve(config).await {
        log::error!("Server stopped: {}", e);
        std::process::exit(1);
    }
}
