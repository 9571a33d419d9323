use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use datapub::server::ServerConfig;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    fmt().with_env_filter(filter).init();

    let cfg = ServerConfig {
        http_port: env_or("DATAPUB_HTTP_PORT", "9100").parse().unwrap_or(9100),
        repos_conf: env_or("DATAPUB_REPOS_CONF", "repos.yml"),
        data_root: env_or("DATAPUB_DATA_ROOT", "data"),
        mode: env_or("DATAPUB_MODE", "dev"),
        admin_users: env_or("DATAPUB_ADMIN_USERS", "")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        auth_url: env_or("DATAPUB_AUTH_URL", "http://localhost:9101/validate"),
        directory_url: env_or("DATAPUB_DIRECTORY_URL", "http://localhost:9102"),
        task_url: env_or("DATAPUB_TASK_URL", "http://localhost:9103"),
        version: env_or("DATAPUB_VERSION", env!("CARGO_PKG_VERSION")),
    };

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "datapub",
        "datapub starting: RUST_LOG='{}', http_port={}, mode='{}', repos_conf='{}', data_root='{}'",
        rust_log, cfg.http_port, cfg.mode, cfg.repos_conf, cfg.data_root
    );

    datapub::server::run(cfg).await
}
