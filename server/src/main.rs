use chrono::Utc;
use tokio::net::TcpListener;

use relay_server::config::{generate_config_template, Config};
use relay_server::routes;
use relay_server::state::AppState;
use relay_server::ws::Hub;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("relay_server=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    config.validate()?;

    tracing::info!("relay-server v{} starting", env!("CARGO_PKG_VERSION"));

    let hub = Hub::spawn(config.hub.mailbox_capacity, config.session.queue_capacity);

    let app_state = AppState {
        hub,
        default_username: config.default_username.clone(),
        session: config.session.clone(),
        started_at: Utc::now(),
    };

    let app = routes::build_router(app_state);

    // Bind failure is fatal
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);
    tracing::info!("WebSocket endpoint: ws://{}/ws?username=YourName", addr);
    tracing::info!("API endpoints: GET /api/users, GET /api/stats, GET /healthz");

    axum::serve(listener, app).await?;

    Ok(())
}
