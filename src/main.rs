mod analysis;
mod app;
mod auth;
mod config;
mod drafts;
mod error;
mod images;
mod logs;
mod state;
mod storage;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "mealflow=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    // `mealflow token <owner-uuid>` prints a bearer token for that owner.
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("token") {
        let owner = args
            .get(2)
            .ok_or_else(|| anyhow::anyhow!("usage: mealflow token <owner-uuid>"))?
            .parse::<uuid::Uuid>()?;
        let config = config::AppConfig::from_env()?;
        println!("{}", auth::JwtKeys::from(&config.jwt).sign(owner)?);
        return Ok(());
    }

    let (app_state, worker) = state::AppState::init().await?;
    tokio::spawn(worker.run());

    app::serve(app::build_app(app_state)).await
}
