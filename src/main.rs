use model_arena::handlers::create_app_router;
use model_arena::init::app_init;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("🚀 Starting Model Arena...");
    dotenv::dotenv().ok();
    let (config, state) = app_init().await?;
    log::info!("✅ Application state initialized");
    let app = create_app_router(state.clone());

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    log::info!("");
    log::info!("🎉 Server started!");
    log::info!("📍 http://{}", addr);
    log::info!("🧪 Sessions: http://{}/api/sessions", addr);
    log::info!("❤️  Health: http://{}/health", addr);
    log::info!("");
    log::info!("🤖 Default model: {}", config.defaults.model);
    log::info!("⏱️  Connect timeout: {:?}", config.connect_timeout);
    log::info!("");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("👋 Shutting down...");
        })
        .await?;

    state.sessions.shutdown_all().await;
    Ok(())
}
