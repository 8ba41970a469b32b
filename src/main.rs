use actix_cors::Cors;
use actix_web::{middleware::Compress, web, App, HttpServer};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()
use utoipa_swagger_ui::SwaggerUi;

use quill::cache::InMemoryPageCache;
use quill::config::Settings;
use quill::error::not_found;
use quill::openapi::ApiDoc;
use quill::repo::Repo;
use quill::storage::build_image_store;
use quill::{config, AppState, SecurityHeaders};

#[cfg(not(any(feature = "inmem-store", feature = "postgres-store")))]
compile_error!("enable at least one of the `inmem-store` or `postgres-store` features");

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env automatically only in debug builds.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    validate_env_vars();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Bootstrapping quill");
    let settings = Settings::from_env();
    let _ = quill::telemetry::prometheus();

    let repo = build_repo(&settings).await?;
    let image_store = build_image_store(settings.media_root.clone()).await?;
    let page_cache = Arc::new(InMemoryPageCache::new());
    info!(ttl_secs = settings.index_cache_ttl.as_secs(), "home page cache ready");

    let state = AppState { repo, image_store, page_cache, settings: settings.clone() };
    let openapi = ApiDoc::openapi();
    let bind_addr = (settings.host.clone(), settings.port);

    let server = HttpServer::new(move || {
        let cors = settings
            .cors_origins
            .iter()
            .fold(Cors::default(), |c, origin| c.allowed_origin(origin))
            .allow_any_header()
            .allowed_methods(["GET", "POST", "OPTIONS"])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(SecurityHeaders::from_settings(&settings))
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            // registered ahead of the catch-all /{username}/ routes
            .service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()))
            .configure(config)
            .default_service(web::to(not_found))
    })
    .bind(bind_addr.clone())?;

    info!("Listening on http://{}:{}", bind_addr.0, bind_addr.1);

    server.run().await?;
    Ok(())
}

#[cfg(feature = "postgres-store")]
async fn build_repo(_settings: &Settings) -> anyhow::Result<Arc<dyn Repo>> {
    use quill::repo::pg::PgRepo;
    use sqlx::postgres::PgPoolOptions;

    let db_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set for postgres-store"))?;
    let pool = PgPoolOptions::new().max_connections(5).connect(&db_url).await?;
    let repo = PgRepo::new(pool);
    repo.migrate().await?;
    info!("Using Postgres repository backend (migrations applied)");
    Ok(Arc::new(repo))
}

#[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
async fn build_repo(settings: &Settings) -> anyhow::Result<Arc<dyn Repo>> {
    use quill::repo::inmem::InMemRepo;

    let repo = match &settings.data_dir {
        Some(dir) => InMemRepo::with_snapshot(dir.join("state.json")),
        None => InMemRepo::new(),
    };
    info!(persistent = settings.data_dir.is_some(), "Using in-memory repository backend");
    Ok(Arc::new(repo))
}

/// Validate that required environment variables are set
fn validate_env_vars() {
    match std::env::var("JWT_SECRET") {
        Err(_) => {
            eprintln!("Missing required environment variable JWT_SECRET");
            eprintln!("Please copy .env.example to .env and configure it");
            std::process::exit(1);
        }
        Ok(secret) if secret.len() < 32 => {
            eprintln!("JWT_SECRET must be at least 32 characters long");
            std::process::exit(1);
        }
        Ok(_) => {}
    }
}
