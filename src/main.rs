use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use usersys::auth::password::hash_password;
use usersys::auth::TokenIssuer;
use usersys::models::token::TokenSummary;
use usersys::models::user::NewUser;
use usersys::store::memory::MemoryStore;
use usersys::store::postgres::PgStore;
use usersys::store::UserStore;
use usersys::{api, cli, config, jobs, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // OTLP export only when an endpoint is configured.
    let otel_enabled = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();
    let telemetry_layer = if otel_enabled {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "usersys"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "usersys=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port, memory }) => run_server(cfg, port, memory).await,
        None => {
            let port = cfg.port;
            run_server(cfg, port, false).await
        }
        Some(cli::Commands::Migrate) => {
            let db = connect(&cfg).await?;
            db.migrate().await?;
            println!("Migrations applied.");
            Ok(())
        }
        Some(cli::Commands::User { command }) => {
            let db = Arc::new(connect(&cfg).await?);
            let issuer = TokenIssuer::new(db.clone(), cfg.token_ttl);
            handle_user_command(db.as_ref(), &issuer, &cfg, command).await
        }
        Some(cli::Commands::Token { command }) => {
            let db = Arc::new(connect(&cfg).await?);
            let issuer = TokenIssuer::new(db, cfg.token_ttl);
            handle_token_command(&issuer, command).await
        }
    };

    if otel_enabled {
        opentelemetry::global::shutdown_tracer_provider();
    }

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn connect(cfg: &config::Config) -> anyhow::Result<PgStore> {
    PgStore::connect(&cfg.database_url, cfg.db_max_connections, cfg.store_timeout)
        .await
        .with_context(|| format!("failed to connect to {}", config::redact_url(&cfg.database_url)))
}

async fn run_server(cfg: config::Config, port: u16, memory: bool) -> anyhow::Result<()> {
    let sweep_interval = cfg.sweep_interval;

    let state = if memory {
        tracing::warn!("using in-memory store; all data is lost on exit");
        let store = Arc::new(MemoryStore::new());
        Arc::new(AppState::new(store.clone(), store, cfg))
    } else {
        tracing::info!("Connecting to database...");
        let db = Arc::new(connect(&cfg).await?);

        tracing::info!("Running migrations...");
        db.migrate().await?;

        Arc::new(AppState::new(db.clone(), db, cfg))
    };

    let app = api::app(state.clone());

    if jobs::cleanup::spawn(state.clone(), sweep_interval).is_some() {
        tracing::info!("Background token sweeper started (every {:?})", sweep_interval);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("usersys listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("usersys stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

async fn handle_user_command(
    db: &dyn UserStore,
    issuer: &TokenIssuer,
    cfg: &config::Config,
    cmd: cli::UserCommands,
) -> anyhow::Result<()> {
    match cmd {
        cli::UserCommands::Create {
            username,
            password,
            role,
            email,
            fullname,
        } => {
            let request = usersys::models::user::CreateUserRequest {
                username,
                password,
                role,
                email,
                fullname,
            };
            request
                .validate()
                .map_err(|e| anyhow::anyhow!("{}", e))?;

            let new_user = NewUser {
                password_hash: hash_password(&request.password, cfg.bcrypt_cost).await?,
                username: request.username,
                role: request.role,
                email: request.email,
                fullname: request.fullname,
            };
            let id = db
                .create_user(&new_user)
                .await
                .with_context(|| format!("failed to create user '{}'", new_user.username))?;
            println!("User created:\n  ID:   {}\n  Name: {}\n  Role: {}", id, new_user.username, new_user.role);
        }
        cli::UserCommands::Remove { id } => {
            let Some(user) = db.find_user_by_id(id).await? else {
                println!("No user with id {}.", id);
                return Ok(());
            };
            db.remove_user(id).await?;
            issuer.revoke_user(&user.username).await?;
            println!("User '{}' removed.", user.username);
        }
        cli::UserCommands::Count => {
            println!("{}", db.count_users().await?);
        }
    }
    Ok(())
}

async fn handle_token_command(issuer: &TokenIssuer, cmd: cli::TokenCommands) -> anyhow::Result<()> {
    match cmd {
        cli::TokenCommands::List => {
            let tokens = issuer.list().await?;
            if tokens.is_empty() {
                println!("No tokens found.");
            } else {
                println!("{:<6} {:<10} {:<20} {:<6} {:<25}", "ID", "TOKEN", "USERNAME", "ROLE", "EXPIRES");
                for t in tokens.iter().map(TokenSummary::from) {
                    println!(
                        "{:<6} {:<10} {:<20} {:<6} {:<25}",
                        t.id,
                        t.token_prefix,
                        t.username,
                        t.role,
                        t.expired_at.to_rfc3339()
                    );
                }
            }
        }
        cli::TokenCommands::Count => {
            println!("{}", issuer.count().await?);
        }
        cli::TokenCommands::Revoke { username, id } => {
            let (revoked, target) = match (username, id) {
                (Some(username), _) => (issuer.revoke_user(&username).await?, format!("'{}'", username)),
                (None, Some(id)) => (issuer.revoke_id(id).await?, format!("id {}", id)),
                (None, None) => anyhow::bail!("pass --username or --id"),
            };
            if revoked {
                println!("Token revoked.");
            } else {
                println!("No token found for {}.", target);
            }
        }
        cli::TokenCommands::PurgeExpired => {
            let removed = issuer.sweep_expired().await?;
            println!("Deleted {} expired token(s).", removed);
        }
        cli::TokenCommands::PurgeAll => {
            let removed = issuer.purge_all().await?;
            println!("Deleted {} token(s).", removed);
        }
    }
    Ok(())
}
