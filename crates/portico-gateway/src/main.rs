//! Portico API Gateway Server
//!
//! Binary entry point: loads and validates configuration, resolves
//! secrets, publishes the first snapshot and starts the HTTP server with
//! the health endpoints and the catch-all proxy route.

use portico_rs::config::secrets::{resolve_secrets, SecretResolver};
use portico_rs::config::settings::load_settings;
use portico_rs::config::validation::ConfigValidator;
use portico_rs::logs::logger::configure_logger;
use portico_rs::routes::{health, http as proxy};
use portico_rs::services::http::Gateway;

use actix_web::{middleware::Logger, App, HttpServer};
use log::{error, info};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    configure_logger();

    let settings = match load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load settings: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Portico API Gateway v{}", env!("CARGO_PKG_VERSION"));

    let validation = ConfigValidator::validate_comprehensive(&settings);
    for warning in &validation.warnings {
        log::warn!("Config warning: {}", warning);
    }
    if !validation.is_valid {
        error!("Configuration validation failed:");
        for e in &validation.errors {
            error!("  - {}", e);
        }
        std::process::exit(1);
    }
    info!(
        "Configuration validated successfully with {} warnings",
        validation.warnings.len()
    );

    let settings = match resolve_secrets(settings, &SecretResolver::new()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Secret resolution failed: {}", e);
            std::process::exit(1);
        }
    };

    let max_body = settings.global.max_body_bytes;
    let gateway = match Gateway::new(settings) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to build gateway: {}", e);
            std::process::exit(1);
        }
    };

    let host = std::env::var("PORTICO_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("PORTICO_PORT")
        .unwrap_or_else(|_| "5900".to_string())
        .parse::<u16>()
        .unwrap_or(5900);

    info!("Starting server on {}:{}", host, port);

    let server_gateway = gateway.clone();
    HttpServer::new(move || {
        App::new()
            .app_data(actix_web::web::PayloadConfig::new(max_body))
            .app_data(actix_web::web::Data::new(server_gateway.clone()))
            .wrap(Logger::new(
                r#"%a "%r" %s %b "%{Referer}i" "%{User-Agent}i" %T"#,
            ))
            .configure(health::configure_health)
            .configure(|cfg| proxy::configure_proxy(cfg, server_gateway.clone()))
    })
    .bind((host.as_str(), port))?
    .run()
    .await
}
