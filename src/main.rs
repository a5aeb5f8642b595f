use actix_cors::Cors;
use actix_server::ServerHandle;
use actix_session::{
    SessionMiddleware,
    config::{BrowserSession, CookieContentSecurity},
    storage::CookieSessionStore,
};
use actix_web::{
    App, HttpServer,
    cookie::{Key, SameSite},
    web::Data,
};
use anyhow::{Context, Result};
use arrival_board_agent::{
    api::Api,
    config::AppConfig,
    services::{
        auth::{PasswordService, TokenManager},
        jobs::{JobCoordinator, actions::JobActions},
        network::{NetworkServices, ProfileStore, SecretSealer},
        provisioning::Provisioning,
        store::AtomicStore,
        system_actions::SystemActionRunner,
    },
};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info, warn};
use rustls::crypto::{CryptoProvider, ring::default_provider};
use std::{
    io::Write,
    path::{Path, PathBuf},
};
use tokio::signal::unix::{SignalKind, signal};

type AdminApi = Api<SystemActionRunner>;

#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize()?;

    let config = AppConfig::get();
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let store = AtomicStore::open(&config.paths.store_dir, config.store_lock_timeout)
        .context("failed to open store")?;
    let sealer = SecretSealer::load_or_create(&config.paths.device_secret_file)
        .context("failed to load device secret")?;

    let runner = SystemActionRunner;
    let network = NetworkServices::new(
        runner,
        &config.access_point,
        &config.provisioning,
        ProfileStore::new(store.clone(), sealer),
    );
    let actions = JobActions::new(
        runner,
        network,
        config.system.clone(),
        config.paths.clone(),
    );
    let coordinator = JobCoordinator::with_history(store);
    let provisioning = Provisioning::new(
        coordinator.clone(),
        actions.clone(),
        config.portal.clone(),
        config.provisioning.clone(),
    );
    let api = Api::new(
        coordinator,
        actions,
        provisioning.clone(),
        PasswordService::new(&config.paths.password_file),
    );

    let (server_handle, server_task) = run_server(api).await?;

    let driver = {
        let provisioning = provisioning.clone();
        tokio::spawn(async move {
            match provisioning.ensure_connectivity().await {
                Ok(state) => info!("provisioning settled in state {state}"),
                Err(e) => error!("failed to ensure connectivity: {e:#}"),
            }
            provisioning.run_health_checks().await;
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => debug!("ctrl-c received"),
        _ = sigterm.recv() => debug!("SIGTERM received"),
        result = server_task => {
            match result {
                Ok(Ok(())) => debug!("server stopped normally"),
                Ok(Err(e)) => error!("server stopped with error: {e}"),
                Err(e) => error!("server task panicked: {e}"),
            }
        },
    }

    info!("shutting down");

    driver.abort();
    server_handle.stop(true).await;
    provisioning.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

fn initialize() -> Result<()> {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));

    CryptoProvider::install_default(default_provider())
        .map_err(|_| anyhow::anyhow!("crypto provider already installed"))?;

    Ok(())
}

async fn run_server(
    api: AdminApi,
) -> Result<(
    ServerHandle,
    tokio::task::JoinHandle<Result<(), std::io::Error>>,
)> {
    let config = AppConfig::get();
    let address = format!("0.0.0.0:{}", config.admin.port);
    let session_key = Key::generate();
    let token_manager = TokenManager::new(&config.token_secret);
    let passwords = api.passwords.clone();
    let tls_config = load_tls_config(&config.paths.tls_dir).context("failed to load tls config")?;
    let secure = tls_config.is_some();

    let server = HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allow_any_header()
                    .allowed_methods(vec!["GET"])
                    .supports_credentials()
                    .max_age(3600),
            )
            .wrap(
                SessionMiddleware::builder(CookieSessionStore::default(), session_key.clone())
                    .cookie_name(String::from("arrival-board-session"))
                    .cookie_secure(secure)
                    .session_lifecycle(BrowserSession::default())
                    .cookie_same_site(SameSite::Strict)
                    .cookie_content_security(CookieContentSecurity::Private)
                    .cookie_http_only(true)
                    .build(),
            )
            .app_data(Data::new(token_manager.clone()))
            .app_data(Data::new(passwords.clone()))
            .app_data(Data::new(api.clone()))
            .configure(AdminApi::configure)
    });

    let server = match tls_config {
        Some(tls_config) => {
            info!("admin api listening on https://{address}");
            server
                .bind_rustls_0_23(&address, tls_config)
                .context("failed to bind server")?
        }
        None => {
            warn!("no tls certificate found, admin api listening on http://{address}");
            server.bind(&address).context("failed to bind server")?
        }
    }
    .disable_signals()
    .run();

    Ok((server.handle(), tokio::spawn(server)))
}

/// First `<name>.crt` in `tls_dir` that has a matching `<name>.key`
fn find_certificate(tls_dir: &Path) -> Result<Option<(PathBuf, PathBuf)>> {
    let entries = match std::fs::read_dir(tls_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context("failed to read tls directory"),
    };

    for entry in entries {
        let cert_path = entry.context("failed to read tls directory entry")?.path();
        if cert_path.extension().is_some_and(|ext| ext == "crt") {
            let key_path = cert_path.with_extension("key");
            if key_path.exists() {
                return Ok(Some((cert_path, key_path)));
            }
        }
    }

    Ok(None)
}

fn load_tls_config(tls_dir: &Path) -> Result<Option<rustls::ServerConfig>> {
    let Some((cert_path, key_path)) = find_certificate(tls_dir)? else {
        return Ok(None);
    };

    let mut tls_certs = std::io::BufReader::new(
        std::fs::File::open(&cert_path).context("failed to open certificate file")?,
    );

    let mut tls_key = std::io::BufReader::new(
        std::fs::File::open(&key_path).context("failed to open key file")?,
    );

    let tls_certs = rustls_pemfile::certs(&mut tls_certs)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse certificate pem")?;

    let key_item = rustls_pemfile::read_one(&mut tls_key)
        .context("failed to read key pem file")?
        .context("no valid key found in pem file")?;

    let config = match key_item {
        rustls_pemfile::Item::Pkcs1Key(key) => rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(tls_certs, rustls::pki_types::PrivateKeyDer::Pkcs1(key))
            .context("failed to create tls config with pkcs1 key")?,
        rustls_pemfile::Item::Pkcs8Key(key) => rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(tls_certs, rustls::pki_types::PrivateKeyDer::Pkcs8(key))
            .context("failed to create tls config with pkcs8 key")?,
        rustls_pemfile::Item::Sec1Key(key) => rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(tls_certs, rustls::pki_types::PrivateKeyDer::Sec1(key))
            .context("failed to create tls config with sec1 key")?,
        _ => anyhow::bail!("unexpected key type in pem file"),
    };

    info!("using tls certificate {}", cert_path.display());
    Ok(Some(config))
}
