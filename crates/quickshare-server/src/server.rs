use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    access::PasteService,
    dirs::DataDir,
    handlers::{api_info, create_paste, get_paste, get_paste_with_password, health},
    store::{
        crypto::{self, Envelope, KdfParams, MasterKey},
        Store,
    },
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// Public origin used to build share links (`$QUICKSHARE_BASE_URL`).
    pub base_url: String,
    pub cors_origins: Option<String>,
    pub sweep_interval: Duration,
    /// Upper bound on any single storage operation.
    pub storage_timeout: Duration,
    /// Argon2id cost for new password-protected pastes.
    pub kdf: KdfParams,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let kdf_default = KdfParams::default();
        Self {
            host: std::env::var("QUICKSHARE_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("QUICKSHARE_PORT").unwrap_or(8000),
            data_dir: std::env::var("QUICKSHARE_DATA_DIR").ok().map(PathBuf::from),
            base_url: std::env::var("QUICKSHARE_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8000".into()),
            cors_origins: std::env::var("QUICKSHARE_CORS_ORIGINS").ok(),
            sweep_interval: Duration::from_secs(
                env_parse("QUICKSHARE_SWEEP_INTERVAL_SECS").unwrap_or(300),
            ),
            storage_timeout: Duration::from_millis(
                env_parse("QUICKSHARE_STORAGE_TIMEOUT_MS").unwrap_or(5000),
            ),
            kdf: KdfParams {
                memory_kib: env_parse("QUICKSHARE_KDF_MEMORY_KIB").unwrap_or(kdf_default.memory_kib),
                iterations: env_parse("QUICKSHARE_KDF_ITERATIONS")
                    .unwrap_or(kdf_default.iterations),
                lanes: kdf_default.lanes,
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Read a master passphrase from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

/// Resolve an operator passphrase from `QUICKSHARE_MASTER_KEY_FILE` (preferred)
/// or `QUICKSHARE_MASTER_KEY`. `None` means use a generated key file.
pub fn resolve_master_passphrase() -> Result<Option<String>> {
    if let Ok(path) = std::env::var("QUICKSHARE_MASTER_KEY_FILE") {
        let key = read_key_file(Path::new(&path))?;
        if std::env::var("QUICKSHARE_MASTER_KEY").is_ok() {
            tracing::warn!(
                "both QUICKSHARE_MASTER_KEY and QUICKSHARE_MASTER_KEY_FILE are set; using file"
            );
        }
        return Ok(Some(key));
    }
    match std::env::var("QUICKSHARE_MASTER_KEY") {
        Ok(k) if k.is_empty() => anyhow::bail!("QUICKSHARE_MASTER_KEY must not be empty"),
        Ok(k) => Ok(Some(k)),
        Err(_) => Ok(None),
    }
}

/// Load the master key: derived from a passphrase with a persisted salt, or a
/// random key persisted to `quickshare.key` on first start.
pub fn load_master_key(data_dir: &DataDir, passphrase: Option<&str>) -> Result<MasterKey> {
    match passphrase {
        Some(passphrase) => {
            let salt = load_or_create_salt(data_dir)?;
            crypto::derive_master_key(passphrase, &salt, KdfParams::default())
        }
        None => load_or_create_key(data_dir),
    }
}

fn load_or_create_key(data_dir: &DataDir) -> Result<MasterKey> {
    let key_path = data_dir.key_file();
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("read quickshare.key")?;
        crypto::load_key(&bytes).ok_or_else(|| {
            anyhow::anyhow!(
                "quickshare.key is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let key = crypto::generate_key();
        write_private(&key_path, key.as_bytes()).context("write quickshare.key")?;
        info!("generated new encryption key");
        Ok(key)
    }
}

fn load_or_create_salt(data_dir: &DataDir) -> Result<[u8; 32]> {
    let salt_path = data_dir.salt_file();
    if salt_path.exists() {
        let bytes = std::fs::read(&salt_path).context("read quickshare.salt")?;
        bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "quickshare.salt is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let salt = crypto::generate_salt();
        write_private(&salt_path, &salt).context("write quickshare.salt")?;
        info!("generated new master key salt");
        Ok(salt)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    f.write_all(bytes)
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}

/// Build the HTTP router over a ready service.
pub fn router(state: AppState, cors_origins: Option<&str>) -> Router {
    let api = Router::new()
        .route("/api/create", post(create_paste))
        .route(
            "/api/get/{id}",
            get(get_paste).post(get_paste_with_password),
        )
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ));

    Router::new()
        .route("/api", get(api_info))
        .route("/health", get(health))
        .merge(api)
        .with_state(state)
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    cfg.kdf.validate().context("invalid KDF parameters")?;

    let data_dir = DataDir::resolve(cfg.data_dir.as_deref())?;
    info!(data_dir = %data_dir.root().display(), "using data directory");

    let passphrase = resolve_master_passphrase()?;
    let master = load_master_key(&data_dir, passphrase.as_deref())?;

    let store = Store::open(&data_dir.database()).context("open store")?;
    store.clone().spawn_sweep(cfg.sweep_interval);

    let service = PasteService::new(
        store,
        Envelope::new(master, cfg.kdf),
        &cfg.base_url,
        cfg.storage_timeout,
    );
    let app = router(AppState { service }, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, base_url = %cfg.base_url, "quickshare server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => cors.allow_origin(parse_origins(o)),
        None => cors.allow_origin(Any),
    }
}

/// Parse a comma-separated origin list, warning on entries that are not
/// valid header values.
fn parse_origins(list: &str) -> Vec<HeaderValue> {
    let origins: Vec<HeaderValue> = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %s.escape_debug(), "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    if origins.is_empty() {
        warn!("QUICKSHARE_CORS_ORIGINS has no valid origins; cross-origin requests will be refused");
    }
    origins
}
