//! webcache
//!
//! Runs a response cache as a small HTTP service, or performs one-shot
//! operations against a file cache directory.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      webcache serve                       │
//! ├──────────────────────────────────────────────────────────┤
//! │  GET/PUT/DELETE /entry?url=..  ──▶  CacheRegistry         │
//! │  GET /metrics                  ──▶  prometheus registry   │
//! │  GET /healthz                                             │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use webcache::cache::{BackendKind, CacheSettings, JsonMeta};
use webcache::{CacheKey, CacheRegistry, CacheResponse};

type Registry = CacheRegistry<JsonMeta>;

// =============================================================================
// CLI Arguments
// =============================================================================

/// webcache - Response caching engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML settings file
    #[arg(long, env = "WEBCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// File cache root, overrides the settings file
    #[arg(long, env = "WEBCACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the cache over HTTP
    Serve {
        /// Bind address
        #[arg(long, env = "WEBCACHE_ADDR", default_value = "0.0.0.0:8080")]
        addr: String,
    },
    /// Print a cached body to stdout
    Get {
        url: String,
        /// Print the gzip representation when one is stored
        #[arg(long)]
        gzip: bool,
    },
    /// Store a file as the cached response for a URL
    Put {
        url: String,
        /// Body file
        file: PathBuf,
        #[arg(long, default_value = "application/octet-stream")]
        content_type: String,
        /// Response status
        #[arg(long, default_value = "200")]
        status: u16,
        /// Redirect target for 3xx statuses
        #[arg(long)]
        location: Option<String>,
        /// Metadata as JSON
        #[arg(long)]
        meta: Option<String>,
        /// Store the body without compressing it
        #[arg(long)]
        uncompressed: bool,
    },
    /// Remove a URL from the cache
    Remove { url: String },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut settings = load_settings(&args)?;
    if !matches!(args.command, Command::Serve { .. }) {
        // One-shot commands only make sense against durable storage
        settings.backend = BackendKind::File;
    }

    let registry: Arc<Registry> = Arc::new(
        CacheRegistry::init(settings)
            .await
            .context("failed to initialize cache")?,
    );

    match &args.command {
        Command::Serve { addr } => serve(registry, addr).await,
        Command::Get { url, gzip } => get(&registry, url, *gzip).await,
        Command::Put {
            url,
            file,
            content_type,
            status,
            location,
            meta,
            uncompressed,
        } => {
            let status = StatusCode::from_u16(*status).context("invalid status")?;
            let meta = meta
                .as_deref()
                .map(serde_json::from_str::<JsonMeta>)
                .transpose()
                .context("--meta is not valid JSON")?;
            let body = tokio::fs::read(file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;

            let mut response = CacheResponse::new(status)
                .with_body(body)
                .with_header(CONTENT_TYPE, content_type);
            if let Some(location) = location {
                response = response.with_header(LOCATION, location);
            }

            let cache = registry.default_cache();
            cache
                .add_to_cache(&CacheKey::parse(url), response, None, meta, *uncompressed)
                .await?;
            info!(url = %url, "Stored");
            Ok(())
        }
        Command::Remove { url } => {
            registry
                .default_cache()
                .remove_from_cache(&CacheKey::parse(url))
                .await?;
            info!(url = %url, "Removed");
            Ok(())
        }
    }
}

fn load_settings(args: &Args) -> anyhow::Result<CacheSettings> {
    let mut settings = match &args.config {
        Some(path) => CacheSettings::from_yaml_file(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => CacheSettings::default(),
    };
    if let Some(dir) = &args.cache_dir {
        settings.file.root = dir.clone();
    }
    Ok(settings)
}

async fn get(registry: &Registry, url: &str, gzip: bool) -> anyhow::Result<()> {
    let cache = registry.default_cache();
    let Some(response) = cache
        .get_from_cache(&CacheKey::parse(url), gzip, None)
        .await?
    else {
        bail!("no cached entry for {}", url);
    };

    if !response.status().is_success() {
        eprintln!("status: {}", response.status());
    }
    let body = response.bytes().await?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&body).await?;
    stdout.flush().await?;
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},hyper=warn", level)));

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// HTTP Server
// =============================================================================

async fn serve(registry: Arc<Registry>, addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid bind address {}", addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!("Cache server listening on {}", addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted.context("accept failed")?;
                let io = TokioIo::new(stream);
                let registry = registry.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(registry.clone(), req));
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        error!("Connection error: {}", e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    registry.shutdown();
    Ok(())
}

async fn handle(
    registry: Arc<Registry>,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match route(&registry, req).await {
        Ok(response) => response,
        Err(e) => {
            error!("Request failed: {:#}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    };
    Ok(response)
}

async fn route(registry: &Registry, req: Request<Incoming>) -> anyhow::Result<Response<Full<Bytes>>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => Ok(text(StatusCode::OK, "ok")),
        (&Method::GET, "/metrics") => {
            let mut response = text(StatusCode::OK, registry.gather_metrics()?);
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(response)
        }
        (_, "/entry") => entry(registry, req).await,
        _ => Ok(text(StatusCode::NOT_FOUND, "not found")),
    }
}

/// Query parameter lookup
fn query_param(req: &Request<Incoming>, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

async fn entry(registry: &Registry, req: Request<Incoming>) -> anyhow::Result<Response<Full<Bytes>>> {
    let Some(url) = query_param(&req, "url") else {
        return Ok(text(StatusCode::BAD_REQUEST, "missing url parameter"));
    };
    let key = CacheKey::parse(&url);
    let cache = registry.default_cache();

    match *req.method() {
        Method::GET => {
            let prefer_gzip = req
                .headers()
                .get(ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.contains("gzip"));

            match cache.get_from_cache(&key, prefer_gzip, None).await? {
                Some(hit) => {
                    let (status, headers, body) = hit.into_parts();
                    let mut response = Response::new(Full::new(body.into_bytes().await?));
                    *response.status_mut() = status;
                    *response.headers_mut() = headers;
                    response
                        .headers_mut()
                        .insert("x-cache", HeaderValue::from_static("HIT"));
                    Ok(response)
                }
                None => {
                    let mut response = text(StatusCode::NOT_FOUND, "miss");
                    response
                        .headers_mut()
                        .insert("x-cache", HeaderValue::from_static("MISS"));
                    Ok(response)
                }
            }
        }
        Method::PUT => {
            let store_uncompressed = query_param(&req, "uncompressed").is_some_and(|v| v == "true");
            let (parts, body) = req.into_parts();
            let data = body.collect().await?.to_bytes();

            let mut response = CacheResponse::ok(data);
            for name in [CONTENT_TYPE, CONTENT_ENCODING] {
                if let Some(value) = parts.headers.get(&name) {
                    response.headers_mut().insert(name, value.clone());
                }
            }

            cache
                .add_to_cache(&key, response, None, None, store_uncompressed)
                .await?;
            Ok(text(StatusCode::CREATED, "stored"))
        }
        Method::DELETE => {
            cache.remove_from_cache(&key).await?;
            Ok(text(StatusCode::NO_CONTENT, ""))
        }
        _ => Ok(text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")),
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}
