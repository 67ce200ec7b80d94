use std::sync::Arc;
use std::time::{Duration, Instant};

use cache_protocol::{
    CacheConfig, CachePolicy, CacheRequest, CachingClient, FileCache, ProtocolConfig,
    ReqwestTransport,
};
use clap::Parser;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use url::Url;

mod cli;
mod error;
mod utils;

use cli::CliArgs;
use error::AppError;
use utils::{parse_duration, split_header};

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        // Log the full error for debugging
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();

    // -v wins over RUST_LOG
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(format!("Failed to set up logging: {e}")))?;

    let request = build_request(&args)?;
    let timeout = parse_duration(&args.timeout)?;

    let cache_config = CacheConfig {
        disk_cache_path: args.cache_dir.clone(),
        ..CacheConfig::default()
    };
    let cache = FileCache::new(&cache_config);
    info!(cache_dir = %cache.cache_dir().display(), "Using file cache");

    let config = ProtocolConfig::builder()
        .with_strict_cache_errors(args.strict)
        .build();
    let transport = ReqwestTransport::with_timeouts(timeout, Duration::from_secs(10))?;
    let client = CachingClient::new(transport, Arc::new(cache), config);

    let started = Instant::now();
    let mut body = client.fetch(request).await?;
    info!(
        status = %body.status,
        outcome = %body.outcome,
        source = if body.from_cache { "cache" } else { "network" },
        "Response ready"
    );
    for (name, value) in &body.headers {
        debug!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
    }

    let written = match &args.output {
        Some(path) => {
            let mut file = tokio::fs::File::create(path).await?;
            copy_body(&mut body, &mut file).await?
        }
        None => copy_body(&mut body, &mut tokio::io::stdout()).await?,
    };

    eprintln!(
        "{} {} from {} ({} bytes in {:.2?})",
        body.status,
        body.outcome,
        if body.from_cache { "cache" } else { "network" },
        written,
        started.elapsed()
    );
    Ok(())
}

fn build_request(args: &CliArgs) -> Result<CacheRequest, AppError> {
    let uri = Url::parse(&args.url)
        .map_err(|e| AppError::InvalidInput(format!("invalid url '{}': {e}", args.url)))?;

    let mut policy = CachePolicy::new(args.policy);
    if let Some(max_age) = &args.max_age {
        policy = policy.with_max_age(parse_duration(max_age)?);
    }
    if let Some(min_fresh) = &args.min_fresh {
        policy = policy.with_min_fresh(parse_duration(min_fresh)?);
    }
    if let Some(max_stale) = &args.max_stale {
        policy = policy.with_max_stale(parse_duration(max_stale)?);
    }
    debug!(?policy, "Request policy");

    let mut request = CacheRequest::get(uri).with_policy(policy);
    for header in &args.headers {
        let (name, value) = split_header(header)?;
        request = request.with_header(name, value);
    }
    Ok(request)
}

async fn copy_body<W>(body: &mut cache_protocol::CachedBody, out: &mut W) -> Result<u64, AppError>
where
    W: AsyncWrite + Unpin,
{
    let written = tokio::io::copy(body, out).await?;
    out.flush().await?;
    Ok(written)
}
