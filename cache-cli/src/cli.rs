use clap::Parser;
use std::path::PathBuf;

use cache_protocol::CacheLevel;

/// Define CLI arguments
#[derive(Parser)]
#[command(
    author = "hua0512 <https://github.com/hua0512>",
    version,
    about = "Fetch a URL through the response cache",
    long_about = "Fetches a URL, answering from the on-disk cache when the stored response\n\
                  is still fresh, revalidating it with the origin when it is not, and\n\
                  storing or refreshing the entry afterwards.\n\
                  \n\
                  The outcome of the validation and the source of the body are printed\n\
                  to stderr so the body can be piped from stdout."
)]
pub struct CliArgs {
    /// URL to fetch
    #[arg(required = true, help = "http(s) URL to fetch")]
    pub url: String,

    /// Cache directory
    #[arg(
        short,
        long,
        help = "Directory holding cached responses (default: system temp dir)"
    )]
    pub cache_dir: Option<PathBuf>,

    #[arg(
        short,
        long,
        default_value = "default",
        help = "Cache level: default, bypass-cache, cache-only, cache-if-available, revalidate, reload, no-cache-no-store, cache-or-next-cache-only, refresh"
    )]
    pub policy: CacheLevel,

    /// Maximum acceptable age with optional unit (s, m, h)
    #[arg(
        long,
        help = "Reject cached entries older than this. Examples: \"30m\", \"1.5h\", \"90s\""
    )]
    pub max_age: Option<String>,

    #[arg(
        long,
        help = "Require entries to stay fresh for at least this long. Examples: \"30s\", \"5m\""
    )]
    pub min_fresh: Option<String>,

    #[arg(
        long,
        help = "Accept entries stale by at most this long. Examples: \"10m\", \"1h\""
    )]
    pub max_stale: Option<String>,

    /// Output file for the body
    #[arg(short, long, help = "Write the body to this file instead of stdout")]
    pub output: Option<PathBuf>,

    /// Extra request headers
    #[arg(
        short = 'H',
        long = "header",
        help = "Add a request header (\"Name: Value\"), can be repeated"
    )]
    pub headers: Vec<String>,

    /// Request timeout
    #[arg(
        long,
        default_value = "30s",
        help = "Overall request timeout with optional unit (s, m, h)"
    )]
    pub timeout: String,

    /// Fail on cache provider errors instead of falling back to the network
    #[arg(long, help = "Treat cache storage failures as request failures")]
    pub strict: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable detailed debug logging")]
    pub verbose: bool,
}
