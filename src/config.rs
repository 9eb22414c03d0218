//! CLI 参数、环境变量与网关运行时配置。

use clap::Parser;
use reqwest::Url;
use shadow_rs::formatcp;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_S3_ENDPOINT: &str = "https://s3.amazonaws.com";
pub const DEFAULT_S3_REGION: &str = "us-east-1";
pub const DEFAULT_CACHE_CONTROL: &str = "public, max-age=31536000";
pub const DEFAULT_USERS_FILE: &str = "users.json";
pub const DEFAULT_STORAGE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_BODY_LIMIT: usize = 100 * 1024 * 1024;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// CLI arguments and environment configuration for the gateway.
#[derive(Parser, Debug)]
#[command(name = "conspire", version = VERSION_INFO, about = "An S3-based file sharing server")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "CONSPIRE_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "CONSPIRE_PORT",
        default_value_t = 8080,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "CONSPIRE_S3_ENDPOINT",
        default_value = DEFAULT_S3_ENDPOINT,
        help = "The S3 endpoint e.g. s3.amazonaws.com"
    )]
    pub s3_endpoint: String,
    #[arg(
        long,
        env = "CONSPIRE_S3_REGION",
        default_value = DEFAULT_S3_REGION,
        help = "The S3 region e.g. us-east-1"
    )]
    pub s3_region: String,
    #[arg(long, env = "CONSPIRE_S3_BUCKET", help = "The S3 bucket (e.g. my-files)")]
    pub s3_bucket: String,
    #[arg(
        long,
        env = "CONSPIRE_S3_ACCESS_KEY_ID",
        help = "S3 access key id (defaults to the AWS_* environment)"
    )]
    pub s3_access_key_id: Option<String>,
    #[arg(
        long,
        env = "CONSPIRE_S3_SECRET_ACCESS_KEY",
        hide_env_values = true,
        help = "S3 secret access key"
    )]
    pub s3_secret_access_key: Option<String>,
    #[arg(
        long,
        env = "CONSPIRE_CACHE_CONTROL",
        default_value = DEFAULT_CACHE_CONTROL,
        help = "Cache-Control string for uploaded and served objects"
    )]
    pub cache_control: String,
    #[arg(
        long,
        env = "CONSPIRE_SET_PUBLIC_ACL",
        help = "Set a public read ACL on uploaded objects"
    )]
    pub set_public_acl: bool,
    #[arg(
        long,
        env = "CONSPIRE_PUBLIC_FETCH_URL",
        help = "Fetch downloads from this URL instead of the S3 API"
    )]
    pub public_fetch_url: Option<String>,
    #[arg(
        long,
        env = "CONSPIRE_FORBIDDEN_IS_404",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Report 403 responses from the public fetch URL as 404"
    )]
    pub forbidden_is_404: bool,
    #[arg(
        long,
        env = "CONSPIRE_RANDOM_INDEX",
        help = "Serve a random tenant's index and favicon to unknown hostnames"
    )]
    pub random_index: bool,
    #[arg(
        long,
        env = "CONSPIRE_LINK_PREVIEW_EMBEDS",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Serve HTML embeds of images to link-preview crawlers"
    )]
    pub link_preview_embeds: bool,
    #[arg(
        short = 'u',
        long,
        env = "CONSPIRE_USERS_FILE",
        default_value = DEFAULT_USERS_FILE,
        help = "JSON file with upload credentials"
    )]
    pub users_file: String,
    #[arg(
        long,
        env = "CONSPIRE_STATIC_DIR",
        help = "Directory with index/ and favicon/ assets (defaults to embedded assets)"
    )]
    pub static_dir: Option<String>,
    #[arg(
        long,
        env = "CONSPIRE_STORAGE_TIMEOUT_SECS",
        default_value_t = DEFAULT_STORAGE_TIMEOUT_SECS,
        help = "Timeout for each object store call in seconds"
    )]
    pub storage_timeout_secs: u64,
    #[arg(
        long,
        env = "CONSPIRE_BODY_LIMIT",
        default_value_t = DEFAULT_BODY_LIMIT,
        help = "Max upload request size in bytes"
    )]
    pub body_limit: usize,
    #[arg(long, env = "CONSPIRE_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long = "attribution",
        value_name = "HOST=TEXT",
        help = "X-Attribution header for a hostname (repeatable)"
    )]
    pub attributions: Vec<String>,
}

/// 启动时构建一次、之后只读的网关配置。
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub s3_endpoint: String,
    pub s3_region: String,
    pub bucket: String,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
    pub default_cache_control: String,
    pub set_public_acl: bool,
    pub public_fetch_url: Option<Url>,
    pub forbidden_is_404: bool,
    pub random_index: bool,
    pub link_preview_embeds: bool,
    pub users_file: PathBuf,
    pub static_dir: Option<PathBuf>,
    pub storage_timeout: Duration,
    pub body_limit: usize,
    pub cors_origins: Option<String>,
    pub attributions: HashMap<String, String>,
}

impl GatewayConfig {
    /// 校验并转换命令行参数，失败时返回可读的错误说明。
    pub fn from_args(args: Args) -> Result<Self, String> {
        let bind = args
            .host
            .parse::<IpAddr>()
            .map_err(|err| format!("invalid bind address {}: {err}", args.host))?;
        if args.s3_bucket.trim().is_empty() {
            return Err("s3 bucket is required".into());
        }
        if args.s3_access_key_id.is_some() != args.s3_secret_access_key.is_some() {
            return Err("s3 access key id and secret access key must be set together".into());
        }
        let public_fetch_url = args
            .public_fetch_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| {
                Url::parse(value).map_err(|err| format!("invalid public fetch url {value}: {err}"))
            })
            .transpose()?;
        let attributions = args
            .attributions
            .iter()
            .map(|pair| parse_attribution(pair))
            .collect::<Result<HashMap<_, _>, _>>()?;

        Ok(Self {
            bind,
            port: args.port,
            s3_endpoint: normalize_endpoint(&args.s3_endpoint),
            s3_region: args.s3_region,
            bucket: args.s3_bucket,
            s3_access_key_id: args.s3_access_key_id,
            s3_secret_access_key: args.s3_secret_access_key,
            default_cache_control: args.cache_control,
            set_public_acl: args.set_public_acl,
            public_fetch_url,
            forbidden_is_404: args.forbidden_is_404,
            random_index: args.random_index,
            link_preview_embeds: args.link_preview_embeds,
            users_file: PathBuf::from(args.users_file),
            static_dir: args.static_dir.map(PathBuf::from),
            storage_timeout: Duration::from_secs(args.storage_timeout_secs),
            body_limit: args.body_limit,
            cors_origins: args.cors_origins,
            attributions,
        })
    }
}

/// 未带协议的端点默认使用 https。
fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

fn parse_attribution(pair: &str) -> Result<(String, String), String> {
    let (host, text) = pair
        .split_once('=')
        .ok_or_else(|| format!("invalid attribution {pair}, expected HOST=TEXT"))?;
    let host = host.trim().to_ascii_lowercase();
    if host.is_empty() || text.trim().is_empty() {
        return Err(format!("invalid attribution {pair}, expected HOST=TEXT"));
    }
    Ok((host, text.trim().to_string()))
}
