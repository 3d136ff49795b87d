//! Centralized server configuration, combining environment variables and CLI arguments.
//!
//! Flags win over environment variables; the pipeline tunables come straight from the
//! `baler` library's own clap surface.  Everything is loaded once at startup and then
//! never mutated.
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::env;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "HTTP service that bales object storage prefixes into tar.gz archives"
)]
pub struct Args {
    /// Host to bind to (overrides BALER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (overrides BALER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Bucket that source prefixes are read from (overrides BALER_SOURCE_BUCKET)
    #[arg(long)]
    pub source_bucket: Option<String>,

    /// Bucket that finished archives are written to (overrides BALER_DEST_BUCKET)
    #[arg(long)]
    pub dest_bucket: Option<String>,

    #[command(flatten)]
    pub pipeline: baler::Config,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub source_bucket: String,
    pub dest_bucket: String,
    pub pipeline: baler::Config,
}

impl ServerConfig {
    /// Parse CLI args, fall back to `BALER_*` environment variables, and fail fast on
    /// anything required that's missing.
    ///
    /// AWS region and credentials are not handled here; the SDK reads those from its own
    /// standard environment/provider chain.
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();

        let env_host = env::var("BALER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("BALER_PORT") {
            Ok(value) => Some(
                value
                    .parse::<u16>()
                    .with_context(|| format!("parsing BALER_PORT value `{value}`"))?,
            ),
            Err(env::VarError::NotPresent) => None,
            Err(err) => return Err(err).context("reading BALER_PORT"),
        };

        let source_bucket = match args.source_bucket.or_else(|| env::var("BALER_SOURCE_BUCKET").ok())
        {
            Some(bucket) if !bucket.is_empty() => bucket,
            _ => bail!("a source bucket is required; set BALER_SOURCE_BUCKET or pass --source-bucket"),
        };
        let dest_bucket = match args.dest_bucket.or_else(|| env::var("BALER_DEST_BUCKET").ok()) {
            Some(bucket) if !bucket.is_empty() => bucket,
            _ => bail!("a destination bucket is required; set BALER_DEST_BUCKET or pass --dest-bucket"),
        };

        let mut pipeline = args.pipeline;
        if pipeline.s3_endpoint.is_none() {
            if let Ok(endpoint) = env::var("BALER_S3_ENDPOINT") {
                pipeline.s3_endpoint = Some(
                    endpoint
                        .parse()
                        .with_context(|| format!("parsing BALER_S3_ENDPOINT value `{endpoint}`"))?,
                );
            }
        }

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.or(env_port).unwrap_or(3000),
            source_bucket,
            dest_bucket,
            pipeline,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
