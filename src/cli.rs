use clap::Parser;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::io::CannedAcl;
use crate::upload::MIB;

#[derive(Parser, Debug)]
#[command(name = "s3-unzip")]
#[command(version)]
#[command(about = "Stream ZIP archives out of S3 and upload their entries back with multipart uploads", long_about = None)]
#[command(after_help = "Examples:\n  \
  s3-unzip s3://bucket/input output                   unzip every application/zip object under input/\n  \
  s3-unzip s3://bucket/in/a.zip out --single          unzip exactly one object\n  \
  s3-unzip s3://bucket/in out --split --header        split text entries into 100 MiB shards\n  \
  s3-unzip s3://bucket/in out --key-matches '.*\\.zip' --endpoint http://localhost:9000")]
pub struct Cli {
    /// Input location, s3://bucket/prefix (or s3://bucket/key with --single)
    #[arg(value_name = "INPUT")]
    pub input: S3Location,

    /// Output key prefix in the same bucket
    #[arg(value_name = "OUTPUT_PREFIX")]
    pub output_prefix: String,

    /// Treat INPUT as a single object key
    #[arg(long, conflicts_with_all = ["key_contains", "key_matches"])]
    pub single: bool,

    /// Only unzip objects whose key contains this string
    #[arg(long, value_name = "STRING", conflicts_with = "key_matches")]
    pub key_contains: Option<String>,

    /// Only unzip objects whose whole key matches this regex
    #[arg(long, value_name = "REGEX")]
    pub key_matches: Option<String>,

    /// Allowed input Content-Types; pass an empty string to accept all
    #[arg(long, value_name = "TYPES", value_delimiter = ',', default_value = "application/zip")]
    pub input_content_types: Vec<String>,

    /// Keep going when an object fails
    #[arg(long)]
    pub continue_on_error: bool,

    /// Split text entries into line-aligned shards
    #[arg(long)]
    pub split: bool,

    /// Repeat the first line of each entry at the top of every shard
    #[arg(long, requires = "split")]
    pub header: bool,

    /// Shard size for --split (e.g. 100MiB)
    #[arg(long, value_name = "SIZE", default_value = "100MiB", value_parser = parse_size)]
    pub file_bytes_limit: u64,

    /// Line delimiter for --split
    #[arg(long, value_name = "DELIM", default_value = "\n", hide_default_value = true)]
    pub delimiter: String,

    /// Multipart part size, at least 5MiB
    #[arg(long, value_name = "SIZE", default_value = "20MiB", value_parser = parse_size)]
    pub part_bytes_limit: u64,

    /// Concurrent part uploads per output object
    #[arg(long, value_name = "N", default_value_t = 4)]
    pub threads: usize,

    /// Parts queued ahead of the workers before reading pauses
    #[arg(long, value_name = "N", default_value_t = 4)]
    pub queue: usize,

    /// Seconds to wait for upload workers when aborting
    #[arg(long, value_name = "SECS", default_value_t = 2)]
    pub await_termination: u64,

    /// Content-Type of the output objects
    #[arg(long, value_name = "TYPE")]
    pub content_type: Option<String>,

    /// Canned ACL of the output objects
    #[arg(long, value_name = "ACL")]
    pub acl: Option<CannedAcl>,

    /// Tag added to every output object (KEY=VALUE, repeatable)
    #[arg(long, value_name = "KEY=VALUE", value_parser = parse_tag)]
    pub tag: Vec<(String, String)>,

    /// S3 endpoint URL (default: AWS_ENDPOINT_URL or AWS for the region)
    #[arg(long, value_name = "URL")]
    pub endpoint: Option<String>,

    /// Region (default: AWS_REGION or us-east-1)
    #[arg(long, value_name = "REGION")]
    pub region: Option<String>,

    /// Use bucket.endpoint addressing instead of endpoint/bucket
    #[arg(long)]
    pub virtual_hosted: bool,

    /// Request timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    pub timeout: u64,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count, conflicts_with = "verbose")]
    pub quiet: u8,

    /// Verbose mode (-vv => trace)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Default log filter for the requested verbosity.
    pub fn log_level(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (q, _) if q > 1 => "error",
            (1, _) => "warn",
            (_, 0) => "info",
            (_, 1) => "debug",
            _ => "trace",
        }
    }

    pub fn await_termination(&self) -> Duration {
        Duration::from_secs(self.await_termination)
    }

    /// Allowed content types with empty values dropped.
    pub fn content_types(&self) -> Vec<String> {
        self.input_content_types
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// `s3://bucket/prefix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    pub bucket: String,
    pub key: String,
}

impl FromStr for S3Location {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("s3://")
            .ok_or_else(|| format!("expected s3://bucket/prefix, got {s}"))?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(format!("missing bucket in {s}"));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

impl fmt::Display for S3Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Parse `1048576`, `512KiB`, `20MiB`, `1GiB`, `10MB` and friends.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid size: {s}"))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1000,
        "kib" | "k" => 1024,
        "mb" => 1000 * 1000,
        "mib" | "m" => MIB as u64,
        "gb" => 1000 * 1000 * 1000,
        "gib" | "g" => 1024 * MIB as u64,
        other => return Err(format!("unknown size unit: {other}")),
    };
    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size too large: {s}"))
}

fn parse_tag(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {s}"))?;
    Ok((key.to_string(), value.to_string()))
}
