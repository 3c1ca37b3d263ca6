//! Command-line entry point for s3-unzip.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use s3_unzip::{
    Cli, FailurePolicy, NoSplitStrategy, ObjectStore, S3Client, S3Config, SplitTextStrategy,
    UnzipManager, UnzipReport, UploadConfig, human_bytes,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level())),
        )
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, aborting uploads");
            on_signal.cancel();
        }
    });

    let client = Arc::new(S3Client::new(s3_config(&cli))?);
    let store: Arc<dyn ObjectStore> = client.clone();
    let manager = build_manager(&cli, store, cancel)?;

    let bucket = &cli.input.bucket;
    let key = &cli.input.key;
    let report = if cli.single {
        if key.is_empty() {
            bail!("--single needs an object key: {}", cli.input);
        }
        let object = manager
            .unzip_object(bucket, key, &cli.output_prefix)
            .await
            .with_context(|| format!("failed to unzip {}", cli.input))?;
        UnzipReport {
            processed: vec![object],
            ..Default::default()
        }
    } else if let Some(needle) = &cli.key_contains {
        manager
            .unzip_objects_key_containing(bucket, key, &cli.output_prefix, needle)
            .await?
    } else if let Some(pattern) = &cli.key_matches {
        manager
            .unzip_objects_key_matching(bucket, key, &cli.output_prefix, pattern)
            .await?
    } else {
        manager
            .unzip_objects(bucket, key, &cli.output_prefix)
            .await?
    };

    info!(
        objects = report.processed.len(),
        skipped = report.skipped.len(),
        entries = report.entries_unzipped(),
        outputs = report.output_keys().len(),
        uploaded = %human_bytes(client.uploaded_bytes()),
        "done"
    );
    for failure in &report.failures {
        error!(
            key = %failure.key,
            error = %failure.error,
            cause = %failure.error.root_cause(),
            "object failed"
        );
    }
    if !report.failures.is_empty() {
        bail!("{} object(s) failed", report.failures.len());
    }
    Ok(())
}

fn s3_config(cli: &Cli) -> S3Config {
    let mut config = S3Config::from_env()
        .with_path_style(!cli.virtual_hosted)
        .with_timeout(Duration::from_secs(cli.timeout));
    if let Some(region) = &cli.region {
        let endpoint_from_region = S3Config::new(config.region.clone()).endpoint;
        if config.endpoint == endpoint_from_region {
            config.endpoint = S3Config::new(region.clone()).endpoint;
        }
        config.region = region.clone();
    }
    if let Some(endpoint) = &cli.endpoint {
        config = config.with_endpoint(endpoint.clone());
    }
    config
}

fn build_manager(
    cli: &Cli,
    store: Arc<dyn ObjectStore>,
    cancel: CancellationToken,
) -> Result<UnzipManager> {
    let part_bytes_limit =
        usize::try_from(cli.part_bytes_limit).context("part size does not fit in memory")?;
    let mut upload = UploadConfig::default()
        .with_upload_part_bytes_limit(part_bytes_limit)
        .with_thread_count(cli.threads)
        .with_queue_size(cli.queue)
        .with_await_termination(cli.await_termination());
    if let Some(content_type) = &cli.content_type {
        upload = upload.with_content_type(content_type.clone());
    }
    if let Some(acl) = cli.acl {
        upload = upload.with_canned_acl(acl);
    }
    if !cli.tag.is_empty() {
        let tags = cli.tag.clone();
        upload = upload.with_initiate_hook(move |request| {
            request.tagging.extend(tags.iter().cloned());
        });
    }

    let manager = if cli.split {
        let strategy = SplitTextStrategy::new()
            .with_header(cli.header)
            .with_file_bytes_limit(cli.file_bytes_limit)
            .with_delimiter(cli.delimiter.as_bytes());
        UnzipManager::new(store, strategy)
    } else {
        UnzipManager::new(store, NoSplitStrategy)
    };

    let policy = if cli.continue_on_error {
        FailurePolicy::Continue
    } else {
        FailurePolicy::FailFast
    };

    Ok(manager
        .with_content_types(cli.content_types())
        .with_upload_config(upload)
        .with_failure_policy(policy)
        .with_cancellation(cancel))
}
