//! Object store configuration for the unit cache.
//!
//! The cache lives either on the local filesystem or in an S3 bucket. Both
//! are reached through `object_store`, so the cache code never touches
//! `std::fs` for persisted state.

use crate::config::CacheConfig;
use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

/// Parse an S3 URI into bucket and key components.
///
/// Accepts `s3://bucket/key/path` and `s3://bucket` (empty key).
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str)> {
    let without_scheme = uri
        .strip_prefix("s3://")
        .with_context(|| format!("Invalid S3 URI: expected 's3://' prefix in '{}'", uri))?;

    let (bucket, key) = without_scheme.split_once('/').unwrap_or((without_scheme, ""));
    if bucket.is_empty() {
        anyhow::bail!("Invalid S3 URI: missing bucket name in '{}'", uri);
    }
    Ok((bucket, key.trim_end_matches('/')))
}

/// Client options for cache uploads and downloads.
///
/// Unit tables are large sequential objects, so the request timeout is
/// generous and the idle pool small.
fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        .with_timeout(Duration::from_secs(300))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(16)
}

/// Retry configuration for transient failures.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        // Initial backoff (doubles each retry)
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        // Retry on 429 (rate limiting) and 5xx (server errors)
        retry_timeout: Duration::from_secs(180),
    }
}

/// Create an authenticated S3 client.
///
/// Credentials and region are loaded from (in order):
/// - Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_REGION)
/// - AWS config files (~/.aws/credentials, ~/.aws/config)
/// - EC2 instance profile (IMDS)
fn create_authenticated_store(bucket: &str) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!("Creating authenticated S3 client for bucket: {}", bucket);

    let builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(create_client_options())
        .with_retry(create_retry_config())
        .with_virtual_hosted_style_request(true);

    Ok(Arc::new(builder.build()?))
}

/// Create the store backing the unit cache, plus the key prefix inside it.
///
/// A local location becomes a `LocalFileSystem` rooted at that directory
/// (empty prefix); `s3://bucket/prefix` becomes an S3 client with `prefix`.
pub fn create_cache_store(config: &CacheConfig) -> Result<(Arc<dyn ObjectStore>, Path)> {
    if config.is_local() {
        let path = std::path::Path::new(&config.location);
        if !path.exists() {
            std::fs::create_dir_all(path)
                .with_context(|| format!("Failed to create cache directory {}", path.display()))?;
        }
        tracing::info!("Using local cache at: {}", path.display());
        Ok((
            Arc::new(LocalFileSystem::new_with_prefix(path)?),
            Path::default(),
        ))
    } else {
        let (bucket, key) = parse_s3_uri(&config.location)?;
        tracing::info!("Using S3 cache at: s3://{}/{}", bucket, key);
        Ok((create_authenticated_store(bucket)?, Path::from(key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_authenticated_store() {
        let result = create_authenticated_store("test-bucket");
        assert!(result.is_ok());
    }

    #[test]
    fn test_local_cache_store_creates_directory() {
        let dir = TempDir::new().unwrap();
        let location = dir.path().join("nested/cache");
        let config = CacheConfig {
            location: location.to_string_lossy().to_string(),
        };

        let (_, prefix) = create_cache_store(&config).unwrap();
        assert!(location.is_dir());
        assert_eq!(prefix.as_ref(), "");
    }

    #[test]
    fn test_s3_cache_prefix() {
        let config = CacheConfig {
            location: "s3://genomics-cache/imputed/v2".to_string(),
        };
        let (_, prefix) = create_cache_store(&config).unwrap();
        assert_eq!(prefix.as_ref(), "imputed/v2");
    }

    #[test]
    fn test_parse_s3_uri() {
        let (bucket, key) = parse_s3_uri("s3://my-bucket/path/to/cache").unwrap();
        assert_eq!(bucket, "my-bucket");
        assert_eq!(key, "path/to/cache");

        let (bucket, key) = parse_s3_uri("s3://bucket/cache").unwrap();
        assert_eq!(bucket, "bucket");
        assert_eq!(key, "cache");
    }

    #[test]
    fn test_parse_s3_uri_bucket_only() {
        assert_eq!(parse_s3_uri("s3://bucket").unwrap(), ("bucket", ""));
        assert_eq!(parse_s3_uri("s3://bucket/").unwrap(), ("bucket", ""));

        let config = CacheConfig {
            location: "s3://genomics-cache".to_string(),
        };
        let (_, prefix) = create_cache_store(&config).unwrap();
        assert_eq!(prefix.as_ref(), "");
    }

    #[test]
    fn test_parse_s3_uri_invalid() {
        assert!(parse_s3_uri("bucket/key").is_err());
        assert!(parse_s3_uri("http://bucket/key").is_err());
        assert!(parse_s3_uri("s3://").is_err());
        assert!(parse_s3_uri("s3:///key").is_err());
    }
}
