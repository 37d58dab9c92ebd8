use std::path::Path;

use sluice_core::error::{Result, SluiceError};

const TEMPLATE: &str = "\
# sluice configuration
#
# All values except server.base_url are optional and shown with their
# defaults.

server:
  base_url: https://files.example.com/api
  # access_token: \"...\"
  # connect_timeout_seconds: 30
  # request_timeout_seconds: 30
  # chunk_timeout_seconds: 60

transfer:
  # Upload chunk size in bytes (also the hashing granularity).
  chunk_size: 2097152
  # Simultaneously in-flight chunk uploads per file (1-16).
  max_concurrent_uploads: 3
  # Adopt the server's chunk-size hint when no explicit size is given.
  honor_server_chunk_size: true
  # Run the post-merge integrity check.
  validate_after_merge: true
  retry:
    max_retries: 3
    retry_delay_ms: 500
    retry_max_delay_ms: 10000

pool:
  # Hash worker threads (0 = host parallelism).
  max_workers: 0
  max_tasks_per_worker: 5

# Directory for the local resume cache.
# cache_dir: ~/.cache/sluice
";

/// Write a starter configuration file.
pub(crate) fn run(dest: Option<&str>) -> Result<()> {
    let dest = dest.unwrap_or("sluice.yaml");
    let path = Path::new(dest);
    if path.exists() {
        return Err(SluiceError::Config(format!(
            "refusing to overwrite existing file: {dest}"
        )));
    }
    std::fs::write(path, TEMPLATE).map_err(SluiceError::Io)?;
    println!("Wrote starter configuration to {dest}.");
    println!("Edit server.base_url before uploading.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_parses_and_validates() {
        let config: sluice_core::config::SluiceConfig = serde_yaml::from_str(TEMPLATE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.transfer.chunk_size, 2 * 1024 * 1024);
    }

    #[test]
    fn refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("sluice.yaml");
        std::fs::write(&dest, "x").unwrap();
        let result = run(Some(dest.to_str().unwrap()));
        assert!(matches!(result, Err(SluiceError::Config(_))));
    }

    #[test]
    fn writes_template() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("fresh.yaml");
        run(Some(dest.to_str().unwrap())).unwrap();
        let written = std::fs::read_to_string(&dest).unwrap();
        assert!(written.contains("base_url"));
    }
}
