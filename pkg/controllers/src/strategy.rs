use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use pkg_types::strategy::{StrategySet, StrategySource};

use crate::error::ScalingError;
use crate::store::StrategyFetcher;

/// Hex SHA-256 of raw source bytes, used to skip reloads of unchanged content.
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Parse a fetched strategy document.
pub fn parse_strategies(bytes: &[u8]) -> Result<StrategySet, ScalingError> {
    StrategySet::from_slice(bytes)
        .map_err(|e| ScalingError::Config(format!("invalid strategy document: {}", e)))
}

/// Reads strategy sources from the local filesystem or over HTTP.
pub struct SourceFetcher {
    http: reqwest::Client,
}

impl SourceFetcher {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for SourceFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StrategyFetcher for SourceFetcher {
    async fn fetch(&self, source: &StrategySource) -> anyhow::Result<Vec<u8>> {
        match source {
            StrategySource::Local { path } => {
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("read local strategies file {}", path))?;
                debug!("Read {} bytes of strategies from {}", bytes.len(), path);
                Ok(bytes)
            }
            StrategySource::Remote { url } => {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .with_context(|| format!("fetch strategies from {}", url))?
                    .error_for_status()
                    .with_context(|| format!("fetch strategies from {}", url))?;
                let bytes = response
                    .bytes()
                    .await
                    .with_context(|| format!("read strategies body from {}", url))?;
                debug!("Fetched {} bytes of strategies from {}", bytes.len(), url);
                Ok(bytes.to_vec())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_tracks_every_byte() {
        let a = fingerprint(b"strategies: []\n");
        let b = fingerprint(b"strategies: []\n");
        let c = fingerprint(b"strategies: [] \n");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn parse_errors_are_configuration_errors() {
        let err = parse_strategies(b"strategies: 7").unwrap_err();
        assert!(matches!(err, ScalingError::Config(_)));
        let set = parse_strategies(b"strategies: []").unwrap();
        assert!(set.strategies.is_empty());
    }

    #[tokio::test]
    async fn fetch_local_file() {
        let path = std::env::temp_dir().join(format!("aas-strategies-{}.yaml", std::process::id()));
        std::fs::write(&path, b"createTime: 1\n").unwrap();

        let fetcher = SourceFetcher::new();
        let source = StrategySource::Local {
            path: path.to_string_lossy().to_string(),
        };
        let bytes = fetcher.fetch(&source).await.unwrap();
        assert_eq!(bytes, b"createTime: 1\n");

        std::fs::remove_file(&path).unwrap();
        assert!(fetcher.fetch(&source).await.is_err());
    }
}
