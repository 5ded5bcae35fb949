use crate::{dns, Error, Result};
use base64::Engine;
use std::{collections::HashMap, sync::RwLock, time::Duration};

const DOH_TIMEOUT: Duration = Duration::from_secs(3);

/// Resolves ECH config lists via DNS-over-HTTPS (HTTPS resource record,
/// SvcParam 5) and caches them for the lifetime of the process. New
/// connections never depend on a fresher list within one run, so cache
/// entries do not expire; failed lookups are not cached and will be
/// retried by the next connection.
pub struct EchResolver {
    doh_url: String,
    cache: RwLock<HashMap<String, Vec<u8>>>,
    /// Serializes cache misses so one domain is fetched at most once.
    flight: tokio::sync::Mutex<()>,
}

impl EchResolver {
    pub fn new(doh_url: impl Into<String>) -> Self {
        Self {
            doh_url: doh_url.into(),
            cache: RwLock::new(HashMap::new()),
            flight: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn resolve(&self, domain: &str) -> Result<Vec<u8>> {
        if let Some(hit) = self.cache.read().unwrap().get(domain) {
            return Ok(hit.clone());
        }

        let _flight = self.flight.lock().await;
        if let Some(hit) = self.cache.read().unwrap().get(domain) {
            return Ok(hit.clone());
        }

        let list = self.fetch(domain).await?;
        log::info!("[ECH] cached config list for {domain} ({} bytes)", list.len());
        self.cache
            .write()
            .unwrap()
            .insert(domain.to_string(), list.clone());
        Ok(list)
    }

    async fn fetch(&self, domain: &str) -> Result<Vec<u8>> {
        if self.doh_url.is_empty() {
            return Err(Error::Dns("no DoH endpoint configured".into()));
        }

        let query = dns::build_https_query(domain)?;
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(query);

        // One-shot client: DoH endpoints sit behind anycast, reusing a
        // pooled connection pins us to a possibly-dead backend.
        let client = reqwest::Client::builder()
            .timeout(DOH_TIMEOUT)
            .pool_max_idle_per_host(0)
            .build()?;
        let url = format!("{}?dns={}", self.doh_url, encoded);
        let response = client
            .get(&url)
            .header("Accept", "application/dns-message")
            .send()
            .await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(Error::Dns(format!("doh status {}", response.status())));
        }
        let body = response.bytes().await?;
        dns::extract_ech_config(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_hit_skips_network() {
        let resolver = EchResolver::new("");
        resolver
            .cache
            .write()
            .unwrap()
            .insert("cached.example".into(), vec![1, 2, 3]);
        // Would fail with "no DoH endpoint" if the fetch path ran.
        assert_eq!(resolver.resolve("cached.example").await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failed_lookup_is_not_cached() {
        let resolver = EchResolver::new("");
        assert!(resolver.resolve("miss.example").await.is_err());
        assert!(resolver.cache.read().unwrap().is_empty());
    }
}
