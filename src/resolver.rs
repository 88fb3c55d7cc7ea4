//! Domain resolver bridge
//!
//! Publishes `domain -> public IP` records to etcd under a fixed prefix.
//! A separately-deployed DNS server with an etcd backend serves the records;
//! this side only writes and deletes single keys.

use std::net::Ipv4Addr;

use etcd_client::Client;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::ResolverError;

/// Key prefix the external DNS resolver watches
const KEY_PREFIX: &str = "/tunneld/dns/";

/// etcd-backed resolver bridge
pub struct Resolver {
    // The etcd KV API takes &mut self; a single client behind a mutex is
    // plenty for one write per session attach/detach.
    client: Mutex<Client>,
}

impl Resolver {
    /// Connect to the etcd cluster.
    ///
    /// # Errors
    ///
    /// Returns `ResolverError::Connect` if no endpoint is reachable.
    pub async fn connect(endpoints: &[String]) -> Result<Self, ResolverError> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| ResolverError::Connect(e.to_string()))?;

        info!("Resolver connected to etcd {:?}", endpoints);

        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Publish a `domain -> public IP` record.
    ///
    /// # Errors
    ///
    /// Returns `ResolverError::Kv` if the put fails; the caller aborts the
    /// attach in that case.
    pub async fn apply(&self, domain: &str, ip: Ipv4Addr) -> Result<(), ResolverError> {
        let key = Self::key_for(domain);
        self.client
            .lock()
            .await
            .put(key.as_str(), ip.to_string(), None)
            .await
            .map_err(|e| ResolverError::kv(domain, e.to_string()))?;

        debug!("Applied domain record {} -> {}", domain, ip);
        Ok(())
    }

    /// Delete a domain record. Best-effort on detach: the caller logs the
    /// error and continues teardown.
    ///
    /// # Errors
    ///
    /// Returns `ResolverError::Kv` if the delete fails.
    pub async fn retract(&self, domain: &str) -> Result<(), ResolverError> {
        let key = Self::key_for(domain);
        self.client
            .lock()
            .await
            .delete(key.as_str(), None)
            .await
            .map_err(|e| ResolverError::kv(domain, e.to_string()))?;

        debug!("Retracted domain record {}", domain);
        Ok(())
    }

    fn key_for(domain: &str) -> String {
        format!("{KEY_PREFIX}{domain}")
    }
}
