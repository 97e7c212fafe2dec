//! Address enrichment
//!
//! Resolves an extracted contract address into a token snapshot:
//! cache hit wins, otherwise a single on-demand fetch. Concurrent
//! misses for the same key collapse into one upstream call.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::cache::TokenInfoCache;
use crate::extract::ContractAddress;
use crate::price::TokenInfo;

pub struct AddressEnricher {
    cache: Arc<TokenInfoCache>,
    /// One leader per key; followers wait on the leader's broadcast
    in_flight: Arc<DashMap<ContractAddress, broadcast::Sender<Option<TokenInfo>>>>,
}

impl AddressEnricher {
    pub fn new(cache: Arc<TokenInfoCache>) -> Self {
        Self {
            cache,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Resolve an address to a token snapshot, or None if the token
    /// can't be identified right now.
    ///
    /// None is a skip-this-address signal, never a pipeline fault:
    /// upstream outages, rate limits and plain not-a-token strings all
    /// land here.
    pub async fn enrich(&self, address: &ContractAddress) -> Option<TokenInfo> {
        if let Some(info) = self.cache.get(address) {
            if info.stale {
                // Serve the snapshot we have; freshen it out of band
                self.spawn_stale_refresh(address.clone());
            }
            return Some(info);
        }

        // Join an in-flight fetch for this key, or become its leader.
        // The map guard is only held for the entry manipulation itself.
        let follower_rx = match self.in_flight.entry(address.clone()) {
            Entry::Occupied(entry) => Some(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (tx, _) = broadcast::channel(1);
                entry.insert(tx);
                None
            }
        };

        if let Some(mut rx) = follower_rx {
            return match rx.recv().await {
                Ok(result) => result,
                // Leader vanished without publishing; the cache has the
                // answer if it succeeded
                Err(_) => self.cache.get(address),
            };
        }

        // A prior leader may have finished between our cache miss and
        // taking the entry; a fresh read avoids a duplicate fetch.
        let result = match self.cache.get(address) {
            Some(info) => Some(info),
            None => match self.cache.refresh_one(address).await {
                Ok(info) => Some(info),
                Err(e) => {
                    debug!(address = %address, "Enrichment miss: {}", e);
                    None
                }
            },
        };

        if let Some((_, tx)) = self.in_flight.remove(address) {
            let _ = tx.send(result.clone());
        }
        result
    }

    /// Kick off a background refresh for a stale entry, unless a fetch
    /// for this key is already in flight
    fn spawn_stale_refresh(&self, address: ContractAddress) {
        match self.in_flight.entry(address.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(entry) => {
                let (tx, _) = broadcast::channel(1);
                entry.insert(tx);
            }
        }

        let cache = self.cache.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            let result = match cache.refresh_one(&address).await {
                Ok(info) => Some(info),
                Err(e) => {
                    debug!(address = %address, "Stale refresh failed: {}", e);
                    None
                }
            };
            if let Some((_, tx)) = in_flight.remove(&address) {
                let _ = tx.send(result);
            }
        });
    }
}
