//! Component E: the reload controller.
//!
//! Keeps the zone index (component A) and record store cache
//! (component B) in sync with the external key-value store, by two
//! independent mechanisms that both call back into the same engine:
//!
//! - a periodic full reload, which re-reads the `zones` set and
//!   republishes a fresh [`ZoneIndex`] snapshot every tick;
//! - an event-driven reload, subscribed to the KVS's keyspace
//!   notifications, which invalidates exactly the cache entry (or
//!   rebuilds exactly the index) a notification says changed.
//!
//! Either one alone satisfies eventual consistency; running both
//! means a change is usually picked up immediately, with the periodic
//! sweep as a backstop if a notification is ever missed.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use dns_types::protocol::types::DomainName;
use dns_types::zones::types::Zones;

use crate::engine::ResolverEngine;
use crate::record_store::{Kvs, KeyNaming};

/// What a keyspace notification's channel name decoded to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Notification {
    /// The `zones` set changed membership: rebuild the whole index.
    ZoneSet,
    /// A `zones:<origin>` hash or `zones:<origin>:config` string
    /// changed: invalidate just that origin's cached bundles/config.
    Zone(DomainName),
}

/// Decode a `__keyspace@<db>__:<key>` (or `__keyevent@<db>__:<event>`)
/// channel name into what changed, given the key naming in use.
/// Returns `None` for channels this controller has no reaction to.
fn parse_notification(channel: &str, naming: &KeyNaming) -> Option<Notification> {
    let (_, key) = channel.split_once("__:")?;
    let body = naming.strip(key)?;

    if body == "zones" {
        return Some(Notification::ZoneSet);
    }

    let rest = body.strip_prefix("zones:")?;
    let origin_str = rest.strip_suffix(":config").unwrap_or(rest);
    DomainName::from_dotted_string(origin_str).map(Notification::Zone)
}

pub struct ReloadController<K: Kvs> {
    engine: Arc<ResolverEngine<K>>,
    naming: KeyNaming,
}

impl<K: Kvs> ReloadController<K> {
    pub fn new(engine: Arc<ResolverEngine<K>>, naming: KeyNaming) -> Self {
        Self { engine, naming }
    }

    /// Re-read the `zones` set and publish a fresh index snapshot.
    pub async fn reload_once(&self) {
        let origins = self.engine.record_store().list_origins().await;
        let count = origins.len();
        self.engine.zone_index().swap(Zones::from_origins(origins));
        tracing::debug!(zones = %count, "reloaded zone index");
    }

    /// Run the periodic reload forever, once every `interval`.
    pub async fn run_periodic(&self, interval: Duration) -> ! {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.reload_once().await;
        }
    }

    /// Subscribe to keyspace notifications on the `zones` set and all
    /// `zones:<origin>` keys, reacting to each as it arrives. Runs
    /// until the subscription itself fails (e.g. the connection
    /// drops); the caller should restart it after a backoff - the
    /// periodic reload keeps the index eventually consistent in the
    /// meantime.
    pub async fn run_keyspace_notifications(&self, client: redis::Client) -> redis::RedisResult<()> {
        let mut pubsub = client.get_async_pubsub().await?;
        // `AK` in the design's keyspace-notification config means both
        // keyspace (`K`) and keyevent (`E` is not requested) channels
        // for every key type (`A`) are enabled; we only need the
        // keyspace form, pattern-matched across every database index.
        pubsub.psubscribe("__keyspace@*__:*").await?;

        let mut messages = pubsub.on_message();
        while let Some(message) = messages.next().await {
            let channel = message.get_channel_name();
            match parse_notification(channel, &self.naming) {
                Some(Notification::ZoneSet) => {
                    tracing::debug!(%channel, "zones set changed");
                    self.reload_once().await;
                }
                Some(Notification::Zone(origin)) => {
                    tracing::debug!(%channel, origin = %origin.to_dotted_string(), "zone data changed");
                    self.engine.record_store().invalidate(&origin);
                }
                None => {}
            }
        }

        Ok(())
    }
}
