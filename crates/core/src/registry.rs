use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::channel::{Channel, ChannelConfig, ChannelInfo};
use crate::pool::PacketPool;
use crate::session::Session;

/// Registry of named channels.
///
/// Channels are created on demand by ANNOUNCE and retired once the last
/// session leaves them. An optional default channel serves request targets
/// that name none, e.g. `rtsp://host:8554/`, and is never retired.
#[derive(Clone)]
pub struct Registry {
    channels: Arc<RwLock<HashMap<String, Arc<Channel>>>>,
    default_channel: Option<String>,
    config: ChannelConfig,
    pool: PacketPool,
}

impl Registry {
    pub fn new(config: ChannelConfig, pool: PacketPool, default_channel: Option<&str>) -> Self {
        let registry = Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            default_channel: default_channel.map(str::to_string),
            config,
            pool,
        };
        if let Some(name) = default_channel {
            registry.get_or_create(name);
        }
        registry
    }

    /// Channel name addressed by a request target segment, falling back to
    /// the default channel when empty.
    pub fn resolve_name<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        if name.is_empty() {
            self.default_channel.as_deref()
        } else {
            Some(name)
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<Channel> {
        if let Some(channel) = self.get(name) {
            return channel;
        }
        let mut channels = self.channels.write();
        channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Channel::new(name, self.config, self.pool.clone())))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.read().get(name).cloned()
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.read().values().cloned().collect()
    }

    /// Unregister `session` from every channel, as producer and as
    /// subscriber, then retire channels left vacant. Returns how many
    /// channels the session was removed from.
    pub fn teardown(&self, session: &Session) -> usize {
        // Collect first: channel teardown joins delivery workers.
        let channels = self.channels();
        let removed = channels.iter().filter(|c| c.teardown(session)).count();
        drop(channels);
        if removed > 0 {
            tracing::debug!(session_id = %session.id(), removed, "session unregistered from channels");
        }
        self.retire_vacant();
        removed
    }

    /// Drop every non-default channel with no producer, no subscribers and
    /// no outside reference. A handle held elsewhere (an ANNOUNCE in flight,
    /// a cached UDP route) defers retirement to a later sweep.
    fn retire_vacant(&self) {
        let retired: Vec<Arc<Channel>> = {
            let mut channels = self.channels.write();
            let names: Vec<String> = channels
                .iter()
                .filter(|(name, channel)| {
                    self.default_channel.as_deref() != Some(name.as_str())
                        && Arc::strong_count(channel) == 1
                        && channel.is_vacant()
                })
                .map(|(name, _)| name.clone())
                .collect();
            names.iter().filter_map(|name| channels.remove(name)).collect()
        };
        // Dropped outside the map lock.
        for channel in retired {
            tracing::info!(channel = %channel.name(), "channel retired");
        }
    }

    /// Producer and subscribers of every channel, ordered by name.
    pub fn snapshot(&self) -> Vec<ChannelInfo> {
        let mut infos: Vec<ChannelInfo> = self.channels().iter().map(|c| c.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }
}

/// Split a request target into (channel name, control id).
///
/// `rtsp://host:8554/cam1/streamid=0` → (`cam1`, `streamid=0`)
/// `rtsp://host:8554/cam1`            → (`cam1`, ``)
/// `rtsp://host:8554`                 → (``, ``)
/// `/cam1/trackID=1?x=y`              → (`cam1`, `trackID=1`)
/// `*`                                → (``, ``)
pub fn split_target(uri: &str) -> (&str, &str) {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
        .or_else(|| uri.strip_prefix("rtspu://"))
    {
        match after.find('/') {
            Some(slash) => &after[slash..],
            None => "",
        }
    } else if uri.starts_with('/') {
        uri
    } else {
        ""
    };

    let path = path.split(['?', '#']).next().unwrap_or("");
    let path = path.trim_matches('/');
    match path.split_once('/') {
        Some((channel, control)) => (channel, control),
        None => (path, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MemoryLink;

    fn registry() -> Registry {
        Registry::new(ChannelConfig::default(), PacketPool::new(4), Some("live"))
    }

    #[test]
    fn split_full_uri() {
        assert_eq!(split_target("rtsp://localhost:8554/cam1"), ("cam1", ""));
        assert_eq!(
            split_target("rtsp://localhost:8554/cam1/streamid=0"),
            ("cam1", "streamid=0")
        );
    }

    #[test]
    fn split_without_path() {
        assert_eq!(split_target("rtsp://localhost:8554"), ("", ""));
        assert_eq!(split_target("rtsp://localhost:8554/"), ("", ""));
        assert_eq!(split_target("*"), ("", ""));
    }

    #[test]
    fn split_strips_query_and_trailing_slash() {
        assert_eq!(split_target("/cam1/trackID=1?token=abc"), ("cam1", "trackID=1"));
        assert_eq!(split_target("rtsp://10.0.0.1/cam1/"), ("cam1", ""));
    }

    #[test]
    fn default_channel_exists() {
        let r = registry();
        assert!(r.get("live").is_some());
        assert_eq!(r.resolve_name(""), Some("live"));
        assert_eq!(r.resolve_name("cam1"), Some("cam1"));

        let bare = Registry::new(ChannelConfig::default(), PacketPool::new(1), None);
        assert_eq!(bare.resolve_name(""), None);
        assert!(bare.channels().is_empty());
    }

    #[test]
    fn get_or_create_is_stable() {
        let r = registry();
        let a = r.get_or_create("cam1");
        let b = r.get_or_create("cam1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(r.channels().len(), 2);
        assert!(r.get("cam2").is_none());
    }

    #[test]
    fn teardown_covers_every_channel() {
        let r = registry();
        let session = Arc::new(Session::new(Arc::new(MemoryLink::new("10.0.0.2:1000")), None));
        r.get_or_create("cam1").claim_producer(&session);
        r.get_or_create("cam2").subscribe(&session);

        assert_eq!(r.teardown(&session), 2);
        assert_eq!(r.teardown(&session), 0);

        let names: Vec<String> = r.snapshot().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["live"]);
    }

    #[test]
    fn vacant_channels_are_retired() {
        let r = registry();
        for i in 0..50 {
            let session = Arc::new(Session::new(Arc::new(MemoryLink::new("10.0.0.2:1000")), None));
            r.get_or_create(&format!("junk{i}")).claim_producer(&session);
            r.teardown(&session);
        }
        let names: Vec<String> = r.snapshot().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["live"]);
    }

    #[test]
    fn occupied_and_default_channels_survive_teardown() {
        let r = registry();
        let producer = Arc::new(Session::new(Arc::new(MemoryLink::new("10.0.0.2:1000")), None));
        let viewer = Arc::new(Session::new(Arc::new(MemoryLink::new("10.0.0.3:1000")), None));
        let other = Arc::new(Session::new(Arc::new(MemoryLink::new("10.0.0.4:1000")), None));
        r.get_or_create("cam1").claim_producer(&producer);
        r.get_or_create("cam2").subscribe(&viewer);

        assert_eq!(r.teardown(&other), 0);
        assert_eq!(r.channels().len(), 3);

        // A handle held outside the registry defers retirement.
        let held = r.get_or_create("cam3");
        r.teardown(&other);
        assert!(r.get("cam3").is_some());
        drop(held);
        r.teardown(&other);
        assert!(r.get("cam3").is_none());

        r.teardown(&producer);
        assert!(r.get("cam1").is_none());
        assert!(r.get("cam2").is_some());
        r.teardown(&viewer);
        assert!(r.get("cam2").is_none());
        assert!(r.get("live").is_some());
    }
}
