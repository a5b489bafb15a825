//! Configured topics and the discovery requests they drive.

use std::collections::HashMap;
use std::sync::Arc;

use chainnet_net_discovery::Discovery;
use chainnet_primitives::DiscoveryKey;
use parking_lot::RwLock;
use tracing::trace;

use crate::config::TopicOptions;
use crate::error::Result;

pub(crate) struct TopicRegistry {
    discovery: Arc<dyn Discovery>,
    topics: RwLock<HashMap<DiscoveryKey, TopicOptions>>,
}

impl TopicRegistry {
    pub(crate) fn new(discovery: Arc<dyn Discovery>) -> Self {
        Self {
            discovery,
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or overwrite the options for `topic`, returning the previous ones.
    pub(crate) fn upsert(&self, topic: DiscoveryKey, options: TopicOptions) -> Option<TopicOptions> {
        self.topics.write().insert(topic, options)
    }

    /// Put back what [`upsert`](Self::upsert) replaced; `None` unregisters the topic.
    pub(crate) fn restore(&self, topic: DiscoveryKey, previous: Option<TopicOptions>) {
        let mut topics = self.topics.write();
        match previous {
            Some(options) => topics.insert(topic, options),
            None => topics.remove(&topic),
        };
    }

    pub(crate) fn remove(&self, topic: &DiscoveryKey) -> Option<TopicOptions> {
        self.topics.write().remove(topic)
    }

    pub(crate) fn contains(&self, topic: &DiscoveryKey) -> bool {
        self.topics.read().contains_key(topic)
    }

    pub(crate) fn get(&self, topic: &DiscoveryKey) -> Option<TopicOptions> {
        self.topics.read().get(topic).copied()
    }

    pub(crate) fn configured(&self) -> Vec<DiscoveryKey> {
        self.topics.read().keys().copied().collect()
    }

    pub(crate) fn clear(&self) -> Vec<(DiscoveryKey, TopicOptions)> {
        self.topics.write().drain().collect()
    }

    /// Bring discovery in line with `options`, given what was requested before.
    ///
    /// Announcements are settled before the lookup is issued, so a lookup never races
    /// this node's own announcement change.
    pub(crate) async fn request(
        &self,
        topic: DiscoveryKey,
        options: TopicOptions,
        previous: Option<TopicOptions>,
    ) -> Result<()> {
        let was = previous.unwrap_or(TopicOptions {
            announce: false,
            lookup: false,
            flush: false,
        });

        if options.announce {
            self.discovery.announce(topic).await?;
        } else if was.announce {
            self.discovery.unannounce(topic).await?;
        }

        if options.lookup {
            self.discovery.lookup(topic).await?;
        } else if was.lookup {
            self.discovery.stop_lookup(topic).await?;
        }

        trace!(topic = %topic.short(), announce = options.announce, lookup = options.lookup, "discovery requested");
        Ok(())
    }

    /// Stop announcing and looking up a topic that was configured with `options`.
    pub(crate) async fn withdraw(&self, topic: DiscoveryKey, options: TopicOptions) -> Result<()> {
        if options.announce {
            self.discovery.unannounce(topic).await?;
        }
        if options.lookup {
            self.discovery.stop_lookup(topic).await?;
        }
        trace!(topic = %topic.short(), "discovery withdrawn");
        Ok(())
    }
}

impl std::fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicRegistry")
            .field("topics", &self.topics.read().len())
            .finish_non_exhaustive()
    }
}
