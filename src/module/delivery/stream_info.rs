use super::{HandlerRegistry, TopicGroup};
use crate::library::communication::StreamGateway;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Snapshot of the (topic, group) pairs the pending-retry processor scans
///
/// Built once from the [`HandlerRegistry`] by resolving the candidate topics of every group
/// through the gateway. Groups are resolved independently so that one failing group does not
/// keep the others from being scanned. Groups that could not be resolved are remembered and
/// retried through [`StreamInfoRegistry::resolve_pending`].
#[derive(Debug, Default)]
pub struct StreamInfoRegistry {
    keys: Vec<TopicGroup>,
    unresolved: BTreeMap<String, Vec<String>>,
}

impl StreamInfoRegistry {
    /// Resolves the topics of every group in the registry
    pub async fn resolve(registry: &HandlerRegistry, gateway: &dyn StreamGateway) -> Self {
        let mut info = Self {
            keys: Vec::new(),
            unresolved: registry
                .groups()
                .map(|group| (group.to_owned(), registry.candidate_topics(group)))
                .collect(),
        };

        info.resolve_pending(gateway).await;
        info
    }

    /// Retries the resolution of groups that previously failed, returns how many succeeded
    pub async fn resolve_pending(&mut self, gateway: &dyn StreamGateway) -> usize {
        let mut resolved = 0;
        let pending = std::mem::take(&mut self.unresolved);

        for (group, candidates) in pending {
            match gateway.resolve_topics(&group, &candidates).await {
                Ok(topics) => {
                    debug!(%group, ?topics, "Resolved topics of group");

                    for topic in topics.into_iter().filter(|t| candidates.contains(t)) {
                        let key = TopicGroup::new(topic, group.clone());
                        if !self.keys.contains(&key) {
                            self.keys.push(key);
                        }
                    }

                    resolved += 1;
                }
                Err(error) => {
                    warn!(%group, %error, "Unable to resolve topics of group, retrying next cycle");
                    self.unresolved.insert(group, candidates);
                }
            }
        }

        self.keys.sort();
        resolved
    }

    /// Resolved pairs, sorted
    pub fn keys(&self) -> &[TopicGroup] {
        &self.keys
    }

    /// Groups whose topics could not be resolved yet
    pub fn unresolved(&self) -> impl Iterator<Item = &str> {
        self.unresolved.keys().map(String::as_str)
    }

    /// Whether every group has been resolved
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}
