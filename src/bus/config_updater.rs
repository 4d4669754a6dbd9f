use crate::error::BusError;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

struct Fragment {
    version: u64,
    value: serde_json::Value,
}

#[derive(Default)]
struct Topics {
    fragments: RwLock<HashMap<String, Fragment>>,
    version: AtomicU64,
}

/// Publishes configuration fragments under topics such as
/// `config/record/front`. Only the latest value per topic is kept.
#[derive(Clone, Default)]
pub struct ConfigPublisher {
    topics: Arc<Topics>,
}

impl ConfigPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish<T: Serialize>(&self, topic: &str, value: &T) -> Result<(), BusError> {
        let value = serde_json::to_value(value).map_err(|e| BusError::Decode {
            topic: topic.to_string(),
            details: e.to_string(),
        })?;
        let version = self.topics.version.fetch_add(1, Ordering::AcqRel) + 1;
        self.topics
            .fragments
            .write()
            .insert(topic.to_string(), Fragment { version, value });
        debug!("Published config update on {} (v{})", topic, version);
        Ok(())
    }

    /// Subscribe to every topic starting with `prefix`. Only updates published
    /// after this call are delivered.
    pub fn subscribe(&self, prefix: &str) -> ConfigSubscriber {
        let seen = self
            .topics
            .fragments
            .read()
            .iter()
            .filter(|(topic, _)| topic.starts_with(prefix))
            .map(|(topic, fragment)| (topic.clone(), fragment.version))
            .collect();
        ConfigSubscriber {
            topics: Arc::clone(&self.topics),
            prefix: prefix.to_string(),
            seen,
        }
    }
}

/// Polls for configuration updates. Absence of an update is a no-op.
pub struct ConfigSubscriber {
    topics: Arc<Topics>,
    prefix: String,
    seen: HashMap<String, u64>,
}

impl ConfigSubscriber {
    /// Return the oldest unseen update, decoded as `T`
    pub fn check_for_update<T: DeserializeOwned>(&mut self) -> Option<(String, T)> {
        loop {
            let (topic, value) = {
                let fragments = self.topics.fragments.read();
                let next = fragments
                    .iter()
                    .filter(|(topic, fragment)| {
                        topic.starts_with(&self.prefix)
                            && self.seen.get(*topic).map_or(true, |v| fragment.version > *v)
                    })
                    .min_by_key(|(_, fragment)| fragment.version)?;
                self.seen.insert(next.0.clone(), next.1.version);
                (next.0.clone(), next.1.value.clone())
            };

            match serde_json::from_value(value) {
                Ok(decoded) => return Some((topic, decoded)),
                Err(e) => warn!("Ignoring undecodable config update on {}: {}", topic, e),
            }
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}
