use crate::notifier::Notifier;
use chrono::{DateTime, Duration, Utc};
use common::rules::{Rule, Violation};
use common::store::{InsertOutcome, Store};
use common::streams::SessionKey;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use telemetry::metrics::VIOLATIONS;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEDUP_CACHE_CAPACITY: usize = 10_000;
const MESSAGE_DEDUP_WINDOW_MINUTES: i64 = 15;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DedupKey {
    Session {
        rule_id: Uuid,
        user_name: String,
        key: SessionKey,
    },
    Message {
        rule_id: Uuid,
        user_name: String,
        message_hash: u64,
    },
}

impl DedupKey {
    fn for_violation(violation: &Violation) -> Self {
        match &violation.session_key {
            Some(key) => DedupKey::Session {
                rule_id: violation.rule_id,
                user_name: violation.user_name.clone(),
                key: key.clone(),
            },
            None => {
                let mut hasher = DefaultHasher::new();
                violation.message.hash(&mut hasher);
                DedupKey::Message {
                    rule_id: violation.rule_id,
                    user_name: violation.user_name.clone(),
                    message_hash: hasher.finish(),
                }
            }
        }
    }
}

/// Bounded dedup cache. Session-keyed entries suppress for the life of
/// the session; message-keyed entries suppress inside a 15-minute
/// window. Eviction is simple LRU.
struct DedupCache {
    entries: HashMap<DedupKey, DateTime<Utc>>,
    order: VecDeque<DedupKey>,
    capacity: usize,
}

impl DedupCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn suppresses(&self, key: &DedupKey, now: DateTime<Utc>) -> bool {
        let Some(surfaced_at) = self.entries.get(key) else {
            return false;
        };
        match key {
            DedupKey::Session { .. } => true,
            DedupKey::Message { .. } => {
                now - *surfaced_at < Duration::minutes(MESSAGE_DEDUP_WINDOW_MINUTES)
            }
        }
    }

    fn insert(&mut self, key: DedupKey, now: DateTime<Utc>) {
        if self.entries.insert(key.clone(), now).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn remove(&mut self, key: &DedupKey) {
        self.entries.remove(key);
    }

    fn sweep_sessions(&mut self, user_name: &str, active: &HashSet<SessionKey>) {
        self.entries.retain(|key, _| match key {
            DedupKey::Session {
                user_name: user,
                key,
                ..
            } => user != user_name || active.contains(key),
            DedupKey::Message { .. } => true,
        });
    }
}

/// Terminal stage for produced violations: dedup, persist, decrement
/// the trust score, fan out notifications. Failures after the insert
/// log but never roll it back.
pub struct ViolationSink {
    store: Arc<dyn Store>,
    notifier: Arc<Notifier>,
    dedup: Mutex<DedupCache>,
}

impl ViolationSink {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<Notifier>) -> Self {
        Self {
            store,
            notifier,
            dedup: Mutex::new(DedupCache::new(DEDUP_CACHE_CAPACITY)),
        }
    }

    pub async fn process(&self, mut violation: Violation, rule: &Rule) {
        violation.occurred_at = Utc::now();
        let key = DedupKey::for_violation(&violation);

        {
            let mut cache = self.dedup.lock().await;
            if cache.suppresses(&key, violation.occurred_at) {
                debug!(
                    rule = %rule.name,
                    user = %violation.user_name,
                    "violation suppressed by dedup cache"
                );
                return;
            }
            cache.insert(key.clone(), violation.occurred_at);
        }

        let outcome = match self.store.insert_violation(&violation).await {
            Ok(outcome) => outcome,
            Err(first) => {
                warn!(
                    rule = %rule.name,
                    user = %violation.user_name,
                    error = %first,
                    "violation insert failed; retrying once"
                );
                match self.store.insert_violation(&violation).await {
                    Ok(outcome) => outcome,
                    Err(second) => {
                        warn!(
                            rule = %rule.name,
                            user = %violation.user_name,
                            error = %second,
                            "dropping violation after retry"
                        );
                        // Let a later tick try again from scratch.
                        self.dedup.lock().await.remove(&key);
                        return;
                    }
                }
            }
        };

        if outcome == InsertOutcome::DuplicateKey {
            debug!(
                rule = %rule.name,
                user = %violation.user_name,
                "violation already persisted"
            );
            return;
        }

        VIOLATIONS
            .with_label_values(&[&rule.kind.to_string(), &violation.severity.to_string()])
            .inc();
        info!(
            rule = %rule.name,
            user = %violation.user_name,
            severity = %violation.severity,
            confidence = violation.confidence,
            "violation recorded"
        );

        let penalty = violation.severity.trust_penalty();
        if let Err(e) = self
            .store
            .adjust_trust_score(&violation.user_name, -penalty)
            .await
        {
            warn!(user = %violation.user_name, error = %e, "trust score update failed");
        }

        match self.store.list_channels_for_rule(rule.id).await {
            Ok(channels) if !channels.is_empty() => {
                if let Err(e) = self.notifier.notify(&violation, &channels).await {
                    warn!(rule = %rule.name, error = %e, "notification delivery failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(rule = %rule.name, error = %e, "failed to load channels"),
        }
    }

    /// Drop dedup entries for sessions the user no longer has live, so
    /// the cache tracks only current activity.
    pub async fn sweep_user_sessions(&self, user_name: &str, active: &HashSet<SessionKey>) {
        self.dedup.lock().await.sweep_sessions(user_name, active);
    }
}
