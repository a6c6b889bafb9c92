use crate::context::EvalContext;
use crate::evaluators::{builtin_evaluators, RuleEvaluator};
use crate::sink::ViolationSink;
use chrono::Utc;
use common::geo::{GeoResolver, GeoResult};
use common::history::WatchHistoryEntry;
use common::rules::{Rule, RuleKind};
use common::store::Store;
use common::streams::{SessionKey, Snapshot};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

const USER_LOCK_STRIPES: usize = 16;

/// Runs every enabled rule against every stream of a snapshot and hands
/// produced violations to the sink. Evaluations for the same user are
/// serialized through a striped lock so trust scores and households are
/// observed consistently.
pub struct DetectionEngine {
    store: Arc<dyn Store>,
    geo: Arc<dyn GeoResolver>,
    evaluators: HashMap<RuleKind, Arc<dyn RuleEvaluator>>,
    rules: RwLock<Arc<Vec<Rule>>>,
    /// Rules whose config failed to parse; logged once and skipped
    /// until the next reload.
    quarantined: Mutex<HashSet<Uuid>>,
    sink: ViolationSink,
    user_locks: Vec<Mutex<()>>,
}

impl DetectionEngine {
    pub fn new(store: Arc<dyn Store>, geo: Arc<dyn GeoResolver>, sink: ViolationSink) -> Self {
        Self {
            store,
            geo,
            evaluators: builtin_evaluators(),
            rules: RwLock::new(Arc::new(Vec::new())),
            quarantined: Mutex::new(HashSet::new()),
            sink,
            user_locks: (0..USER_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Refresh the enabled-rule cache from the store and lift all
    /// config quarantines.
    pub async fn reload_rules(&self) -> anyhow::Result<()> {
        let rules = self.store.list_enabled_rules().await?;
        debug!(count = rules.len(), "rules reloaded");
        *self.rules.write().await = Arc::new(rules);
        self.quarantined.lock().await.clear();
        Ok(())
    }

    fn stripe_for(&self, user_name: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        user_name.hash(&mut hasher);
        &self.user_locks[hasher.finish() as usize % self.user_locks.len()]
    }

    /// Evaluate one snapshot. Geolocations for every IP in the snapshot
    /// are resolved up front; evaluators receive them pre-resolved.
    pub async fn evaluate_snapshot(&self, snapshot: Arc<Snapshot>) {
        let rules = self.rules.read().await.clone();
        if rules.is_empty() || snapshot.streams.is_empty() {
            return;
        }

        let ips: Vec<String> = snapshot
            .streams
            .iter()
            .filter_map(|s| s.ip_address.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let geo_by_ip: Arc<HashMap<String, GeoResult>> =
            Arc::new(self.geo.lookup_many(&ips).await.unwrap_or_else(|e| {
                debug!(error = %e, "snapshot geo resolution failed");
                HashMap::new()
            }));

        for stream in &snapshot.streams {
            let _guard = self.stripe_for(&stream.user_name).lock().await;

            let households = self
                .store
                .list_trusted_households(&stream.user_name)
                .await
                .unwrap_or_else(|e| {
                    warn!(user = %stream.user_name, error = %e, "household lookup failed");
                    Vec::new()
                });

            let ctx = EvalContext {
                snapshot: snapshot.clone(),
                geo: stream
                    .ip_address
                    .as_deref()
                    .and_then(|ip| geo_by_ip.get(ip).cloned()),
                geo_by_ip: geo_by_ip.clone(),
                households: Arc::new(households),
                store: self.store.clone(),
                now: Utc::now(),
            };

            for rule in rules.iter() {
                if self.quarantined.lock().await.contains(&rule.id) {
                    continue;
                }
                let Some(evaluator) = self.evaluators.get(&rule.kind) else {
                    continue;
                };

                match evaluator.evaluate(rule, stream, &ctx).await {
                    Ok(Some(violation)) => self.sink.process(violation, rule).await,
                    Ok(None) => {}
                    Err(e) => {
                        // Log once per rule per process; a reload lifts
                        // the quarantine.
                        if self.quarantined.lock().await.insert(rule.id) {
                            warn!(
                                rule_id = %rule.id,
                                rule = %rule.name,
                                error = %e,
                                "rule evaluation failed; disabling until reload"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Hook for completed viewings: retire dedup state for sessions the
    /// user no longer has live, based on the latest snapshot.
    pub async fn notify_session_ended(&self, entry: &WatchHistoryEntry, snapshot: &Snapshot) {
        let active: HashSet<SessionKey> = snapshot
            .streams_for_user(&entry.user_name)
            .map(|s| s.session_key())
            .collect();
        self.sink
            .sweep_user_sessions(&entry.user_name, &active)
            .await;
    }
}
