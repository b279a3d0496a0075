//! Inbox sharding: which processor instance owns which inbox row.
//!
//! A strategy claims a set of event types and splits their rows across
//! `total_consumers` processor instances with a pure routing function:
//! `shard = routing_fn(record) % total_consumers`. Rows with the same routing
//! key always land on the same shard, so one shard sees them in creation order.
//!
//! The `default` strategy always exists: one consumer, every row on shard 0,
//! owning each event type no other strategy claimed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::store::InboxRecord;

pub const DEFAULT_STRATEGY: &str = "default";

/// Maps an inbox row to its routing key.
pub type RoutingFn = Arc<dyn Fn(&InboxRecord) -> u64 + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("routing strategy '{0}' is already registered")]
    DuplicateStrategy(String),

    #[error("event type '{event_type}' is already routed by strategy '{strategy}'")]
    EventTypeClaimed { event_type: String, strategy: String },

    #[error("routing strategy '{0}' must have at least one consumer")]
    ZeroConsumers(String),

    #[error("unknown routing strategy '{0}'")]
    UnknownStrategy(String),

    #[error("consumer id {consumer_id} is out of range for strategy '{strategy}' ({total} consumers)")]
    ConsumerOutOfRange {
        strategy: String,
        consumer_id: u32,
        total: u32,
    },
}

pub struct RoutingStrategy {
    name: String,
    event_types: BTreeSet<String>,
    routing_fn: RoutingFn,
    total_consumers: u32,
}

impl RoutingStrategy {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event_types(&self) -> &BTreeSet<String> {
        &self.event_types
    }

    pub fn total_consumers(&self) -> u32 {
        self.total_consumers
    }

    /// Shard owning `record` under this strategy.
    pub fn shard_of(&self, record: &InboxRecord) -> u32 {
        let shard = (self.routing_fn)(record) % u64::from(self.total_consumers);
        // `shard < total_consumers`, which is a u32.
        shard as u32
    }
}

impl core::fmt::Debug for RoutingStrategy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RoutingStrategy")
            .field("name", &self.name)
            .field("event_types", &self.event_types)
            .field("total_consumers", &self.total_consumers)
            .finish()
    }
}

/// All strategies of one bounded context. Built at bootstrap, then shared.
#[derive(Debug)]
pub struct RoutingRegistry {
    default: Arc<RoutingStrategy>,
    strategies: BTreeMap<String, Arc<RoutingStrategy>>,
    claims: BTreeMap<String, String>,
}

impl RoutingRegistry {
    pub fn new() -> Self {
        let default = Arc::new(RoutingStrategy {
            name: DEFAULT_STRATEGY.to_string(),
            event_types: BTreeSet::new(),
            routing_fn: Arc::new(|_: &InboxRecord| 0u64),
            total_consumers: 1,
        });
        let mut strategies = BTreeMap::new();
        strategies.insert(DEFAULT_STRATEGY.to_string(), Arc::clone(&default));
        Self {
            default,
            strategies,
            claims: BTreeMap::new(),
        }
    }

    pub fn register<I, S, F>(
        &mut self,
        name: impl Into<String>,
        event_types: I,
        total_consumers: u32,
        routing_fn: F,
    ) -> Result<&mut Self, RoutingError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&InboxRecord) -> u64 + Send + Sync + 'static,
    {
        let name = name.into();
        if self.strategies.contains_key(&name) {
            return Err(RoutingError::DuplicateStrategy(name));
        }
        if total_consumers == 0 {
            return Err(RoutingError::ZeroConsumers(name));
        }
        let event_types: BTreeSet<String> = event_types.into_iter().map(Into::into).collect();
        if let Some((event_type, strategy)) = event_types
            .iter()
            .find_map(|t| self.claims.get(t).map(|owner| (t.clone(), owner.clone())))
        {
            return Err(RoutingError::EventTypeClaimed { event_type, strategy });
        }

        for event_type in &event_types {
            self.claims.insert(event_type.clone(), name.clone());
        }
        self.strategies.insert(
            name.clone(),
            Arc::new(RoutingStrategy {
                name,
                event_types,
                routing_fn: Arc::new(routing_fn),
                total_consumers,
            }),
        );
        Ok(self)
    }

    /// True while no strategy besides `default` is registered.
    pub fn is_default_only(&self) -> bool {
        self.strategies.len() == 1
    }

    /// Strategy owning `event_type` (the default one when unclaimed).
    pub fn resolve(&self, event_type: &str) -> &Arc<RoutingStrategy> {
        self.claims
            .get(event_type)
            .and_then(|name| self.strategies.get(name))
            .unwrap_or(&self.default)
    }

    pub fn strategy(&self, name: &str) -> Result<&Arc<RoutingStrategy>, RoutingError> {
        self.strategies
            .get(name)
            .ok_or_else(|| RoutingError::UnknownStrategy(name.to_string()))
    }

    /// Validate and bind one processor instance to its shard.
    pub fn shard(&self, strategy: &str, consumer_id: u32) -> Result<Shard, RoutingError> {
        let strategy = self.strategy(strategy)?;
        if consumer_id >= strategy.total_consumers {
            return Err(RoutingError::ConsumerOutOfRange {
                strategy: strategy.name.clone(),
                consumer_id,
                total: strategy.total_consumers,
            });
        }
        Ok(Shard {
            strategy: Arc::clone(strategy),
            consumer_id,
        })
    }

    /// Every `(strategy, consumer_id)` pair needed to cover all rows.
    pub fn all_shards(&self) -> Vec<Shard> {
        self.strategies
            .values()
            .flat_map(|strategy| {
                (0..strategy.total_consumers).map(move |consumer_id| Shard {
                    strategy: Arc::clone(strategy),
                    consumer_id,
                })
            })
            .collect()
    }
}

impl Default for RoutingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One processor instance's slice of the inbox.
#[derive(Debug, Clone)]
pub struct Shard {
    strategy: Arc<RoutingStrategy>,
    consumer_id: u32,
}

impl Shard {
    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    pub fn consumer_id(&self) -> u32 {
        self.consumer_id
    }

    /// Whether this shard processes `record`.
    pub fn owns(&self, registry: &RoutingRegistry, record: &InboxRecord) -> bool {
        let owner = registry.resolve(&record.event_name);
        owner.name == self.strategy.name && owner.shard_of(record) == self.consumer_id
    }
}

/// Stable 64-bit hash of a business key (first eight bytes of SHA-256).
///
/// Identical on every host and across restarts, unlike `std`'s `DefaultHasher`.
pub fn hash_key(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use courier_core::TransactionId;
    use courier_observability::TraceContext;

    use super::*;

    fn record(event_name: &str, customer: &str) -> InboxRecord {
        InboxRecord::new(
            "billing",
            event_name,
            TransactionId::new(),
            serde_json::json!({ "customer": customer }),
            TraceContext::empty(),
        )
    }

    fn by_customer(record: &InboxRecord) -> u64 {
        hash_key(record.payload["customer"].as_str().unwrap_or_default())
    }

    #[test]
    fn unclaimed_types_fall_back_to_default() {
        let registry = RoutingRegistry::new();
        assert_eq!(registry.resolve("order.placed").name(), DEFAULT_STRATEGY);
        let shard = registry.shard(DEFAULT_STRATEGY, 0).unwrap();
        assert!(shard.owns(&registry, &record("order.placed", "c-1")));
    }

    #[test]
    fn registering_a_strategy_ends_default_only_routing() {
        let mut registry = RoutingRegistry::new();
        assert!(registry.is_default_only());
        registry
            .register("by-customer", ["order.placed"], 2, by_customer)
            .unwrap();
        assert!(!registry.is_default_only());
    }

    #[test]
    fn a_type_can_be_claimed_only_once() {
        let mut registry = RoutingRegistry::new();
        registry
            .register("by-customer", ["order.placed"], 2, by_customer)
            .unwrap();
        let err = registry
            .register("other", ["order.placed", "order.cancelled"], 1, |_: &InboxRecord| 0)
            .unwrap_err();
        assert_eq!(
            err,
            RoutingError::EventTypeClaimed {
                event_type: "order.placed".to_string(),
                strategy: "by-customer".to_string(),
            }
        );
        // The failed registration claimed nothing.
        assert_eq!(registry.resolve("order.cancelled").name(), DEFAULT_STRATEGY);
    }

    #[test]
    fn configuration_errors_fail_fast() {
        let mut registry = RoutingRegistry::new();
        assert!(matches!(
            registry.register(DEFAULT_STRATEGY, ["x"], 1, |_: &InboxRecord| 0),
            Err(RoutingError::DuplicateStrategy(_))
        ));
        assert!(matches!(
            registry.register("empty", ["x"], 0, |_: &InboxRecord| 0),
            Err(RoutingError::ZeroConsumers(_))
        ));
        registry.register("pair", ["x"], 2, |_: &InboxRecord| 0).unwrap();
        assert!(matches!(
            registry.shard("pair", 2),
            Err(RoutingError::ConsumerOutOfRange { consumer_id: 2, total: 2, .. })
        ));
        assert!(matches!(
            registry.shard("missing", 0),
            Err(RoutingError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn each_row_is_owned_by_exactly_one_shard() {
        let mut registry = RoutingRegistry::new();
        registry
            .register("by-customer", ["order.placed"], 3, by_customer)
            .unwrap();
        let shards = registry.all_shards();
        assert_eq!(shards.len(), 4);

        for customer in ["alice", "bob", "carol", "dave", "erin"] {
            for event_name in ["order.placed", "invoice.paid"] {
                let row = record(event_name, customer);
                let owners = shards.iter().filter(|s| s.owns(&registry, &row)).count();
                assert_eq!(owners, 1, "{event_name} for {customer}");
            }
        }
    }

    #[test]
    fn hash_key_is_stable() {
        assert_eq!(hash_key("customer-42"), hash_key("customer-42"));
        assert_ne!(hash_key("customer-42"), hash_key("customer-43"));
        // First eight bytes of SHA-256("abc").
        assert_eq!(hash_key("abc"), 0xba78_16bf_8f01_cfea);
    }
}
