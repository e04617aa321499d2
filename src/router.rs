// src/router.rs
//! Maps `(job type, priority)` to a queue.
//!
//! Priorities are grouped into tiers; every `(type, tier)` pair owns one
//! queue, and dispatchers consume tiers from highest to lowest so that
//! higher-priority work is drained first. With the default one-tier-per-value
//! layout a single consumer sees jobs in non-increasing priority order.

use crate::{JobRecord, Priority, RelayConfig, RelayError, Result};
use std::collections::BTreeSet;

/// Declaration properties for a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueProperties {
    pub durable: bool,
    pub max_length: Option<u64>,
    /// 0 is the highest tier.
    pub tier_rank: usize,
}

/// Where a message is published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTarget {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
    pub tier: String,
    pub properties: QueueProperties,
}

#[derive(Debug, Clone)]
pub struct PriorityRouter {
    exchange: String,
    tier_bounds: Vec<u8>,
    job_types: BTreeSet<String>,
    max_length: Option<u64>,
}

const DEAD_LETTER_SUFFIX: &str = "deadletter";

impl PriorityRouter {
    pub fn new<I, S>(exchange: impl Into<String>, tier_bounds: Vec<u8>, job_types: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if tier_bounds.first() != Some(&Priority::MIN.value())
            || tier_bounds.windows(2).any(|w| w[0] >= w[1])
        {
            return Err(RelayError::Config(format!(
                "invalid priority tiers {tier_bounds:?}"
            )));
        }
        let job_types: BTreeSet<String> = job_types.into_iter().map(Into::into).collect();
        if job_types.is_empty() {
            return Err(RelayError::Config("no job types registered".to_string()));
        }

        Ok(Self {
            exchange: exchange.into(),
            tier_bounds,
            job_types,
            max_length: None,
        })
    }

    pub fn from_config<I, S>(config: &RelayConfig, job_types: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut router = Self::new(config.exchange.clone(), config.tier_bounds.clone(), job_types)?;
        router.max_length = config.queue_max_length;
        Ok(router)
    }

    pub fn with_max_length(mut self, max_length: Option<u64>) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.job_types.iter().map(String::as_str)
    }

    pub fn knows(&self, job_type: &str) -> bool {
        self.job_types.contains(job_type)
    }

    /// Tier rank (0 = highest) and label for a priority.
    pub fn tier_of(&self, priority: Priority) -> (usize, String) {
        let index = self
            .tier_bounds
            .iter()
            .rposition(|bound| *bound <= priority.value())
            .unwrap_or(0);
        let rank = self.tier_bounds.len() - 1 - index;
        (rank, format!("p{}", self.tier_bounds[index]))
    }

    pub fn route(&self, job_type: &str, priority: Priority) -> Result<RoutingTarget> {
        if !self.knows(job_type) {
            return Err(RelayError::Validation(format!("unknown job type '{job_type}'")));
        }
        let (rank, tier) = self.tier_of(priority);
        Ok(self.target(job_type, tier, rank))
    }

    pub fn route_job(&self, job: &JobRecord) -> Result<RoutingTarget> {
        self.route(&job.job_type, job.priority)
    }

    /// Quarantine destination for a job type.
    pub fn dead_letter_target(&self, job_type: &str) -> Result<RoutingTarget> {
        if !self.knows(job_type) {
            return Err(RelayError::Validation(format!("unknown job type '{job_type}'")));
        }
        Ok(RoutingTarget {
            exchange: format!("{}.{DEAD_LETTER_SUFFIX}", self.exchange),
            routing_key: format!("{}.{job_type}.{DEAD_LETTER_SUFFIX}", self.exchange),
            queue: format!("{}.{job_type}.{DEAD_LETTER_SUFFIX}", self.exchange),
            tier: DEAD_LETTER_SUFFIX.to_string(),
            properties: QueueProperties {
                durable: true,
                max_length: None,
                tier_rank: usize::MAX,
            },
        })
    }

    /// Every live queue for `job_types`, highest tier first.
    pub fn consume_order(&self, job_types: &[String]) -> Result<Vec<RoutingTarget>> {
        if let Some(unknown) = job_types.iter().find(|t| !self.knows(t)) {
            return Err(RelayError::Config(format!("unknown job type '{unknown}'")));
        }
        let mut targets = Vec::with_capacity(job_types.len() * self.tier_bounds.len());
        for (index, bound) in self.tier_bounds.iter().enumerate().rev() {
            let rank = self.tier_bounds.len() - 1 - index;
            for job_type in job_types {
                targets.push(self.target(job_type, format!("p{bound}"), rank));
            }
        }
        Ok(targets)
    }

    /// All live and dead-letter queues, for declaration at startup.
    pub fn all_targets(&self) -> Vec<RoutingTarget> {
        let types: Vec<String> = self.job_types.iter().cloned().collect();
        let mut targets = self.consume_order(&types).unwrap_or_default();
        targets.extend(types.iter().filter_map(|t| self.dead_letter_target(t).ok()));
        targets
    }

    fn target(&self, job_type: &str, tier: String, rank: usize) -> RoutingTarget {
        RoutingTarget {
            exchange: self.exchange.clone(),
            routing_key: format!("{}.{job_type}.{tier}", self.exchange),
            queue: format!("{}.{job_type}.{tier}", self.exchange),
            tier,
            properties: QueueProperties {
                durable: true,
                max_length: self.max_length,
                tier_rank: rank,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(bounds: Vec<u8>) -> PriorityRouter {
        PriorityRouter::new("jobs", bounds, ["send_email", "cleanup"]).unwrap()
    }

    #[test]
    fn routing_key_encodes_type_and_tier() {
        let target = router(vec![0, 3, 7]).route("send_email", Priority::new(5).unwrap()).unwrap();
        assert_eq!(target.routing_key, "jobs.send_email.p3");
        assert_eq!(target.queue, "jobs.send_email.p3");
        assert_eq!(target.properties.tier_rank, 1);
        assert!(target.properties.durable);
    }

    #[test]
    fn routing_is_deterministic() {
        let r = router(vec![0, 3, 7]);
        let a = r.route("cleanup", Priority::HIGH).unwrap();
        let b = r.route("cleanup", Priority::HIGH).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn higher_priority_gets_a_better_rank() {
        let r = router(vec![0, 3, 7]);
        let low = r.route("send_email", Priority::LOW).unwrap();
        let high = r.route("send_email", Priority::CRITICAL).unwrap();
        assert!(high.properties.tier_rank < low.properties.tier_rank);
        assert_eq!(high.tier, "p7");
        assert_eq!(low.tier, "p0");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = router(vec![0]).route("fax", Priority::NORMAL).unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
        let err = router(vec![0]).consume_order(&["fax".to_string()]).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn consume_order_lists_highest_tier_first() {
        let r = router(vec![0, 5]);
        let queues: Vec<_> = r
            .consume_order(&["send_email".to_string(), "cleanup".to_string()])
            .unwrap()
            .into_iter()
            .map(|t| t.queue)
            .collect();
        assert_eq!(
            queues,
            vec![
                "jobs.send_email.p5",
                "jobs.cleanup.p5",
                "jobs.send_email.p0",
                "jobs.cleanup.p0",
            ]
        );
    }

    #[test]
    fn dead_letter_queue_uses_suffix() {
        let target = router(vec![0]).dead_letter_target("send_email").unwrap();
        assert_eq!(target.queue, "jobs.send_email.deadletter");
        assert_eq!(target.exchange, "jobs.deadletter");
    }

    #[test]
    fn tiers_must_start_at_minimum() {
        assert!(PriorityRouter::new("jobs", vec![1, 5], ["a"]).is_err());
        assert!(PriorityRouter::new("jobs", vec![0], Vec::<String>::new()).is_err());
    }
}
