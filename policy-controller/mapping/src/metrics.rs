use crate::{driver::Op, redirect::Transition, txn::Stats, Error};
use grouppolicy_core::policy::ResourceKind;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct DriverMetrics {
    events: Family<EventLabels, Counter>,
    handling: Family<KindLabels, Histogram>,
    rules_added: Counter,
    rules_removed: Counter,
    chain_transitions: Family<TransitionLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct EventLabels {
    kind: &'static str,
    op: &'static str,
    result: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct KindLabels {
    kind: &'static str,
    op: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct TransitionLabels {
    transition: &'static str,
}

// === impl DriverMetrics ===

impl DriverMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let events = Family::<EventLabels, Counter>::default();
        reg.register(
            "events",
            "Total number of lifecycle events handled, by result",
            events.clone(),
        );

        let handling = Family::<KindLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.0001, 0.001, 0.01, 0.1, 1.0].into_iter())
        });
        reg.register_with_unit(
            "event_duration",
            "Histogram of time spent handling lifecycle events, including rollback",
            Unit::Seconds,
            handling.clone(),
        );

        let rules_added = Counter::default();
        reg.register(
            "rules_added",
            "Total number of security group rules installed",
            rules_added.clone(),
        );

        let rules_removed = Counter::default();
        reg.register(
            "rules_removed",
            "Total number of security group rules removed",
            rules_removed.clone(),
        );

        let chain_transitions = Family::<TransitionLabels, Counter>::default();
        reg.register(
            "chain_transitions",
            "Total number of service chain state transitions",
            chain_transitions.clone(),
        );

        Self {
            events,
            handling,
            rules_added,
            rules_removed,
            chain_transitions,
        }
    }

    pub(crate) fn committed(&self, kind: ResourceKind, op: Op, stats: &Stats, elapsed: Duration) {
        self.observe(kind, op, "ok", elapsed);
        self.rules_added.inc_by(stats.rules_added);
        self.rules_removed.inc_by(stats.rules_removed);
        for transition in &stats.transitions {
            self.chain_transitions
                .get_or_create(&TransitionLabels {
                    transition: transition.as_str(),
                })
                .inc();
        }
    }

    pub(crate) fn failed(&self, kind: ResourceKind, op: Op, error: &Error, elapsed: Duration) {
        self.observe(kind, op, error.name(), elapsed);
    }

    fn observe(&self, kind: ResourceKind, op: Op, result: &'static str, elapsed: Duration) {
        self.events
            .get_or_create(&EventLabels {
                kind: kind.as_str(),
                op: op.as_str(),
                result,
            })
            .inc();
        self.handling
            .get_or_create(&KindLabels {
                kind: kind.as_str(),
                op: op.as_str(),
            })
            .observe(elapsed.as_secs_f64());
    }
}

/// Unregistered metrics.
impl Default for DriverMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}
