//! Runtime filter descriptors.
//!
//! A hash join builds one descriptor per equality conjunct; the builder then
//! pushes it down the probe subtree looking for attach points. The exchange
//! crossing counter is the single source of truth for local versus remote:
//! it is incremented when descent enters an exchange's producing subtree and
//! decremented on the way back, so its value at an attach point is the
//! number of network boundaries between build and probe.

use crate::catalog::WorkerAddr;
use crate::expr::PhysExpr;
use crate::plan_node::JoinDistributionMode;
use quarry_common::{FilterId, PlanNodeId, SessionConfig};
use serde::{Deserialize, Serialize};

/// One probe attach point of a runtime filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeTarget {
    /// Node evaluating the filter.
    pub node: PlanNodeId,
    /// Probe-side expression the filter tests.
    pub expr: PhysExpr,
    /// No exchange separates this probe from the build.
    pub local: bool,
}

/// Build-side description of one runtime filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeFilterDesc {
    /// Filter id within the plan.
    pub id: FilterId,
    /// Join node building the filter.
    pub build_node: PlanNodeId,
    /// Index of the originating equality conjunct within its join.
    pub expr_order: usize,
    /// Build-side expression the filter is collected from.
    pub build_expr: PhysExpr,
    /// Estimated build-side rows.
    pub build_cardinality: f64,
    /// Distribution mode of the building join.
    pub join_mode: JoinDistributionMode,
    /// Equality conjunct count of the building join.
    pub equal_count: usize,
    /// Some probe target sits across an exchange; such filters need the
    /// merge/broadcast machinery at runtime.
    pub has_remote_targets: bool,
    /// Attached probe targets.
    pub probe_targets: Vec<ProbeTarget>,
    /// Merge endpoints assigned by the scheduler; empty until scheduling.
    pub merge_addrs: Vec<WorkerAddr>,
    #[serde(skip)]
    cross_exchange_count: u32,
}

impl RuntimeFilterDesc {
    /// Fresh descriptor for one equality conjunct of a join.
    pub fn new(
        id: FilterId,
        build_node: PlanNodeId,
        expr_order: usize,
        build_expr: PhysExpr,
        build_cardinality: f64,
        join_mode: JoinDistributionMode,
        equal_count: usize,
    ) -> Self {
        Self {
            id,
            build_node,
            expr_order,
            build_expr,
            build_cardinality,
            join_mode,
            equal_count,
            has_remote_targets: false,
            probe_targets: Vec::new(),
            merge_addrs: Vec::new(),
            cross_exchange_count: 0,
        }
    }

    /// Records descent into an exchange's producing subtree.
    pub fn enter_exchange(&mut self) {
        self.cross_exchange_count += 1;
        self.has_remote_targets = true;
    }

    /// Records ascent back out of an exchange's producing subtree.
    pub fn exit_exchange(&mut self) {
        assert!(self.cross_exchange_count > 0, "unbalanced exchange exit");
        self.cross_exchange_count -= 1;
    }

    /// No exchange currently separates the push-down position from the
    /// build node.
    pub fn in_local_fragment(&self) -> bool {
        self.cross_exchange_count == 0
    }

    /// Whether the filter may cross an exchange at all.
    ///
    /// Broadcast builds see every build row on every instance, so the
    /// filter is complete everywhere. Partitioned and local-bucket builds
    /// produce per-instance partial filters that are only mergeable when
    /// the join has a single equality key (the filter key is then the
    /// shuffle key). All other modes keep their filters local.
    pub fn can_push_across_exchange(&self) -> bool {
        match self.join_mode {
            JoinDistributionMode::Broadcast => true,
            JoinDistributionMode::Partitioned | JoinDistributionMode::LocalHashBucket => {
                self.equal_count == 1
            }
            JoinDistributionMode::Colocate
            | JoinDistributionMode::Replicated
            | JoinDistributionMode::ShuffleHashBucket => false,
        }
    }

    /// Whether a probe point with the given cardinality should accept the
    /// filter.
    ///
    /// Local probes always accept. Remote probes pay a network round trip,
    /// so they accept only when the probe is large enough and the filter
    /// is estimated to drop enough rows.
    pub fn can_probe_use(&self, probe_cardinality: f64, config: &SessionConfig) -> bool {
        if self.in_local_fragment() {
            return true;
        }
        if probe_cardinality < config.rf_probe_min_rows as f64 {
            return false;
        }
        let selectivity = 1.0 - self.build_cardinality / probe_cardinality;
        selectivity >= config.rf_probe_min_selectivity
    }

    /// Attaches a probe target at the current push-down position.
    pub fn add_probe_target(&mut self, node: PlanNodeId, expr: PhysExpr) {
        self.probe_targets.push(ProbeTarget {
            node,
            expr,
            local: self.in_local_fragment(),
        });
    }

    /// True when at least one probe point accepted the filter.
    pub fn has_probe_targets(&self) -> bool {
        !self.probe_targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_schema::DataType;
    use quarry_common::{SlotId, TupleId};

    fn desc(mode: JoinDistributionMode, equal_count: usize, build_rows: f64) -> RuntimeFilterDesc {
        RuntimeFilterDesc::new(
            FilterId(0),
            PlanNodeId(5),
            0,
            PhysExpr::SlotRef {
                slot: SlotId(1),
                tuple: TupleId(0),
                data_type: DataType::Int64,
                nullable: false,
            },
            build_rows,
            mode,
            equal_count,
        )
    }

    #[test]
    fn broadcast_always_crosses_exchanges() {
        assert!(desc(JoinDistributionMode::Broadcast, 3, 10.0).can_push_across_exchange());
    }

    #[test]
    fn partitioned_crosses_only_with_single_key() {
        assert!(desc(JoinDistributionMode::Partitioned, 1, 10.0).can_push_across_exchange());
        assert!(!desc(JoinDistributionMode::Partitioned, 2, 10.0).can_push_across_exchange());
        assert!(!desc(JoinDistributionMode::Colocate, 1, 10.0).can_push_across_exchange());
    }

    #[test]
    fn local_probe_accepts_unconditionally() {
        let d = desc(JoinDistributionMode::Partitioned, 1, 1_000_000.0);
        assert!(d.can_probe_use(10.0, &SessionConfig::default()));
    }

    #[test]
    fn remote_probe_gated_by_size_and_selectivity() {
        let config = SessionConfig::default();
        let mut d = desc(JoinDistributionMode::Broadcast, 1, 1_000.0);
        d.enter_exchange();

        // too small to be worth a network filter
        assert!(!d.can_probe_use(1_000.0, &config));
        // large and selective: build of 1e3 against probe of 1e7
        assert!(d.can_probe_use(10_000_000.0, &config));

        // large but unselective: build nearly as big as probe
        let mut weak = desc(JoinDistributionMode::Broadcast, 1, 9_000_000.0);
        weak.enter_exchange();
        assert!(!weak.can_probe_use(10_000_000.0, &config));
    }

    #[test]
    fn crossing_counter_balances() {
        let mut d = desc(JoinDistributionMode::Broadcast, 1, 10.0);
        assert!(d.in_local_fragment());
        d.enter_exchange();
        assert!(!d.in_local_fragment());
        assert!(d.has_remote_targets);
        d.exit_exchange();
        assert!(d.in_local_fragment());
        // remoteness is sticky even after the counter unwinds
        assert!(d.has_remote_targets);
    }

    #[test]
    fn probe_targets_record_locality_at_attach_time() {
        let mut d = desc(JoinDistributionMode::Broadcast, 1, 10.0);
        let expr = d.build_expr.clone();
        d.add_probe_target(PlanNodeId(1), expr.clone());
        d.enter_exchange();
        d.add_probe_target(PlanNodeId(2), expr);
        d.exit_exchange();

        assert!(d.probe_targets[0].local);
        assert!(!d.probe_targets[1].local);
    }
}
