//! Plan fragments and the serialized form shipped to workers.
//!
//! A fragment is a maximal exchange-free subtree of the node arena plus its
//! partitioning contract and delivery edges. Fragments are addressed by
//! [`FragmentId`]; graph edges are id lists, never shared references, so
//! rewiring during join resolution is a plain id swap.

use crate::expr::PhysExpr;
use crate::plan_node::{DataPartition, PlanNode};
use crate::runtime_filter::RuntimeFilterDesc;
use quarry_common::{FragmentId, PlanNodeId};
use serde::{Deserialize, Serialize};

/// One plan fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFragment {
    /// Fragment id within the plan.
    pub id: FragmentId,
    /// Root plan node.
    pub root: PlanNodeId,
    /// How this fragment's input data is partitioned across its instances.
    pub partition: DataPartition,
    /// How this fragment partitions the rows it sends out.
    pub output_partition: DataPartition,
    /// Child fragments feeding exchanges inside this fragment.
    pub children: Vec<FragmentId>,
    /// Receiving exchange nodes. At most one, except for multicast
    /// fragments which fan out to one exchange per consumer.
    pub destinations: Vec<PlanNodeId>,
    /// Result expressions; set only on the output fragment.
    pub output_exprs: Option<Vec<PhysExpr>>,
    /// CTE producer fragment feeding several consumers.
    pub multicast: bool,
    /// Instance count before dop estimation.
    pub parallel_exec_num: u32,
    /// Pipeline degree of parallelism; 0 until estimated.
    pub pipeline_dop: u32,
    /// A dop estimate has been committed and must not be overwritten.
    pub dop_estimated: bool,
    /// Pipeline execution may insert a local shuffle below partitioned
    /// operators; one-phase aggregates without a local exchange disable it.
    pub needs_local_shuffle: bool,
}

impl PlanFragment {
    /// Fragment with the given shape and default execution tunables.
    pub fn new(id: FragmentId, root: PlanNodeId, partition: DataPartition) -> Self {
        let output_partition = partition.clone();
        Self {
            id,
            root,
            partition,
            output_partition,
            children: Vec::new(),
            destinations: Vec::new(),
            output_exprs: None,
            multicast: false,
            parallel_exec_num: 1,
            pipeline_dop: 0,
            dop_estimated: false,
            needs_local_shuffle: true,
        }
    }

    /// Single delivery target, when not multicast.
    pub fn destination(&self) -> Option<PlanNodeId> {
        debug_assert!(self.multicast || self.destinations.len() <= 1);
        self.destinations.first().copied()
    }

    /// Sets the single delivery target of a non-multicast fragment.
    pub fn set_destination(&mut self, exchange: PlanNodeId) {
        assert!(!self.multicast, "multicast fragments accumulate destinations");
        self.destinations = vec![exchange];
    }
}

/// One plan node in the serialized fragment tree.
///
/// The wire tree is self-contained per fragment: exchange nodes become
/// leaves, with their producer reachable through the fragment graph instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireNode {
    /// The node, children cleared.
    pub node: PlanNode,
    /// Same-fragment children.
    pub children: Vec<WireNode>,
}

/// One fragment as shipped to workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentWire {
    /// Fragment id.
    pub fragment: FragmentId,
    /// Input partitioning contract.
    pub partition: DataPartition,
    /// Output partitioning contract.
    pub output_partition: DataPartition,
    /// Receiving exchange node ids.
    pub destinations: Vec<PlanNodeId>,
    /// Child fragment ids.
    pub children: Vec<FragmentId>,
    /// Fragment-local node tree.
    pub root: WireNode,
    /// Result expressions, on the output fragment only.
    pub output_exprs: Option<Vec<PhysExpr>>,
    /// Runtime filters built by joins in this fragment.
    pub build_filters: Vec<RuntimeFilterDesc>,
    /// Instance count.
    pub parallel_exec_num: u32,
    /// Pipeline degree of parallelism.
    pub pipeline_dop: u32,
}
