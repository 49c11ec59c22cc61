//! Mutable state of one fragment build.
//!
//! The context owns the plan-node arena, the fragment arena and its
//! execution order, the slot/tuple layouts, and the global column-to-slot
//! bindings. All structural rewiring (join resolution, output fragment
//! creation, finalization) goes through id swaps on this state.

use crate::expr::PhysExpr;
use crate::fragment::{FragmentWire, PlanFragment, WireNode};
use crate::layout::LayoutTable;
use crate::plan_node::{PlanNode, PlanNodeKind};
use crate::runtime_filter::RuntimeFilterDesc;
use quarry_common::{ColumnId, CteId, FilterId, FragmentId, PlanNodeId, SlotId, TupleId};
use std::collections::HashMap;

/// Arena-backed build state.
#[derive(Debug, Default)]
pub struct PlanContext {
    nodes: Vec<PlanNode>,
    fragments: Vec<PlanFragment>,
    /// Fragment execution order; finalization reverses it so sinks come
    /// before their sources.
    pub fragment_order: Vec<FragmentId>,
    /// Slot and tuple layouts.
    pub layouts: LayoutTable,
    /// Global logical-column bindings, shared across the whole build.
    pub bindings: HashMap<ColumnId, PhysExpr>,
    /// Runtime filters registered by join translation.
    pub filters: Vec<RuntimeFilterDesc>,
    /// CTE producer fragments by pairing key.
    pub cte_fragments: HashMap<CteId, FragmentId>,
    /// All scan nodes, for scheduling and dead-column bookkeeping.
    pub scan_nodes: Vec<PlanNodeId>,
    next_filter: u32,
}

impl PlanContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a plan node, returning its id.
    pub fn add_node(
        &mut self,
        kind: PlanNodeKind,
        children: Vec<PlanNodeId>,
        tuple_ids: Vec<TupleId>,
        cardinality: f64,
    ) -> PlanNodeId {
        let id = PlanNodeId(self.nodes.len() as u32);
        let nullable_generate = children
            .iter()
            .any(|c| self.node(*c).nullable_generate);
        self.nodes.push(PlanNode {
            id,
            kind,
            children,
            tuple_ids,
            conjuncts: Vec::new(),
            limit: None,
            cardinality,
            nullable_generate,
            probe_filters: Vec::new(),
            local_rf_waiting_set: Default::default(),
        });
        id
    }

    /// Node by id.
    pub fn node(&self, id: PlanNodeId) -> &PlanNode {
        &self.nodes[id.0 as usize]
    }

    /// Mutable node by id.
    pub fn node_mut(&mut self, id: PlanNodeId) -> &mut PlanNode {
        &mut self.nodes[id.0 as usize]
    }

    /// Allocates a fragment and appends it to the execution order.
    pub fn add_fragment(&mut self, build: impl FnOnce(FragmentId) -> PlanFragment) -> FragmentId {
        let id = FragmentId(self.fragments.len() as u32);
        self.fragments.push(build(id));
        self.fragment_order.push(id);
        id
    }

    /// Fragment by id; retired fragments remain addressable.
    pub fn fragment(&self, id: FragmentId) -> &PlanFragment {
        &self.fragments[id.0 as usize]
    }

    /// Mutable fragment by id.
    pub fn fragment_mut(&mut self, id: FragmentId) -> &mut PlanFragment {
        &mut self.fragments[id.0 as usize]
    }

    /// Removes a fragment from the execution order. Its arena entry stays
    /// valid so already-issued ids never dangle.
    pub fn retire_fragment(&mut self, id: FragmentId) {
        self.fragment_order.retain(|f| *f != id);
    }

    /// Moves a fragment to the end of the execution order.
    pub fn move_fragment_to_end(&mut self, id: FragmentId) {
        self.retire_fragment(id);
        self.fragment_order.push(id);
    }

    /// Fragments in execution order.
    pub fn ordered_fragments(&self) -> impl Iterator<Item = &PlanFragment> {
        self.fragment_order.iter().map(|id| self.fragment(*id))
    }

    /// Allocates the next runtime filter id.
    pub fn next_filter_id(&mut self) -> FilterId {
        let id = FilterId(self.next_filter);
        self.next_filter += 1;
        id
    }

    /// Runtime filter descriptor by id.
    pub fn filter(&self, id: FilterId) -> &RuntimeFilterDesc {
        self.filters
            .iter()
            .find(|f| f.id == id)
            .unwrap_or_else(|| panic!("unknown runtime filter {id}"))
    }

    /// Binds a logical column to its physical expression.
    pub fn bind(&mut self, column: ColumnId, expr: PhysExpr) {
        self.bindings.insert(column, expr);
    }

    /// Physical binding of a column; a miss is a builder bug and panics.
    pub fn binding(&self, column: ColumnId) -> &PhysExpr {
        self.bindings
            .get(&column)
            .unwrap_or_else(|| panic!("no binding for column {column}"))
    }

    /// Slot a column is bound to; panics when the binding is not a slot.
    pub fn slot_of(&self, column: ColumnId) -> SlotId {
        self.binding(column)
            .as_slot()
            .unwrap_or_else(|| panic!("column {column} is not bound to a slot"))
    }

    /// Collects the nodes of one fragment: the subtree from its root,
    /// stopping below exchange nodes (their children belong to the
    /// producing fragment).
    pub fn fragment_nodes(&self, fragment: FragmentId) -> Vec<PlanNodeId> {
        let mut out = Vec::new();
        self.collect_fragment_nodes(self.fragment(fragment).root, &mut out);
        out
    }

    fn collect_fragment_nodes(&self, node: PlanNodeId, out: &mut Vec<PlanNodeId>) {
        out.push(node);
        if matches!(self.node(node).kind, PlanNodeKind::Exchange(_)) {
            return;
        }
        for child in self.node(node).children.clone() {
            self.collect_fragment_nodes(child, out);
        }
    }

    /// Serializes one fragment for shipping.
    pub fn fragment_wire(&self, id: FragmentId) -> FragmentWire {
        let fragment = self.fragment(id);
        let build_filters: Vec<RuntimeFilterDesc> = {
            let nodes = self.fragment_nodes(id);
            self.filters
                .iter()
                .filter(|f| nodes.contains(&f.build_node))
                .cloned()
                .collect()
        };
        FragmentWire {
            fragment: fragment.id,
            partition: fragment.partition.clone(),
            output_partition: fragment.output_partition.clone(),
            destinations: fragment.destinations.clone(),
            children: fragment.children.clone(),
            root: self.wire_node(fragment.root),
            output_exprs: fragment.output_exprs.clone(),
            build_filters,
            parallel_exec_num: fragment.parallel_exec_num,
            pipeline_dop: fragment.pipeline_dop,
        }
    }

    fn wire_node(&self, id: PlanNodeId) -> WireNode {
        let node = self.node(id);
        let children = if matches!(node.kind, PlanNodeKind::Exchange(_)) {
            Vec::new()
        } else {
            node.children.iter().map(|c| self.wire_node(*c)).collect()
        };
        let mut flat = node.clone();
        flat.children.clear();
        WireNode {
            node: flat,
            children,
        }
    }
}
