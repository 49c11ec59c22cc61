//! Fragment builder: lowers an optimized operator tree into an executable
//! fragment graph.
//!
//! Translation is a single bottom-up pass. Each operator visit returns the
//! fragment currently holding the translated subtree; parents either grow
//! that fragment or stitch fragments together through exchange nodes. After
//! the pass, an output fragment is attached and the plan is finalized
//! (fragment order reversed, runtime-filter waiting sets computed).

use crate::catalog::MetadataProvider;
use crate::context::PlanContext;
use crate::expr::{
    default_predicate_policy, extract_conjuncts, lower_expr, FormatterContext, PhysExpr,
    PredicatePolicy, ScalarExpr,
};
use crate::fragment::{FragmentWire, PlanFragment};
use crate::layout::LayoutTable;
use crate::operator::{
    AggPhase, AggregateOp, AssertOneRowOp, ColumnCatalog, CteConsumeOp, CteProduceOp, DecodeOp,
    DistributionOp, OpNode, OperatorKind, PhysicalTree, Projection, RepeatOp, ScanOp, SetOpKind,
    SetOperation, Statistics, TableFunctionOp, TopNOp, ValuesOp, WindowOp,
};
use crate::plan_node::{
    AggregationNode, AnalyticNode, AssertNumRowsNode, DataPartition, DecodeNode, EmptySetNode,
    ExchangeKind, ExchangeNode, MergeInfo, PartitionKind, PlanNodeKind, ProjectNode, RepeatNode,
    ScanNode, SelectNode, SetNode, SetNodeKind, SortInfo, SortNode, TableFunctionNode,
};
use crate::runtime_filter::RuntimeFilterDesc;
use quarry_common::{
    ColumnId, FragmentId, PlanNodeId, QuarryError, Result, SessionConfig, SlotId, TupleId,
};
use std::collections::{BTreeSet, HashMap};

/// Entry point for turning optimized operator trees into fragment plans.
pub struct FragmentBuilder<'a> {
    catalog: &'a dyn MetadataProvider,
    config: SessionConfig,
    policy: PredicatePolicy,
}

impl<'a> FragmentBuilder<'a> {
    /// Builder over a metadata source with the given session tunables.
    pub fn new(catalog: &'a dyn MetadataProvider, config: SessionConfig) -> Self {
        Self {
            catalog,
            config,
            policy: default_predicate_policy,
        }
    }

    /// Replaces the predicate classifier used for scan dead-column
    /// elimination.
    pub fn with_predicate_policy(mut self, policy: PredicatePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Builds the fragment plan for one optimized tree.
    pub fn build(&self, tree: &PhysicalTree) -> Result<ExecPlan> {
        let mut t = Translator {
            catalog: self.catalog,
            config: &self.config,
            policy: self.policy,
            columns: &tree.columns,
            ctx: PlanContext::new(),
        };
        let root = t.visit(&tree.root)?;
        t.create_output_fragment(root, tree)?;
        t.finalize();
        tracing::debug!(
            fragments = t.ctx.fragment_order.len(),
            filters = t.ctx.filters.len(),
            "fragment plan built"
        );
        let output_exprs = tree
            .output_columns
            .iter()
            .map(|c| t.ctx.binding(*c).clone())
            .collect();
        Ok(ExecPlan {
            ctx: t.ctx,
            output_exprs,
            column_names: tree.column_names.clone(),
        })
    }
}

/// Finished fragment plan.
#[derive(Debug)]
pub struct ExecPlan {
    pub(crate) ctx: PlanContext,
    /// Result expressions in output order.
    pub output_exprs: Vec<PhysExpr>,
    /// Result column names in output order.
    pub column_names: Vec<String>,
}

impl ExecPlan {
    /// Fragments in execution order (sinks first after finalization).
    pub fn fragments(&self) -> Vec<&PlanFragment> {
        self.ctx.ordered_fragments().collect()
    }

    /// Fragment ids in execution order.
    pub fn fragment_ids(&self) -> &[FragmentId] {
        &self.ctx.fragment_order
    }

    /// Fragment by id.
    pub fn fragment(&self, id: FragmentId) -> &PlanFragment {
        self.ctx.fragment(id)
    }

    /// Plan node by id.
    pub fn node(&self, id: PlanNodeId) -> &crate::plan_node::PlanNode {
        self.ctx.node(id)
    }

    /// Slot and tuple layouts of the plan.
    pub fn layouts(&self) -> &LayoutTable {
        &self.ctx.layouts
    }

    /// Runtime filters surviving finalization.
    pub fn runtime_filters(&self) -> &[RuntimeFilterDesc] {
        &self.ctx.filters
    }

    /// All scan nodes of the plan.
    pub fn scan_nodes(&self) -> &[PlanNodeId] {
        &self.ctx.scan_nodes
    }

    /// Serializes every fragment for shipping, in execution order.
    pub fn to_wire(&self) -> Vec<FragmentWire> {
        self.ctx
            .fragment_order
            .iter()
            .map(|id| self.ctx.fragment_wire(*id))
            .collect()
    }

    /// Renders the plan for humans.
    pub fn explain(&self) -> String {
        crate::explain::render(self)
    }
}

pub(crate) struct Translator<'a> {
    pub(crate) catalog: &'a dyn MetadataProvider,
    pub(crate) config: &'a SessionConfig,
    pub(crate) policy: PredicatePolicy,
    pub(crate) columns: &'a ColumnCatalog,
    pub(crate) ctx: PlanContext,
}

impl<'a> Translator<'a> {
    pub(crate) fn visit(&mut self, op: &OpNode) -> Result<FragmentId> {
        let fragment = match &op.kind {
            OperatorKind::TableScan(scan) => self.visit_scan(op, scan),
            OperatorKind::Values(values) => self.visit_values(op, values),
            OperatorKind::Project => self.visit(&op.inputs[0]),
            OperatorKind::Filter => self.visit_filter(op),
            OperatorKind::HashAggregate(agg) => self.visit_aggregate(op, agg),
            OperatorKind::Distribution(dist) => self.visit_distribution(op, dist),
            OperatorKind::TopN(topn) => self.visit_topn(op, topn),
            OperatorKind::HashJoin(join) => self.visit_join(op, join),
            OperatorKind::SetOp(set_op) => self.visit_set_op(op, set_op),
            OperatorKind::Repeat(repeat) => self.visit_repeat(op, repeat),
            OperatorKind::TableFunction(func) => self.visit_table_function(op, func),
            OperatorKind::AssertOneRow(assert) => self.visit_assert_one_row(op, assert),
            OperatorKind::Window(window) => self.visit_window(op, window),
            OperatorKind::Limit => self.visit_limit(op),
            OperatorKind::Decode(decode) => self.visit_decode(op, decode),
            OperatorKind::CteProduce(produce) => self.visit_cte_produce(op, produce),
            OperatorKind::CteConsume(consume) => self.visit_cte_consume(op, consume),
            OperatorKind::CteAnchor => self.visit_cte_anchor(op),
        }?;
        if let Some(projection) = &op.projection {
            self.apply_projection(fragment, projection, op.stats);
        }
        Ok(fragment)
    }

    // ---- shared lowering helpers ----

    pub(crate) fn lower(&self, expr: &ScalarExpr) -> PhysExpr {
        lower_expr(expr, &FormatterContext::new(&self.ctx.bindings))
    }

    fn lower_conjuncts(&self, predicate: Option<&ScalarExpr>) -> Vec<PhysExpr> {
        extract_conjuncts(predicate)
            .into_iter()
            .map(|c| self.lower(c))
            .collect()
    }

    pub(crate) fn root_of(&self, fragment: FragmentId) -> PlanNodeId {
        self.ctx.fragment(fragment).root
    }

    pub(crate) fn is_exchange(&self, node: PlanNodeId) -> bool {
        matches!(self.ctx.node(node).kind, PlanNodeKind::Exchange(_))
    }

    /// Decode nodes are transparent for fragment-shape decisions.
    pub(crate) fn skip_decode(&self, mut node: PlanNodeId) -> PlanNodeId {
        while matches!(self.ctx.node(node).kind, PlanNodeKind::Decode(_)) {
            node = self.ctx.node(node).children[0];
        }
        node
    }

    fn slot_ref(&self, slot: SlotId) -> PhysExpr {
        let d = self.ctx.layouts.slot(slot);
        PhysExpr::SlotRef {
            slot,
            tuple: d.tuple,
            data_type: d.data_type.clone(),
            nullable: d.nullable,
        }
    }

    fn bind_new_slot(
        &mut self,
        tuple: TupleId,
        column: ColumnId,
        data_type: arrow_schema::DataType,
        nullable: bool,
    ) -> SlotId {
        let slot = self.ctx.layouts.add_slot(tuple, data_type, nullable, true);
        let expr = self.slot_ref(slot);
        self.ctx.bind(column, expr);
        slot
    }

    // ---- projection ----

    fn apply_projection(&mut self, fragment: FragmentId, projection: &Projection, stats: Statistics) {
        let root = self.root_of(fragment);
        let tuple = self.ctx.layouts.new_tuple();

        let mut common = HashMap::new();
        let mut common_subs = Vec::new();
        for (col, expr) in &projection.common_sub_map {
            let lowered = lower_expr(expr, &FormatterContext::with_common(&self.ctx.bindings, &common));
            let slot = self
                .ctx
                .layouts
                .add_slot(tuple, lowered.data_type(), lowered.nullable(), false);
            common.insert(*col, self.slot_ref(slot));
            common_subs.push((slot, lowered));
        }

        let nullable_child = self.ctx.node(root).nullable_generate;
        let mut projections = Vec::new();
        for (col, expr) in &projection.column_map {
            let lowered = lower_expr(expr, &FormatterContext::with_common(&self.ctx.bindings, &common));
            let nullable = lowered.nullable() || nullable_child;
            let slot = self
                .ctx
                .layouts
                .add_slot(tuple, lowered.data_type(), nullable, true);
            let r = self.slot_ref(slot);
            self.ctx.bind(*col, r);
            projections.push((slot, lowered));
        }
        self.ctx.layouts.compute_mem_layout(tuple);

        let limit = self.ctx.node(root).limit;
        let node = self.ctx.add_node(
            PlanNodeKind::Project(ProjectNode {
                projections,
                common_subs,
            }),
            vec![root],
            vec![tuple],
            stats.output_row_count,
        );
        self.ctx.node_mut(node).limit = limit;
        self.ctx.fragment_mut(fragment).root = node;
    }

    // ---- leaves ----

    fn visit_scan(&mut self, op: &OpNode, scan: &ScanOp) -> Result<FragmentId> {
        let table = self.catalog.table(scan.table).map_err(|e| {
            QuarryError::Planning(format!("scan of table {} is invalid: {e}", scan.table))
        })?;
        let ranges = self.catalog.scan_ranges(
            scan.table,
            &scan.selected_partitions,
            &scan.selected_tablets,
        )?;

        let tuple = self.ctx.layouts.new_tuple();
        for (col, name) in &scan.column_map {
            let tc = table.column(name).ok_or_else(|| {
                QuarryError::Planning(format!("table {} has no column {name}", table.name))
            })?;
            let slot = self.bind_new_slot(tuple, *col, tc.data_type.clone(), tc.nullable);
            self.ctx.layouts.slot_mut(slot).source_column = Some((scan.table, name.clone()));
        }
        self.ctx.layouts.compute_mem_layout(tuple);

        let conjuncts = self.lower_conjuncts(op.predicate.as_ref());
        let tablet_buckets = ranges.iter().map(|r| (r.tablet, r.bucket_seq)).collect();
        let total_tablets =
            table.bucket_count as u64 * scan.selected_partitions.len().max(1) as u64;
        let unused_output_slots = if self.config.filter_unused_columns_in_scan {
            self.unused_scan_slots(op)
        } else {
            Vec::new()
        };

        let node = self.ctx.add_node(
            PlanNodeKind::Scan(ScanNode {
                table: scan.table,
                table_name: table.name.clone(),
                ranges,
                tablet_buckets,
                total_tablets,
                unused_output_slots,
                bucket_columns: scan.bucket_columns.clone(),
                preagg: scan.preagg,
            }),
            vec![],
            vec![tuple],
            op.stats.output_row_count,
        );
        self.ctx.node_mut(node).conjuncts = conjuncts;
        self.ctx.node_mut(node).limit = op.limit;
        self.ctx.scan_nodes.push(node);

        let parallel = self.config.parallel_exec_instance_num.max(1);
        Ok(self.ctx.add_fragment(|id| {
            let mut f = PlanFragment::new(id, node, DataPartition::random());
            f.parallel_exec_num = parallel;
            f
        }))
    }

    /// Columns referenced only by storage-evaluable predicates and absent
    /// from the operator's output need not leave the scan.
    fn unused_scan_slots(&self, op: &OpNode) -> Vec<SlotId> {
        let mut simple_only: Vec<ColumnId> = Vec::new();
        let mut complex: Vec<ColumnId> = Vec::new();
        for conjunct in extract_conjuncts(op.predicate.as_ref()) {
            let cols = conjunct.used_columns();
            if (self.policy)(conjunct) {
                simple_only.extend(cols);
            } else {
                complex.extend(cols);
            }
        }
        let mut out: Vec<SlotId> = simple_only
            .into_iter()
            .filter(|c| !complex.contains(c) && !op.output_columns.contains(c))
            .map(|c| self.ctx.slot_of(c))
            .collect();
        out.sort();
        out.dedup();
        out
    }

    fn visit_values(&mut self, op: &OpNode, values: &ValuesOp) -> Result<FragmentId> {
        let tuple = self.ctx.layouts.new_tuple();
        for col in &values.columns {
            let info = self.columns.info(*col).clone();
            self.bind_new_slot(tuple, *col, info.data_type, info.nullable);
        }
        self.ctx.layouts.compute_mem_layout(tuple);

        let node = if values.rows.is_empty() {
            self.ctx.add_node(
                PlanNodeKind::EmptySet(EmptySetNode {}),
                vec![],
                vec![tuple],
                0.0,
            )
        } else {
            let const_expr_rows = values
                .rows
                .iter()
                .map(|row| row.iter().map(|e| self.lower(e)).collect())
                .collect();
            self.ctx.add_node(
                PlanNodeKind::SetOperation(SetNode {
                    kind: SetNodeKind::Union,
                    output_tuple: tuple,
                    first_materialized_child_idx: 0,
                    result_expr_lists: Vec::new(),
                    const_expr_rows,
                    output_slot_maps: Vec::new(),
                }),
                vec![],
                vec![tuple],
                op.stats.output_row_count,
            )
        };
        self.ctx.node_mut(node).limit = op.limit;
        Ok(self
            .ctx
            .add_fragment(|id| PlanFragment::new(id, node, DataPartition::unpartitioned())))
    }

    // ---- single-child operators ----

    fn visit_filter(&mut self, op: &OpNode) -> Result<FragmentId> {
        let fragment = self.visit(&op.inputs[0])?;
        let root = self.root_of(fragment);
        let predicate = op
            .predicate
            .as_ref()
            .unwrap_or_else(|| panic!("filter without a predicate"));
        let conjuncts = self.lower_conjuncts(Some(predicate));
        let tuples = self.ctx.node(root).tuple_ids.clone();
        let node = self.ctx.add_node(
            PlanNodeKind::Select(SelectNode {}),
            vec![root],
            tuples,
            op.stats.output_row_count,
        );
        self.ctx.node_mut(node).conjuncts = conjuncts;
        self.ctx.node_mut(node).limit = op.limit;
        self.ctx.fragment_mut(fragment).root = node;
        Ok(fragment)
    }

    fn visit_limit(&mut self, op: &OpNode) -> Result<FragmentId> {
        let fragment = self.visit(&op.inputs[0])?;
        if let Some(limit) = op.limit {
            let root = self.root_of(fragment);
            let node = self.ctx.node_mut(root);
            node.limit = Some(node.limit.map_or(limit, |l| l.min(limit)));
        }
        Ok(fragment)
    }

    fn visit_distribution(&mut self, op: &OpNode, dist: &DistributionOp) -> Result<FragmentId> {
        let child = self.visit(&op.inputs[0])?;
        let child_root = self.root_of(child);
        let (kind, partition) = match dist {
            DistributionOp::Gather => (ExchangeKind::Gather, DataPartition::unpartitioned()),
            DistributionOp::Broadcast => (ExchangeKind::Broadcast, DataPartition::unpartitioned()),
            DistributionOp::Shuffle { columns } => {
                let exprs: Vec<PhysExpr> =
                    columns.iter().map(|c| self.ctx.binding(*c).clone()).collect();
                (ExchangeKind::Shuffle, DataPartition::hash(exprs))
            }
        };

        let num_senders = self.ctx.fragment(child).parallel_exec_num;
        let tuples = self.ctx.node(child_root).tuple_ids.clone();
        let cardinality = self.ctx.node(child_root).cardinality;
        let exchange = self.ctx.add_node(
            PlanNodeKind::Exchange(ExchangeNode {
                kind,
                num_senders,
                merge: None,
            }),
            vec![child_root],
            tuples,
            cardinality,
        );
        if matches!(dist, DistributionOp::Gather) {
            self.ctx.node_mut(exchange).limit = op.limit;
        }

        let parallel = match dist {
            DistributionOp::Gather => 1,
            _ => self.config.parallel_exec_instance_num.max(1),
        };
        let fragment = self.ctx.add_fragment(|id| {
            let mut f = PlanFragment::new(id, exchange, partition.clone());
            f.parallel_exec_num = parallel;
            f
        });
        self.ctx.fragment_mut(fragment).children.push(child);
        self.ctx.fragment_mut(child).set_destination(exchange);
        self.ctx.fragment_mut(child).output_partition = partition;
        Ok(fragment)
    }

    // ---- sort ----

    fn visit_topn(&mut self, op: &OpNode, topn: &TopNOp) -> Result<FragmentId> {
        if topn.split && !topn.partial {
            self.build_merge_topn(op, topn)
        } else {
            self.build_partial_topn(op, topn)
        }
    }

    /// Sort node inside the input fragment; also the whole story for an
    /// unsplit sort.
    fn build_partial_topn(&mut self, op: &OpNode, topn: &TopNOp) -> Result<FragmentId> {
        let fragment = self.visit(&op.inputs[0])?;
        let root = self.root_of(fragment);

        let sort_tuple = self.ctx.layouts.new_tuple();
        let mut sort_exprs = Vec::new();
        let mut materialized = Vec::new();
        let mut seen: BTreeSet<ColumnId> = BTreeSet::new();
        for key in &topn.order_by {
            let source = self.ctx.binding(key.column).clone();
            let slot = self.bind_new_slot(
                sort_tuple,
                key.column,
                source.data_type(),
                source.nullable(),
            );
            sort_exprs.push(self.slot_ref(slot));
            materialized.push(source);
            seen.insert(key.column);
        }
        for col in &op.output_columns {
            if seen.contains(col) {
                continue;
            }
            let source = self.ctx.binding(*col).clone();
            self.bind_new_slot(sort_tuple, *col, source.data_type(), source.nullable());
            materialized.push(source);
            seen.insert(*col);
        }
        self.ctx.layouts.compute_mem_layout(sort_tuple);

        let sort = SortInfo {
            sort_exprs,
            ascending: topn.order_by.iter().map(|k| k.ascending).collect(),
            nulls_first: topn.order_by.iter().map(|k| k.nulls_first).collect(),
            materialized_exprs: materialized,
            sort_tuple,
        };
        let node = self.ctx.add_node(
            PlanNodeKind::Sort(SortNode {
                sort,
                topn: op.limit.is_some(),
                offset: if topn.split { 0 } else { topn.offset },
                analytic_partition_exprs: Vec::new(),
            }),
            vec![root],
            vec![sort_tuple],
            op.stats.output_row_count,
        );
        self.ctx.node_mut(node).limit = op.limit;
        self.ctx.fragment_mut(fragment).root = node;
        Ok(fragment)
    }

    /// Merging gather above an already-sorted child fragment.
    fn build_merge_topn(&mut self, op: &OpNode, topn: &TopNOp) -> Result<FragmentId> {
        let child = self.visit(&op.inputs[0])?;
        let child_root = self.root_of(child);
        let sort = match &self.ctx.node(child_root).kind {
            PlanNodeKind::Sort(s) => s.sort.clone(),
            other => panic!("merge sort over non-sort child {}", other.name()),
        };

        let num_senders = self.ctx.fragment(child).parallel_exec_num;
        let tuples = self.ctx.node(child_root).tuple_ids.clone();
        let cardinality = self.ctx.node(child_root).cardinality;
        let exchange = self.ctx.add_node(
            PlanNodeKind::Exchange(ExchangeNode {
                kind: ExchangeKind::Gather,
                num_senders,
                merge: Some(MergeInfo {
                    sort,
                    offset: topn.offset,
                }),
            }),
            vec![child_root],
            tuples,
            cardinality,
        );
        self.ctx.node_mut(exchange).limit = op.limit;

        let fragment = self.ctx.add_fragment(|id| {
            let mut f = PlanFragment::new(id, exchange, DataPartition::unpartitioned());
            f.parallel_exec_num = 1;
            f
        });
        self.ctx.fragment_mut(fragment).children.push(child);
        self.ctx.fragment_mut(child).set_destination(exchange);
        self.ctx.fragment_mut(child).output_partition = DataPartition::unpartitioned();
        Ok(fragment)
    }

    // ---- aggregation ----

    fn visit_aggregate(&mut self, op: &OpNode, agg: &AggregateOp) -> Result<FragmentId> {
        let fragment = self.visit(&op.inputs[0])?;
        let root = self.root_of(fragment);

        // lowered against child bindings, before group columns are rebound
        let partition_exprs: Vec<PhysExpr> = agg
            .partition_by
            .iter()
            .map(|c| self.ctx.binding(*c).clone())
            .collect();
        let group_sources: Vec<PhysExpr> = agg
            .group_by
            .iter()
            .map(|c| self.ctx.binding(*c).clone())
            .collect();

        let tuple = self.ctx.layouts.new_tuple();
        let mut group_exprs = Vec::new();
        for (col, source) in agg.group_by.iter().zip(&group_sources) {
            let slot = self.bind_new_slot(tuple, *col, source.data_type(), source.nullable());
            group_exprs.push(self.slot_ref(slot));
        }

        let mut agg_calls = Vec::new();
        for (idx, (col, call)) in agg.aggregations.iter().enumerate() {
            let mut lowered = self.lower(call);
            self.mark_agg_call(&mut lowered, agg, idx);
            self.bind_new_slot(tuple, *col, lowered.data_type(), lowered.nullable());
            agg_calls.push(lowered);
        }
        self.ctx.layouts.compute_mem_layout(tuple);

        let (phase, needs_finalize, streaming) = match agg.phase {
            AggPhase::Local => (crate::plan_node::AggNodePhase::First, false, true),
            AggPhase::Global if agg.single_distinct_pos.is_some() && agg.split => {
                (crate::plan_node::AggNodePhase::Second, true, false)
            }
            AggPhase::Global if !agg.split => {
                (crate::plan_node::AggNodePhase::Second, true, false)
            }
            AggPhase::Global => (crate::plan_node::AggNodePhase::SecondMerge, true, false),
            AggPhase::DistinctGlobal => {
                (crate::plan_node::AggNodePhase::FirstMerge, false, false)
            }
            AggPhase::DistinctLocal => (crate::plan_node::AggNodePhase::Second, false, true),
        };
        let colocate = !agg.group_by.is_empty()
            && !self.is_exchange(self.skip_decode(root))
            && self.fragment_has_colocate_scan(fragment);

        let node = self.ctx.add_node(
            PlanNodeKind::Aggregation(AggregationNode {
                phase,
                group_exprs,
                agg_calls,
                needs_finalize,
                streaming_preagg: streaming,
                streaming_mode: self.config.streaming_preagg_mode,
                colocate,
            }),
            vec![root],
            vec![tuple],
            op.stats.output_row_count,
        );
        let conjuncts = self.lower_conjuncts(op.predicate.as_ref());
        self.ctx.node_mut(node).conjuncts = conjuncts;
        self.ctx.node_mut(node).limit = op.limit;
        self.ctx.fragment_mut(fragment).root = node;

        if agg.phase == AggPhase::Local && !partition_exprs.is_empty() {
            self.ctx.fragment_mut(fragment).output_partition =
                DataPartition::hash(partition_exprs);
        }
        // a one-phase aggregate keys the whole fragment; splitting its input
        // locally would break grouping
        if needs_finalize && !agg.split && self.config.pipeline_dop_adaption {
            self.ctx.fragment_mut(fragment).needs_local_shuffle = false;
        }
        Ok(fragment)
    }

    /// Applies the per-phase merge markers and the single-distinct rewrite
    /// to one lowered aggregate call.
    fn mark_agg_call(&mut self, call: &mut PhysExpr, agg: &AggregateOp, idx: usize) {
        let is_distinct_pos = agg.single_distinct_pos == Some(idx);
        match agg.phase {
            AggPhase::Local => {}
            AggPhase::Global => {
                if agg.single_distinct_pos.is_some() && agg.split {
                    if !is_distinct_pos {
                        set_merge(call);
                    }
                } else if !agg.split {
                    if is_distinct_pos {
                        rewrite_distinct_to_multi(call);
                    }
                } else {
                    set_merge(call);
                }
            }
            AggPhase::DistinctGlobal => set_merge(call),
            AggPhase::DistinctLocal => {
                if !is_distinct_pos {
                    set_merge(call);
                }
            }
        }
    }

    fn fragment_has_colocate_scan(&self, fragment: FragmentId) -> bool {
        self.ctx.fragment_nodes(fragment).iter().any(|n| {
            if let PlanNodeKind::Scan(scan) = &self.ctx.node(*n).kind {
                self.catalog
                    .colocate_group(scan.table)
                    .is_some_and(|g| self.catalog.colocate_group_stable(g))
            } else {
                false
            }
        })
    }

    // ---- misc single-child nodes ----

    fn visit_assert_one_row(&mut self, op: &OpNode, assert: &AssertOneRowOp) -> Result<FragmentId> {
        let fragment = self.visit(&op.inputs[0])?;
        let root = self.root_of(fragment);
        let tuples = self.ctx.node(root).tuple_ids.clone();
        // a zero-row input surfaces as a single all-null row
        for t in &tuples {
            self.ctx.layouts.widen_tuple_nullable(*t);
        }
        let node = self.ctx.add_node(
            PlanNodeKind::AssertNumRows(AssertNumRowsNode {
                cmp: assert.cmp,
                rows: assert.rows,
                tips: assert.tips.clone(),
            }),
            vec![root],
            tuples,
            op.stats.output_row_count,
        );
        self.ctx.node_mut(node).nullable_generate = true;
        self.ctx.node_mut(node).limit = op.limit;
        self.ctx.fragment_mut(fragment).root = node;
        Ok(fragment)
    }

    fn visit_window(&mut self, op: &OpNode, window: &WindowOp) -> Result<FragmentId> {
        let fragment = self.visit(&op.inputs[0])?;
        let root = self.root_of(fragment);

        let partition_exprs: Vec<PhysExpr> = window
            .partition_by
            .iter()
            .map(|c| self.ctx.binding(*c).clone())
            .collect();
        let order_by_exprs: Vec<PhysExpr> = window
            .order_by
            .iter()
            .map(|k| self.ctx.binding(k.column).clone())
            .collect();

        let tuple = self.ctx.layouts.new_tuple();
        let mut fn_calls = Vec::new();
        for (col, call) in &window.calls {
            let lowered = self.lower(call);
            self.bind_new_slot(tuple, *col, lowered.data_type(), lowered.nullable());
            fn_calls.push(lowered);
        }
        self.ctx.layouts.compute_mem_layout(tuple);

        let mut tuples = self.ctx.node(root).tuple_ids.clone();
        tuples.push(tuple);
        let node = self.ctx.add_node(
            PlanNodeKind::Analytic(AnalyticNode {
                fn_calls,
                partition_exprs: partition_exprs.clone(),
                order_by_exprs,
                ascending: window.order_by.iter().map(|k| k.ascending).collect(),
                nulls_first: window.order_by.iter().map(|k| k.nulls_first).collect(),
                output_tuple: tuple,
            }),
            vec![root],
            tuples,
            op.stats.output_row_count,
        );
        let conjuncts = self.lower_conjuncts(op.predicate.as_ref());
        self.ctx.node_mut(node).conjuncts = conjuncts;
        self.ctx.node_mut(node).limit = op.limit;

        // a sorted input can emit complete partitions early
        if let PlanNodeKind::Sort(sort) = &mut self.ctx.node_mut(root).kind {
            sort.analytic_partition_exprs = partition_exprs;
        }
        self.ctx.fragment_mut(fragment).root = node;
        Ok(fragment)
    }

    fn visit_repeat(&mut self, op: &OpNode, repeat: &RepeatOp) -> Result<FragmentId> {
        let fragment = self.visit(&op.inputs[0])?;
        let root = self.root_of(fragment);

        let tuple = self.ctx.layouts.new_tuple();
        for col in &repeat.output_grouping {
            let info = self.columns.info(*col).clone();
            // grouping columns are nulled out in the sets that drop them
            self.bind_new_slot(tuple, *col, info.data_type, true);
        }
        self.ctx.layouts.compute_mem_layout(tuple);

        let repeat_slots = repeat
            .repeat_columns
            .iter()
            .map(|set| set.iter().map(|c| self.ctx.slot_of(*c)).collect())
            .collect();

        let mut tuples = self.ctx.node(root).tuple_ids.clone();
        tuples.push(tuple);
        let node = self.ctx.add_node(
            PlanNodeKind::Repeat(RepeatNode {
                output_tuple: tuple,
                repeat_slots,
                grouping_ids: repeat.grouping_ids.clone(),
            }),
            vec![root],
            tuples,
            op.stats.output_row_count,
        );
        let conjuncts = self.lower_conjuncts(op.predicate.as_ref());
        self.ctx.node_mut(node).conjuncts = conjuncts;
        self.ctx.node_mut(node).nullable_generate = true;
        self.ctx.fragment_mut(fragment).root = node;
        Ok(fragment)
    }

    fn visit_table_function(&mut self, op: &OpNode, func: &TableFunctionOp) -> Result<FragmentId> {
        let fragment = self.visit(&op.inputs[0])?;
        let root = self.root_of(fragment);

        let param_slots: Vec<SlotId> = func
            .param_columns
            .iter()
            .map(|c| self.ctx.slot_of(*c))
            .collect();
        let tuple = self.ctx.layouts.new_tuple();
        let mut outer_slots = Vec::new();
        for col in &func.outer_columns {
            let source = self.ctx.binding(*col).clone();
            outer_slots.push(self.bind_new_slot(
                tuple,
                *col,
                source.data_type(),
                source.nullable(),
            ));
        }
        let mut result_slots = Vec::new();
        for col in &func.result_columns {
            let info = self.columns.info(*col).clone();
            result_slots.push(self.bind_new_slot(tuple, *col, info.data_type, info.nullable));
        }
        self.ctx.layouts.compute_mem_layout(tuple);

        let node = self.ctx.add_node(
            PlanNodeKind::TableFunction(TableFunctionNode {
                name: func.name.clone(),
                output_tuple: tuple,
                param_slots,
                outer_slots,
                result_slots,
            }),
            vec![root],
            vec![tuple],
            op.stats.output_row_count,
        );
        let conjuncts = self.lower_conjuncts(op.predicate.as_ref());
        self.ctx.node_mut(node).conjuncts = conjuncts;
        self.ctx.node_mut(node).limit = op.limit;
        self.ctx.fragment_mut(fragment).root = node;
        Ok(fragment)
    }

    fn visit_decode(&mut self, op: &OpNode, decode: &DecodeOp) -> Result<FragmentId> {
        let fragment = self.visit(&op.inputs[0])?;
        let root = self.root_of(fragment);

        let tuple = self.ctx.layouts.new_tuple();
        let mut pairs = Vec::new();
        for (dict_col, string_col) in &decode.dict_to_strings {
            let dict_slot = self.ctx.slot_of(*dict_col);
            let nullable = self.ctx.layouts.slot(dict_slot).nullable;
            let string_slot =
                self.bind_new_slot(tuple, *string_col, arrow_schema::DataType::Utf8, nullable);
            pairs.push((dict_slot, string_slot));
        }
        let mut string_projections = Vec::new();
        for (col, expr) in &decode.string_functions {
            let lowered = self.lower(expr);
            let slot = self.bind_new_slot(tuple, *col, lowered.data_type(), lowered.nullable());
            string_projections.push((slot, lowered));
        }
        self.ctx.layouts.compute_mem_layout(tuple);

        let mut tuples = self.ctx.node(root).tuple_ids.clone();
        tuples.push(tuple);
        let node = self.ctx.add_node(
            PlanNodeKind::Decode(DecodeNode {
                dict_to_strings: pairs,
                string_projections,
            }),
            vec![root],
            tuples,
            op.stats.output_row_count,
        );
        self.ctx.node_mut(node).limit = op.limit;
        self.ctx.fragment_mut(fragment).root = node;
        Ok(fragment)
    }

    // ---- set operations ----

    fn visit_set_op(&mut self, op: &OpNode, set_op: &SetOperation) -> Result<FragmentId> {
        let kind = match set_op.kind {
            SetOpKind::Union => SetNodeKind::Union,
            SetOpKind::Except => SetNodeKind::Except,
            SetOpKind::Intersect => SetNodeKind::Intersect,
        };

        let mut child_fragments = Vec::new();
        let mut child_roots = Vec::new();
        let mut result_expr_lists: Vec<Vec<PhysExpr>> = Vec::new();
        for (input, outputs) in op.inputs.iter().zip(&set_op.child_outputs) {
            let child = self.visit(input)?;
            child_fragments.push(child);
            child_roots.push(self.root_of(child));
            result_expr_lists.push(
                outputs
                    .iter()
                    .map(|c| self.ctx.binding(*c).clone())
                    .collect(),
            );
        }

        let nullable_children = child_roots
            .iter()
            .any(|r| self.ctx.node(*r).nullable_generate);
        let tuple = self.ctx.layouts.new_tuple();
        let mut output_slots = Vec::new();
        for (idx, col) in set_op.output_columns.iter().enumerate() {
            let info = self.columns.info(*col).clone();
            let nullable = nullable_children
                || result_expr_lists.iter().any(|exprs| exprs[idx].nullable());
            output_slots.push(self.bind_new_slot(tuple, *col, info.data_type, nullable));
        }
        self.ctx.layouts.compute_mem_layout(tuple);

        let output_slot_maps = result_expr_lists
            .iter()
            .map(|exprs| {
                exprs
                    .iter()
                    .enumerate()
                    .filter_map(|(i, e)| e.as_slot().map(|s| (s, output_slots[i])))
                    .collect()
            })
            .collect();
        let first_materialized_child_idx = if kind == SetNodeKind::Union {
            op.inputs.len()
        } else {
            0
        };

        let node = self.ctx.add_node(
            PlanNodeKind::SetOperation(SetNode {
                kind,
                output_tuple: tuple,
                first_materialized_child_idx,
                result_expr_lists,
                const_expr_rows: Vec::new(),
                output_slot_maps,
            }),
            vec![],
            vec![tuple],
            op.stats.output_row_count,
        );
        let conjuncts = self.lower_conjuncts(op.predicate.as_ref());
        self.ctx.node_mut(node).conjuncts = conjuncts;
        self.ctx.node_mut(node).limit = op.limit;
        self.ctx.node_mut(node).nullable_generate = nullable_children;

        let fragment = self
            .ctx
            .add_fragment(|id| PlanFragment::new(id, node, DataPartition::random()));
        self.ctx.fragment_mut(fragment).parallel_exec_num =
            self.config.parallel_exec_instance_num.max(1);

        // every child reaches the set node through its own exchange
        for (child, child_root) in child_fragments.iter().zip(&child_roots) {
            let num_senders = self.ctx.fragment(*child).parallel_exec_num;
            let tuples = self.ctx.node(*child_root).tuple_ids.clone();
            let cardinality = self.ctx.node(*child_root).cardinality;
            let exchange = self.ctx.add_node(
                PlanNodeKind::Exchange(ExchangeNode {
                    kind: ExchangeKind::Shuffle,
                    num_senders,
                    merge: None,
                }),
                vec![*child_root],
                tuples,
                cardinality,
            );
            self.ctx.node_mut(node).children.push(exchange);
            self.ctx.fragment_mut(fragment).children.push(*child);
            self.ctx.fragment_mut(*child).set_destination(exchange);
            self.ctx.fragment_mut(*child).output_partition = DataPartition::random();
        }
        Ok(fragment)
    }

    // ---- common table expressions ----

    fn visit_cte_produce(&mut self, op: &OpNode, produce: &CteProduceOp) -> Result<FragmentId> {
        let child = self.visit(&op.inputs[0])?;
        let child_fragment = self.ctx.fragment(child).clone();
        self.ctx.retire_fragment(child);

        let parallel = child_fragment.parallel_exec_num;
        let partition = child_fragment.partition.clone();
        let root = child_fragment.root;
        let children = child_fragment.children.clone();
        let multicast = self.ctx.add_fragment(|id| {
            let mut f = PlanFragment::new(id, root, partition);
            f.multicast = true;
            f.children = children;
            f.parallel_exec_num = parallel;
            f
        });
        let output_exprs = produce
            .output_columns
            .iter()
            .map(|c| self.ctx.binding(*c).clone())
            .collect();
        self.ctx.fragment_mut(multicast).output_exprs = Some(output_exprs);
        self.ctx.cte_fragments.insert(produce.cte_id, multicast);
        Ok(multicast)
    }

    fn visit_cte_consume(&mut self, op: &OpNode, consume: &CteConsumeOp) -> Result<FragmentId> {
        let producer = *self
            .ctx
            .cte_fragments
            .get(&consume.cte_id)
            .unwrap_or_else(|| panic!("cte {} consumed before being produced", consume.cte_id));
        let producer_root = self.ctx.fragment(producer).root;
        let num_senders = self.ctx.fragment(producer).parallel_exec_num;
        let partition = self.ctx.fragment(producer).partition.clone();

        let tuples = self.ctx.node(producer_root).tuple_ids.clone();
        let cardinality = self.ctx.node(producer_root).cardinality;
        let exchange = self.ctx.add_node(
            PlanNodeKind::Exchange(ExchangeNode {
                kind: ExchangeKind::Shuffle,
                num_senders,
                merge: None,
            }),
            vec![producer_root],
            tuples,
            cardinality,
        );

        let parallel = self.config.parallel_exec_instance_num.max(1);
        let fragment = self.ctx.add_fragment(|id| {
            let mut f = PlanFragment::new(id, exchange, partition);
            f.parallel_exec_num = parallel;
            f
        });
        self.ctx.fragment_mut(fragment).children.push(producer);
        self.ctx.fragment_mut(producer).destinations.push(exchange);

        // rebind the consumer's private columns onto the shared stream
        self.apply_projection(
            fragment,
            &Projection {
                column_map: consume.output_map.clone(),
                common_sub_map: Vec::new(),
            },
            op.stats,
        );
        if let Some(predicate) = &op.predicate {
            let conjuncts = self.lower_conjuncts(Some(predicate));
            let root = self.root_of(fragment);
            self.ctx.node_mut(root).conjuncts.extend(conjuncts);
        }
        if let Some(limit) = op.limit {
            let root = self.root_of(fragment);
            self.ctx.node_mut(root).limit = Some(limit);
        }
        Ok(fragment)
    }

    fn visit_cte_anchor(&mut self, op: &OpNode) -> Result<FragmentId> {
        self.visit(&op.inputs[0])?;
        self.visit(&op.inputs[1])
    }

    // ---- output fragment and finalization ----

    pub(crate) fn create_output_fragment(
        &mut self,
        fragment: FragmentId,
        tree: &PhysicalTree,
    ) -> Result<FragmentId> {
        let output_exprs: Vec<PhysExpr> = tree
            .output_columns
            .iter()
            .map(|c| self.ctx.binding(*c).clone())
            .collect();

        let root = self.root_of(fragment);
        // an exchange-rooted fragment already gathers on one instance
        if self.ctx.fragment(fragment).partition.kind == PartitionKind::Unpartitioned
            || self.is_exchange(root)
        {
            self.ctx.fragment_mut(fragment).output_exprs = Some(output_exprs);
            return Ok(fragment);
        }
        // a single-tablet scan fragment already runs on one instance
        if self.single_tablet_fragment(fragment) && !self.has_local_bucket_right_join(fragment) {
            self.ctx.fragment_mut(fragment).output_exprs = Some(output_exprs);
            return Ok(fragment);
        }

        let num_senders = self.ctx.fragment(fragment).parallel_exec_num;
        let tuples = self.ctx.node(root).tuple_ids.clone();
        let cardinality = self.ctx.node(root).cardinality;
        let limit = self.ctx.node(root).limit;
        let exchange = self.ctx.add_node(
            PlanNodeKind::Exchange(ExchangeNode {
                kind: ExchangeKind::Gather,
                num_senders,
                merge: None,
            }),
            vec![root],
            tuples,
            cardinality,
        );
        self.ctx.node_mut(exchange).limit = limit;

        let output = self.ctx.add_fragment(|id| {
            let mut f = PlanFragment::new(id, exchange, DataPartition::unpartitioned());
            f.parallel_exec_num = 1;
            f
        });
        self.ctx.fragment_mut(output).children.push(fragment);
        self.ctx.fragment_mut(output).output_exprs = Some(output_exprs);
        self.ctx.fragment_mut(fragment).set_destination(exchange);
        self.ctx.fragment_mut(fragment).output_partition = DataPartition::unpartitioned();
        Ok(output)
    }

    fn single_tablet_fragment(&self, fragment: FragmentId) -> bool {
        let mut scans = 0usize;
        let mut ranges = 0usize;
        for n in self.ctx.fragment_nodes(fragment) {
            if let PlanNodeKind::Scan(scan) = &self.ctx.node(n).kind {
                scans += 1;
                ranges += scan.ranges.len();
            }
        }
        scans > 0 && ranges <= 1
    }

    /// Right/full local-bucket joins need every bucket's build rows present,
    /// so their fragment cannot short-circuit to direct output.
    fn has_local_bucket_right_join(&self, fragment: FragmentId) -> bool {
        self.ctx.fragment_nodes(fragment).iter().any(|n| {
            if let PlanNodeKind::HashJoin(join) = &self.ctx.node(*n).kind {
                join.distribution == crate::plan_node::JoinDistributionMode::LocalHashBucket
                    && (join.join_type.is_right_flavor())
            } else {
                false
            }
        })
    }

    pub(crate) fn finalize(&mut self) {
        self.compute_local_rf_waiting_sets();
        if self.config.enable_pipeline_engine && !self.config.enable_global_runtime_filter {
            self.clear_runtime_filters();
        }
        self.ctx.fragment_order.reverse();
    }

    /// For each fragment, every probe node records the fragment-local
    /// filters it must wait for before emitting rows.
    fn compute_local_rf_waiting_sets(&mut self) {
        for fragment in self.ctx.fragment_order.clone() {
            let nodes = self.ctx.fragment_nodes(fragment);
            for filter in self.ctx.filters.clone() {
                if !nodes.contains(&filter.build_node) {
                    continue;
                }
                for target in &filter.probe_targets {
                    if target.local && nodes.contains(&target.node) {
                        self.ctx
                            .node_mut(target.node)
                            .local_rf_waiting_set
                            .insert(filter.id);
                    }
                }
            }
        }
    }

    /// Pipeline execution without global runtime filters builds its own
    /// local filters from the waiting sets; descriptor state is dropped.
    fn clear_runtime_filters(&mut self) {
        for fragment in self.ctx.fragment_order.clone() {
            for n in self.ctx.fragment_nodes(fragment) {
                self.ctx.node_mut(n).probe_filters.clear();
                if let PlanNodeKind::HashJoin(join) = &mut self.ctx.node_mut(n).kind {
                    join.build_filters.clear();
                }
            }
        }
        self.ctx.filters.clear();
    }
}

fn set_merge(call: &mut PhysExpr) {
    if let PhysExpr::Call { merge, distinct, .. } = call {
        *merge = true;
        *distinct = false;
    }
}

/// One-phase distinct aggregates collapse into their multi_distinct forms.
fn rewrite_distinct_to_multi(call: &mut PhysExpr) {
    if let PhysExpr::Call {
        name,
        distinct,
        data_type,
        args,
        ..
    } = call
    {
        if !*distinct {
            return;
        }
        let rewritten = match name.as_str() {
            "count" => "multi_distinct_count",
            "sum" => "multi_distinct_sum",
            _ => return,
        };
        *name = rewritten.to_string();
        *distinct = false;
        let (t, _) = crate::expr::call_result_type(name, args);
        *data_type = t;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_schema::DataType;

    #[test]
    fn distinct_count_rewrites_to_multi_distinct() {
        let mut call = PhysExpr::Call {
            name: "count".into(),
            args: vec![],
            data_type: DataType::Int64,
            nullable: false,
            distinct: true,
            merge: false,
        };
        rewrite_distinct_to_multi(&mut call);
        match call {
            PhysExpr::Call { name, distinct, .. } => {
                assert_eq!(name, "multi_distinct_count");
                assert!(!distinct);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn non_distinct_calls_are_left_alone() {
        let mut call = PhysExpr::Call {
            name: "sum".into(),
            args: vec![],
            data_type: DataType::Int64,
            nullable: true,
            distinct: false,
            merge: false,
        };
        rewrite_distinct_to_multi(&mut call);
        match &call {
            PhysExpr::Call { name, .. } => assert_eq!(name, "sum"),
            _ => unreachable!(),
        }
    }
}
