//! Executable plan nodes.
//!
//! Plan nodes live in the [`crate::context::PlanContext`] arena and address
//! each other by [`PlanNodeId`]; the tree shape is the `children` lists.
//! Exchange nodes keep their producing subtree as a child, so one node tree
//! spans fragment boundaries; fragment membership ends at an exchange.

use crate::expr::PhysExpr;
use crate::catalog::ScanRange;
use quarry_common::{ColumnId, FilterId, PlanNodeId, SlotId, TableId, TabletId, TupleId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How rows of a fragment (or exchange input) are divided across instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionKind {
    /// All rows on a single instance.
    Unpartitioned,
    /// Rows spread without a placement contract.
    Random,
    /// Rows hash-partitioned by expressions.
    Hash,
    /// Rows hash-partitioned into the receiver's storage buckets.
    BucketShuffleHash,
}

/// Partitioning contract of a fragment's data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPartition {
    /// Partition kind.
    pub kind: PartitionKind,
    /// Hash expressions for the hash kinds; empty otherwise.
    pub exprs: Vec<PhysExpr>,
}

impl DataPartition {
    /// Single-instance partition.
    pub fn unpartitioned() -> Self {
        Self {
            kind: PartitionKind::Unpartitioned,
            exprs: Vec::new(),
        }
    }

    /// Unconstrained spread.
    pub fn random() -> Self {
        Self {
            kind: PartitionKind::Random,
            exprs: Vec::new(),
        }
    }

    /// Hash partition by expressions.
    pub fn hash(exprs: Vec<PhysExpr>) -> Self {
        Self {
            kind: PartitionKind::Hash,
            exprs,
        }
    }

    /// Bucket-aligned hash partition by expressions.
    pub fn bucket_shuffle(exprs: Vec<PhysExpr>) -> Self {
        Self {
            kind: PartitionKind::BucketShuffleHash,
            exprs,
        }
    }
}

/// Sort specification shared by sort nodes and merging exchanges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortInfo {
    /// Sort key expressions over the sort tuple, major first.
    pub sort_exprs: Vec<PhysExpr>,
    /// Per-key ascending flags.
    pub ascending: Vec<bool>,
    /// Per-key nulls-first flags.
    pub nulls_first: Vec<bool>,
    /// Expressions materializing the sort tuple from the input.
    pub materialized_exprs: Vec<PhysExpr>,
    /// Tuple holding the sorted rows.
    pub sort_tuple: TupleId,
}

/// How a join's inputs are brought together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinDistributionMode {
    /// Build side replicated to every probe instance.
    Broadcast,
    /// Both sides hash-shuffled on the join keys.
    Partitioned,
    /// Both sides already bucket-aligned in one colocation group.
    Colocate,
    /// Build side is a fully replicated table read locally.
    Replicated,
    /// Shuffled side delivered into the local side's storage buckets.
    LocalHashBucket,
    /// Both sides shuffled with bucket-compatible hashing.
    ShuffleHashBucket,
}

/// One executable plan node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    /// Node id within the plan arena.
    pub id: PlanNodeId,
    /// Node payload.
    pub kind: PlanNodeKind,
    /// Child node ids, left to right. For exchange nodes the single child is
    /// the producing fragment's root.
    pub children: Vec<PlanNodeId>,
    /// Tuples describing this node's output rows.
    pub tuple_ids: Vec<TupleId>,
    /// Residual predicates evaluated by this node.
    pub conjuncts: Vec<PhysExpr>,
    /// Row limit, if any.
    pub limit: Option<u64>,
    /// Estimated output rows.
    pub cardinality: f64,
    /// This node (or a same-fragment descendant) introduces nulls into
    /// otherwise non-nullable slots.
    pub nullable_generate: bool,
    /// Runtime filters probed at this node.
    pub probe_filters: Vec<FilterId>,
    /// Fragment-local runtime filters this node must wait for before
    /// producing rows.
    pub local_rf_waiting_set: BTreeSet<FilterId>,
}

/// Closed set of executable node payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PlanNodeKind {
    /// Storage scan.
    Scan(ScanNode),
    /// Fragment-boundary exchange.
    Exchange(ExchangeNode),
    /// Projection.
    Project(ProjectNode),
    /// Predicate evaluation.
    Select(SelectNode),
    /// Hash aggregation.
    Aggregation(AggregationNode),
    /// Sort / top-n.
    Sort(SortNode),
    /// Hash join.
    HashJoin(HashJoinNode),
    /// Nested-loop (cross) join.
    NestLoopJoin(NestLoopJoinNode),
    /// Union / except / intersect / constant rows.
    SetOperation(SetNode),
    /// Grouping-sets repeat.
    Repeat(RepeatNode),
    /// Window functions.
    Analytic(AnalyticNode),
    /// Lateral table function.
    TableFunction(TableFunctionNode),
    /// Row-count assertion.
    AssertNumRows(AssertNumRowsNode),
    /// Dictionary decode.
    Decode(DecodeNode),
    /// Empty relation.
    EmptySet(EmptySetNode),
}

impl PlanNodeKind {
    /// Short name for explain output.
    pub fn name(&self) -> &'static str {
        match self {
            PlanNodeKind::Scan(_) => "SCAN",
            PlanNodeKind::Exchange(_) => "EXCHANGE",
            PlanNodeKind::Project(_) => "PROJECT",
            PlanNodeKind::Select(_) => "SELECT",
            PlanNodeKind::Aggregation(_) => "AGGREGATE",
            PlanNodeKind::Sort(_) => "SORT",
            PlanNodeKind::HashJoin(_) => "HASH JOIN",
            PlanNodeKind::NestLoopJoin(_) => "NESTLOOP JOIN",
            PlanNodeKind::SetOperation(s) => match s.kind {
                SetNodeKind::Union => "UNION",
                SetNodeKind::Except => "EXCEPT",
                SetNodeKind::Intersect => "INTERSECT",
            },
            PlanNodeKind::Repeat(_) => "REPEAT",
            PlanNodeKind::Analytic(_) => "ANALYTIC",
            PlanNodeKind::TableFunction(_) => "TABLE FUNCTION",
            PlanNodeKind::AssertNumRows(_) => "ASSERT ROWS",
            PlanNodeKind::Decode(_) => "DECODE",
            PlanNodeKind::EmptySet(_) => "EMPTYSET",
        }
    }
}

/// Storage scan payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanNode {
    /// Scanned table.
    pub table: TableId,
    /// Table name for explain output.
    pub table_name: String,
    /// Resolved scan ranges.
    pub ranges: Vec<ScanRange>,
    /// Tablet to bucket-sequence mapping, used for bucket-shuffle delivery.
    pub tablet_buckets: Vec<(TabletId, u32)>,
    /// Output columns holding the table's hash-distribution keys, in key
    /// order; empty when the distribution keys are not all read.
    pub bucket_columns: Vec<ColumnId>,
    /// Total tablet count of the table before pruning.
    pub total_tablets: u64,
    /// Output slots kept only for pushed-down simple predicates; execution
    /// drops them after predicate evaluation.
    pub unused_output_slots: Vec<SlotId>,
    /// Storage-level pre-aggregation enabled.
    pub preagg: bool,
}

/// Exchange delivery shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeKind {
    /// All senders to one receiver instance.
    Gather,
    /// Every sender row to every receiver instance.
    Broadcast,
    /// Rows routed by the sender fragment's output partition.
    Shuffle,
}

/// Sorted-stream merge performed by a gathering exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeInfo {
    /// Sort contract of the incoming streams.
    pub sort: SortInfo,
    /// Rows to skip after merging.
    pub offset: u64,
}

/// Fragment-boundary exchange payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeNode {
    /// Delivery shape.
    pub kind: ExchangeKind,
    /// Sender instance count.
    pub num_senders: u32,
    /// Merge sorted input streams instead of interleaving them.
    pub merge: Option<MergeInfo>,
}

/// Projection payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectNode {
    /// Output slot to defining expression.
    pub projections: Vec<(SlotId, PhysExpr)>,
    /// Common sub-expression slot to defining expression; evaluated before
    /// `projections`.
    pub common_subs: Vec<(SlotId, PhysExpr)>,
}

/// Predicate evaluation payload; the conjuncts live on the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectNode {}

/// Placement of one aggregation node in its multi-phase plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggNodePhase {
    /// Aggregates raw input rows; partial output.
    First,
    /// Merges partial states; partial output.
    FirstMerge,
    /// Aggregates raw input rows; final output.
    Second,
    /// Merges partial states; final output.
    SecondMerge,
}

/// Hash-aggregation payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationNode {
    /// Phase of this node.
    pub phase: AggNodePhase,
    /// Group-by expressions.
    pub group_exprs: Vec<PhysExpr>,
    /// Aggregate call expressions; merge variants carry the merge marker.
    pub agg_calls: Vec<PhysExpr>,
    /// Produces final values rather than partial states.
    pub needs_finalize: bool,
    /// Streaming pre-aggregation allowed (first phase only).
    pub streaming_preagg: bool,
    /// Streaming decision forwarded from the session.
    pub streaming_mode: quarry_common::StreamingPreAggMode,
    /// Grouped execution against colocated scan buckets.
    pub colocate: bool,
}

/// Sort payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortNode {
    /// Sort contract and materialization.
    pub sort: SortInfo,
    /// Top-n execution (limit-bounded heap) rather than full sort.
    pub topn: bool,
    /// Rows to skip; only meaningful on the merge phase.
    pub offset: u64,
    /// Partition boundaries of a downstream analytic node, enabling
    /// partition-local early output.
    pub analytic_partition_exprs: Vec<PhysExpr>,
}

/// One hash-join equality conjunct, probe side first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EqJoinConjunct {
    /// Probe (left) side expression.
    pub left: PhysExpr,
    /// Build (right) side expression.
    pub right: PhysExpr,
}

/// Hash-join payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashJoinNode {
    /// Join type.
    pub join_type: crate::operator::JoinType,
    /// Resolved distribution mode.
    pub distribution: JoinDistributionMode,
    /// Hash-key equality conjuncts.
    pub eq_conjuncts: Vec<EqJoinConjunct>,
    /// Non-equality ON conjuncts.
    pub other_conjuncts: Vec<PhysExpr>,
    /// Hash expressions both sides were partitioned by, for the shuffled
    /// modes.
    pub partition_exprs: Vec<PhysExpr>,
    /// Slots the join actually outputs; `None` means all child slots.
    pub output_slots: Option<Vec<SlotId>>,
    /// Push build-side predicates into the probe side scan.
    pub push_down_right_table: bool,
    /// Runtime filters built from this join's build side.
    pub build_filters: Vec<FilterId>,
}

/// Nested-loop join payload; join conjuncts live on the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NestLoopJoinNode {
    /// Join type (cross, or inner with non-equality conjuncts).
    pub join_type: crate::operator::JoinType,
    /// Build side is read from a replicated table with no exchange.
    pub replicated: bool,
}

/// Set-operation node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetNodeKind {
    /// Pass-through union (also hosts constant rows).
    Union,
    /// Distinct except.
    Except,
    /// Distinct intersect.
    Intersect,
}

/// Set-operation payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetNode {
    /// Node kind.
    pub kind: SetNodeKind,
    /// Output tuple.
    pub output_tuple: TupleId,
    /// Children below this index pass rows through without materialization.
    pub first_materialized_child_idx: usize,
    /// Per-child expressions materializing the output tuple.
    pub result_expr_lists: Vec<Vec<PhysExpr>>,
    /// Constant rows (a values relation), materialized without a child.
    pub const_expr_rows: Vec<Vec<PhysExpr>>,
    /// Per-child (child slot, output slot) pass-through maps.
    pub output_slot_maps: Vec<Vec<(SlotId, SlotId)>>,
}

/// Grouping-sets repeat payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatNode {
    /// Output tuple carrying the grouping columns.
    pub output_tuple: TupleId,
    /// Per-grouping-set slots kept non-null.
    pub repeat_slots: Vec<BTreeSet<SlotId>>,
    /// Per-grouping-set grouping-id values.
    pub grouping_ids: Vec<u64>,
}

/// Window-function payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticNode {
    /// Analytic call expressions.
    pub fn_calls: Vec<PhysExpr>,
    /// PARTITION BY expressions.
    pub partition_exprs: Vec<PhysExpr>,
    /// ORDER BY key expressions.
    pub order_by_exprs: Vec<PhysExpr>,
    /// Per-key ascending flags.
    pub ascending: Vec<bool>,
    /// Per-key nulls-first flags.
    pub nulls_first: Vec<bool>,
    /// Tuple holding the analytic results.
    pub output_tuple: TupleId,
}

/// Lateral table-function payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableFunctionNode {
    /// Function name.
    pub name: String,
    /// Output tuple.
    pub output_tuple: TupleId,
    /// Argument slots from the input row.
    pub param_slots: Vec<SlotId>,
    /// Input slots replicated onto every produced row.
    pub outer_slots: Vec<SlotId>,
    /// Slots produced by the function.
    pub result_slots: Vec<SlotId>,
}

/// Row-count assertion payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertNumRowsNode {
    /// Comparison kind.
    pub cmp: crate::operator::AssertCmp,
    /// Row bound.
    pub rows: u64,
    /// Error text reported on failure.
    pub tips: String,
}

/// Dictionary-decode payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeNode {
    /// Dictionary slot to decoded string slot.
    pub dict_to_strings: Vec<(SlotId, SlotId)>,
    /// Projections rewritten to run on dictionary codes.
    pub string_projections: Vec<(SlotId, PhysExpr)>,
}

/// Empty relation payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmptySetNode {}
