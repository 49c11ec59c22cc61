//! Optimizer-facing physical operator tree.
//!
//! This is the input contract of the fragment builder: a fully optimized,
//! cost-annotated operator tree over logical columns. The builder consumes it
//! read-only; all mutation happens in the plan-node arena it produces.

use crate::expr::ScalarExpr;
use arrow_schema::DataType;
use quarry_common::{ColumnId, CteId, PartitionId, TableId, TabletId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Root of the builder input: operator tree plus the column catalog that
/// types every logical column the tree references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalTree {
    /// Root operator.
    pub root: OpNode,
    /// Column definitions for every [`ColumnId`] in the tree.
    pub columns: ColumnCatalog,
    /// Output columns of the query, in result order.
    pub output_columns: Vec<ColumnId>,
    /// Result column names, positionally matching `output_columns`.
    pub column_names: Vec<String>,
}

/// Name, type, and nullability of one logical column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name for explain output.
    pub name: String,
    /// Column type.
    pub data_type: DataType,
    /// Column nullability as derived by the optimizer.
    pub nullable: bool,
}

/// Logical column definitions keyed by [`ColumnId`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnCatalog {
    columns: HashMap<ColumnId, ColumnInfo>,
}

impl ColumnCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a column definition, returning its id for chaining.
    pub fn insert(&mut self, id: ColumnId, info: ColumnInfo) -> ColumnId {
        self.columns.insert(id, info);
        id
    }

    /// Looks up a column definition.
    ///
    /// Every column referenced by the operator tree must be present; a miss
    /// is an optimizer contract violation and panics.
    pub fn info(&self, id: ColumnId) -> &ColumnInfo {
        self.columns
            .get(&id)
            .unwrap_or_else(|| panic!("column {id} missing from catalog"))
    }
}

/// Cost-model annotations the builder consumes.
///
/// Only the output row estimate survives into the fragment plan; it drives
/// runtime-filter gating and broadcast dop estimation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Statistics {
    /// Estimated output row count.
    pub output_row_count: f64,
}

impl Statistics {
    /// Statistics with a known row estimate.
    pub fn new(output_row_count: f64) -> Self {
        Self { output_row_count }
    }

    /// Statistics for an unestimated operator.
    pub fn unknown() -> Self {
        Self {
            output_row_count: 0.0,
        }
    }
}

/// One operator in the optimized tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpNode {
    /// Operator payload.
    pub kind: OperatorKind,
    /// Child operators, left to right.
    pub inputs: Vec<OpNode>,
    /// Cost-model annotations.
    pub stats: Statistics,
    /// Columns this operator produces.
    pub output_columns: Vec<ColumnId>,
    /// Projection applied on top of the operator, if any.
    pub projection: Option<Projection>,
    /// Conjunction predicate applied on top of the operator, if any.
    pub predicate: Option<ScalarExpr>,
    /// Row limit applied on top of the operator, if any.
    pub limit: Option<u64>,
}

impl OpNode {
    /// Operator with the given payload and children and no decorations.
    pub fn new(kind: OperatorKind, inputs: Vec<OpNode>) -> Self {
        Self {
            kind,
            inputs,
            stats: Statistics::unknown(),
            output_columns: Vec::new(),
            projection: None,
            predicate: None,
            limit: None,
        }
    }

    /// Sets the cost annotations.
    pub fn with_stats(mut self, stats: Statistics) -> Self {
        self.stats = stats;
        self
    }

    /// Sets the output column list.
    pub fn with_outputs(mut self, columns: Vec<ColumnId>) -> Self {
        self.output_columns = columns;
        self
    }

    /// Attaches an on-top projection.
    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    /// Attaches an on-top predicate.
    pub fn with_predicate(mut self, predicate: ScalarExpr) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Attaches an on-top row limit.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Projection map attached on top of an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Projection {
    /// Output column to defining expression.
    pub column_map: Vec<(ColumnId, ScalarExpr)>,
    /// Factored common sub-expressions, lowered before `column_map`.
    pub common_sub_map: Vec<(ColumnId, ScalarExpr)>,
}

/// Closed set of physical operators the builder translates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperatorKind {
    /// Storage table scan.
    TableScan(ScanOp),
    /// Constant relation.
    Values(ValuesOp),
    /// Standalone projection.
    Project,
    /// Standalone filter (predicate on the node).
    Filter,
    /// Hash aggregate, one phase of a multi-phase plan.
    HashAggregate(AggregateOp),
    /// Data movement enforcer.
    Distribution(DistributionOp),
    /// Sort with optional limit, possibly phase-split.
    TopN(TopNOp),
    /// Hash join (cross joins translate to nested-loop nodes).
    HashJoin(JoinOp),
    /// Union / except / intersect.
    SetOp(SetOperation),
    /// Grouping-sets repeat.
    Repeat(RepeatOp),
    /// Lateral table function.
    TableFunction(TableFunctionOp),
    /// Scalar-subquery row-count assertion.
    AssertOneRow(AssertOneRowOp),
    /// Window (analytic) functions.
    Window(WindowOp),
    /// Pass-through row limit.
    Limit,
    /// Dictionary decode of low-cardinality string columns.
    Decode(DecodeOp),
    /// CTE producer side.
    CteProduce(CteProduceOp),
    /// CTE consumer side.
    CteConsume(CteConsumeOp),
    /// CTE anchor pairing one producer with its consumers.
    CteAnchor,
}

/// Table scan payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOp {
    /// Scanned table.
    pub table: TableId,
    /// Output column to source table column name.
    pub column_map: Vec<(ColumnId, String)>,
    /// Partitions surviving pruning.
    pub selected_partitions: Vec<PartitionId>,
    /// Tablets surviving pruning.
    pub selected_tablets: Vec<TabletId>,
    /// Output columns holding the table's hash-distribution keys, in key
    /// order; empty when the distribution keys are not all read.
    pub bucket_columns: Vec<ColumnId>,
    /// Storage-level pre-aggregation is sound for this scan.
    pub preagg: bool,
}

/// Constant relation payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuesOp {
    /// Output columns.
    pub columns: Vec<ColumnId>,
    /// Row-major constant expressions; empty means an empty relation.
    pub rows: Vec<Vec<ScalarExpr>>,
}

/// Placement of one aggregate node in the multi-phase plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggPhase {
    /// Pre-shuffle partial aggregation.
    Local,
    /// Post-shuffle final aggregation.
    Global,
    /// Third phase of a distinct plan: merge partials grouped by
    /// group-by + distinct columns.
    DistinctGlobal,
    /// Fourth phase of a distinct plan: final local re-aggregation.
    DistinctLocal,
}

/// Hash aggregate payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateOp {
    /// Phase of this node.
    pub phase: AggPhase,
    /// The aggregation was split across an exchange; a one-phase global
    /// aggregate has `phase == Global` and `split == false`.
    pub split: bool,
    /// Group-by columns.
    pub group_by: Vec<ColumnId>,
    /// Output column to aggregate call expression.
    pub aggregations: Vec<(ColumnId, ScalarExpr)>,
    /// Index into `aggregations` of the single DISTINCT call, when the
    /// optimizer chose the multi_distinct rewrite path.
    pub single_distinct_pos: Option<usize>,
    /// Columns the enclosing shuffle partitions by; drives the output
    /// partition of the local phase's fragment.
    pub partition_by: Vec<ColumnId>,
}

/// Data movement enforced by the optimizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DistributionOp {
    /// Gather all rows to one instance.
    Gather,
    /// Replicate all rows to every instance.
    Broadcast,
    /// Hash-repartition by the given columns.
    Shuffle {
        /// Hash key columns.
        columns: Vec<ColumnId>,
    },
}

/// Sort key direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ordering {
    /// Sort column.
    pub column: ColumnId,
    /// Ascending order.
    pub ascending: bool,
    /// Nulls sort before non-nulls.
    pub nulls_first: bool,
}

/// Sort / top-n payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopNOp {
    /// Sort keys, major first.
    pub order_by: Vec<Ordering>,
    /// Rows to skip after the final merge.
    pub offset: u64,
    /// Split two-phase top-n: partial sort below an exchange, merge above.
    pub split: bool,
    /// Partial phase of a split top-n (the merge phase has this unset).
    pub partial: bool,
}

/// Join type vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    /// Inner join.
    Inner,
    /// Cross join.
    Cross,
    /// Left outer join.
    LeftOuter,
    /// Right outer join.
    RightOuter,
    /// Full outer join.
    FullOuter,
    /// Left semi join.
    LeftSemi,
    /// Right semi join.
    RightSemi,
    /// Left anti join.
    LeftAnti,
    /// Right anti join.
    RightAnti,
}

impl JoinType {
    /// Left side keeps unmatched rows (its slots stay non-null).
    pub fn preserves_left(&self) -> bool {
        matches!(self, JoinType::LeftOuter | JoinType::FullOuter)
    }

    /// Right side keeps unmatched rows.
    pub fn preserves_right(&self) -> bool {
        matches!(self, JoinType::RightOuter | JoinType::FullOuter)
    }

    /// Right-flavored join: build side must see all its rows on one node,
    /// which forbids broadcasting the build input.
    pub fn is_right_flavor(&self) -> bool {
        matches!(
            self,
            JoinType::RightOuter | JoinType::RightSemi | JoinType::RightAnti | JoinType::FullOuter
        )
    }

    /// Probe rows without a match are dropped, so a build-side runtime
    /// filter applied to the probe side is sound.
    pub fn filters_probe_side(&self) -> bool {
        !matches!(
            self,
            JoinType::LeftOuter | JoinType::FullOuter | JoinType::LeftAnti | JoinType::Cross
        )
    }
}

/// Hash join payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinOp {
    /// Join type.
    pub join_type: JoinType,
    /// Full ON predicate; equality conjuncts between the two sides become
    /// hash keys, the rest become other-conjuncts.
    pub on_predicate: Option<ScalarExpr>,
    /// Distribution mode hints from the optimizer's enforcer placement, in
    /// priority order. Empty means the builder derives the mode from the
    /// child fragment shapes alone.
    pub distribution_hint: Option<JoinDistributionHint>,
}

/// Optimizer hint restricting join distribution resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinDistributionHint {
    /// Force broadcast of the right side.
    Broadcast,
    /// Force shuffle of both sides.
    Shuffle,
}

/// Set-operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetOpKind {
    /// Union; `distinct` unions are planned as union-all plus an aggregate
    /// above, so the node itself always passes rows through.
    Union,
    /// Except (distinct).
    Except,
    /// Intersect (distinct).
    Intersect,
}

/// Set-operation payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetOperation {
    /// Kind.
    pub kind: SetOpKind,
    /// Output columns.
    pub output_columns: Vec<ColumnId>,
    /// Per-child output columns, positionally matched to `output_columns`.
    pub child_outputs: Vec<Vec<ColumnId>>,
}

/// Grouping-sets repeat payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatOp {
    /// All grouping columns produced by the repeat, including the virtual
    /// grouping-id columns.
    pub output_grouping: Vec<ColumnId>,
    /// Per-grouping-set columns kept non-null.
    pub repeat_columns: Vec<Vec<ColumnId>>,
    /// Per-grouping-set grouping-id values, positionally matching
    /// `repeat_columns`.
    pub grouping_ids: Vec<u64>,
}

/// Lateral table-function payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableFunctionOp {
    /// Function name.
    pub name: String,
    /// Columns passed as function arguments.
    pub param_columns: Vec<ColumnId>,
    /// Input columns replicated onto every produced row.
    pub outer_columns: Vec<ColumnId>,
    /// Fresh columns produced by the function.
    pub result_columns: Vec<ColumnId>,
}

/// Comparison applied by a row-count assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssertCmp {
    /// Exactly `rows`.
    Eq,
    /// At most `rows`.
    LtEq,
}

/// Scalar-subquery assertion payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertOneRowOp {
    /// Comparison kind.
    pub cmp: AssertCmp,
    /// Row bound.
    pub rows: u64,
    /// Error text reported when the assertion fails at runtime.
    pub tips: String,
}

/// Window frame bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameBound {
    /// Unbounded preceding/following depending on position.
    Unbounded,
    /// Current row.
    CurrentRow,
    /// N rows preceding.
    Preceding(u64),
    /// N rows following.
    Following(u64),
}

/// Window frame specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowFrame {
    /// ROWS frame (RANGE otherwise).
    pub rows: bool,
    /// Frame start.
    pub start: FrameBound,
    /// Frame end.
    pub end: FrameBound,
}

/// Window-function payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowOp {
    /// Output column to analytic call expression.
    pub calls: Vec<(ColumnId, ScalarExpr)>,
    /// PARTITION BY columns.
    pub partition_by: Vec<ColumnId>,
    /// ORDER BY keys.
    pub order_by: Vec<Ordering>,
    /// Frame, when the calls need one.
    pub frame: Option<WindowFrame>,
}

/// Dictionary-decode payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeOp {
    /// Dictionary-encoded column to decoded string column.
    pub dict_to_strings: Vec<(ColumnId, ColumnId)>,
    /// String functions rewritten to run on dictionary codes; keyed by the
    /// output column they define.
    pub string_functions: Vec<(ColumnId, ScalarExpr)>,
}

/// CTE producer payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CteProduceOp {
    /// Pairing key with the consumers.
    pub cte_id: CteId,
    /// Columns published to consumers.
    pub output_columns: Vec<ColumnId>,
}

/// CTE consumer payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CteConsumeOp {
    /// Pairing key with the producer.
    pub cte_id: CteId,
    /// Consumer-local column to producer-column expression.
    pub output_map: Vec<(ColumnId, ScalarExpr)>,
}
