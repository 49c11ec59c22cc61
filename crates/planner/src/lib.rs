//! Distributed plan-fragment builder.
//!
//! Takes a fully optimized physical operator tree ([`operator::PhysicalTree`])
//! and lowers it into a graph of plan fragments connected by exchange edges,
//! ready for scheduling onto workers.
//!
//! Pipeline:
//! 1. bottom-up translation of operators into plan nodes and fragments
//!    ([`builder::FragmentBuilder`])
//! 2. join distribution resolution and fragment stitching ([`join`])
//! 3. runtime-filter generation and push-down ([`runtime_filter`])
//! 4. output-fragment creation and finalization (fragment order reversal,
//!    local waiting sets)
//!
//! All plan structure lives in arenas addressed by typed ids; fragment
//! surgery is id rewiring, never shared-pointer mutation.

pub mod builder;
pub mod catalog;
pub mod context;
pub mod explain;
pub mod expr;
pub mod fragment;
pub mod join;
pub mod layout;
pub mod operator;
pub mod plan_node;
pub mod runtime_filter;

pub use builder::{ExecPlan, FragmentBuilder};
pub use catalog::{MetadataProvider, ScanRange, TableColumn, TableDesc, WorkerAddr};
pub use expr::{
    default_predicate_policy, lower_expr, BinaryOp, FormatterContext, LiteralValue, PhysExpr,
    PredicatePolicy, ScalarExpr,
};
pub use fragment::{FragmentWire, PlanFragment};
pub use operator::{OpNode, OperatorKind, PhysicalTree, Statistics};
pub use plan_node::{DataPartition, JoinDistributionMode, PlanNode, PlanNodeKind};
pub use runtime_filter::RuntimeFilterDesc;
