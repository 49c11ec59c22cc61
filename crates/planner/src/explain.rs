//! Human-readable rendering of a fragment plan.

use crate::builder::ExecPlan;
use crate::expr::{BinaryOp, LiteralValue, PhysExpr};
use crate::plan_node::{DataPartition, PartitionKind, PlanNodeKind};
use quarry_common::PlanNodeId;
use std::fmt::Write;

/// Renders every fragment, sinks first, with its node tree indented.
pub fn render(plan: &ExecPlan) -> String {
    let mut out = String::new();
    for fragment in plan.fragments() {
        let _ = writeln!(
            out,
            "FRAGMENT {} [{}]{}",
            fragment.id,
            fmt_partition(&fragment.partition),
            if fragment.multicast { " multicast" } else { "" }
        );
        if let Some(exprs) = &fragment.output_exprs {
            let cols: Vec<String> = exprs.iter().map(fmt_expr).collect();
            let _ = writeln!(out, "  output: {}", cols.join(", "));
        }
        render_node(plan, fragment.root, 1, &mut out);
        out.push('\n');
    }
    out
}

fn render_node(plan: &ExecPlan, id: PlanNodeId, indent: usize, out: &mut String) {
    let node = plan.node(id);
    let pad = "  ".repeat(indent);
    let _ = write!(out, "{pad}{}:{}", node.id, node.kind.name());
    match &node.kind {
        PlanNodeKind::Scan(scan) => {
            let _ = write!(out, " {} ({} tablets)", scan.table_name, scan.ranges.len());
        }
        PlanNodeKind::Exchange(e) => {
            let _ = write!(out, " [{:?}]", e.kind);
            if e.merge.is_some() {
                let _ = write!(out, " merging");
            }
        }
        PlanNodeKind::HashJoin(join) => {
            let keys: Vec<String> = join
                .eq_conjuncts
                .iter()
                .map(|c| format!("{} = {}", fmt_expr(&c.left), fmt_expr(&c.right)))
                .collect();
            let _ = write!(
                out,
                " ({:?}, {:?}) on {}",
                join.join_type,
                join.distribution,
                keys.join(", ")
            );
        }
        PlanNodeKind::Aggregation(agg) => {
            let groups: Vec<String> = agg.group_exprs.iter().map(fmt_expr).collect();
            let calls: Vec<String> = agg.agg_calls.iter().map(fmt_expr).collect();
            let _ = write!(
                out,
                " [{:?}{}] group by {} calls {}",
                agg.phase,
                if agg.colocate { ", colocate" } else { "" },
                groups.join(", "),
                calls.join(", ")
            );
        }
        PlanNodeKind::Sort(sort) => {
            let keys: Vec<String> = sort.sort.sort_exprs.iter().map(fmt_expr).collect();
            let _ = write!(
                out,
                "{} by {}",
                if sort.topn { " topn" } else { "" },
                keys.join(", ")
            );
        }
        _ => {}
    }
    if let Some(limit) = node.limit {
        let _ = write!(out, " limit {limit}");
    }
    if !node.conjuncts.is_empty() {
        let preds: Vec<String> = node.conjuncts.iter().map(fmt_expr).collect();
        let _ = write!(out, " where {}", preds.join(" AND "));
    }
    if !node.probe_filters.is_empty() {
        let ids: Vec<String> = node.probe_filters.iter().map(|f| f.to_string()).collect();
        let _ = write!(out, " probe rf [{}]", ids.join(", "));
    }
    out.push('\n');
    if matches!(node.kind, PlanNodeKind::Exchange(_)) {
        return;
    }
    for child in &node.children {
        render_node(plan, *child, indent + 1, out);
    }
}

fn fmt_partition(p: &DataPartition) -> &'static str {
    match p.kind {
        PartitionKind::Unpartitioned => "UNPARTITIONED",
        PartitionKind::Random => "RANDOM",
        PartitionKind::Hash => "HASH",
        PartitionKind::BucketShuffleHash => "BUCKET_SHUFFLE",
    }
}

/// Compact one-line expression rendering.
pub fn fmt_expr(expr: &PhysExpr) -> String {
    match expr {
        PhysExpr::SlotRef { slot, .. } => format!("s{slot}"),
        PhysExpr::Literal { value, .. } => fmt_literal(value),
        PhysExpr::Binary { left, op, right, .. } => {
            format!("({} {} {})", fmt_expr(left), fmt_op(*op), fmt_expr(right))
        }
        PhysExpr::And(a, b) => format!("({} AND {})", fmt_expr(a), fmt_expr(b)),
        PhysExpr::Or(a, b) => format!("({} OR {})", fmt_expr(a), fmt_expr(b)),
        PhysExpr::Not(e) => format!("NOT {}", fmt_expr(e)),
        PhysExpr::Call {
            name,
            args,
            distinct,
            merge,
            ..
        } => {
            let args: Vec<String> = args.iter().map(fmt_expr).collect();
            format!(
                "{name}{}({}{})",
                if *merge { "_merge" } else { "" },
                if *distinct { "distinct " } else { "" },
                args.join(", ")
            )
        }
        PhysExpr::Cast { expr, to_type } => format!("cast({} as {to_type})", fmt_expr(expr)),
    }
}

fn fmt_literal(value: &LiteralValue) -> String {
    match value {
        LiteralValue::Int64(v) => v.to_string(),
        LiteralValue::Float64(v) => v.to_string(),
        LiteralValue::Utf8(v) => format!("'{v}'"),
        LiteralValue::Boolean(v) => v.to_string(),
        LiteralValue::Null => "NULL".into(),
    }
}

fn fmt_op(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Eq => "=",
        BinaryOp::NotEq => "!=",
        BinaryOp::Lt => "<",
        BinaryOp::LtEq => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::GtEq => ">=",
        BinaryOp::Plus => "+",
        BinaryOp::Minus => "-",
        BinaryOp::Multiply => "*",
        BinaryOp::Divide => "/",
    }
}
