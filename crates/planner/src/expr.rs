//! Scalar expressions on both sides of the fragment builder.
//!
//! [`ScalarExpr`] is the optimizer-facing form: it references logical columns
//! by [`ColumnId`] and carries no layout information. [`PhysExpr`] is the
//! executable form produced by lowering: column references are resolved to
//! slot references against the tuple layouts the builder creates, and every
//! node knows its result type and nullability.

use arrow_schema::DataType;
use quarry_common::{ColumnId, SlotId, TupleId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Constant value carried by literal expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralValue {
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit float.
    Float64(f64),
    /// UTF-8 string.
    Utf8(String),
    /// Boolean.
    Boolean(bool),
    /// Typed null.
    Null,
}

impl LiteralValue {
    /// Natural arrow type of the literal; nulls type as [`DataType::Null`].
    pub fn data_type(&self) -> DataType {
        match self {
            LiteralValue::Int64(_) => DataType::Int64,
            LiteralValue::Float64(_) => DataType::Float64,
            LiteralValue::Utf8(_) => DataType::Utf8,
            LiteralValue::Boolean(_) => DataType::Boolean,
            LiteralValue::Null => DataType::Null,
        }
    }
}

/// Binary operator vocabulary for comparisons and arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    /// Equality.
    Eq,
    /// Inequality.
    NotEq,
    /// Less-than.
    Lt,
    /// Less-than-or-equal.
    LtEq,
    /// Greater-than.
    Gt,
    /// Greater-than-or-equal.
    GtEq,
    /// Addition.
    Plus,
    /// Subtraction.
    Minus,
    /// Multiplication.
    Multiply,
    /// Division.
    Divide,
}

impl BinaryOp {
    /// True for the six comparison operators.
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }
}

/// Optimizer-level scalar expression over logical columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarExpr {
    /// Reference to a logical column.
    ColumnRef(ColumnId),
    /// Constant.
    Literal(LiteralValue),
    /// Binary comparison or arithmetic.
    Binary {
        /// Left operand.
        left: Box<ScalarExpr>,
        /// Operator.
        op: BinaryOp,
        /// Right operand.
        right: Box<ScalarExpr>,
    },
    /// Logical conjunction.
    And(Box<ScalarExpr>, Box<ScalarExpr>),
    /// Logical disjunction.
    Or(Box<ScalarExpr>, Box<ScalarExpr>),
    /// Logical negation.
    Not(Box<ScalarExpr>),
    /// Scalar, aggregate, or table function call.
    Call {
        /// Function name, lower-case.
        name: String,
        /// Argument expressions.
        args: Vec<ScalarExpr>,
        /// DISTINCT qualifier on an aggregate call.
        distinct: bool,
    },
    /// Explicit cast.
    Cast {
        /// Operand.
        expr: Box<ScalarExpr>,
        /// Target type.
        to_type: DataType,
    },
}

impl ScalarExpr {
    /// Convenience constructor for an equality between two columns.
    pub fn col_eq(left: ColumnId, right: ColumnId) -> ScalarExpr {
        ScalarExpr::Binary {
            left: Box::new(ScalarExpr::ColumnRef(left)),
            op: BinaryOp::Eq,
            right: Box::new(ScalarExpr::ColumnRef(right)),
        }
    }

    /// Collects every referenced column id, in first-seen order.
    pub fn used_columns(&self) -> Vec<ColumnId> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut Vec<ColumnId>) {
        match self {
            ScalarExpr::ColumnRef(c) => {
                if !out.contains(c) {
                    out.push(*c);
                }
            }
            ScalarExpr::Literal(_) => {}
            ScalarExpr::Binary { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            ScalarExpr::And(a, b) | ScalarExpr::Or(a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
            ScalarExpr::Not(e) | ScalarExpr::Cast { expr: e, .. } => e.collect_columns(out),
            ScalarExpr::Call { args, .. } => {
                for a in args {
                    a.collect_columns(out);
                }
            }
        }
    }

    /// True when the expression references no columns.
    pub fn is_constant(&self) -> bool {
        self.used_columns().is_empty()
    }

    /// Returns the column id of a bare column reference.
    pub fn as_column(&self) -> Option<ColumnId> {
        match self {
            ScalarExpr::ColumnRef(c) => Some(*c),
            _ => None,
        }
    }

    /// Flattens a conjunction tree into its leaves.
    pub fn conjuncts(&self) -> Vec<&ScalarExpr> {
        let mut out = Vec::new();
        self.collect_conjuncts(&mut out);
        out
    }

    fn collect_conjuncts<'a>(&'a self, out: &mut Vec<&'a ScalarExpr>) {
        match self {
            ScalarExpr::And(a, b) => {
                a.collect_conjuncts(out);
                b.collect_conjuncts(out);
            }
            other => out.push(other),
        }
    }
}

/// Flattens an optional predicate into conjunct leaves; `None` yields nothing.
pub fn extract_conjuncts(predicate: Option<&ScalarExpr>) -> Vec<&ScalarExpr> {
    predicate.map(|p| p.conjuncts()).unwrap_or_default()
}

/// Predicate classifier injected by the embedding engine.
///
/// Classifies a pushed-down scan conjunct as "simple" (evaluable inside the
/// storage layer, so its input columns need not be output) versus complex.
/// The default policy accepts `column <op> literal` comparisons only.
pub type PredicatePolicy = fn(&ScalarExpr) -> bool;

/// Default [`PredicatePolicy`]: `column <op> literal` with a comparison op.
pub fn default_predicate_policy(expr: &ScalarExpr) -> bool {
    match expr {
        ScalarExpr::Binary { left, op, right } if op.is_comparison() => matches!(
            (left.as_ref(), right.as_ref()),
            (ScalarExpr::ColumnRef(_), ScalarExpr::Literal(_))
                | (ScalarExpr::Literal(_), ScalarExpr::ColumnRef(_))
        ),
        _ => false,
    }
}

/// Executable scalar expression over physical slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PhysExpr {
    /// Reference to a materialized slot.
    SlotRef {
        /// Slot id.
        slot: SlotId,
        /// Owning tuple.
        tuple: TupleId,
        /// Slot type.
        data_type: DataType,
        /// Slot nullability at lowering time.
        nullable: bool,
    },
    /// Constant.
    Literal {
        /// Constant value.
        value: LiteralValue,
        /// Result type (may differ from the value's natural type after cast
        /// folding).
        data_type: DataType,
    },
    /// Binary comparison or arithmetic.
    Binary {
        /// Left operand.
        left: Box<PhysExpr>,
        /// Operator.
        op: BinaryOp,
        /// Right operand.
        right: Box<PhysExpr>,
        /// Result type.
        data_type: DataType,
    },
    /// Logical conjunction.
    And(Box<PhysExpr>, Box<PhysExpr>),
    /// Logical disjunction.
    Or(Box<PhysExpr>, Box<PhysExpr>),
    /// Logical negation.
    Not(Box<PhysExpr>),
    /// Function call; aggregate calls carry the distinct/merge markers the
    /// multi-phase aggregate translation relies on.
    Call {
        /// Function name, lower-case.
        name: String,
        /// Argument expressions.
        args: Vec<PhysExpr>,
        /// Result type.
        data_type: DataType,
        /// Result nullability.
        nullable: bool,
        /// DISTINCT qualifier.
        distinct: bool,
        /// Merge variant: consumes partial aggregate states instead of raw
        /// input rows.
        merge: bool,
    },
    /// Runtime cast.
    Cast {
        /// Operand.
        expr: Box<PhysExpr>,
        /// Target type.
        to_type: DataType,
    },
}

impl PhysExpr {
    /// Result type of the expression.
    pub fn data_type(&self) -> DataType {
        match self {
            PhysExpr::SlotRef { data_type, .. } => data_type.clone(),
            PhysExpr::Literal { data_type, .. } => data_type.clone(),
            PhysExpr::Binary { data_type, .. } => data_type.clone(),
            PhysExpr::And(..) | PhysExpr::Or(..) | PhysExpr::Not(..) => DataType::Boolean,
            PhysExpr::Call { data_type, .. } => data_type.clone(),
            PhysExpr::Cast { to_type, .. } => to_type.clone(),
        }
    }

    /// Result nullability of the expression.
    pub fn nullable(&self) -> bool {
        match self {
            PhysExpr::SlotRef { nullable, .. } => *nullable,
            PhysExpr::Literal { value, .. } => matches!(value, LiteralValue::Null),
            PhysExpr::Binary { left, right, .. } => left.nullable() || right.nullable(),
            PhysExpr::And(a, b) | PhysExpr::Or(a, b) => a.nullable() || b.nullable(),
            PhysExpr::Not(e) => e.nullable(),
            PhysExpr::Call { nullable, .. } => *nullable,
            PhysExpr::Cast { expr, .. } => expr.nullable(),
        }
    }

    /// Returns the slot id of a bare slot reference.
    pub fn as_slot(&self) -> Option<SlotId> {
        match self {
            PhysExpr::SlotRef { slot, .. } => Some(*slot),
            _ => None,
        }
    }

    /// Collects every referenced slot id, in first-seen order.
    pub fn used_slots(&self) -> Vec<SlotId> {
        let mut out = Vec::new();
        self.collect_slots(&mut out);
        out
    }

    fn collect_slots(&self, out: &mut Vec<SlotId>) {
        match self {
            PhysExpr::SlotRef { slot, .. } => {
                if !out.contains(slot) {
                    out.push(*slot);
                }
            }
            PhysExpr::Literal { .. } => {}
            PhysExpr::Binary { left, right, .. } => {
                left.collect_slots(out);
                right.collect_slots(out);
            }
            PhysExpr::And(a, b) | PhysExpr::Or(a, b) => {
                a.collect_slots(out);
                b.collect_slots(out);
            }
            PhysExpr::Not(e) | PhysExpr::Cast { expr: e, .. } => e.collect_slots(out),
            PhysExpr::Call { args, .. } => {
                for a in args {
                    a.collect_slots(out);
                }
            }
        }
    }

    /// True when the expression references no slots.
    pub fn is_constant(&self) -> bool {
        self.used_slots().is_empty()
    }
}

/// Lowering environment mapping logical columns to their physical bindings.
///
/// `common` holds the lowered common sub-expression bindings of the projection
/// currently being translated; it is consulted before the global bindings so a
/// projection can reference its own factored sub-expressions.
pub struct FormatterContext<'a> {
    bindings: &'a HashMap<ColumnId, PhysExpr>,
    common: Option<&'a HashMap<ColumnId, PhysExpr>>,
    /// Insert implicit numeric widening casts on mixed-type binary operands.
    pub implicit_cast: bool,
}

impl<'a> FormatterContext<'a> {
    /// Context over the builder's global column bindings.
    pub fn new(bindings: &'a HashMap<ColumnId, PhysExpr>) -> Self {
        Self {
            bindings,
            common: None,
            implicit_cast: true,
        }
    }

    /// Context that additionally resolves against a projection's lowered
    /// common sub-expressions.
    pub fn with_common(
        bindings: &'a HashMap<ColumnId, PhysExpr>,
        common: &'a HashMap<ColumnId, PhysExpr>,
    ) -> Self {
        Self {
            bindings,
            common: Some(common),
            implicit_cast: true,
        }
    }

    fn resolve(&self, col: ColumnId) -> &PhysExpr {
        if let Some(common) = self.common {
            if let Some(e) = common.get(&col) {
                return e;
            }
        }
        self.bindings
            .get(&col)
            .unwrap_or_else(|| panic!("no binding for column {col}"))
    }
}

/// Lowers an optimizer expression into its executable form.
///
/// Column references must already be bound (a missing binding is a builder
/// bug and panics). Constant binary sub-expressions are folded, and mixed
/// int/float arithmetic operands are widened when the context allows it.
pub fn lower_expr(expr: &ScalarExpr, ctx: &FormatterContext<'_>) -> PhysExpr {
    match expr {
        ScalarExpr::ColumnRef(c) => ctx.resolve(*c).clone(),
        ScalarExpr::Literal(v) => PhysExpr::Literal {
            data_type: v.data_type(),
            value: v.clone(),
        },
        ScalarExpr::Binary { left, op, right } => {
            let mut l = lower_expr(left, ctx);
            let mut r = lower_expr(right, ctx);
            if ctx.implicit_cast {
                widen_operands(&mut l, &mut r);
            }
            if let Some(folded) = fold_binary(&l, *op, &r) {
                return folded;
            }
            let data_type = if op.is_comparison() {
                DataType::Boolean
            } else {
                l.data_type()
            };
            PhysExpr::Binary {
                left: Box::new(l),
                op: *op,
                right: Box::new(r),
                data_type,
            }
        }
        ScalarExpr::And(a, b) => {
            PhysExpr::And(Box::new(lower_expr(a, ctx)), Box::new(lower_expr(b, ctx)))
        }
        ScalarExpr::Or(a, b) => {
            PhysExpr::Or(Box::new(lower_expr(a, ctx)), Box::new(lower_expr(b, ctx)))
        }
        ScalarExpr::Not(e) => PhysExpr::Not(Box::new(lower_expr(e, ctx))),
        ScalarExpr::Call {
            name,
            args,
            distinct,
        } => {
            let lowered: Vec<PhysExpr> = args.iter().map(|a| lower_expr(a, ctx)).collect();
            let (data_type, nullable) = call_result_type(name, &lowered);
            PhysExpr::Call {
                name: name.clone(),
                args: lowered,
                data_type,
                nullable,
                distinct: *distinct,
                merge: false,
            }
        }
        ScalarExpr::Cast { expr, to_type } => {
            let inner = lower_expr(expr, ctx);
            if let PhysExpr::Literal { value, .. } = &inner {
                if let Some(folded) = fold_cast(value, to_type) {
                    return PhysExpr::Literal {
                        value: folded,
                        data_type: to_type.clone(),
                    };
                }
            }
            if inner.data_type() == *to_type {
                return inner;
            }
            PhysExpr::Cast {
                expr: Box::new(inner),
                to_type: to_type.clone(),
            }
        }
    }
}

/// Result type and nullability of a function call.
///
/// Covers the builtin aggregates the fragment builder rewrites; other calls
/// default to their first argument's type. Stays consistent with the types
/// the optimizer assigns to the same calls.
pub fn call_result_type(name: &str, args: &[PhysExpr]) -> (DataType, bool) {
    let arg_type = |i: usize| args.get(i).map(|a| a.data_type()).unwrap_or(DataType::Null);
    let arg_nullable = args.iter().any(|a| a.nullable());
    match name {
        "count" | "multi_distinct_count" => (DataType::Int64, false),
        "sum" | "multi_distinct_sum" => {
            let t = match arg_type(0) {
                DataType::Float32 | DataType::Float64 => DataType::Float64,
                _ => DataType::Int64,
            };
            (t, true)
        }
        "avg" => (DataType::Float64, true),
        "min" | "max" | "any_value" | "first_value" | "last_value" | "lag" | "lead" => {
            (arg_type(0), true)
        }
        "row_number" | "rank" | "dense_rank" => (DataType::Int64, false),
        "grouping" | "grouping_id" => (DataType::Int64, false),
        "unnest" => (arg_type(0), true),
        _ => (arg_type(0), arg_nullable),
    }
}

fn widen_operands(l: &mut PhysExpr, r: &mut PhysExpr) {
    let lt = l.data_type();
    let rt = r.data_type();
    let is_int = |t: &DataType| matches!(t, DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64);
    let is_float = |t: &DataType| matches!(t, DataType::Float32 | DataType::Float64);
    if is_int(&lt) && is_float(&rt) {
        cast_in_place(l, DataType::Float64);
    } else if is_float(&lt) && is_int(&rt) {
        cast_in_place(r, DataType::Float64);
    }
}

fn cast_in_place(e: &mut PhysExpr, to_type: DataType) {
    if let PhysExpr::Literal { value, .. } = e {
        if let Some(folded) = fold_cast(value, &to_type) {
            *e = PhysExpr::Literal {
                value: folded,
                data_type: to_type,
            };
            return;
        }
    }
    let inner = std::mem::replace(
        e,
        PhysExpr::Literal {
            value: LiteralValue::Null,
            data_type: DataType::Null,
        },
    );
    *e = PhysExpr::Cast {
        expr: Box::new(inner),
        to_type,
    };
}

fn fold_cast(value: &LiteralValue, to_type: &DataType) -> Option<LiteralValue> {
    match (value, to_type) {
        (LiteralValue::Int64(v), DataType::Float64) => Some(LiteralValue::Float64(*v as f64)),
        (LiteralValue::Int64(v), DataType::Int64) => Some(LiteralValue::Int64(*v)),
        (LiteralValue::Float64(v), DataType::Float64) => Some(LiteralValue::Float64(*v)),
        (LiteralValue::Null, _) => Some(LiteralValue::Null),
        _ => None,
    }
}

fn fold_binary(l: &PhysExpr, op: BinaryOp, r: &PhysExpr) -> Option<PhysExpr> {
    let (lv, rv) = match (l, r) {
        (PhysExpr::Literal { value: lv, .. }, PhysExpr::Literal { value: rv, .. }) => (lv, rv),
        _ => return None,
    };
    let bool_lit = |b: bool| PhysExpr::Literal {
        value: LiteralValue::Boolean(b),
        data_type: DataType::Boolean,
    };
    match (lv, rv) {
        (LiteralValue::Int64(a), LiteralValue::Int64(b)) => Some(match op {
            BinaryOp::Eq => bool_lit(a == b),
            BinaryOp::NotEq => bool_lit(a != b),
            BinaryOp::Lt => bool_lit(a < b),
            BinaryOp::LtEq => bool_lit(a <= b),
            BinaryOp::Gt => bool_lit(a > b),
            BinaryOp::GtEq => bool_lit(a >= b),
            BinaryOp::Plus => int_lit(a.checked_add(*b)?),
            BinaryOp::Minus => int_lit(a.checked_sub(*b)?),
            BinaryOp::Multiply => int_lit(a.checked_mul(*b)?),
            BinaryOp::Divide => {
                if *b == 0 {
                    return None;
                }
                int_lit(a / b)
            }
        }),
        (LiteralValue::Float64(a), LiteralValue::Float64(b)) => Some(match op {
            BinaryOp::Eq => bool_lit(a == b),
            BinaryOp::NotEq => bool_lit(a != b),
            BinaryOp::Lt => bool_lit(a < b),
            BinaryOp::LtEq => bool_lit(a <= b),
            BinaryOp::Gt => bool_lit(a > b),
            BinaryOp::GtEq => bool_lit(a >= b),
            BinaryOp::Plus => float_lit(a + b),
            BinaryOp::Minus => float_lit(a - b),
            BinaryOp::Multiply => float_lit(a * b),
            BinaryOp::Divide => float_lit(a / b),
        }),
        _ => None,
    }
}

fn int_lit(v: i64) -> PhysExpr {
    PhysExpr::Literal {
        value: LiteralValue::Int64(v),
        data_type: DataType::Int64,
    }
}

fn float_lit(v: f64) -> PhysExpr {
    PhysExpr::Literal {
        value: LiteralValue::Float64(v),
        data_type: DataType::Float64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(id: u32, data_type: DataType, nullable: bool) -> PhysExpr {
        PhysExpr::SlotRef {
            slot: SlotId(id),
            tuple: TupleId(0),
            data_type,
            nullable,
        }
    }

    #[test]
    fn lowering_resolves_column_bindings() {
        let mut bindings = HashMap::new();
        bindings.insert(ColumnId(7), slot(3, DataType::Int64, false));
        let ctx = FormatterContext::new(&bindings);
        let lowered = lower_expr(&ScalarExpr::ColumnRef(ColumnId(7)), &ctx);
        assert_eq!(lowered.as_slot(), Some(SlotId(3)));
    }

    #[test]
    fn common_sub_bindings_shadow_globals() {
        let mut bindings = HashMap::new();
        bindings.insert(ColumnId(1), slot(1, DataType::Int64, false));
        let mut common = HashMap::new();
        common.insert(ColumnId(1), slot(9, DataType::Int64, false));
        let ctx = FormatterContext::with_common(&bindings, &common);
        let lowered = lower_expr(&ScalarExpr::ColumnRef(ColumnId(1)), &ctx);
        assert_eq!(lowered.as_slot(), Some(SlotId(9)));
    }

    #[test]
    fn constant_comparison_folds_to_boolean_literal() {
        let bindings = HashMap::new();
        let ctx = FormatterContext::new(&bindings);
        let expr = ScalarExpr::Binary {
            left: Box::new(ScalarExpr::Literal(LiteralValue::Int64(2))),
            op: BinaryOp::Lt,
            right: Box::new(ScalarExpr::Literal(LiteralValue::Int64(5))),
        };
        let lowered = lower_expr(&expr, &ctx);
        assert_eq!(
            lowered,
            PhysExpr::Literal {
                value: LiteralValue::Boolean(true),
                data_type: DataType::Boolean,
            }
        );
    }

    #[test]
    fn mixed_numeric_operands_get_widened() {
        let mut bindings = HashMap::new();
        bindings.insert(ColumnId(1), slot(1, DataType::Int64, false));
        let ctx = FormatterContext::new(&bindings);
        let expr = ScalarExpr::Binary {
            left: Box::new(ScalarExpr::ColumnRef(ColumnId(1))),
            op: BinaryOp::Plus,
            right: Box::new(ScalarExpr::Literal(LiteralValue::Float64(0.5))),
        };
        let lowered = lower_expr(&expr, &ctx);
        match lowered {
            PhysExpr::Binary {
                left, data_type, ..
            } => {
                assert_eq!(data_type, DataType::Float64);
                assert!(matches!(*left, PhysExpr::Cast { .. }));
            }
            other => panic!("expected binary, got {other:?}"),
        }
    }

    #[test]
    fn redundant_cast_is_elided() {
        let mut bindings = HashMap::new();
        bindings.insert(ColumnId(1), slot(1, DataType::Int64, true));
        let ctx = FormatterContext::new(&bindings);
        let expr = ScalarExpr::Cast {
            expr: Box::new(ScalarExpr::ColumnRef(ColumnId(1))),
            to_type: DataType::Int64,
        };
        assert_eq!(lower_expr(&expr, &ctx).as_slot(), Some(SlotId(1)));
    }

    #[test]
    fn conjuncts_flatten_nested_and() {
        let a = ScalarExpr::ColumnRef(ColumnId(1));
        let b = ScalarExpr::ColumnRef(ColumnId(2));
        let c = ScalarExpr::ColumnRef(ColumnId(3));
        let pred = ScalarExpr::And(
            Box::new(ScalarExpr::And(Box::new(a.clone()), Box::new(b.clone()))),
            Box::new(c.clone()),
        );
        assert_eq!(pred.conjuncts(), vec![&a, &b, &c]);
    }

    #[test]
    fn default_policy_accepts_column_vs_literal_only() {
        let simple = ScalarExpr::Binary {
            left: Box::new(ScalarExpr::ColumnRef(ColumnId(1))),
            op: BinaryOp::Gt,
            right: Box::new(ScalarExpr::Literal(LiteralValue::Int64(10))),
        };
        let complex = ScalarExpr::Binary {
            left: Box::new(ScalarExpr::ColumnRef(ColumnId(1))),
            op: BinaryOp::Gt,
            right: Box::new(ScalarExpr::ColumnRef(ColumnId(2))),
        };
        assert!(default_predicate_policy(&simple));
        assert!(!default_predicate_policy(&complex));
    }

    #[test]
    fn count_is_not_nullable() {
        let (ty, nullable) = call_result_type("count", &[slot(1, DataType::Int64, true)]);
        assert_eq!(ty, DataType::Int64);
        assert!(!nullable);
    }
}
