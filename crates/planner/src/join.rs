//! Join translation: distribution-mode resolution, fragment stitching, and
//! runtime-filter generation.
//!
//! The distribution mode is resolved from the shape of the child fragments'
//! roots (decode nodes are skipped), never from mutable global state. Each
//! mode then merges or stitches the child fragments through id swaps on the
//! fragment arena.

use crate::builder::Translator;
use crate::expr::{extract_conjuncts, PhysExpr, ScalarExpr};
use crate::fragment::PlanFragment;
use crate::operator::{JoinDistributionHint, JoinOp, JoinType, OpNode};
use crate::plan_node::{
    DataPartition, EqJoinConjunct, ExchangeKind, HashJoinNode, JoinDistributionMode,
    NestLoopJoinNode, PartitionKind, PlanNodeKind,
};
use crate::runtime_filter::RuntimeFilterDesc;
use quarry_common::{ColumnId, FragmentId, PlanNodeId, QuarryError, Result};

impl<'a> Translator<'a> {
    pub(crate) fn visit_join(&mut self, op: &OpNode, join: &JoinOp) -> Result<FragmentId> {
        let left_cols = op.inputs[0].output_columns.clone();
        let right_cols = op.inputs[1].output_columns.clone();
        let left = self.visit(&op.inputs[0])?;
        let right = self.visit(&op.inputs[1])?;

        let (eq, others) =
            split_join_predicate(join.on_predicate.as_ref(), &left_cols, &right_cols)?;
        if join.join_type == JoinType::Cross || eq.is_empty() {
            return self.build_nestloop(op, join, left, right, &others);
        }

        let eq_conjuncts: Vec<EqJoinConjunct> = eq
            .iter()
            .map(|(l, r)| EqJoinConjunct {
                left: self.lower(l),
                right: self.lower(r),
            })
            .collect();
        let other_conjuncts: Vec<PhysExpr> = others.iter().map(|e| self.lower(e)).collect();
        let conjuncts: Vec<PhysExpr> = extract_conjuncts(op.predicate.as_ref())
            .into_iter()
            .map(|e| self.lower(e))
            .collect();

        let left_root = self.root_of(left);
        let right_root = self.root_of(right);
        let mode = self.resolve_join_mode(left, right, join, &eq)?;
        self.widen_for_outer(join.join_type, left_root, right_root);

        let mut tuples = self.ctx.node(left_root).tuple_ids.clone();
        tuples.extend(self.ctx.node(right_root).tuple_ids.clone());
        let output_slots = op
            .output_columns
            .iter()
            .map(|c| self.ctx.slot_of(*c))
            .collect();
        let push_down_right_table = self.config.hash_join_push_down_right_table
            && matches!(join.join_type, JoinType::Inner | JoinType::LeftSemi);

        let equal_count = eq_conjuncts.len();
        let node = self.ctx.add_node(
            PlanNodeKind::HashJoin(HashJoinNode {
                join_type: join.join_type,
                distribution: mode,
                eq_conjuncts,
                other_conjuncts,
                partition_exprs: Vec::new(),
                output_slots: Some(output_slots),
                push_down_right_table,
                build_filters: Vec::new(),
            }),
            vec![left_root, right_root],
            tuples,
            op.stats.output_row_count,
        );
        self.ctx.node_mut(node).conjuncts = conjuncts;
        if join.join_type.preserves_left() || join.join_type.preserves_right() {
            self.ctx.node_mut(node).nullable_generate = true;
        }

        let fragment = match mode {
            JoinDistributionMode::Broadcast
            | JoinDistributionMode::Colocate
            | JoinDistributionMode::Replicated => self.merge_into_left(left, right, node),
            JoinDistributionMode::Partitioned => self.build_partitioned(left, right, node),
            JoinDistributionMode::LocalHashBucket | JoinDistributionMode::ShuffleHashBucket => {
                let left_exchanged = self.is_exchange(self.skip_decode(left_root));
                let right_exchanged = self.is_exchange(self.skip_decode(right_root));
                if !left_exchanged && !right_exchanged {
                    self.merge_into_left(left, right, node)
                } else if left_exchanged && !right_exchanged {
                    self.build_bucket_shuffle(right, left, node, mode)
                } else {
                    self.build_bucket_shuffle(left, right, node, mode)
                }
            }
        };

        if (self.config.enable_global_runtime_filter || self.config.enable_pipeline_engine)
            && join.join_type.filters_probe_side()
        {
            self.build_runtime_filters(node, left_root, mode, equal_count);
        }
        if matches!(
            mode,
            JoinDistributionMode::Broadcast | JoinDistributionMode::Replicated
        ) {
            self.estimate_pipeline_dop(fragment);
        }
        Ok(fragment)
    }

    fn build_nestloop(
        &mut self,
        op: &OpNode,
        join: &JoinOp,
        left: FragmentId,
        right: FragmentId,
        others: &[ScalarExpr],
    ) -> Result<FragmentId> {
        let left_root = self.root_of(left);
        let right_root = self.root_of(right);
        let replicated = !self.is_exchange(self.skip_decode(right_root));

        let mut conjuncts: Vec<PhysExpr> = others.iter().map(|e| self.lower(e)).collect();
        conjuncts.extend(
            extract_conjuncts(op.predicate.as_ref())
                .into_iter()
                .map(|e| self.lower(e)),
        );

        self.widen_for_outer(join.join_type, left_root, right_root);
        let mut tuples = self.ctx.node(left_root).tuple_ids.clone();
        tuples.extend(self.ctx.node(right_root).tuple_ids.clone());
        let node = self.ctx.add_node(
            PlanNodeKind::NestLoopJoin(NestLoopJoinNode {
                join_type: join.join_type,
                replicated,
            }),
            vec![left_root, right_root],
            tuples,
            op.stats.output_row_count,
        );
        self.ctx.node_mut(node).conjuncts = conjuncts;
        self.ctx.node_mut(node).limit = op.limit;
        if join.join_type.preserves_left() || join.join_type.preserves_right() {
            self.ctx.node_mut(node).nullable_generate = true;
        }
        Ok(self.merge_into_left(left, right, node))
    }

    /// Unmatched preserved rows surface the other side as nulls.
    fn widen_for_outer(&mut self, join_type: JoinType, left_root: PlanNodeId, right_root: PlanNodeId) {
        if join_type.preserves_left() {
            for t in self.ctx.node(right_root).tuple_ids.clone() {
                self.ctx.layouts.widen_tuple_nullable(t);
            }
        }
        if join_type.preserves_right() {
            for t in self.ctx.node(left_root).tuple_ids.clone() {
                self.ctx.layouts.widen_tuple_nullable(t);
            }
        }
    }

    // ---- distribution-mode resolution ----

    fn exchange_kind(&self, node: PlanNodeId) -> Option<ExchangeKind> {
        match &self.ctx.node(self.skip_decode(node)).kind {
            PlanNodeKind::Exchange(e) => Some(e.kind),
            _ => None,
        }
    }

    fn resolve_join_mode(
        &self,
        left: FragmentId,
        right: FragmentId,
        join: &JoinOp,
        eq: &[(ScalarExpr, ScalarExpr)],
    ) -> Result<JoinDistributionMode> {
        debug_assert!(!eq.is_empty());
        let left_kind = self.exchange_kind(self.root_of(left));
        let right_kind = self.exchange_kind(self.root_of(right));
        let shuffle_hint = join.distribution_hint == Some(JoinDistributionHint::Shuffle);
        match (left_kind, right_kind) {
            (Some(ExchangeKind::Shuffle), Some(ExchangeKind::Shuffle)) => {
                if shuffle_hint {
                    return Ok(JoinDistributionMode::Partitioned);
                }
                let bucketed = |f: FragmentId| {
                    self.ctx.fragment(f).partition.kind == PartitionKind::BucketShuffleHash
                };
                if bucketed(left) || bucketed(right) {
                    Ok(JoinDistributionMode::ShuffleHashBucket)
                } else {
                    Ok(JoinDistributionMode::Partitioned)
                }
            }
            // the build side reaches every probe instance whole, so the
            // probe shape does not matter
            (_, Some(ExchangeKind::Broadcast)) => Ok(JoinDistributionMode::Broadcast),
            (None, None) => {
                if self.colocatable(left, right, eq) {
                    Ok(JoinDistributionMode::Colocate)
                } else if self.config.enable_replication_join && self.all_scans_replicated(right) {
                    Ok(JoinDistributionMode::Replicated)
                } else if shuffle_hint {
                    Ok(JoinDistributionMode::ShuffleHashBucket)
                } else {
                    Err(QuarryError::Planning(
                        "join children have no exchanges and are not colocatable".into(),
                    ))
                }
            }
            (None, Some(ExchangeKind::Shuffle)) | (Some(ExchangeKind::Shuffle), None) => {
                if shuffle_hint {
                    return Ok(JoinDistributionMode::ShuffleHashBucket);
                }
                if !self.config.enable_bucket_shuffle {
                    return Err(QuarryError::Planning(
                        "shuffled input against a local side requires bucket shuffle".into(),
                    ));
                }
                Ok(JoinDistributionMode::LocalHashBucket)
            }
            (l, r) => Err(QuarryError::Planning(format!(
                "unexpected exchange shape under join: left {l:?}, right {r:?}"
            ))),
        }
    }

    /// Both sides scan tables of one stable colocation group, and every
    /// bucket column of each scan is a join key of that side; otherwise
    /// matching rows may live in differently-numbered buckets.
    fn colocatable(
        &self,
        left: FragmentId,
        right: FragmentId,
        eq: &[(ScalarExpr, ScalarExpr)],
    ) -> bool {
        let left_keys: Vec<ColumnId> = eq.iter().filter_map(|(l, _)| l.as_column()).collect();
        let right_keys: Vec<ColumnId> = eq.iter().filter_map(|(_, r)| r.as_column()).collect();
        let mut group = None;
        let mut scans = 0usize;
        for (fragment, keys) in [(left, &left_keys), (right, &right_keys)] {
            for n in self.ctx.fragment_nodes(fragment) {
                if let PlanNodeKind::Scan(scan) = &self.ctx.node(n).kind {
                    scans += 1;
                    if scan.bucket_columns.is_empty()
                        || !scan.bucket_columns.iter().all(|c| keys.contains(c))
                    {
                        return false;
                    }
                    match (group, self.catalog.colocate_group(scan.table)) {
                        (_, None) => return false,
                        (None, Some(g)) => group = Some(g),
                        (Some(a), Some(b)) if a != b => return false,
                        _ => {}
                    }
                }
            }
        }
        scans >= 2
            && group.is_some_and(|g| self.catalog.colocate_group_stable(g))
    }

    fn all_scans_replicated(&self, fragment: FragmentId) -> bool {
        let mut scans = 0usize;
        for n in self.ctx.fragment_nodes(fragment) {
            if let PlanNodeKind::Scan(scan) = &self.ctx.node(n).kind {
                scans += 1;
                match self.catalog.table(scan.table) {
                    Ok(t) if t.replicated => {}
                    _ => return false,
                }
            }
        }
        scans > 0
    }

    // ---- fragment stitching ----

    /// Right fragment's subtree joins the left fragment; used by broadcast
    /// (right root is the broadcast exchange), colocate, and replicated.
    fn merge_into_left(
        &mut self,
        left: FragmentId,
        right: FragmentId,
        node: PlanNodeId,
    ) -> FragmentId {
        self.ctx.fragment_mut(left).root = node;
        let grandchildren = self.ctx.fragment(right).children.clone();
        self.ctx.fragment_mut(left).children.extend(grandchildren);
        self.ctx.retire_fragment(right);
        left
    }

    /// Both sides are shuffle exchanges: a fresh fragment owns the join,
    /// partitioned like the probe-side shuffle.
    fn build_partitioned(
        &mut self,
        left: FragmentId,
        right: FragmentId,
        node: PlanNodeId,
    ) -> FragmentId {
        let lhs_exprs = self.ctx.fragment(left).partition.exprs.clone();
        if let PlanNodeKind::HashJoin(join) = &mut self.ctx.node_mut(node).kind {
            join.partition_exprs = lhs_exprs.clone();
        }

        let parallel = self.config.parallel_exec_instance_num.max(1);
        let fragment = self.ctx.add_fragment(|id| {
            let mut f = PlanFragment::new(id, node, DataPartition::hash(lhs_exprs));
            f.parallel_exec_num = parallel;
            f
        });
        for side in [left, right] {
            let grandchildren = self.ctx.fragment(side).children.clone();
            self.ctx.fragment_mut(fragment).children.extend(grandchildren);
            self.ctx.retire_fragment(side);
        }
        fragment
    }

    /// The shuffled side is delivered into the staying fragment and the
    /// staying fragment absorbs the join. Local-bucket delivery routes rows
    /// into the stayer's storage buckets; shuffle-bucket delivery is a plain
    /// hash repartition.
    fn build_bucket_shuffle(
        &mut self,
        stay: FragmentId,
        remove: FragmentId,
        node: PlanNodeId,
        mode: JoinDistributionMode,
    ) -> FragmentId {
        let shuffle_exprs = self.ctx.fragment(remove).partition.exprs.clone();
        if let PlanNodeKind::HashJoin(join) = &mut self.ctx.node_mut(node).kind {
            join.partition_exprs = shuffle_exprs.clone();
        }
        let delivery = if mode == JoinDistributionMode::LocalHashBucket {
            DataPartition::bucket_shuffle(shuffle_exprs)
        } else {
            DataPartition::hash(shuffle_exprs)
        };
        for child in self.ctx.fragment(remove).children.clone() {
            self.ctx.fragment_mut(child).output_partition = delivery.clone();
        }
        self.ctx.fragment_mut(stay).root = node;
        let grandchildren = self.ctx.fragment(remove).children.clone();
        self.ctx.fragment_mut(stay).children.extend(grandchildren);
        self.ctx.retire_fragment(remove);
        // keep the stitched fragment after all of its inputs
        self.ctx.move_fragment_to_end(stay);
        stay
    }

    // ---- runtime filters ----

    fn build_runtime_filters(
        &mut self,
        node: PlanNodeId,
        probe_root: PlanNodeId,
        mode: JoinDistributionMode,
        equal_count: usize,
    ) {
        let eq_conjuncts = match &self.ctx.node(node).kind {
            PlanNodeKind::HashJoin(j) => j.eq_conjuncts.clone(),
            _ => return,
        };
        let build_cardinality = {
            let build_root = self.ctx.node(node).children[1];
            self.ctx.node(build_root).cardinality
        };
        for (order, eq) in eq_conjuncts.iter().enumerate() {
            let id = self.ctx.next_filter_id();
            let mut desc = RuntimeFilterDesc::new(
                id,
                node,
                order,
                eq.right.clone(),
                build_cardinality,
                mode,
                equal_count,
            );
            self.push_runtime_filter(probe_root, &mut desc, &eq.left);
            if let PlanNodeKind::HashJoin(j) = &mut self.ctx.node_mut(node).kind {
                j.build_filters.push(id);
            }
            self.ctx.filters.push(desc);
        }
    }

    fn push_runtime_filter(
        &mut self,
        node_id: PlanNodeId,
        desc: &mut RuntimeFilterDesc,
        expr: &PhysExpr,
    ) {
        enum Step {
            Attach(f64),
            Cross(Vec<PlanNodeId>),
            Through(PlanNodeId, PhysExpr),
            Fanout(Vec<PlanNodeId>),
            Stop,
        }
        let step = {
            let node = self.ctx.node(node_id);
            match &node.kind {
                PlanNodeKind::Scan(_) => Step::Attach(node.cardinality),
                PlanNodeKind::Exchange(_) => {
                    if self.config.enable_global_runtime_filter
                        && desc.can_push_across_exchange()
                    {
                        Step::Cross(node.children.clone())
                    } else {
                        Step::Stop
                    }
                }
                PlanNodeKind::Project(p) => {
                    // only identity projections are transparent
                    let inner = expr.as_slot().and_then(|slot| {
                        p.projections
                            .iter()
                            .find(|(s, _)| *s == slot)
                            .map(|(_, e)| e.clone())
                    });
                    match inner {
                        Some(e) if e.as_slot().is_some() => Step::Through(node.children[0], e),
                        _ => Step::Stop,
                    }
                }
                _ => Step::Fanout(node.children.clone()),
            }
        };
        match step {
            Step::Attach(cardinality) => {
                if desc.can_probe_use(cardinality, self.config) {
                    self.ctx.node_mut(node_id).probe_filters.push(desc.id);
                    desc.add_probe_target(node_id, expr.clone());
                }
            }
            Step::Cross(children) => {
                desc.enter_exchange();
                for child in children {
                    self.push_runtime_filter(child, desc, expr);
                }
                desc.exit_exchange();
            }
            Step::Through(child, inner) => self.push_runtime_filter(child, desc, &inner),
            Step::Fanout(children) => {
                for child in children {
                    if self.expr_tuples_contained(expr, child) {
                        self.push_runtime_filter(child, desc, expr);
                    }
                }
            }
            Step::Stop => {}
        }
    }

    fn expr_tuples_contained(&self, expr: &PhysExpr, node: PlanNodeId) -> bool {
        let tuples = &self.ctx.node(node).tuple_ids;
        expr.used_slots()
            .iter()
            .all(|s| tuples.contains(&self.ctx.layouts.slot(*s).tuple))
    }

    // ---- pipeline dop ----

    /// Broadcast and replicated joins hold the whole build side per
    /// instance; under the pipeline engine with auto dop the per-instance
    /// parallelism moves into the pipeline dop and the fragment runs as one
    /// instance per worker.
    fn estimate_pipeline_dop(&mut self, fragment: FragmentId) {
        if !self.config.enable_pipeline_engine
            || self.config.pipeline_dop != 0
            || self.ctx.fragment(fragment).dop_estimated
        {
            return;
        }
        let f = self.ctx.fragment_mut(fragment);
        f.pipeline_dop = f.parallel_exec_num;
        f.parallel_exec_num = 1;
        f.dop_estimated = true;
    }
}

/// Splits an ON predicate into hash-key equalities (normalized so the left
/// expression references probe columns) and other conjuncts.
///
/// An equality between two constant expressions keys the join on nothing
/// and is rejected.
pub(crate) fn split_join_predicate(
    predicate: Option<&ScalarExpr>,
    left_cols: &[ColumnId],
    right_cols: &[ColumnId],
) -> Result<(Vec<(ScalarExpr, ScalarExpr)>, Vec<ScalarExpr>)> {
    let mut eq = Vec::new();
    let mut others = Vec::new();
    for conjunct in extract_conjuncts(predicate) {
        if let ScalarExpr::Binary {
            left,
            op: crate::expr::BinaryOp::Eq,
            right,
        } = conjunct
        {
            let l_used = left.used_columns();
            let r_used = right.used_columns();
            if l_used.is_empty() && r_used.is_empty() {
                return Err(QuarryError::Unsupported(
                    "join equality between constants".into(),
                ));
            }
            let from = |cols: &[ColumnId], side: &[ColumnId]| {
                !cols.is_empty() && cols.iter().all(|c| side.contains(c))
            };
            if from(&l_used, left_cols) && from(&r_used, right_cols) {
                eq.push((left.as_ref().clone(), right.as_ref().clone()));
                continue;
            }
            if from(&l_used, right_cols) && from(&r_used, left_cols) {
                eq.push((right.as_ref().clone(), left.as_ref().clone()));
                continue;
            }
        }
        others.push(conjunct.clone());
    }
    Ok((eq, others))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{BinaryOp, LiteralValue};

    fn col(id: u32) -> ScalarExpr {
        ScalarExpr::ColumnRef(ColumnId(id))
    }

    #[test]
    fn equality_spanning_sides_becomes_a_key() {
        let pred = ScalarExpr::col_eq(ColumnId(1), ColumnId(10));
        let (eq, others) =
            split_join_predicate(Some(&pred), &[ColumnId(1)], &[ColumnId(10)]).unwrap();
        assert_eq!(eq.len(), 1);
        assert!(others.is_empty());
        assert_eq!(eq[0].0, col(1));
        assert_eq!(eq[0].1, col(10));
    }

    #[test]
    fn swapped_equality_is_normalized() {
        let pred = ScalarExpr::col_eq(ColumnId(10), ColumnId(1));
        let (eq, _) = split_join_predicate(Some(&pred), &[ColumnId(1)], &[ColumnId(10)]).unwrap();
        assert_eq!(eq[0].0, col(1));
        assert_eq!(eq[0].1, col(10));
    }

    #[test]
    fn same_side_equality_stays_a_residual() {
        let pred = ScalarExpr::col_eq(ColumnId(1), ColumnId(2));
        let (eq, others) =
            split_join_predicate(Some(&pred), &[ColumnId(1), ColumnId(2)], &[ColumnId(10)])
                .unwrap();
        assert!(eq.is_empty());
        assert_eq!(others.len(), 1);
    }

    #[test]
    fn constant_equality_is_rejected() {
        let pred = ScalarExpr::Binary {
            left: Box::new(ScalarExpr::Literal(LiteralValue::Int64(1))),
            op: BinaryOp::Eq,
            right: Box::new(ScalarExpr::Literal(LiteralValue::Int64(1))),
        };
        let err = split_join_predicate(Some(&pred), &[ColumnId(1)], &[ColumnId(2)]).unwrap_err();
        assert!(matches!(err, QuarryError::Unsupported(_)));
    }

    #[test]
    fn non_equality_goes_to_others() {
        let pred = ScalarExpr::Binary {
            left: Box::new(col(1)),
            op: BinaryOp::Lt,
            right: Box::new(col(10)),
        };
        let (eq, others) =
            split_join_predicate(Some(&pred), &[ColumnId(1)], &[ColumnId(10)]).unwrap();
        assert!(eq.is_empty());
        assert_eq!(others.len(), 1);
    }
}
