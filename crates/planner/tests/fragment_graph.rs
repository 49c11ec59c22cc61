//! End-to-end fragment graph shapes: join distribution modes, split top-n,
//! output fragment creation, and build determinism.

mod support;

use arrow_schema::DataType;
use quarry_common::{ColocateGroupId, ColumnId, PlanNodeId, SessionConfig, TableId};
use quarry_planner::builder::{ExecPlan, FragmentBuilder};
use quarry_planner::operator::{
    ColumnCatalog, DistributionOp, JoinDistributionHint, JoinOp, JoinType, OpNode, OperatorKind,
    Ordering, PhysicalTree, Statistics, TopNOp,
};
use quarry_planner::plan_node::{
    ExchangeKind, JoinDistributionMode, PartitionKind, PlanNodeKind,
};
use support::{col_eq, register_column, scan, table_desc, TestCatalog};

fn fixture() -> (TestCatalog, ColumnCatalog) {
    let mut cat = TestCatalog::new();
    cat.add_table(
        table_desc(
            TableId(1),
            "orders",
            &[
                ("o_id", DataType::Int64, false),
                ("o_cust", DataType::Int64, false),
                ("o_amount", DataType::Float64, true),
            ],
            &["o_id"],
            3,
        ),
        3,
    );
    cat.add_table(
        table_desc(
            TableId(2),
            "customers",
            &[
                ("c_id", DataType::Int64, false),
                ("c_name", DataType::Utf8, true),
            ],
            &["c_id"],
            3,
        ),
        3,
    );
    let mut cols = ColumnCatalog::new();
    register_column(&mut cols, 1, "o_id", DataType::Int64, false);
    register_column(&mut cols, 2, "o_cust", DataType::Int64, false);
    register_column(&mut cols, 3, "o_amount", DataType::Float64, true);
    register_column(&mut cols, 10, "c_id", DataType::Int64, false);
    register_column(&mut cols, 11, "c_name", DataType::Utf8, true);
    (cat, cols)
}

fn orders_scan() -> OpNode {
    scan(TableId(1), &[(1, "o_id"), (2, "o_cust")], &[1], 10_000_000.0)
}

fn customers_scan() -> OpNode {
    scan(TableId(2), &[(10, "c_id"), (11, "c_name")], &[10], 1_000.0)
}

fn broadcast(input: OpNode) -> OpNode {
    let outputs = input.output_columns.clone();
    let stats = input.stats;
    OpNode::new(OperatorKind::Distribution(DistributionOp::Broadcast), vec![input])
        .with_outputs(outputs)
        .with_stats(stats)
}

fn shuffle(input: OpNode, columns: &[u32]) -> OpNode {
    let outputs = input.output_columns.clone();
    let stats = input.stats;
    OpNode::new(
        OperatorKind::Distribution(DistributionOp::Shuffle {
            columns: columns.iter().map(|c| ColumnId(*c)).collect(),
        }),
        vec![input],
    )
    .with_outputs(outputs)
    .with_stats(stats)
}

fn inner_join(left: OpNode, right: OpNode, on: quarry_planner::expr::ScalarExpr) -> OpNode {
    join_of(JoinType::Inner, left, right, on)
}

fn join_of(
    join_type: JoinType,
    left: OpNode,
    right: OpNode,
    on: quarry_planner::expr::ScalarExpr,
) -> OpNode {
    OpNode::new(
        OperatorKind::HashJoin(JoinOp {
            join_type,
            on_predicate: Some(on),
            distribution_hint: None,
        }),
        vec![left, right],
    )
    .with_outputs(vec![ColumnId(1), ColumnId(11)])
    .with_stats(Statistics::new(10_000_000.0))
}

fn tree(root: OpNode, columns: ColumnCatalog) -> PhysicalTree {
    PhysicalTree {
        root,
        columns,
        output_columns: vec![ColumnId(1), ColumnId(11)],
        column_names: vec!["o_id".into(), "c_name".into()],
    }
}

/// Fragment-local nodes, in preorder.
fn nodes_of(plan: &ExecPlan, root: PlanNodeId) -> Vec<PlanNodeId> {
    let mut out = vec![root];
    if !matches!(plan.node(root).kind, PlanNodeKind::Exchange(_)) {
        for child in &plan.node(root).children {
            out.extend(nodes_of(plan, *child));
        }
    }
    out
}

fn find_join(plan: &ExecPlan) -> PlanNodeId {
    for fragment in plan.fragments() {
        for n in nodes_of(plan, fragment.root) {
            if matches!(plan.node(n).kind, PlanNodeKind::HashJoin(_)) {
                return n;
            }
        }
    }
    panic!("no hash join in plan");
}

#[test]
fn broadcast_join_merges_build_into_probe_fragment() {
    let (cat, cols) = fixture();
    let root = inner_join(orders_scan(), broadcast(customers_scan()), col_eq(2, 10));
    let plan = FragmentBuilder::new(&cat, SessionConfig::default())
        .build(&tree(root, cols))
        .unwrap();

    let fragments = plan.fragments();
    assert_eq!(fragments.len(), 3);

    // sinks first: output fragment leads
    let output = fragments[0];
    assert_eq!(output.partition.kind, PartitionKind::Unpartitioned);
    assert!(output.output_exprs.is_some());

    let join = find_join(&plan);
    let join_node = plan.node(join);
    match &join_node.kind {
        PlanNodeKind::HashJoin(j) => {
            assert_eq!(j.distribution, JoinDistributionMode::Broadcast)
        }
        _ => unreachable!(),
    }
    // build side enters through a broadcast exchange inside the probe fragment
    let build = join_node.children[1];
    match &plan.node(build).kind {
        PlanNodeKind::Exchange(e) => assert_eq!(e.kind, ExchangeKind::Broadcast),
        other => panic!("build child should be an exchange, got {}", other.name()),
    }
    // the customers fragment now feeds that exchange
    let producer = fragments
        .iter()
        .find(|f| f.destination() == Some(build))
        .expect("no producer for the broadcast exchange");
    let join_fragment = fragments
        .iter()
        .find(|f| nodes_of(&plan, f.root).contains(&join))
        .unwrap();
    assert!(join_fragment.children.contains(&producer.id));
}

#[test]
fn broadcast_join_builds_a_local_runtime_filter() {
    let (cat, cols) = fixture();
    let root = inner_join(orders_scan(), broadcast(customers_scan()), col_eq(2, 10));
    let plan = FragmentBuilder::new(&cat, SessionConfig::default())
        .build(&tree(root, cols))
        .unwrap();

    let filters = plan.runtime_filters();
    assert_eq!(filters.len(), 1);
    let filter = &filters[0];
    assert_eq!(filter.probe_targets.len(), 1);
    assert!(filter.probe_targets[0].local);
    assert!(!filter.has_remote_targets);

    let probe = filter.probe_targets[0].node;
    assert!(plan.node(probe).probe_filters.contains(&filter.id));
    // build and probe share a fragment, so the probe waits locally
    assert!(plan.node(probe).local_rf_waiting_set.contains(&filter.id));
}

#[test]
fn partitioned_join_gets_its_own_hash_fragment() {
    let (cat, cols) = fixture();
    let root = inner_join(
        shuffle(orders_scan(), &[2]),
        shuffle(customers_scan(), &[10]),
        col_eq(2, 10),
    );
    let plan = FragmentBuilder::new(&cat, SessionConfig::default())
        .build(&tree(root, cols))
        .unwrap();

    let fragments = plan.fragments();
    assert_eq!(fragments.len(), 4);

    let join = find_join(&plan);
    match &plan.node(join).kind {
        PlanNodeKind::HashJoin(j) => {
            assert_eq!(j.distribution, JoinDistributionMode::Partitioned);
            assert!(!j.partition_exprs.is_empty());
        }
        _ => unreachable!(),
    }
    let join_fragment = fragments
        .iter()
        .find(|f| nodes_of(&plan, f.root).contains(&join))
        .unwrap();
    assert_eq!(join_fragment.partition.kind, PartitionKind::Hash);
    assert_eq!(join_fragment.children.len(), 2);
    // both scan fragments now ship hash-partitioned rows
    for child in &join_fragment.children {
        assert_eq!(
            plan.fragment(*child).output_partition.kind,
            PartitionKind::Hash
        );
    }
}

#[test]
fn single_key_shuffle_filter_crosses_the_exchange() {
    let (cat, cols) = fixture();
    let root = inner_join(
        shuffle(orders_scan(), &[2]),
        shuffle(customers_scan(), &[10]),
        col_eq(2, 10),
    );
    let plan = FragmentBuilder::new(&cat, SessionConfig::default())
        .build(&tree(root, cols))
        .unwrap();

    let filters = plan.runtime_filters();
    assert_eq!(filters.len(), 1);
    let filter = &filters[0];
    assert!(filter.can_push_across_exchange());
    assert!(filter.has_remote_targets);
    assert_eq!(filter.probe_targets.len(), 1);
    assert!(!filter.probe_targets[0].local);

    // remote targets never enter a local waiting set
    let probe = filter.probe_targets[0].node;
    assert!(plan.node(probe).local_rf_waiting_set.is_empty());
}

#[test]
fn two_key_shuffle_filters_stay_behind_the_exchange() {
    let (cat, cols) = fixture();
    let on = quarry_planner::expr::ScalarExpr::And(
        Box::new(col_eq(2, 10)),
        Box::new(col_eq(1, 10)),
    );
    let root = inner_join(
        shuffle(orders_scan(), &[2]),
        shuffle(customers_scan(), &[10]),
        on,
    );
    let plan = FragmentBuilder::new(&cat, SessionConfig::default())
        .build(&tree(root, cols))
        .unwrap();

    let filters = plan.runtime_filters();
    assert_eq!(filters.len(), 2);
    for filter in filters {
        assert_eq!(filter.equal_count, 2);
        assert!(!filter.can_push_across_exchange());
        assert!(!filter.has_probe_targets());
    }
    // the join still records both build filters
    let join = find_join(&plan);
    match &plan.node(join).kind {
        PlanNodeKind::HashJoin(j) => assert_eq!(j.build_filters.len(), 2),
        _ => unreachable!(),
    }
}

#[test]
fn colocated_tables_join_without_exchanges() {
    let (mut cat, cols) = fixture();
    cat.set_colocate(TableId(1), ColocateGroupId(7), true);
    cat.set_colocate(TableId(2), ColocateGroupId(7), true);

    // o_id and c_id are the bucket columns of their tables
    let root = inner_join(orders_scan(), customers_scan(), col_eq(1, 10));
    let plan = FragmentBuilder::new(&cat, SessionConfig::default())
        .build(&tree(root, cols))
        .unwrap();

    let join = find_join(&plan);
    match &plan.node(join).kind {
        PlanNodeKind::HashJoin(j) => {
            assert_eq!(j.distribution, JoinDistributionMode::Colocate)
        }
        _ => unreachable!(),
    }
    let fragments = plan.fragments();
    let join_fragment = fragments
        .iter()
        .find(|f| nodes_of(&plan, f.root).contains(&join))
        .unwrap();
    let kinds: Vec<&str> = nodes_of(&plan, join_fragment.root)
        .iter()
        .map(|n| plan.node(*n).kind.name())
        .collect();
    assert_eq!(kinds.iter().filter(|k| **k == "SCAN").count(), 2);
    assert!(!kinds.contains(&"EXCHANGE"));
}

#[test]
fn unstable_colocate_group_is_rejected() {
    let (mut cat, cols) = fixture();
    cat.set_colocate(TableId(1), ColocateGroupId(7), false);
    cat.set_colocate(TableId(2), ColocateGroupId(7), false);

    let root = inner_join(orders_scan(), customers_scan(), col_eq(1, 10));
    let err = FragmentBuilder::new(&cat, SessionConfig::default())
        .build(&tree(root, cols))
        .unwrap_err();
    assert!(err.to_string().contains("not colocatable"));
}

#[test]
fn colocate_needs_join_keys_covering_the_bucket_columns() {
    let (mut cat, cols) = fixture();
    cat.set_colocate(TableId(1), ColocateGroupId(7), true);
    cat.set_colocate(TableId(2), ColocateGroupId(7), true);

    // o_cust is not the orders bucket column, so matching rows can live in
    // differently-numbered buckets
    let root = inner_join(orders_scan(), customers_scan(), col_eq(2, 10));
    let err = FragmentBuilder::new(&cat, SessionConfig::default())
        .build(&tree(root, cols))
        .unwrap_err();
    assert!(err.to_string().contains("not colocatable"));
}

#[test]
fn broadcast_build_wins_over_a_shuffled_probe() {
    let (cat, cols) = fixture();
    let root = inner_join(
        shuffle(orders_scan(), &[2]),
        broadcast(customers_scan()),
        col_eq(2, 10),
    );
    let plan = FragmentBuilder::new(&cat, SessionConfig::default())
        .build(&tree(root, cols))
        .unwrap();

    let join = find_join(&plan);
    match &plan.node(join).kind {
        PlanNodeKind::HashJoin(j) => {
            assert_eq!(j.distribution, JoinDistributionMode::Broadcast)
        }
        _ => unreachable!(),
    }
}

#[test]
fn local_bucket_join_routes_the_shuffled_build_into_storage_buckets() {
    let (cat, cols) = fixture();
    let root = inner_join(orders_scan(), shuffle(customers_scan(), &[10]), col_eq(2, 10));
    let plan = FragmentBuilder::new(&cat, SessionConfig::default())
        .build(&tree(root, cols))
        .unwrap();

    let join = find_join(&plan);
    match &plan.node(join).kind {
        PlanNodeKind::HashJoin(j) => {
            assert_eq!(j.distribution, JoinDistributionMode::LocalHashBucket);
            assert!(!j.partition_exprs.is_empty());
        }
        _ => unreachable!(),
    }
    // the probe scan fragment hosts the join; the build producer now ships
    // bucket-aligned rows
    let fragments = plan.fragments();
    let join_fragment = fragments
        .iter()
        .find(|f| nodes_of(&plan, f.root).contains(&join))
        .unwrap();
    assert_eq!(join_fragment.children.len(), 1);
    let producer = plan.fragment(join_fragment.children[0]);
    assert_eq!(
        producer.output_partition.kind,
        PartitionKind::BucketShuffleHash
    );
}

#[test]
fn shuffle_hint_keeps_a_plain_hash_delivery() {
    let (cat, cols) = fixture();
    let root = OpNode::new(
        OperatorKind::HashJoin(JoinOp {
            join_type: JoinType::Inner,
            on_predicate: Some(col_eq(2, 10)),
            distribution_hint: Some(JoinDistributionHint::Shuffle),
        }),
        vec![orders_scan(), shuffle(customers_scan(), &[10])],
    )
    .with_outputs(vec![ColumnId(1), ColumnId(11)])
    .with_stats(Statistics::new(10_000_000.0));
    let plan = FragmentBuilder::new(&cat, SessionConfig::default())
        .build(&tree(root, cols))
        .unwrap();

    let join = find_join(&plan);
    match &plan.node(join).kind {
        PlanNodeKind::HashJoin(j) => {
            assert_eq!(j.distribution, JoinDistributionMode::ShuffleHashBucket)
        }
        _ => unreachable!(),
    }
    let fragments = plan.fragments();
    let join_fragment = fragments
        .iter()
        .find(|f| nodes_of(&plan, f.root).contains(&join))
        .unwrap();
    let producer = plan.fragment(join_fragment.children[0]);
    assert_eq!(producer.output_partition.kind, PartitionKind::Hash);
}

#[test]
fn disabled_bucket_shuffle_rejects_a_shuffled_build() {
    let (cat, cols) = fixture();
    let config = SessionConfig {
        enable_bucket_shuffle: false,
        ..SessionConfig::default()
    };
    let root = inner_join(orders_scan(), shuffle(customers_scan(), &[10]), col_eq(2, 10));
    let err = FragmentBuilder::new(&cat, config)
        .build(&tree(root, cols))
        .unwrap_err();
    assert!(err.to_string().contains("bucket shuffle"));
}

#[test]
fn exchange_rooted_plan_outputs_directly() {
    let (cat, cols) = fixture();
    let root = shuffle(orders_scan(), &[2]);
    let plan = FragmentBuilder::new(&cat, SessionConfig::default())
        .build(&PhysicalTree {
            root,
            columns: cols,
            output_columns: vec![ColumnId(1), ColumnId(2)],
            column_names: vec!["o_id".into(), "o_cust".into()],
        })
        .unwrap();

    // no gather fragment is appended on top of the shuffle
    let fragments = plan.fragments();
    assert_eq!(fragments.len(), 2);
    let output = fragments[0];
    assert!(output.output_exprs.is_some());
    assert!(matches!(
        plan.node(output.root).kind,
        PlanNodeKind::Exchange(_)
    ));
}

#[test]
fn broadcast_join_trades_instances_for_pipeline_dop() {
    let (cat, cols) = fixture();
    let config = SessionConfig {
        parallel_exec_instance_num: 8,
        ..SessionConfig::default()
    };
    let root = inner_join(orders_scan(), broadcast(customers_scan()), col_eq(2, 10));
    let plan = FragmentBuilder::new(&cat, config)
        .build(&tree(root, cols))
        .unwrap();

    let join = find_join(&plan);
    let fragments = plan.fragments();
    let join_fragment = fragments
        .iter()
        .find(|f| nodes_of(&plan, f.root).contains(&join))
        .unwrap();
    assert!(join_fragment.dop_estimated);
    assert_eq!(join_fragment.pipeline_dop, 8);
    assert_eq!(join_fragment.parallel_exec_num, 1);
}

#[test]
fn replicated_join_also_trades_instances_for_pipeline_dop() {
    let (mut cat, cols) = fixture();
    let mut customers = table_desc(
        TableId(2),
        "customers",
        &[
            ("c_id", DataType::Int64, false),
            ("c_name", DataType::Utf8, true),
        ],
        &["c_id"],
        3,
    );
    customers.replicated = true;
    cat.add_table(customers, 3);
    let config = SessionConfig {
        enable_replication_join: true,
        parallel_exec_instance_num: 4,
        ..SessionConfig::default()
    };

    let root = inner_join(orders_scan(), customers_scan(), col_eq(2, 10));
    let plan = FragmentBuilder::new(&cat, config)
        .build(&tree(root, cols))
        .unwrap();

    let join = find_join(&plan);
    match &plan.node(join).kind {
        PlanNodeKind::HashJoin(j) => {
            assert_eq!(j.distribution, JoinDistributionMode::Replicated)
        }
        _ => unreachable!(),
    }
    let fragments = plan.fragments();
    let join_fragment = fragments
        .iter()
        .find(|f| nodes_of(&plan, f.root).contains(&join))
        .unwrap();
    assert!(join_fragment.dop_estimated);
    assert_eq!(join_fragment.pipeline_dop, 4);
    assert_eq!(join_fragment.parallel_exec_num, 1);
}

#[test]
fn left_outer_join_widens_build_side_nullability() {
    let (cat, cols) = fixture();
    let root = join_of(
        JoinType::LeftOuter,
        orders_scan(),
        broadcast(customers_scan()),
        col_eq(2, 10),
    );
    let plan = FragmentBuilder::new(&cat, SessionConfig::default())
        .build(&tree(root, cols))
        .unwrap();

    // customers is the second scan translated
    let build_scan = plan.scan_nodes()[1];
    let tuple = plan.node(build_scan).tuple_ids[0];
    for slot in &plan.layouts().tuple(tuple).slots {
        assert!(plan.layouts().slot(*slot).nullable);
    }
    // preserved probe rows forbid probe-side filtering
    assert!(plan.runtime_filters().is_empty());
}

#[test]
fn split_topn_merges_through_a_sorting_exchange() {
    let (cat, cols) = fixture();
    let partial = OpNode::new(
        OperatorKind::TopN(TopNOp {
            order_by: vec![Ordering {
                column: ColumnId(1),
                ascending: true,
                nulls_first: false,
            }],
            offset: 0,
            split: true,
            partial: true,
        }),
        vec![orders_scan()],
    )
    .with_outputs(vec![ColumnId(1), ColumnId(2)])
    .with_stats(Statistics::new(10.0))
    .with_limit(10);
    let merge = OpNode::new(
        OperatorKind::TopN(TopNOp {
            order_by: vec![Ordering {
                column: ColumnId(1),
                ascending: true,
                nulls_first: false,
            }],
            offset: 2,
            split: true,
            partial: false,
        }),
        vec![partial],
    )
    .with_outputs(vec![ColumnId(1), ColumnId(2)])
    .with_stats(Statistics::new(8.0))
    .with_limit(10);

    let plan = FragmentBuilder::new(&cat, SessionConfig::default())
        .build(&PhysicalTree {
            root: merge,
            columns: cols,
            output_columns: vec![ColumnId(1), ColumnId(2)],
            column_names: vec!["o_id".into(), "o_cust".into()],
        })
        .unwrap();

    // the unpartitioned merge fragment doubles as the output fragment
    let fragments = plan.fragments();
    assert_eq!(fragments.len(), 2);
    let merge_fragment = fragments[0];
    assert!(merge_fragment.output_exprs.is_some());
    let root = plan.node(merge_fragment.root);
    match &root.kind {
        PlanNodeKind::Exchange(e) => {
            assert_eq!(e.kind, ExchangeKind::Gather);
            assert_eq!(e.merge.as_ref().unwrap().offset, 2);
        }
        other => panic!("expected merging exchange, got {}", other.name()),
    }
    assert_eq!(root.limit, Some(10));
    // the partial phase sorts inside the scan fragment
    match &plan.node(plan.fragment(merge_fragment.children[0]).root).kind {
        PlanNodeKind::Sort(s) => assert!(s.topn),
        other => panic!("expected sort below the merge, got {}", other.name()),
    }
}

#[test]
fn identical_input_builds_identical_wire_plans() {
    let (cat, cols) = fixture();
    let build = || {
        let root = inner_join(orders_scan(), broadcast(customers_scan()), col_eq(2, 10));
        FragmentBuilder::new(&cat, SessionConfig::default())
            .build(&tree(root, cols.clone()))
            .unwrap()
    };
    let a = serde_json::to_string(&build().to_wire()).unwrap();
    let b = serde_json::to_string(&build().to_wire()).unwrap();
    assert_eq!(a, b);
}
