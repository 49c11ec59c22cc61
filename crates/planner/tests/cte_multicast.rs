//! CTE translation: one multicast producer fanned out to several consumers.

mod support;

use arrow_schema::DataType;
use quarry_common::{ColumnId, CteId, SessionConfig, TableId};
use quarry_planner::builder::FragmentBuilder;
use quarry_planner::expr::ScalarExpr;
use quarry_planner::operator::{
    ColumnCatalog, CteConsumeOp, CteProduceOp, OpNode, OperatorKind, PhysicalTree, SetOpKind,
    SetOperation, Statistics,
};
use quarry_planner::plan_node::{ExchangeKind, PartitionKind, PlanNodeKind};
use support::{register_column, scan, table_desc, TestCatalog};

fn consume(cte: CteId, locals: [u32; 2]) -> OpNode {
    OpNode::new(
        OperatorKind::CteConsume(CteConsumeOp {
            cte_id: cte,
            output_map: vec![
                (ColumnId(locals[0]), ScalarExpr::ColumnRef(ColumnId(1))),
                (ColumnId(locals[1]), ScalarExpr::ColumnRef(ColumnId(2))),
            ],
        }),
        vec![],
    )
    .with_outputs(vec![ColumnId(locals[0]), ColumnId(locals[1])])
    .with_stats(Statistics::new(1_000.0))
}

#[test]
fn cte_producer_multicasts_to_every_consumer() {
    let mut cat = TestCatalog::new();
    cat.add_table(
        table_desc(
            TableId(1),
            "events",
            &[
                ("e_id", DataType::Int64, false),
                ("e_kind", DataType::Int64, false),
            ],
            &["e_id"],
            3,
        ),
        3,
    );
    let mut cols = ColumnCatalog::new();
    register_column(&mut cols, 1, "e_id", DataType::Int64, false);
    register_column(&mut cols, 2, "e_kind", DataType::Int64, false);
    for id in [20, 21, 30, 31, 40, 41] {
        register_column(&mut cols, id, &format!("c{id}"), DataType::Int64, false);
    }

    let cte = CteId(0);
    let produce = OpNode::new(
        OperatorKind::CteProduce(CteProduceOp {
            cte_id: cte,
            output_columns: vec![ColumnId(1), ColumnId(2)],
        }),
        vec![scan(TableId(1), &[(1, "e_id"), (2, "e_kind")], &[1], 1_000.0)],
    )
    .with_outputs(vec![ColumnId(1), ColumnId(2)]);

    let union = OpNode::new(
        OperatorKind::SetOp(SetOperation {
            kind: SetOpKind::Union,
            output_columns: vec![ColumnId(40), ColumnId(41)],
            child_outputs: vec![
                vec![ColumnId(20), ColumnId(21)],
                vec![ColumnId(30), ColumnId(31)],
            ],
        }),
        vec![consume(cte, [20, 21]), consume(cte, [30, 31])],
    )
    .with_outputs(vec![ColumnId(40), ColumnId(41)])
    .with_stats(Statistics::new(2_000.0));

    let anchor = OpNode::new(OperatorKind::CteAnchor, vec![produce, union])
        .with_outputs(vec![ColumnId(40), ColumnId(41)]);

    let plan = FragmentBuilder::new(&cat, SessionConfig::default())
        .build(&PhysicalTree {
            root: anchor,
            columns: cols,
            output_columns: vec![ColumnId(40), ColumnId(41)],
            column_names: vec!["c40".into(), "c41".into()],
        })
        .unwrap();

    let fragments = plan.fragments();
    // multicast producer, two consumers, union, output
    assert_eq!(fragments.len(), 5);

    let multicast = fragments
        .iter()
        .find(|f| f.multicast)
        .expect("no multicast fragment");
    assert_eq!(multicast.destinations.len(), 2);
    assert!(multicast.output_exprs.is_some());

    // each consumer reads the shared stream through its own exchange
    for dest in &multicast.destinations {
        match &plan.node(*dest).kind {
            PlanNodeKind::Exchange(e) => assert_eq!(e.kind, ExchangeKind::Shuffle),
            other => panic!("destination should be an exchange, got {}", other.name()),
        }
    }
    let consumers: Vec<_> = fragments
        .iter()
        .filter(|f| f.children == vec![multicast.id])
        .collect();
    assert_eq!(consumers.len(), 2);
    for consumer in &consumers {
        // consumer root re-projects the producer columns onto local ids
        assert!(matches!(
            plan.node(consumer.root).kind,
            PlanNodeKind::Project(_)
        ));
    }

    let union_fragment = fragments
        .iter()
        .find(|f| matches!(plan.node(f.root).kind, PlanNodeKind::SetOperation(_)))
        .expect("no union fragment");
    assert_eq!(union_fragment.partition.kind, PartitionKind::Random);
    assert_eq!(union_fragment.children.len(), 2);
    match &plan.node(union_fragment.root).kind {
        PlanNodeKind::SetOperation(s) => {
            assert_eq!(s.result_expr_lists.len(), 2);
            assert_eq!(s.first_materialized_child_idx, 2);
        }
        _ => unreachable!(),
    }
}
