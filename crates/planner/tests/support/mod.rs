//! Shared fixtures: an in-memory metadata provider and operator-tree
//! construction helpers.

use arrow_schema::DataType;
use quarry_common::{
    ColocateGroupId, ColumnId, PartitionId, QuarryError, Result, TableId, TabletId,
};
use quarry_planner::catalog::{
    MetadataProvider, ScanRange, TableColumn, TableDesc, WorkerAddr,
};
use quarry_planner::expr::ScalarExpr;
use quarry_planner::operator::{
    ColumnCatalog, ColumnInfo, OpNode, OperatorKind, ScanOp, Statistics,
};
use std::collections::{HashMap, HashSet};

/// In-memory [`MetadataProvider`].
#[derive(Default)]
pub struct TestCatalog {
    tables: HashMap<TableId, TableDesc>,
    ranges: HashMap<TableId, Vec<ScanRange>>,
    colocate: HashMap<TableId, ColocateGroupId>,
    stable: HashSet<ColocateGroupId>,
}

impl TestCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a table with `tablets` single-replica tablets in one
    /// partition, bucket sequences in tablet order.
    pub fn add_table(&mut self, desc: TableDesc, tablets: u32) {
        let table = desc.id;
        let ranges = (0..tablets)
            .map(|i| ScanRange {
                partition: PartitionId(0),
                tablet: TabletId(i),
                bucket_seq: i,
                replicas: vec![WorkerAddr {
                    host: format!("worker-{}", i % 3),
                    port: 9060,
                }],
            })
            .collect();
        self.tables.insert(table, desc);
        self.ranges.insert(table, ranges);
    }

    pub fn set_colocate(&mut self, table: TableId, group: ColocateGroupId, stable: bool) {
        self.colocate.insert(table, group);
        if stable {
            self.stable.insert(group);
        }
    }
}

impl MetadataProvider for TestCatalog {
    fn table(&self, id: TableId) -> Result<TableDesc> {
        self.tables
            .get(&id)
            .cloned()
            .ok_or_else(|| QuarryError::Planning(format!("unknown table {id}")))
    }

    fn scan_ranges(
        &self,
        table: TableId,
        _partitions: &[PartitionId],
        tablets: &[TabletId],
    ) -> Result<Vec<ScanRange>> {
        let all = self
            .ranges
            .get(&table)
            .ok_or_else(|| QuarryError::Planning(format!("unknown table {table}")))?;
        if tablets.is_empty() {
            return Ok(all.clone());
        }
        Ok(all
            .iter()
            .filter(|r| tablets.contains(&r.tablet))
            .cloned()
            .collect())
    }

    fn colocate_group(&self, table: TableId) -> Option<ColocateGroupId> {
        self.colocate.get(&table).copied()
    }

    fn colocate_group_stable(&self, group: ColocateGroupId) -> bool {
        self.stable.contains(&group)
    }
}

pub fn table_desc(
    id: TableId,
    name: &str,
    columns: &[(&str, DataType, bool)],
    bucket_columns: &[&str],
    bucket_count: u32,
) -> TableDesc {
    TableDesc {
        id,
        name: name.into(),
        columns: columns
            .iter()
            .map(|(n, t, nullable)| TableColumn {
                name: (*n).into(),
                data_type: t.clone(),
                nullable: *nullable,
            })
            .collect(),
        bucket_columns: bucket_columns.iter().map(|s| (*s).into()).collect(),
        bucket_count,
        replicated: false,
    }
}

pub fn register_column(
    catalog: &mut ColumnCatalog,
    id: u32,
    name: &str,
    data_type: DataType,
    nullable: bool,
) -> ColumnId {
    catalog.insert(
        ColumnId(id),
        ColumnInfo {
            name: name.into(),
            data_type,
            nullable,
        },
    )
}

/// Scan operator over all tablets of a table.
pub fn scan(
    table: TableId,
    column_map: &[(u32, &str)],
    bucket_columns: &[u32],
    rows: f64,
) -> OpNode {
    let outputs: Vec<ColumnId> = column_map.iter().map(|(c, _)| ColumnId(*c)).collect();
    OpNode::new(
        OperatorKind::TableScan(ScanOp {
            table,
            column_map: column_map
                .iter()
                .map(|(c, n)| (ColumnId(*c), (*n).to_string()))
                .collect(),
            selected_partitions: vec![PartitionId(0)],
            selected_tablets: Vec::new(),
            bucket_columns: bucket_columns.iter().map(|c| ColumnId(*c)).collect(),
            preagg: false,
        }),
        vec![],
    )
    .with_stats(Statistics::new(rows))
    .with_outputs(outputs)
}

pub fn col_eq(left: u32, right: u32) -> ScalarExpr {
    ScalarExpr::col_eq(ColumnId(left), ColumnId(right))
}
