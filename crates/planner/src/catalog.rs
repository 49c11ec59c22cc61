//! Metadata boundary between the fragment builder and the embedding engine.
//!
//! The builder never talks to storage directly; everything it needs about
//! tables, tablet placement, and colocation comes through
//! [`MetadataProvider`].

use quarry_common::{ColocateGroupId, PartitionId, Result, TableId, TabletId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Network address of one worker node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerAddr {
    /// Host name or IP.
    pub host: String,
    /// Data-plane port.
    pub port: u16,
}

impl fmt::Display for WorkerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Column definition inside a table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableColumn {
    /// Column name.
    pub name: String,
    /// Column type.
    pub data_type: arrow_schema::DataType,
    /// Column nullability.
    pub nullable: bool,
}

/// Table metadata the builder consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDesc {
    /// Table id.
    pub id: TableId,
    /// Table name for explain output.
    pub name: String,
    /// Schema columns.
    pub columns: Vec<TableColumn>,
    /// Hash-distribution key column names, in key order.
    pub bucket_columns: Vec<String>,
    /// Bucket count of the hash distribution.
    pub bucket_count: u32,
    /// Every tablet is replicated on every worker, making the table usable
    /// as a replicated-join build side.
    pub replicated: bool,
}

impl TableDesc {
    /// Looks up a schema column by name.
    pub fn column(&self, name: &str) -> Option<&TableColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// One scannable tablet with its placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRange {
    /// Owning partition.
    pub partition: PartitionId,
    /// Tablet id.
    pub tablet: TabletId,
    /// Bucket sequence of the tablet within its partition's distribution.
    pub bucket_seq: u32,
    /// Workers holding a replica, preferred first.
    pub replicas: Vec<WorkerAddr>,
}

/// Read-only metadata source for one plan build.
///
/// Implementations must answer consistently for the duration of a build;
/// tablet moves concurrent with planning surface as scheduling retries, not
/// planner errors.
pub trait MetadataProvider {
    /// Resolves a table definition.
    fn table(&self, id: TableId) -> Result<TableDesc>;

    /// Resolves scan ranges for the pruned partitions and tablets of a
    /// table, in tablet order.
    fn scan_ranges(
        &self,
        table: TableId,
        partitions: &[PartitionId],
        tablets: &[TabletId],
    ) -> Result<Vec<ScanRange>>;

    /// Colocation group of a table, if it belongs to one.
    fn colocate_group(&self, table: TableId) -> Option<ColocateGroupId>;

    /// Whether a colocation group currently has all its buckets aligned
    /// (no tablet is mid-rebalance).
    fn colocate_group_stable(&self, group: ColocateGroupId) -> bool;
}
