use serde::{Deserialize, Serialize};

/// Streaming pre-aggregation behavior for the local aggregate phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamingPreAggMode {
    /// Runtime decides per input chunk.
    Auto,
    /// Always stream through without building hash tables.
    ForceStreaming,
    /// Always pre-aggregate locally.
    ForcePreagg,
}

/// Read-only session tunables consumed by one plan build.
///
/// Passed explicitly into the builder entry point; there is no ambient
/// session singleton. Defaults reflect a pipeline-enabled deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Pipeline execution engine enabled on the workers.
    pub enable_pipeline_engine: bool,
    /// Per-fragment pipeline degree of parallelism; 0 means auto-tuning has
    /// not run yet and the builder may estimate it for broadcast and
    /// replicated joins.
    pub pipeline_dop: u32,
    /// Adapt fragment dop from the plan shape.
    pub pipeline_dop_adaption: bool,
    /// Build cross-fragment runtime filters.
    pub enable_global_runtime_filter: bool,
    /// Allow replicated joins when the build side is fully replicated.
    pub enable_replication_join: bool,
    /// Allow bucket-shuffle joins against bucket-aligned local sides.
    pub enable_bucket_shuffle: bool,
    /// Drop scan output columns used only by simple pushed-down predicates.
    pub filter_unused_columns_in_scan: bool,
    /// Minimum probe-side cardinality before a remote runtime filter applies.
    pub rf_probe_min_rows: u64,
    /// Minimum estimated selectivity before a remote runtime filter applies.
    pub rf_probe_min_selectivity: f64,
    /// Streaming pre-aggregation mode forwarded to local aggregate nodes.
    pub streaming_preagg_mode: StreamingPreAggMode,
    /// Push right-table predicates down through eligible hash joins.
    pub hash_join_push_down_right_table: bool,
    /// Per-fragment parallel instance count before dop estimation.
    pub parallel_exec_instance_num: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enable_pipeline_engine: true,
            pipeline_dop: 0,
            pipeline_dop_adaption: true,
            enable_global_runtime_filter: true,
            enable_replication_join: false,
            enable_bucket_shuffle: true,
            filter_unused_columns_in_scan: true,
            rf_probe_min_rows: 100 * 1024,
            rf_probe_min_selectivity: 0.5,
            streaming_preagg_mode: StreamingPreAggMode::Auto,
            hash_join_push_down_right_table: true,
            parallel_exec_instance_num: 1,
        }
    }
}
