//! Typed identifiers shared across the planner components.
//!
//! Ids are issued monotonically by the plan context during one build and are
//! stable for the lifetime of that build; they are never reused after the
//! object they address is retired.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! plan_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(
            /// Raw numeric id value.
            pub u32,
        );

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

plan_id!(
    /// Logical column reference assigned by the optimizer.
    ColumnId
);
plan_id!(
    /// Physical slot within a tuple layout.
    SlotId
);
plan_id!(
    /// Tuple layout (ordered slot group sharing one row buffer).
    TupleId
);
plan_id!(
    /// Plan node, unique within one plan.
    PlanNodeId
);
plan_id!(
    /// Plan fragment within the fragment graph.
    FragmentId
);
plan_id!(
    /// Common-table-expression produce/consume pairing key.
    CteId
);
plan_id!(
    /// Runtime filter descriptor.
    FilterId
);
plan_id!(
    /// Catalog table.
    TableId
);
plan_id!(
    /// Catalog partition within a table.
    PartitionId
);
plan_id!(
    /// Storage tablet within a partition.
    TabletId
);
plan_id!(
    /// Colocation group of tables sharing bucket-to-node placement.
    ColocateGroupId
);
