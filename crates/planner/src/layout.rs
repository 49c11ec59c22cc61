//! Slot and tuple layouts.
//!
//! Every plan node that materializes rows owns one or more tuple layouts.
//! A tuple is an ordered group of slots sharing one row buffer; sealing a
//! tuple via [`LayoutTable::compute_mem_layout`] assigns byte offsets and
//! null-indicator bits. After sealing, the only permitted mutation is
//! widening a slot's nullability, which outer-join and set-operation
//! translation apply to already-built child layouts.

use arrow_schema::DataType;
use quarry_common::{SlotId, TableId, TupleId};
use serde::{Deserialize, Serialize};

/// One physical slot within a tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotDescriptor {
    /// Slot id, unique within the plan.
    pub id: SlotId,
    /// Owning tuple.
    pub tuple: TupleId,
    /// Value type.
    pub data_type: DataType,
    /// Whether the slot can hold null. Widens monotonically; never narrows.
    pub nullable: bool,
    /// Materialized slots occupy row-buffer bytes; non-materialized slots
    /// (projection common sub-expressions) are computed on demand.
    pub materialized: bool,
    /// Source table column for scan-produced slots.
    pub source_column: Option<(TableId, String)>,
    /// Byte offset within the row buffer; assigned by layout computation.
    pub byte_offset: Option<usize>,
    /// Null-indicator bit index; assigned for nullable materialized slots.
    pub null_bit: Option<usize>,
}

/// One tuple layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TupleLayout {
    /// Tuple id, unique within the plan.
    pub id: TupleId,
    /// Member slots in creation order.
    pub slots: Vec<SlotId>,
    /// Row-buffer size in bytes once sealed.
    pub byte_size: usize,
    /// Sealed tuples reject new slots.
    pub sealed: bool,
}

/// Arena of all tuple layouts and slot descriptors of one plan build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayoutTable {
    tuples: Vec<TupleLayout>,
    slots: Vec<SlotDescriptor>,
}

impl LayoutTable {
    /// Empty layout table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new, unsealed tuple layout.
    pub fn new_tuple(&mut self) -> TupleId {
        let id = TupleId(self.tuples.len() as u32);
        self.tuples.push(TupleLayout {
            id,
            slots: Vec::new(),
            byte_size: 0,
            sealed: false,
        });
        id
    }

    /// Adds a slot to an unsealed tuple.
    ///
    /// Panics if the tuple is already sealed; slots are never added after
    /// memory layout computation.
    pub fn add_slot(
        &mut self,
        tuple: TupleId,
        data_type: DataType,
        nullable: bool,
        materialized: bool,
    ) -> SlotId {
        let t = &mut self.tuples[tuple.0 as usize];
        assert!(!t.sealed, "tuple {tuple} is sealed");
        let id = SlotId(self.slots.len() as u32);
        t.slots.push(id);
        self.slots.push(SlotDescriptor {
            id,
            tuple,
            data_type,
            nullable,
            materialized,
            source_column: None,
            byte_offset: None,
            null_bit: None,
        });
        id
    }

    /// Slot descriptor by id.
    pub fn slot(&self, id: SlotId) -> &SlotDescriptor {
        &self.slots[id.0 as usize]
    }

    /// Mutable slot descriptor by id.
    pub fn slot_mut(&mut self, id: SlotId) -> &mut SlotDescriptor {
        &mut self.slots[id.0 as usize]
    }

    /// Tuple layout by id.
    pub fn tuple(&self, id: TupleId) -> &TupleLayout {
        &self.tuples[id.0 as usize]
    }

    /// Number of tuples created so far.
    pub fn tuple_count(&self) -> usize {
        self.tuples.len()
    }

    /// Seals a tuple: assigns slot byte offsets and null bits, and computes
    /// the row-buffer size.
    ///
    /// Materialized slots are packed widest-first (stable within equal
    /// widths) after a null-indicator prefix of one bit per nullable
    /// materialized slot. Sealing twice is a bug and panics.
    pub fn compute_mem_layout(&mut self, tuple: TupleId) {
        let t = &self.tuples[tuple.0 as usize];
        assert!(!t.sealed, "tuple {tuple} is already sealed");
        let mut materialized: Vec<SlotId> = t
            .slots
            .iter()
            .copied()
            .filter(|s| self.slot(*s).materialized)
            .collect();
        materialized.sort_by_key(|s| std::cmp::Reverse(type_width(&self.slot(*s).data_type)));

        let nullable_count = materialized
            .iter()
            .filter(|s| self.slot(**s).nullable)
            .count();
        let null_bytes = nullable_count.div_ceil(8);

        let mut offset = null_bytes;
        let mut null_bit = 0usize;
        for slot_id in materialized {
            let width = type_width(&self.slot(slot_id).data_type);
            if width > 1 {
                offset = offset.div_ceil(width) * width;
            }
            let slot = self.slot_mut(slot_id);
            slot.byte_offset = Some(offset);
            if slot.nullable {
                slot.null_bit = Some(null_bit);
                null_bit += 1;
            }
            offset += width;
        }

        let t = &mut self.tuples[tuple.0 as usize];
        t.byte_size = offset;
        t.sealed = true;
    }

    /// Widens every slot of a tuple to nullable.
    ///
    /// Allowed on sealed tuples: outer-join translation widens child
    /// layouts in place after they were built.
    pub fn widen_tuple_nullable(&mut self, tuple: TupleId) {
        let slots = self.tuples[tuple.0 as usize].slots.clone();
        for slot_id in slots {
            self.slot_mut(slot_id).nullable = true;
        }
    }
}

/// Fixed row-buffer width of a type; variable-length types store a 16-byte
/// pointer/length pair.
pub fn type_width(data_type: &DataType) -> usize {
    match data_type {
        DataType::Null | DataType::Boolean | DataType::Int8 => 1,
        DataType::Int16 => 2,
        DataType::Int32 | DataType::Float32 | DataType::Date32 => 4,
        DataType::Int64 | DataType::Float64 | DataType::Timestamp(_, _) => 8,
        _ => 16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_layout_packs_widest_first_after_null_prefix() {
        let mut layouts = LayoutTable::new();
        let t = layouts.new_tuple();
        let narrow = layouts.add_slot(t, DataType::Int8, true, true);
        let wide = layouts.add_slot(t, DataType::Int64, true, true);
        layouts.compute_mem_layout(t);

        // two nullable slots -> one null byte, then the Int64 aligned at 8.
        assert_eq!(layouts.slot(wide).byte_offset, Some(8));
        assert_eq!(layouts.slot(narrow).byte_offset, Some(16));
        assert_eq!(layouts.slot(wide).null_bit, Some(0));
        assert_eq!(layouts.slot(narrow).null_bit, Some(1));
        assert_eq!(layouts.tuple(t).byte_size, 17);
        assert!(layouts.tuple(t).sealed);
    }

    #[test]
    fn non_materialized_slots_take_no_space() {
        let mut layouts = LayoutTable::new();
        let t = layouts.new_tuple();
        let virt = layouts.add_slot(t, DataType::Int64, false, false);
        let real = layouts.add_slot(t, DataType::Int64, false, true);
        layouts.compute_mem_layout(t);

        assert_eq!(layouts.slot(virt).byte_offset, None);
        assert_eq!(layouts.slot(real).byte_offset, Some(0));
        assert_eq!(layouts.tuple(t).byte_size, 8);
    }

    #[test]
    #[should_panic(expected = "sealed")]
    fn sealed_tuple_rejects_new_slots() {
        let mut layouts = LayoutTable::new();
        let t = layouts.new_tuple();
        layouts.add_slot(t, DataType::Int64, false, true);
        layouts.compute_mem_layout(t);
        layouts.add_slot(t, DataType::Int64, false, true);
    }

    #[test]
    fn nullability_widening_is_allowed_after_sealing() {
        let mut layouts = LayoutTable::new();
        let t = layouts.new_tuple();
        let s = layouts.add_slot(t, DataType::Int64, false, true);
        layouts.compute_mem_layout(t);
        layouts.widen_tuple_nullable(t);
        assert!(layouts.slot(s).nullable);
    }
}
