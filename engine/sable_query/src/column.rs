//! Per-label column index over a container's children.
//!
//! One column holds every child entity's value at one label, organised per
//! value type: numbers in a sorted vector of value entries (NaN bucketed
//! separately), strings in a hash map ranged by natural order, code grouped
//! by deep size. Each value entry carries the sorted set of child indices
//! holding that value.

use crate::value::{ColumnValue, ValueType};
use rustc_hash::FxHashMap;
use sable_intern::{natural_compare, SharedPool, StringId};
use sable_sets::{BitSet, EfficientSet, SortedSet};
use std::cmp::Ordering;

/// All child indices sharing one numeric value.
#[derive(Clone, Debug)]
pub struct ValueEntry {
    /// The value; never NaN here.
    pub value: f64,
    /// Children holding it, ascending.
    pub indices: SortedSet,
}

/// Storage for per-entity numbers, direct or interned.
///
/// When few distinct values cover many entities the column interns each
/// distinct number into a small index and stores one index per entity slot;
/// the logical view is unchanged. Index 0 is reserved for "no value".
enum NumberSlots {
    Direct(FxHashMap<usize, f64>),
    Interned {
        values: Vec<f64>,
        slots: FxHashMap<usize, u32>,
    },
}

impl NumberSlots {
    fn get(&self, entity_index: usize) -> Option<f64> {
        match self {
            NumberSlots::Direct(map) => map.get(&entity_index).copied(),
            NumberSlots::Interned { values, slots } => slots
                .get(&entity_index)
                .and_then(|&intern_index| values.get(intern_index as usize))
                .copied(),
        }
    }

    fn insert(&mut self, entity_index: usize, value: f64) {
        match self {
            NumberSlots::Direct(map) => {
                map.insert(entity_index, value);
            }
            NumberSlots::Interned { values, slots } => {
                let position = values
                    .iter()
                    .position(|&v| v.to_bits() == value.to_bits())
                    .unwrap_or_else(|| {
                        values.push(value);
                        values.len() - 1
                    });
                slots.insert(entity_index, position as u32);
            }
        }
    }

    fn remove(&mut self, entity_index: usize) {
        match self {
            NumberSlots::Direct(map) => {
                map.remove(&entity_index);
            }
            NumberSlots::Interned { slots, .. } => {
                slots.remove(&entity_index);
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            NumberSlots::Direct(map) => map.len(),
            NumberSlots::Interned { slots, .. } => slots.len(),
        }
    }
}

/// Storage for per-entity string IDs, direct or interned.
///
/// Same switchover as [`NumberSlots`]: when few distinct strings cover many
/// entities the column stores one small intern index per entity slot and a
/// reverse table from intern index to string ID. Index 0 is reserved for
/// "no value".
enum StringSlots {
    Direct(FxHashMap<usize, StringId>),
    Interned {
        values: Vec<StringId>,
        slots: FxHashMap<usize, u32>,
    },
}

impl StringSlots {
    fn get(&self, entity_index: usize) -> Option<StringId> {
        match self {
            StringSlots::Direct(map) => map.get(&entity_index).copied(),
            StringSlots::Interned { values, slots } => slots
                .get(&entity_index)
                .and_then(|&intern_index| values.get(intern_index as usize))
                .copied()
                .filter(|id| id.is_string()),
        }
    }

    fn insert(&mut self, entity_index: usize, value: StringId) {
        match self {
            StringSlots::Direct(map) => {
                map.insert(entity_index, value);
            }
            StringSlots::Interned { values, slots } => {
                let position = values
                    .iter()
                    .position(|&v| v == value)
                    .unwrap_or_else(|| {
                        values.push(value);
                        values.len() - 1
                    });
                slots.insert(entity_index, position as u32);
            }
        }
    }

    fn remove(&mut self, entity_index: usize) {
        match self {
            StringSlots::Direct(map) => {
                map.remove(&entity_index);
            }
            StringSlots::Interned { slots, .. } => {
                slots.remove(&entity_index);
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            StringSlots::Direct(map) => map.len(),
            StringSlots::Interned { slots, .. } => slots.len(),
        }
    }
}

/// Index for one label across an entity's children.
pub struct ColumnData {
    label: StringId,
    pool: SharedPool,

    /// Distinct finite (or infinite, but not NaN) numbers, ascending.
    sorted_numbers: Vec<ValueEntry>,
    number_slots: NumberSlots,
    /// Children whose value is a number, NaN included.
    pub number_indices: EfficientSet,
    /// Children whose value is NaN.
    pub nan_indices: EfficientSet,

    string_values: FxHashMap<StringId, SortedSet>,
    string_slots: StringSlots,
    /// Children whose value is a string.
    pub string_indices: EfficientSet,

    /// Code values bucketed by deep node size.
    code_by_size: FxHashMap<usize, SortedSet>,
    /// Children whose value is structured code.
    pub code_indices: EfficientSet,

    /// Children whose value is null.
    pub null_indices: EfficientSet,

    longest_string: Option<(usize, usize)>, // (char count, entity index)
    largest_code: Option<(usize, usize)>,   // (deep size, entity index)
}

impl ColumnData {
    /// Empty column for `label`.
    pub fn new(label: StringId, pool: SharedPool) -> Self {
        ColumnData {
            label,
            pool,
            sorted_numbers: Vec::new(),
            number_slots: NumberSlots::Direct(FxHashMap::default()),
            number_indices: EfficientSet::new(),
            nan_indices: EfficientSet::new(),
            string_values: FxHashMap::default(),
            string_slots: StringSlots::Direct(FxHashMap::default()),
            string_indices: EfficientSet::new(),
            code_by_size: FxHashMap::default(),
            code_indices: EfficientSet::new(),
            null_indices: EfficientSet::new(),
            longest_string: None,
            largest_code: None,
        }
    }

    /// The label this column indexes.
    #[inline]
    pub fn label(&self) -> StringId {
        self.label
    }

    /// True while the interned number representation is active.
    pub fn numbers_interned(&self) -> bool {
        matches!(self.number_slots, NumberSlots::Interned { .. })
    }

    /// True while the interned string representation is active.
    pub fn strings_interned(&self) -> bool {
        matches!(self.string_slots, StringSlots::Interned { .. })
    }

    // -- Mutation --

    /// Record `value` for `entity_index`.
    pub fn insert(&mut self, entity_index: usize, value: &ColumnValue) {
        match *value {
            ColumnValue::NotExist => {}
            ColumnValue::Null => {
                self.null_indices.insert(entity_index);
            }
            ColumnValue::Number(n) => {
                self.number_indices.insert(entity_index);
                if n.is_nan() {
                    self.nan_indices.insert(entity_index);
                } else {
                    match self.find_number(n) {
                        Ok(position) => {
                            self.sorted_numbers[position].indices.insert(entity_index);
                        }
                        Err(position) => {
                            let mut indices = SortedSet::new();
                            indices.insert(entity_index);
                            self.sorted_numbers
                                .insert(position, ValueEntry { value: n, indices });
                        }
                    }
                }
                self.number_slots.insert(entity_index, n);
                self.rebalance_number_storage();
            }
            ColumnValue::String(id) => {
                self.string_indices.insert(entity_index);
                self.string_values.entry(id).or_default().insert(entity_index);
                self.string_slots.insert(entity_index, id);
                self.rebalance_string_storage();
                let chars = self.pool.with_str(id, |s| s.chars().count());
                if self.longest_string.is_none_or_below(chars) {
                    self.longest_string = Some((chars, entity_index));
                }
            }
            ColumnValue::Code { size, .. } => {
                self.code_indices.insert(entity_index);
                self.code_by_size.entry(size).or_default().insert(entity_index);
                if self.largest_code.is_none_or_below(size) {
                    self.largest_code = Some((size, entity_index));
                }
            }
        }
    }

    /// Forget `value` for `entity_index`.
    pub fn erase(&mut self, entity_index: usize, value: &ColumnValue) {
        match *value {
            ColumnValue::NotExist => {}
            ColumnValue::Null => {
                self.null_indices.erase(entity_index);
            }
            ColumnValue::Number(n) => {
                self.number_indices.erase(entity_index);
                if n.is_nan() {
                    self.nan_indices.erase(entity_index);
                } else if let Ok(position) = self.find_number(n) {
                    let entry = &mut self.sorted_numbers[position];
                    entry.indices.erase(entity_index);
                    if entry.indices.is_empty() {
                        self.sorted_numbers.remove(position);
                    }
                }
                self.number_slots.remove(entity_index);
                self.rebalance_number_storage();
            }
            ColumnValue::String(id) => {
                self.string_indices.erase(entity_index);
                if let Some(indices) = self.string_values.get_mut(&id) {
                    indices.erase(entity_index);
                    if indices.is_empty() {
                        self.string_values.remove(&id);
                    }
                }
                self.string_slots.remove(entity_index);
                self.rebalance_string_storage();
                if self.longest_string.is_some_and(|(_, holder)| holder == entity_index) {
                    self.recompute_longest_string();
                }
            }
            ColumnValue::Code { size, .. } => {
                self.code_indices.erase(entity_index);
                if let Some(indices) = self.code_by_size.get_mut(&size) {
                    indices.erase(entity_index);
                    if indices.is_empty() {
                        self.code_by_size.remove(&size);
                    }
                }
                if self.largest_code.is_some_and(|(_, holder)| holder == entity_index) {
                    self.recompute_largest_code();
                }
            }
        }
    }

    /// Replace the value for `entity_index`.
    pub fn update(&mut self, entity_index: usize, old: &ColumnValue, new: &ColumnValue) {
        self.erase(entity_index, old);
        self.insert(entity_index, new);
    }

    /// Renumber an entity slot: the child at slot `from` now occupies `to`.
    pub fn reassign_slot(&mut self, from: usize, to: usize, value: &ColumnValue) {
        self.erase(from, value);
        self.insert(to, value);
    }

    fn find_number(&self, value: f64) -> Result<usize, usize> {
        self.sorted_numbers.binary_search_by(|entry| {
            entry.value.partial_cmp(&value).unwrap_or(Ordering::Less)
        })
    }

    /// Switch between direct and interned number storage when the
    /// unique-value count crosses √n, with slack so single insertions do
    /// not flip it back and forth.
    fn rebalance_number_storage(&mut self) {
        let total = self.number_slots.len();
        let unique = self.sorted_numbers.len() + usize::from(!self.nan_indices.is_empty());
        if total < 16 {
            return;
        }
        let root = (total as f64).sqrt();
        match &self.number_slots {
            NumberSlots::Direct(map) => {
                if (unique as f64) * 2.0 < root {
                    let mut values = vec![f64::NAN];
                    let mut slots = FxHashMap::default();
                    for (&entity_index, &value) in map {
                        let position = values
                            .iter()
                            .position(|v: &f64| v.to_bits() == value.to_bits())
                            .unwrap_or_else(|| {
                                values.push(value);
                                values.len() - 1
                            });
                        slots.insert(entity_index, position as u32);
                    }
                    tracing::debug!(unique, total, "interning column numbers");
                    self.number_slots = NumberSlots::Interned { values, slots };
                }
            }
            NumberSlots::Interned { slots, values } => {
                if (unique as f64) > root {
                    let mut map = FxHashMap::default();
                    for (&entity_index, &intern_index) in slots {
                        if let Some(&value) = values.get(intern_index as usize) {
                            map.insert(entity_index, value);
                        }
                    }
                    tracing::debug!(unique, total, "un-interning column numbers");
                    self.number_slots = NumberSlots::Direct(map);
                }
            }
        }
    }

    /// Switch between direct and interned string storage when the distinct
    /// count crosses √n, with the same slack as the number switchover.
    fn rebalance_string_storage(&mut self) {
        let total = self.string_slots.len();
        let unique = self.string_values.len();
        if total < 16 {
            return;
        }
        let root = (total as f64).sqrt();
        match &self.string_slots {
            StringSlots::Direct(map) => {
                if (unique as f64) * 2.0 < root {
                    let mut values = vec![StringId::NOT_A_STRING];
                    let mut slots = FxHashMap::default();
                    for (&entity_index, &value) in map {
                        let position = values
                            .iter()
                            .position(|&v| v == value)
                            .unwrap_or_else(|| {
                                values.push(value);
                                values.len() - 1
                            });
                        slots.insert(entity_index, position as u32);
                    }
                    tracing::debug!(unique, total, "interning column strings");
                    self.string_slots = StringSlots::Interned { values, slots };
                }
            }
            StringSlots::Interned { slots, values } => {
                if (unique as f64) > root {
                    let mut map = FxHashMap::default();
                    for (&entity_index, &intern_index) in slots {
                        if let Some(&value) = values.get(intern_index as usize) {
                            map.insert(entity_index, value);
                        }
                    }
                    tracing::debug!(unique, total, "un-interning column strings");
                    self.string_slots = StringSlots::Direct(map);
                }
            }
        }
    }

    fn recompute_longest_string(&mut self) {
        self.longest_string = None;
        let entries: Vec<(StringId, usize)> = self
            .string_values
            .iter()
            .filter_map(|(&id, indices)| indices.nth(0).map(|holder| (id, holder)))
            .collect();
        for (id, holder) in entries {
            let chars = self.pool.with_str(id, |s| s.chars().count());
            if self.longest_string.is_none_or_below(chars) {
                self.longest_string = Some((chars, holder));
            }
        }
    }

    fn recompute_largest_code(&mut self) {
        self.largest_code = self
            .code_by_size
            .iter()
            .filter_map(|(&size, indices)| indices.nth(0).map(|holder| (size, holder)))
            .max_by_key(|&(size, _)| size);
    }

    // -- Reads --

    /// The logical numeric value stored for `entity_index`, regardless of
    /// the interning state.
    pub fn number_value(&self, entity_index: usize) -> Option<f64> {
        self.number_slots.get(entity_index)
    }

    /// The logical string value stored for `entity_index`, regardless of
    /// the interning state.
    pub fn string_value(&self, entity_index: usize) -> Option<StringId> {
        self.string_slots.get(entity_index)
    }

    /// Distinct numeric values ascending, with their holders.
    pub fn number_entries(&self) -> &[ValueEntry] {
        &self.sorted_numbers
    }

    /// Distinct string values with their holders.
    pub fn string_entries(&self) -> impl Iterator<Item = (StringId, &SortedSet)> {
        self.string_values.iter().map(|(&id, indices)| (id, indices))
    }

    /// Children whose code value has exactly `size` nodes.
    pub fn code_with_size(&self, size: usize) -> Option<&SortedSet> {
        self.code_by_size.get(&size)
    }

    /// Character count of the longest stored string.
    pub fn longest_string_length(&self) -> usize {
        self.longest_string.map_or(0, |(chars, _)| chars)
    }

    /// Deep size of the largest stored code value.
    pub fn largest_code_size(&self) -> usize {
        self.largest_code.map_or(0, |(size, _)| size)
    }

    /// Union into `out` every child whose value equals `value`.
    pub fn find_equal(&self, value: &ColumnValue, out: &mut BitSet) {
        match *value {
            ColumnValue::NotExist => {}
            ColumnValue::Null => self.null_indices.union_into_bits(out),
            ColumnValue::Number(n) => {
                if n.is_nan() {
                    self.nan_indices.union_into_bits(out);
                } else if let Ok(position) = self.find_number(n) {
                    out.insert_batch(self.sorted_numbers[position].indices.iter());
                }
            }
            ColumnValue::String(id) => {
                if let Some(indices) = self.string_values.get(&id) {
                    out.insert_batch(indices.iter());
                }
            }
            ColumnValue::Code { size, .. } => {
                // Size bucket only; the caller narrows by structural
                // equality against the actual entities.
                if let Some(indices) = self.code_by_size.get(&size) {
                    out.insert_batch(indices.iter());
                }
            }
        }
    }

    /// Union into `out` every child whose value lies in `[low, high]`
    /// (`between = true`) or outside it (`between = false`).
    ///
    /// A NaN endpoint widens its side to infinity and admits the NaN bucket;
    /// `[NaN, NaN]` selects exactly the NaN bucket. String endpoints compare
    /// in natural order; the not-a-string sentinel is unbounded.
    pub fn find_within_range(
        &self,
        low: &ColumnValue,
        high: &ColumnValue,
        between: bool,
        out: &mut BitSet,
    ) {
        match (low, high) {
            (ColumnValue::Number(low), ColumnValue::Number(high)) => {
                self.number_range(*low, *high, between, out);
            }
            (ColumnValue::String(low), ColumnValue::String(high)) => {
                self.string_range(*low, *high, between, out);
            }
            _ => {}
        }
    }

    fn number_range(&self, mut low: f64, mut high: f64, between: bool, out: &mut BitSet) {
        if self.number_indices.is_empty() {
            return;
        }

        if low.is_nan() || high.is_nan() {
            if low.is_nan() && high.is_nan() {
                if between {
                    self.nan_indices.union_into_bits(out);
                } else {
                    self.number_indices.union_into_bits(out);
                    let mut nans = BitSet::new();
                    self.nan_indices.union_into_bits(&mut nans);
                    out.subtract(&nans);
                }
                return;
            }
            // One NaN endpoint: widen that side and admit the NaN bucket.
            if between {
                self.nan_indices.union_into_bits(out);
            }
            if low.is_nan() {
                low = f64::NEG_INFINITY;
            } else {
                high = f64::INFINITY;
            }
        }

        let start = self
            .sorted_numbers
            .partition_point(|entry| entry.value < low);
        let end = self
            .sorted_numbers
            .partition_point(|entry| entry.value <= high);

        if between {
            for entry in &self.sorted_numbers[start..end] {
                out.insert_batch(entry.indices.iter());
            }
        } else {
            self.nan_indices.union_into_bits(out);
            for entry in &self.sorted_numbers[..start] {
                out.insert_batch(entry.indices.iter());
            }
            for entry in &self.sorted_numbers[end..] {
                out.insert_batch(entry.indices.iter());
            }
        }
    }

    fn string_range(&self, low: StringId, high: StringId, between: bool, out: &mut BitSet) {
        if self.string_values.is_empty() {
            return;
        }
        let low_text = (low != StringId::NOT_A_STRING).then(|| self.pool.get(low));
        let high_text = (high != StringId::NOT_A_STRING).then(|| self.pool.get(high));

        for (&id, indices) in &self.string_values {
            let text = self.pool.get(id);
            let above_low = low_text
                .as_deref()
                .map_or(true, |lo| natural_compare(lo, &text) != Ordering::Greater);
            let below_high = high_text
                .as_deref()
                .map_or(true, |hi| natural_compare(&text, hi) != Ordering::Greater);
            let inside = above_low && below_high;
            if inside == between {
                out.insert_batch(indices.iter());
            }
        }
    }

    /// Fill `out` with the `count` children holding the smallest
    /// (`want_max = false`) or largest values, optionally restricted to
    /// `consider`.
    pub fn find_min_max(
        &self,
        value_type: ValueType,
        count: usize,
        want_max: bool,
        consider: Option<&BitSet>,
        out: &mut BitSet,
    ) {
        let mut taken = 0usize;
        match value_type {
            ValueType::Number => {
                let entries: Box<dyn Iterator<Item = &ValueEntry> + '_> = if want_max {
                    Box::new(self.sorted_numbers.iter().rev())
                } else {
                    Box::new(self.sorted_numbers.iter())
                };
                for entry in entries {
                    for index in entry.indices.iter() {
                        if consider.is_some_and(|set| !set.contains(index)) {
                            continue;
                        }
                        out.insert(index);
                        taken += 1;
                        if taken >= count {
                            return;
                        }
                    }
                }
            }
            ValueType::String => {
                let mut ids: Vec<StringId> = self.string_values.keys().copied().collect();
                ids.sort_by(|a, b| {
                    let text_a = self.pool.get(*a);
                    let text_b = self.pool.get(*b);
                    natural_compare(&text_a, &text_b)
                });
                if want_max {
                    ids.reverse();
                }
                for id in ids {
                    let Some(indices) = self.string_values.get(&id) else {
                        continue;
                    };
                    for index in indices.iter() {
                        if consider.is_some_and(|set| !set.contains(index)) {
                            continue;
                        }
                        out.insert(index);
                        taken += 1;
                        if taken >= count {
                            return;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Largest possible distance from `value` to any stored value, from the
    /// tracked extremes in O(1).
    pub fn max_difference_from(&self, value: &ColumnValue) -> f64 {
        match *value {
            ColumnValue::Number(n) => {
                let Some(first) = self.sorted_numbers.first() else {
                    return 0.0;
                };
                let Some(last) = self.sorted_numbers.last() else {
                    return 0.0;
                };
                if n.is_nan() {
                    return last.value - first.value;
                }
                (last.value - n).max(n - first.value).max(0.0)
            }
            ColumnValue::String(id) => {
                let own = self.pool.with_str(id, |s| s.chars().count());
                (self.longest_string_length() + own) as f64
            }
            ColumnValue::Code { size, .. } => (self.largest_code_size() + size) as f64,
            ColumnValue::Null | ColumnValue::NotExist => f64::INFINITY,
        }
    }
}

trait TrackedMax {
    fn is_none_or_below(&self, candidate: usize) -> bool;
}

impl TrackedMax for Option<(usize, usize)> {
    fn is_none_or_below(&self, candidate: usize) -> bool {
        self.map_or(true, |(current, _)| current < candidate)
    }
}
