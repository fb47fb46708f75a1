//! Node kinds and their constant property tables.
//!
//! The opcode set is closed: one integer enum covers the immediate value
//! tags, every operation, and the two bookkeeping tags (`Uninitialized`,
//! `Deallocated`). Per-kind properties (keyword, idempotency potential,
//! side effects, return characterisation, scope creation) are functions of
//! the tag only.

use rustc_hash::FxHashMap;
use std::sync::LazyLock;

macro_rules! node_kinds {
    ($(($variant:ident, $keyword:literal)),* $(,)?) => {
        /// Tag of an evaluable node: immediate value kinds, the full opcode
        /// set, and bookkeeping tags.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum NodeKind {
            $($variant),*
        }

        impl NodeKind {
            /// Every kind, in declaration order.
            pub const ALL: &'static [NodeKind] = &[$(NodeKind::$variant),*];

            /// Keyword used in the canonical text form.
            pub const fn keyword(self) -> &'static str {
                match self {
                    $(NodeKind::$variant => $keyword),*
                }
            }
        }
    };
}

node_kinds! {
    // system and defaults
    (System, "system"),
    (GetDefaults, "get_defaults"),

    // parsing
    (Parse, "parse"),
    (Unparse, "unparse"),

    // control flow
    (If, "if"),
    (Sequence, "seq"),
    (Parallel, "parallel"),
    (Lambda, "lambda"),
    (Conclude, "conclude"),
    (Return, "return"),
    (Call, "call"),
    (CallSandboxed, "call_sandboxed"),
    (While, "while"),

    // definitions
    (Let, "let"),
    (Declare, "declare"),
    (Assign, "assign"),
    (Accum, "accum"),

    // retrieval
    (Retrieve, "retrieve"),
    (Get, "get"),
    (Set, "set"),
    (Replace, "replace"),

    // stack and interpreter state
    (Target, "target"),
    (CurrentIndex, "current_index"),
    (CurrentValue, "current_value"),
    (PreviousResult, "previous_result"),
    (OpcodeStack, "opcode_stack"),
    (Stack, "stack"),
    (Args, "args"),

    // randomness and time
    (Rand, "rand"),
    (GetRandSeed, "get_rand_seed"),
    (SetRandSeed, "set_rand_seed"),
    (SystemTime, "system_time"),

    // arithmetic
    (Add, "+"),
    (Subtract, "-"),
    (Multiply, "*"),
    (Divide, "/"),
    (Modulus, "mod"),
    (GetDigits, "get_digits"),
    (SetDigits, "set_digits"),
    (Floor, "floor"),
    (Ceiling, "ceil"),
    (Round, "round"),
    (Exponent, "exp"),
    (Log, "log"),
    (Sin, "sin"),
    (Asin, "asin"),
    (Cos, "cos"),
    (Acos, "acos"),
    (Tan, "tan"),
    (Atan, "atan"),
    (Sinh, "sinh"),
    (Asinh, "asinh"),
    (Cosh, "cosh"),
    (Acosh, "acosh"),
    (Tanh, "tanh"),
    (Atanh, "atanh"),
    (Erf, "erf"),
    (Tgamma, "tgamma"),
    (Lgamma, "lgamma"),
    (Sqrt, "sqrt"),
    (Pow, "pow"),
    (Abs, "abs"),
    (Max, "max"),
    (Min, "min"),
    (IndexMax, "index_max"),
    (IndexMin, "index_min"),
    (DotProduct, "dot_product"),
    (GeneralizedDistance, "generalized_distance"),
    (Entropy, "entropy"),

    // list access
    (First, "first"),
    (Tail, "tail"),
    (Last, "last"),
    (Trunc, "trunc"),
    (Append, "append"),
    (Size, "size"),
    (Range, "range"),

    // transformation
    (Rewrite, "rewrite"),
    (Map, "map"),
    (Filter, "filter"),
    (Weave, "weave"),
    (Reduce, "reduce"),
    (Apply, "apply"),
    (Reverse, "reverse"),
    (Sort, "sort"),

    // associative access
    (Indices, "indices"),
    (Values, "values"),
    (ContainsIndex, "contains_index"),
    (ContainsValue, "contains_value"),
    (Remove, "remove"),
    (Keep, "keep"),
    (Associate, "associate"),
    (Zip, "zip"),
    (Unzip, "unzip"),

    // logic
    (And, "and"),
    (Or, "or"),
    (Xor, "xor"),
    (Not, "not"),

    // comparison
    (Equal, "="),
    (Nequal, "!="),
    (Less, "<"),
    (Lequal, "<="),
    (Greater, ">"),
    (Gequal, ">="),
    (TypeEquals, "~"),
    (TypeNequals, "!~"),

    // immediate value kinds
    (Null, "null"),
    (List, "list"),
    (Assoc, "assoc"),
    (Bool, "bool"),
    (Number, "number"),
    (String, "string"),
    (Symbol, "symbol"),

    // type reflection
    (GetType, "get_type"),
    (GetTypeString, "get_type_string"),
    (SetType, "set_type"),
    (Format, "format"),

    // labels, comments, concurrency
    (GetLabels, "get_labels"),
    (GetAllLabels, "get_all_labels"),
    (SetLabels, "set_labels"),
    (ZipLabels, "zip_labels"),
    (GetComments, "get_comments"),
    (SetComments, "set_comments"),
    (GetConcurrency, "get_concurrency"),
    (SetConcurrency, "set_concurrency"),
    (GetValue, "get_value"),
    (SetValue, "set_value"),

    // strings
    (Explode, "explode"),
    (Split, "split"),
    (Substr, "substr"),
    (Concat, "concat"),

    // cryptography
    (CryptoSign, "crypto_sign"),
    (CryptoSignVerify, "crypto_sign_verify"),
    (Encrypt, "encrypt"),
    (Decrypt, "decrypt"),

    // output
    (Print, "print"),

    // whole-tree operations
    (TotalSize, "total_size"),
    (Mutate, "mutate"),
    (Commonality, "commonality"),
    (EditDistance, "edit_distance"),
    (Intersect, "intersect"),
    (Union, "union"),
    (Difference, "difference"),
    (Mix, "mix"),
    (MixLabels, "mix_labels"),

    // whole-entity operations
    (TotalEntitySize, "total_entity_size"),
    (FlattenEntity, "flatten_entity"),
    (MutateEntity, "mutate_entity"),
    (CommonalityEntities, "commonality_entities"),
    (EditDistanceEntities, "edit_distance_entities"),
    (IntersectEntities, "intersect_entities"),
    (UnionEntities, "union_entities"),
    (DifferenceEntities, "difference_entities"),
    (MixEntities, "mix_entities"),

    // entity metadata
    (GetEntityComments, "get_entity_comments"),
    (RetrieveEntityRoot, "retrieve_entity_root"),
    (AssignEntityRoots, "assign_entity_roots"),
    (AccumEntityRoots, "accum_entity_roots"),
    (GetEntityRandSeed, "get_entity_rand_seed"),
    (SetEntityRandSeed, "set_entity_rand_seed"),
    (GetEntityRootPermission, "get_entity_root_permission"),
    (SetEntityRootPermission, "set_entity_root_permission"),

    // entity lifecycle
    (CreateEntities, "create_entities"),
    (CloneEntities, "clone_entities"),
    (MoveEntities, "move_entities"),
    (DestroyEntities, "destroy_entities"),
    (Load, "load"),
    (LoadEntity, "load_entity"),
    (Store, "store"),
    (StoreEntity, "store_entity"),
    (ContainsEntity, "contains_entity"),

    // entity queries; this block must stay contiguous (see is_query)
    (ContainedEntities, "contained_entities"),
    (ComputeOnContainedEntities, "compute_on_contained_entities"),
    (QuerySelect, "query_select"),
    (QuerySample, "query_sample"),
    (QueryWeightedSample, "query_weighted_sample"),
    (QueryInEntityList, "query_in_entity_list"),
    (QueryNotInEntityList, "query_not_in_entity_list"),
    (QueryCount, "query_count"),
    (QueryExists, "query_exists"),
    (QueryNotExists, "query_not_exists"),
    (QueryEquals, "query_equals"),
    (QueryNotEquals, "query_not_equals"),
    (QueryBetween, "query_between"),
    (QueryNotBetween, "query_not_between"),
    (QueryAmong, "query_among"),
    (QueryNotAmong, "query_not_among"),
    (QueryMax, "query_max"),
    (QueryMin, "query_min"),
    (QuerySum, "query_sum"),
    (QueryMode, "query_mode"),
    (QueryQuantile, "query_quantile"),
    (QueryGeneralizedMean, "query_generalized_mean"),
    (QueryMinDifference, "query_min_difference"),
    (QueryMaxDifference, "query_max_difference"),
    (QueryValueMasses, "query_value_masses"),
    (QueryGreaterOrEqualTo, "query_greater_or_equal_to"),
    (QueryLessOrEqualTo, "query_less_or_equal_to"),
    (QueryWithinGeneralizedDistance, "query_within_generalized_distance"),
    (QueryNearestGeneralizedDistance, "query_nearest_generalized_distance"),
    (ComputeEntityConvictions, "compute_entity_convictions"),
    (ComputeEntityGroupKlDivergence, "compute_entity_group_kl_divergence"),
    (ComputeEntityDistanceContributions, "compute_entity_distance_contributions"),
    (ComputeEntityKlDivergences, "compute_entity_kl_divergences"),

    // entity access
    (ContainsLabel, "contains_label"),
    (AssignToEntities, "assign_to_entities"),
    (DirectAssignToEntities, "direct_assign_to_entities"),
    (AccumToEntities, "accum_to_entities"),
    (RetrieveFromEntity, "retrieve_from_entity"),
    (DirectRetrieveFromEntity, "direct_retrieve_from_entity"),
    (CallEntity, "call_entity"),
    (CallEntityGetChanges, "call_entity_get_changes"),
    (CallContainer, "call_container"),

    // not in active memory: freed and no longer in use
    (Deallocated, "deallocated"),
    // allocated but not yet initialised
    (Uninitialized, "uninitialized"),
}

/// Characterisation of whether an opcode's result is freshly allocated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReturnValueKind {
    /// Always allocates its result.
    NewValue,
    /// Allocates the top node but may reference existing subtrees.
    PartiallyNewValue,
    /// May return either a new or an existing node depending on inputs.
    ConditionallyNewValue,
    /// Returns a node that already existed.
    ExistingValue,
    /// Always yields null.
    AlwaysNull,
}

impl NodeKind {
    /// Number of valid kinds (excludes the bookkeeping tags).
    pub const NUM_VALID: usize = NodeKind::Deallocated as usize;

    /// Immediate value tags carry a scalar payload rather than child nodes.
    #[inline]
    pub const fn is_immediate(self) -> bool {
        matches!(
            self,
            NodeKind::Null | NodeKind::Bool | NodeKind::Number | NodeKind::String | NodeKind::Symbol
        )
    }

    /// Kinds whose payload is an associative map.
    #[inline]
    pub const fn uses_assoc(self) -> bool {
        matches!(self, NodeKind::Assoc)
    }

    /// Kinds whose payload is an ordered child list.
    #[inline]
    pub const fn uses_ordered_children(self) -> bool {
        self.is_valid() && !self.is_immediate() && !self.uses_assoc()
    }

    /// False for the bookkeeping tags.
    #[inline]
    pub const fn is_valid(self) -> bool {
        (self as u8) < (NodeKind::Deallocated as u8)
    }

    /// Entity query and compute opcodes.
    #[inline]
    pub const fn is_query(self) -> bool {
        let d = self as u8;
        d >= NodeKind::ContainedEntities as u8 && d <= NodeKind::ComputeEntityKlDivergences as u8
    }

    /// True if evaluating the opcode modifies state outside its return
    /// value: assignment, RNG, I/O, entity mutation.
    pub const fn has_side_effects(self) -> bool {
        matches!(
            self,
            NodeKind::System
                | NodeKind::Call
                | NodeKind::Declare
                | NodeKind::Assign
                | NodeKind::Accum
                | NodeKind::PreviousResult
                | NodeKind::Rand
                | NodeKind::SetRandSeed
                | NodeKind::SystemTime
                | NodeKind::Print
                | NodeKind::Mutate
                | NodeKind::MutateEntity
                | NodeKind::IntersectEntities
                | NodeKind::UnionEntities
                | NodeKind::MixEntities
                | NodeKind::AssignEntityRoots
                | NodeKind::AccumEntityRoots
                | NodeKind::SetEntityRandSeed
                | NodeKind::SetEntityRootPermission
                | NodeKind::CreateEntities
                | NodeKind::CloneEntities
                | NodeKind::MoveEntities
                | NodeKind::DestroyEntities
                | NodeKind::Load
                | NodeKind::LoadEntity
                | NodeKind::Store
                | NodeKind::StoreEntity
                | NodeKind::AssignToEntities
                | NodeKind::DirectAssignToEntities
                | NodeKind::AccumToEntities
                | NodeKind::CallEntity
                | NodeKind::CallEntityGetChanges
                | NodeKind::CallContainer
        )
    }

    /// True if a node of this kind *can* be idempotent — a pure value whose
    /// evaluation has no side effect and always yields itself.
    ///
    /// Labels and non-idempotent children still veto idempotency; this is
    /// only the per-kind precondition.
    pub const fn is_potentially_idempotent(self) -> bool {
        matches!(
            self,
            NodeKind::Null
                | NodeKind::Bool
                | NodeKind::Number
                | NodeKind::String
                | NodeKind::List
                | NodeKind::Assoc
                | NodeKind::Conclude
                | NodeKind::Return
        ) || self.is_query()
    }

    /// True if evaluating this opcode pushes a new variable scope.
    pub const fn creates_scope(self) -> bool {
        matches!(
            self,
            NodeKind::Let
                | NodeKind::Declare
                | NodeKind::While
                | NodeKind::Call
                | NodeKind::CallSandboxed
                | NodeKind::CallEntity
                | NodeKind::CallEntityGetChanges
                | NodeKind::CallContainer
        )
    }

    /// How the opcode's return value relates to existing nodes.
    pub const fn return_value_kind(self) -> ReturnValueKind {
        match self {
            // pure computations always allocate
            NodeKind::System
            | NodeKind::GetDefaults
            | NodeKind::Parse
            | NodeKind::Unparse
            | NodeKind::GetRandSeed
            | NodeKind::SystemTime
            | NodeKind::Rand
            | NodeKind::Add
            | NodeKind::Subtract
            | NodeKind::Multiply
            | NodeKind::Divide
            | NodeKind::Modulus
            | NodeKind::GetDigits
            | NodeKind::SetDigits
            | NodeKind::Floor
            | NodeKind::Ceiling
            | NodeKind::Round
            | NodeKind::Exponent
            | NodeKind::Log
            | NodeKind::Sin
            | NodeKind::Asin
            | NodeKind::Cos
            | NodeKind::Acos
            | NodeKind::Tan
            | NodeKind::Atan
            | NodeKind::Sinh
            | NodeKind::Asinh
            | NodeKind::Cosh
            | NodeKind::Acosh
            | NodeKind::Tanh
            | NodeKind::Atanh
            | NodeKind::Erf
            | NodeKind::Tgamma
            | NodeKind::Lgamma
            | NodeKind::Sqrt
            | NodeKind::Pow
            | NodeKind::Abs
            | NodeKind::DotProduct
            | NodeKind::GeneralizedDistance
            | NodeKind::Entropy
            | NodeKind::Size
            | NodeKind::TotalSize
            | NodeKind::TotalEntitySize
            | NodeKind::Range
            | NodeKind::Explode
            | NodeKind::Split
            | NodeKind::Substr
            | NodeKind::Concat
            | NodeKind::Rewrite
            | NodeKind::GetType
            | NodeKind::GetTypeString
            | NodeKind::Format
            | NodeKind::GetLabels
            | NodeKind::GetAllLabels
            | NodeKind::ZipLabels
            | NodeKind::GetComments
            | NodeKind::GetConcurrency
            | NodeKind::Indices
            | NodeKind::Values
            | NodeKind::ContainsIndex
            | NodeKind::ContainsValue
            | NodeKind::Zip
            | NodeKind::Unzip
            | NodeKind::And
            | NodeKind::Or
            | NodeKind::Xor
            | NodeKind::Not
            | NodeKind::Equal
            | NodeKind::Nequal
            | NodeKind::Less
            | NodeKind::Lequal
            | NodeKind::Greater
            | NodeKind::Gequal
            | NodeKind::TypeEquals
            | NodeKind::TypeNequals
            | NodeKind::CryptoSign
            | NodeKind::CryptoSignVerify
            | NodeKind::Encrypt
            | NodeKind::Decrypt
            | NodeKind::Commonality
            | NodeKind::EditDistance
            | NodeKind::CommonalityEntities
            | NodeKind::EditDistanceEntities
            | NodeKind::GetEntityComments
            | NodeKind::GetEntityRandSeed
            | NodeKind::GetEntityRootPermission
            | NodeKind::ContainsEntity
            | NodeKind::ContainsLabel => ReturnValueKind::NewValue,

            // queries materialise fresh result structures
            _ if self.is_query() => ReturnValueKind::NewValue,

            // structural constructors allocate the top node around
            // existing children
            NodeKind::List
            | NodeKind::Assoc
            | NodeKind::Associate
            | NodeKind::Append
            | NodeKind::Map
            | NodeKind::Filter
            | NodeKind::Weave
            | NodeKind::Reverse
            | NodeKind::Sort
            | NodeKind::Remove
            | NodeKind::Keep
            | NodeKind::Intersect
            | NodeKind::Union
            | NodeKind::Difference
            | NodeKind::Mix
            | NodeKind::MixLabels
            | NodeKind::FlattenEntity => ReturnValueKind::PartiallyNewValue,

            // immediates evaluate to themselves
            NodeKind::Null
            | NodeKind::Bool
            | NodeKind::Number
            | NodeKind::String
            | NodeKind::Symbol => ReturnValueKind::ExistingValue,

            // pure accessors return what is already there
            NodeKind::Retrieve
            | NodeKind::Get
            | NodeKind::Target
            | NodeKind::CurrentIndex
            | NodeKind::CurrentValue
            | NodeKind::PreviousResult
            | NodeKind::OpcodeStack
            | NodeKind::Stack
            | NodeKind::Args
            | NodeKind::First
            | NodeKind::Tail
            | NodeKind::Last
            | NodeKind::Trunc
            | NodeKind::RetrieveEntityRoot
            | NodeKind::RetrieveFromEntity
            | NodeKind::DirectRetrieveFromEntity
            | NodeKind::GetValue => ReturnValueKind::ExistingValue,

            // writers and pure control flow yield whatever their bodies do
            NodeKind::Print
            | NodeKind::SetRandSeed
            | NodeKind::SetEntityRandSeed
            | NodeKind::SetEntityRootPermission
            | NodeKind::AssignEntityRoots
            | NodeKind::AccumEntityRoots
            | NodeKind::DestroyEntities
            | NodeKind::Store
            | NodeKind::StoreEntity => ReturnValueKind::AlwaysNull,

            _ => ReturnValueKind::ConditionallyNewValue,
        }
    }

    /// Look up a kind by its canonical keyword.
    pub fn from_keyword(keyword: &str) -> Option<NodeKind> {
        static BY_KEYWORD: LazyLock<FxHashMap<&'static str, NodeKind>> = LazyLock::new(|| {
            let mut map = FxHashMap::default();
            for &kind in NodeKind::ALL {
                if kind.is_valid() {
                    map.insert(kind.keyword(), kind);
                }
            }
            map
        });
        BY_KEYWORD.get(keyword).copied()
    }

    /// Keywords of all valid kinds, in tag order. The intern pool's static
    /// prefix is built from this.
    pub fn keywords() -> impl Iterator<Item = &'static str> {
        NodeKind::ALL
            .iter()
            .filter(|k| k.is_valid())
            .map(|k| k.keyword())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_round_trip() {
        for &kind in NodeKind::ALL {
            if kind.is_valid() {
                assert_eq!(NodeKind::from_keyword(kind.keyword()), Some(kind));
            }
        }
        assert_eq!(NodeKind::from_keyword("no_such_opcode"), None);
    }

    #[test]
    fn keywords_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for &kind in NodeKind::ALL {
            assert!(seen.insert(kind.keyword()), "duplicate keyword {:?}", kind.keyword());
        }
    }

    #[test]
    fn query_block_is_contiguous() {
        assert!(NodeKind::QuerySelect.is_query());
        assert!(NodeKind::QueryNearestGeneralizedDistance.is_query());
        assert!(NodeKind::ComputeEntityKlDivergences.is_query());
        assert!(!NodeKind::ContainsLabel.is_query());
        assert!(!NodeKind::ContainsEntity.is_query());
    }

    #[test]
    fn side_effects_veto_idempotency_potential() {
        for &kind in NodeKind::ALL {
            if kind.has_side_effects() {
                assert!(
                    !kind.is_potentially_idempotent(),
                    "{kind:?} has side effects yet claims idempotency"
                );
            }
        }
    }

    #[test]
    fn bookkeeping_tags_are_invalid() {
        assert!(!NodeKind::Deallocated.is_valid());
        assert!(!NodeKind::Uninitialized.is_valid());
        assert!(NodeKind::Null.is_valid());
        assert_eq!(NodeKind::NUM_VALID, NodeKind::Deallocated as usize);
    }

    #[test]
    fn payload_classes_partition_valid_kinds() {
        for &kind in NodeKind::ALL {
            if !kind.is_valid() {
                continue;
            }
            let classes = [
                kind.is_immediate(),
                kind.uses_assoc(),
                kind.uses_ordered_children(),
            ];
            assert_eq!(
                classes.iter().filter(|c| **c).count(),
                1,
                "{kind:?} must belong to exactly one payload class"
            );
        }
    }
}
