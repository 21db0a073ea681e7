// ============================================================================
// Query Condition Builder
// ============================================================================

pub mod builder;
pub mod predicate;

pub use builder::{
    DEFAULT_MAX_PAGE_SIZE, DEFAULT_ORGANIZATION_FIELD, DEFAULT_USER_FIELD, QueryConditionBuilder,
};
pub use predicate::{
    Association, AssociationKind, Direction, OrderBy, Pagination, Predicate, QueryDescriptor,
};
