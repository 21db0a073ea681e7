pub mod error;
pub mod model;
pub mod value;

pub use error::{
    CHECK_VIOLATION, CONNECTION_CODES, CONNECTION_FAILURE, DEADLOCK_DETECTED, DbError,
    FOREIGN_KEY_VIOLATION, NOT_NULL_VIOLATION, Result, SERIALIZATION_CODES, SERIALIZATION_FAILURE,
    TimeoutKind, UNIQUE_VIOLATION,
};
pub use model::{AttributeSpec, DefaultValue, EntityModel, Fields, ForeignKey, Record};
pub use value::{DataType, Value};
