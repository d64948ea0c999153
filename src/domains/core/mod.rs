pub mod backend;
pub mod field;
pub mod relation;
pub mod row;

pub use backend::{BackendGateway, FilterOperation, Query, QueryFilter, QuerySort, QuerySpec, SortDirection};
pub use field::{format_timestamp, parse_timestamp, FieldKind, FieldSchema, FieldValue};
pub use relation::{
    RelationDefinition, RelationId, RelationRegistry, CREATION_DATE, CREATOR_URI_USER, DOM_AURI,
    LAST_UPDATE_DATE, LAST_UPDATE_URI_USER, SUB_AURI, URI,
};
pub use row::PersistedRow;
