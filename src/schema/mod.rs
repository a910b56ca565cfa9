//! Schema snapshot: model, catalog introspection and the disk-backed cache.

pub mod cache;
pub mod introspect;
pub mod model;

pub use cache::{RefreshHandle, RefreshStatus, SchemaCache, SnapshotOptions};
pub use introspect::{introspect, PgSchemaSource, RawColumn, SchemaSource, TableDetails};
pub use model::{
    Column, ExtensionInfo, ForeignKey, ForeignKeyRef, IndexInfo, JoinStep, RelationshipGraph,
    SchemaSnapshot, Table,
};
