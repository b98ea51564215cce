//! Core types and traits for the rowgraph persistence engine.
//!
//! This crate provides the foundational abstractions the query and session
//! layers build on:
//!
//! - `ModelRegistry` mapping metadata (entities, attributes, relationships)
//! - `ObjectId` / `DomainObject` runtime object identity and state
//! - `Snapshot` committed-row images with unresolved lazy slots
//! - `DbClient` / `KeyGenerator` synchronous database collaborator traits
//! - the shared error taxonomy

pub mod client;
pub mod entity;
pub mod error;
pub mod object;
pub mod object_id;
pub mod row;
pub mod snapshot;
pub mod value;

pub use client::{
    CounterKeyGenerator, DbClient, DbTransaction, KeyGenerator, RowCursor, fetch_all,
};
pub use entity::{
    Attribute, Cardinality, DeleteRule, Entity, Inheritance, ModelRegistry, Relationship,
};
pub use error::{
    CommitError, CommitErrorKind, Error, FaultError, FaultErrorKind, QueryError, QueryErrorKind,
    Result, TypeError, ValidationError, ValidationFailure,
};
pub use object::{DomainObject, ObjectHandle, ObjectState, RelationshipHolder};
pub use object_id::ObjectId;
pub use row::{ColumnInfo, Row};
pub use snapshot::{AttributeValue, Snapshot};
pub use value::Value;
