//! Rowgraph - object graph persistence over plain SQL clients.
//!
//! Rowgraph keeps an identity-mapped object graph per session, a shared
//! versioned snapshot cache per domain, and compiles declarative object
//! queries (with joint and disjoint prefetching) down to parameterized SQL.
//! Commits are planned as FK-ordered batches and run inside one client
//! transaction.
//!
//! # Quick Start
//!
//! ```ignore
//! use rowgraph::prelude::*;
//!
//! let mut registry = ModelRegistry::new();
//! registry.register(
//!     Entity::new("Artist", "artist")
//!         .attribute(Attribute::new("id").primary_key().generated())
//!         .attribute(Attribute::new("name"))
//!         .relationship(
//!             Relationship::to_many("paintings", "Painting", "artist_id", "id")
//!                 .delete_rule(DeleteRule::Cascade)
//!                 .reverse("artist"),
//!         ),
//! );
//!
//! let domain = Arc::new(Domain::builder(registry, client).build());
//! let mut session = Session::new(&domain);
//!
//! let artist = session.create_object("Artist")?;
//! session.set_property(&artist, "name", Value::Text("Dali".into()))?;
//! session.commit_changes()?;
//!
//! let with_paintings = session.perform(
//!     &ObjectQuery::new("Artist")
//!         .filter(Expr::path("name").eq("Dali"))
//!         .prefetch("paintings", PrefetchSemantics::Disjoint),
//! )?;
//! ```

pub use rowgraph_core::{
    Attribute, AttributeValue, Cardinality, ColumnInfo, CommitError, CommitErrorKind,
    CounterKeyGenerator, DbClient, DbTransaction, DeleteRule, DomainObject, Entity, Error,
    FaultError, FaultErrorKind, Inheritance, KeyGenerator, ModelRegistry, ObjectHandle, ObjectId,
    ObjectState, QueryError, QueryErrorKind, Relationship, RelationshipHolder, Result, Row,
    RowCursor, Snapshot, TypeError, ValidationError, ValidationFailure, Value, fetch_all,
};
pub use rowgraph_query::{
    AttributeFaultQuery, BinaryOp, Dialect, Expr, ObjectQuery, Ordering, PrefetchSemantics,
    PrefetchTree, QueryTranslator, SortDirection, SqlStatement,
};
pub use rowgraph_session::{
    CacheChange, CacheListener, CommitPlanner, Diff, Domain, DomainBuilder, GraphChange,
    GraphChangeHandler, ObjectGraphStore, ObjectResolver, RowCache, Session, Validator,
    read_object, write_object,
};

/// Everything a typical embedding needs.
pub mod prelude {
    pub use crate::{
        Attribute, DbClient, DeleteRule, Dialect, Domain, Entity, Error, Expr, ModelRegistry,
        ObjectHandle, ObjectId, ObjectQuery, ObjectState, Ordering, PrefetchSemantics,
        Relationship, RelationshipHolder, Result, Session, Value, read_object, write_object,
    };
}
