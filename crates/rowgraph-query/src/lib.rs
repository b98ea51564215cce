//! Query model and SQL translation for the rowgraph persistence engine.
//!
//! Queries are declarative: an entity name, a qualifier expression tree over
//! entity paths, orderings, and a prefetch tree. The [`QueryTranslator`]
//! compiles them into a primary SELECT plus a plan for secondary SELECTs,
//! consulting the mapping registry for tables, columns, and join conditions.

pub mod cache;
pub mod expr;
pub mod ordering;
pub mod prefetch;
pub mod query;
pub mod translator;

pub use cache::{TranslationCache, cache_key};
pub use expr::{BinaryOp, Dialect, Expr, PathResolver};
pub use ordering::{Ordering, SortDirection};
pub use prefetch::{PrefetchNode, PrefetchSemantics, PrefetchTree};
pub use query::{AttributeFaultQuery, ObjectQuery, SqlStatement};
pub use translator::{
    LABEL_SEPARATOR, QueryTranslator, ROOT_ALIAS, ResultSegment, SecondaryFetch, SelectTranslation,
};
