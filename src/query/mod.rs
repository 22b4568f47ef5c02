//! Query building blocks: expressions, predicates, projections, and
//! document mutation operations

mod expression;
mod ops;
mod predicate;
mod projection;

pub use expression::PathExpression;
pub use ops::{DeleteDocument, InsertDocument, InsertOp, SetFields, UnsetFields, UpdateOp};
pub use predicate::{Predicate, ValueTest};
pub use projection::{project_document, Projection, SortOrder, SortSpec};
