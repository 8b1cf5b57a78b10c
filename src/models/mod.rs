//! Core data model: documents, extracted values, schemas.

mod document;
mod schema;
mod value;

pub use document::{
    Document, DocumentStatus, NewDocument, PageStatus, ProcessingMeta, StatusSnapshot,
};
pub use schema::{FieldSpec, FieldType, Schema, SchemaChoice};
pub use value::Value;
