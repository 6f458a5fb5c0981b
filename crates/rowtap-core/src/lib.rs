//! Rowtap Core - dialect-independent query compilation
//!
//! This crate turns caller-supplied filter, sort, projection and format
//! parameters into a canonical, validated query specification:
//! - Field catalogs describing what a connector exposes
//! - Closed operator tables and function allowlists per dialect
//! - Filter / sort / fields compilers
//! - Result reshaping into list, dict and CSV output

pub mod catalog;
pub mod compiler;
pub mod dialect;
pub mod error;
pub mod expr;
pub mod filter;
pub mod format;
pub mod params;
pub mod sort;

pub use catalog::{Datatype, FieldCatalog, FieldDescriptor};
pub use compiler::{CompiledQuery, QueryCompiler};
pub use dialect::{Dialect, FunctionAllowlist, FunctionPolicy, NativeOperator, Operator, OperatorTable};
pub use error::{QueryError, Result};
pub use expr::{FieldRef, FuncExpr, FuncParam};
pub use filter::{FilterSpec, Operand};
pub use format::{QueryResult, ResultBody, ResultData, SelectResult};
pub use params::{OutputFormat, QueryParams, QueryProperties, RESERVED_PARAMETERS};
pub use sort::{SortDirection, SortSpec};
