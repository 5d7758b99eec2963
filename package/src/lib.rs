//! Package loading, verification, and serialization.
//!
//! A package is a sectioned random-access binary (the CSWP format)
//! holding functions, types, and strings. Opening a package maps the
//! file and checks the section table; functions materialize lazily and
//! are verified on demand. The verifier abstractly interprets each
//! function body and constructs the safepoint tables the collector
//! relies on.

mod function;
mod package;
mod roots;
mod ty;
mod validate;

pub use function::{Function, Safepoints};
pub use package::{FunctionDef, Package, PackageError, MAGIC};
pub use roots::Roots;
pub use ty::{Type, TypeKind};
pub use validate::{verify, CalleeResolver, ValidateError};
