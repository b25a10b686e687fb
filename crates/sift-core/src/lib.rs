pub mod error;
pub mod intern;
pub mod location;
pub mod native;
pub mod value;

pub use error::SiftError;
pub use intern::{intern, resolve, with_resolved};
pub use lasso::Spur;
pub use location::{Location, SourceFile};
pub use native::{NativeFn, NativeFnInner};
pub use value::{kind_of, Value, ValueKind};
