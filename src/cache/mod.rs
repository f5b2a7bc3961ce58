//! On-disk cache format: spans, stripes, directories, docs, the header
//! heap, alternate lists, and object enumeration (C3–C9).

pub mod alternate;
pub mod directory;
pub mod doc;
pub mod heap;
pub mod iterate;
pub mod span;
pub mod stripe;

pub use alternate::Alternate;
pub use directory::{DirEntry, Directory};
pub use doc::Doc;
pub use span::Span;
pub use stripe::Stripe;
