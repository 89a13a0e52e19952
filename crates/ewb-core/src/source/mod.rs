//! Data sources: the opener seam and the memoizing resolver.

pub mod opener;
pub mod resolver;

pub use opener::{open_error, DatasetOpener, OpenedSource, Source};
pub use resolver::{SourceKey, SourceResolver};
