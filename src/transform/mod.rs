//! Data transformation: order-preserving merge of artifact triples.

mod merge;

pub use merge::{MergeReducer, TableAppender, TextTableAppender, UnitMerge};
