pub mod label;
pub mod vocabulary;

pub use label::{Prefix, TagLabel};
pub use vocabulary::{DEFAULT_PAD, TagVocabulary};

/// Dense tag id in `[0, K)`.
pub type TagId = usize;
