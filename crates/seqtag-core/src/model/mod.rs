pub mod head;
pub mod snapshot;

pub use head::{TaggerHead, TaggerKind};
pub use snapshot::CrfSnapshot;
