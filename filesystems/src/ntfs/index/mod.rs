// NTFS indexes
// Directory ($I30) and view indexes share one B+tree implementation; the collation rule
// in $INDEX_ROOT decides how keys are ordered.

pub mod collation;
pub mod index_data;
pub mod index_entry;
pub mod index_record;

pub use collation::CollationRule;
pub use index_data::IndexData;
pub use index_entry::IndexEntry;
pub use index_record::{IndexRecord, IndexRoot};
