pub mod mbr;

pub use mbr::{Mbr, MbrPartition};
