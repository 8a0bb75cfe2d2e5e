//! On-disk filesystem implementations (§4.5, §4.6).

pub mod ext2;
