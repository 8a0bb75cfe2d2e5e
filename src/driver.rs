//! Device drivers (§4.4, §4.8).

pub mod ahci;
pub mod serial;
