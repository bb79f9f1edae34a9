//! On-disk formats: the length-prefixed write log and the record encoding
//! layered on top of it.

pub mod wire;
pub mod writelog;
