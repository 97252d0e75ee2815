pub mod base;
pub mod cache;
pub mod checkpoint;
pub mod error;
pub mod interconnect;
pub mod mem;
pub mod sim;
pub mod stats;
pub mod timeq;

mod unit_tests;
