pub mod controller;
pub mod locked;
pub mod physical;
pub mod range;
pub mod request;
