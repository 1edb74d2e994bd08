pub mod config;
pub mod db;
pub mod poold;

#[cfg(any(test, feature = "fuzztesting"))]
pub mod fuzz;
