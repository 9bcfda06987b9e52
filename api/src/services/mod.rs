pub mod cache;
pub mod client;
pub mod enrichment;
pub mod scheduler;
