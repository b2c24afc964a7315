pub mod capture;
pub mod classifier;
pub mod config;
pub mod identity;
pub mod metrics;
pub mod pipeline;
pub mod record;
pub mod sink;
pub mod table;
pub mod window;
