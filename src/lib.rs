pub mod analytics;
pub mod audit;
pub mod breaker;
pub mod broadcast;
pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod forecast;
pub mod gateway;
pub mod http;
pub mod ingest;
pub mod queue_depth;
pub mod reading;
pub mod recovery;
pub mod scheduler;
pub mod store;
pub mod system;

#[cfg(test)]
pub mod test_support;
