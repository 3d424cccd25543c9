pub mod crawler;
pub mod destination;
pub mod latency;
pub mod listing;
pub mod pipeline;
pub mod source_client;
