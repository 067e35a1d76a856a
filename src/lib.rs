pub mod api;
pub mod availability;
pub mod client;
pub mod config;
pub mod detector;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod pricing;
pub mod protocol;
pub mod reaper;
pub mod selection;
pub mod server;
pub mod slots;
pub mod store;
pub mod wal;
pub mod wizard;
