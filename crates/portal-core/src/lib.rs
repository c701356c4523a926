pub mod activity;
pub mod backup;
pub mod block;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod event_log;
pub mod guard;
pub mod paths;
pub mod policy;
pub mod storage;
pub mod store;
