pub mod operations;
pub mod policy_provider;
pub mod session;
