pub mod auth;
pub mod jobs;
pub mod network;
pub mod portal;
pub mod provisioning;
pub mod store;
pub mod system_actions;
