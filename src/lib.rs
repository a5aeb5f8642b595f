pub mod api;
pub mod config;
pub mod http_response;
pub mod middleware;
pub mod services;
