pub mod api;
pub mod auth;
pub mod client;
pub mod constants;
pub mod credentials;
pub mod crypto;
pub mod engine;
pub mod eventbus;
pub mod http;
pub mod inventory;
pub mod pubsub;
pub mod registry;
pub mod status;
pub mod tasks;
pub mod test_utils;

pub use dropminer_common::Error;
