pub mod credential_store;
pub mod status_sink;

pub use credential_store::CredentialStore;
pub use status_sink::{NoopStatusSink, StatusSink};
