pub mod fakes;
pub mod helpers;

pub use fakes::{FakeApi, FakeConnector, FakeSession, RecordingSink, ScriptedTransport, WatchBehavior};
