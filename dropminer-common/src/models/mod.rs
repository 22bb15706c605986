pub mod campaign;
pub mod channel;
pub mod config;
pub mod game;
pub mod session;
pub mod status;
pub mod watch;

pub use campaign::{Benefit, Campaign, CampaignStatus, Drop, ProgressOutcome, ProgressSource};
pub use channel::{Channel, ChannelRef, EventVersion, StreamInfo, Versioned};
pub use config::{MinerConfig, PollIntervals, PriorityMode, StatusSinkKind};
pub use game::Game;
pub use session::{LoginPrompt, Session};
pub use status::{DropSummary, EngineState, ErrorReport, MinerSnapshot, ShardStatus, StatusUpdate};
pub use watch::WatchState;
