// Player backends and the media sink they render into

mod adapter;
mod frame;
mod probe;
mod scripted;
mod types;

pub use adapter::{AcceptPlay, LoadRequest, PlaybackControl, PlayerAdapter, PlayerEvents, PlayerSession};
pub use frame::{FrameBuffer, TEST_CARD_HEIGHT, TEST_CARD_WIDTH};
pub use probe::HttpProbePlayer;
pub use scripted::{LiveGauge, ScriptStep, ScriptedPlayer};
pub use types::{Backend, MediaSink, PlayerError, PlayerEvent, PlayerResult};
