//! Session recording and playback (spec §4.11): capture a sequence of
//! reacton writes with timing, export/import it, and replay it against
//! a store at an adjustable speed.

pub mod event;
mod player;
mod recorder;
mod session;

pub use event::{SessionMark, StateEvent};
pub use player::{Player, PlayerBuilder};
pub use recorder::{Recorder, RecorderBuilder};
pub use session::{RecordedSession, SCHEMA_VERSION};
