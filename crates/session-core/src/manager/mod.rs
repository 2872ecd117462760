//! Process-wide session coordination.

mod manager;
mod requests;
mod ringtone;

pub use manager::SessionManager;
pub use requests::{IncomingRequest, RequestId, RequestQueue, RequestTarget};
pub use ringtone::{plan_ringtone, HoldTone, NullToneSink, RingTone, RingtonePlan, ToneSink};
