pub mod control;
pub mod directory;
pub mod dispatcher;
pub mod offsets;

pub use control::{ControlMessage, PushMessage};
pub use directory::{SubscriptionDirectory, SubscriptionRecord};
pub use dispatcher::{DispatchError, DispatchOutcome, InboundRecord, NotificationDispatcher};
pub use offsets::OffsetTracker;
