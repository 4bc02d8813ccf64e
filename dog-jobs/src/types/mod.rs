pub mod capabilities;
pub mod events;
pub mod ids;
pub mod job;
pub mod options;

pub use capabilities::BrokerCapabilities;
pub use events::JobEvent;
pub use ids::{JobId, ReservationToken};
pub use job::{Job, PipelineStat, Reservation};
pub use options::{JobOptions, PushOptions, RetryDelay};
