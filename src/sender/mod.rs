mod backoff;
mod config;
mod controller;
mod loop_worker;
mod transport;

pub use backoff::{apply_jitter, backoff_delay};
pub use config::SenderConfig;
pub use controller::SenderController;
pub use loop_worker::{sender_loop, CycleReport, ReliableSender};
pub use transport::{DeliveryChain, HttpTransport, Transport};
