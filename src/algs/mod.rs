//! Communication layer: transports, the all-to-all exchange and wire frames.

pub mod communicator;
pub mod exchange;
pub mod wire;
