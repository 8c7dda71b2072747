// Wire contracts for the transports that expose the session coordinator.

pub mod http;
