//! Events published by the assistant for hosts and UIs.

pub mod events;
