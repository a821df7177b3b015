//! Bridges phone location/motion sensors to an ESP32-class peer, emulating
//! a vehicle speed sensor over a serial-like wireless link.

pub mod error;
pub mod fusion;
pub mod link;
pub mod sensors;
pub mod speed;
pub mod status;
