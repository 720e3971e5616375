//! # vncmux: VNC relay service
//!
//! Connects to one VNC server as a client and re-serves its screen to
//! any number of VNC viewers at a fixed frame rate. The relay core
//! lives in `vncmux-core`; this crate adds configuration, logging and
//! signal handling.

pub mod config;
pub mod service;
