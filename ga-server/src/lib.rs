//! # ga-server
//!
//! Runs the capture → filter → encode → transport pipeline and the TCP
//! control channel that adapts the encoder bitrate to receiver feedback.
//!
//! Startup order matters: every pipeline stage is loaded, initialised
//! and started before the control server accepts its first client. A
//! stage failure is fatal; the binary exits with status 1.

pub mod config;
pub mod service;
