//! Host emulator for sinsp plugins.
//!
//! Loads plugin libraries through their C entry points and plays the host
//! engine's part of every boundary protocol, including the async extractor
//! rendezvous.

pub mod cli;
pub mod config;
pub mod loader;
pub mod runner;
