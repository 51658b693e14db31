//! Admin HTTP surface and process wiring for the scheduler.

pub mod app;
