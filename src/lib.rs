//! Core of a propar-speaking pressure controller: a serialized parameter
//! channel, the controller state machines and the acquisition loop.

pub mod alarm;
pub mod backend;
pub mod channel;
pub mod clock;
pub mod constants;
pub mod controller;
pub mod conversions;
pub mod data;
pub mod error;
pub mod frame;
pub mod interface;
pub mod poller;
pub mod purge;
pub mod settings;

#[cfg(debug_assertions)]
pub mod sim;
