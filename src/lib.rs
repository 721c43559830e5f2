//! Call session lifecycle controller for a messaging client.
//!
//! Decides whether a call is ringing, active or over while hang-ups, local
//! close requests, user actions and the ring timeout race each other.

pub mod calling;
pub mod config;
pub mod console;
