//! `signalroom` relay server library.
//!
//! Exposes the relay server for use in tests and embedding.
//! The relay accepts WebSocket connections, tracks which room each
//! connection has joined, and forwards signaling messages between members
//! of the same room.

pub mod config;
pub mod relay;
pub mod rooms;
