//! Gatekeeper core: gate timing, bot-update parsing, command dispatch and the
//! resident registry of an ESP32 gate controller.
//!
//! Everything in this crate runs without an allocator and without hardware,
//! so the firmware binary (`src/main.rs`, feature `esp32`) and the host tests
//! share the same code. Hardware only enters through small seams:
//! [`gate::Clock`], [`embedded_hal::digital::OutputPin`], [`storage::Store`]
//! and [`dispatch::GateLink`].

#![no_std]

pub mod bot;
pub mod config;
pub mod dispatch;
pub mod gate;
pub mod handshake;
pub mod parser;
pub mod registry;
pub mod storage;
pub mod ticks;
pub mod tokenizer;
