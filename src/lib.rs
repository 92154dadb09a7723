//! Bluetooth HID device role service.
//!
//! The [`hid`] module holds the session engine, free of I/O. [`bluetooth`]
//! binds it to BlueZ L2CAP sockets and profile records, and [`dbus`] exposes
//! the sessions to applications.

pub mod bluetooth;
pub mod config;
pub mod dbus;
pub mod error;
pub mod event;
pub mod hid;
