//! Block-storage style flash driver for a flash peripheral shared with a
//! BLE controller.
//!
//! The controller firmware owns the flash peripheral whenever the radio is
//! active, so ordinary synchronous flash programming is not possible. The
//! firmware instead exposes asynchronous write/erase entry points that
//! schedule the physical operation between radio events and report completion
//! through a callback. This crate provides the glue that accepts conventional
//! blocking read/write/erase requests, splits writes into hardware-legal
//! steps (word aligned, page bounded), and resumes itself from the firmware's
//! completion callback until the whole request is done.

#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod error;
mod firmware;
mod flash;
mod lock;

pub use error::*;
pub use firmware::*;
pub use flash::*;
pub use lock::*;
