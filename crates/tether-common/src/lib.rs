#![doc = "Common types shared across the Tether workspace."]

pub mod config;
pub mod error;
pub mod ring_buffer;
pub mod time;

pub use config::*;
pub use error::*;
pub use ring_buffer::*;
pub use time::*;
