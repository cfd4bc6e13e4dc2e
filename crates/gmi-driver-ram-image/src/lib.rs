//! Image driver for flat captures of guest physical RAM.
//!
//! A capture is a headerless file whose byte 0 is the byte at the guest RAM
//! base; see [`RamImageDriver`].

mod driver;
mod error;

pub use self::{
    driver::{DEFAULT_RAM_BASE, RamImageDriver},
    error::Error,
};
