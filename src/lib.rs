#[macro_use]
extern crate log;
extern crate byteorder;

#[macro_use]
pub(crate) mod utils;
pub mod disk;
mod error;
pub mod fs;
pub mod part;

pub use error::*;

#[cfg(test)]
extern crate better_panic;

#[cfg(test)]
pub(crate) fn tests_init() {
    better_panic::install();
}
