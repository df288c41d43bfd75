#[macro_use]
extern crate log;

mod config;
mod error;
mod time;

pub use config::Config;
pub use error::Error;
pub use time::{PktTime, MICROS_PER_SEC};
