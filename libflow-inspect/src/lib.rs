#[macro_use]
extern crate log;

mod analyzer;
mod bus;
mod capture;
mod commands;
mod config;
mod context_switcher;
mod expect_cache;
mod flow;
mod flow_cache;
mod flow_control;
mod flow_key;
mod ha;
mod packet;
mod readback;
mod retry;
mod session;
mod stats;
mod uni_list;
mod verdict;

pub use analyzer::*;
pub use bus::*;
pub use capture::*;
pub use commands::*;
pub use config::*;
pub use context_switcher::*;
pub use expect_cache::*;
pub use flow::*;
pub use flow_cache::*;
pub use flow_control::*;
pub use flow_key::*;
pub use ha::*;
pub use packet::*;
pub use readback::*;
pub use retry::*;
pub use session::*;
pub use stats::*;
pub use uni_list::*;
pub use verdict::*;
