#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use grouppolicy_core as core;
pub use grouppolicy_mapping as mapping;

mod args;
mod log;
mod replay;

pub use self::{
    args::Args,
    log::LogFormat,
    replay::{Outcome, Record, Replay, Summary},
};
