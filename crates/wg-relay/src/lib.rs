pub mod config;
pub mod engine;
mod error;
pub mod interface;
pub mod relay;
pub mod script;
pub mod shutdown;
pub mod timer;
pub mod transport;
pub mod tun;
pub mod x25519;

pub use crate::{
    config::Settings,
    engine::{BoringEngine, Engine},
    error::{Error, Result, ScriptError},
    interface::{Interface, Options, State},
    shutdown::Shutdown,
};
