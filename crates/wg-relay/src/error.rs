use std::io;

use crate::{config::ConfigError, engine::EngineError, interface::State};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport: {context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("tunnel: {context}: {source}")]
    Tunnel {
        context: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("timer: {0}")]
    Timer(String),
    #[error("tunnel device I/O: {0}")]
    DeviceIo(#[source] io::Error),
    #[error("protocol engine: {0}")]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot {operation} while {state:?}")]
    State {
        operation: &'static str,
        state: State,
    },
}

/// A command from an up or down script that did not succeed
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("`{command}` could not be started: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with status {status}")]
    Status { command: String, status: i32 },
    #[error("`{command}` was terminated by a signal")]
    Signaled { command: String },
}

impl Error {
    pub(crate) fn transport(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Transport { context, source }
    }

    pub(crate) fn tunnel(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Tunnel { context, source }
    }

    /// OS error code behind this error, if there is one
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Transport { source, .. } | Self::Tunnel { source, .. } => source.raw_os_error(),
            Self::DeviceIo(source) => source.raw_os_error(),
            _ => None,
        }
    }
}
