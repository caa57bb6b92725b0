//! Scripting - Sandboxed execution of bot scripts
//!
//! A [`Sandbox`] hosts exactly one interpreter for one bot run. Host
//! capabilities are plain Rust closures over [`Value`]s so bridges never see
//! interpreter types.

mod lua;
mod model;
mod transpile;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use lua::LuaSandbox;
pub use model::{ScriptModel, ScriptStep, ScriptVariable};
pub use transpile::compose;

use crate::core::Value;

/// Why a script stopped early
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScriptError {
    #[error("script cancelled")]
    Cancelled,

    #[error("script exceeded the {0:?} time limit")]
    Timeout(Duration),

    #[error("{0}")]
    Runtime(String),
}

impl ScriptError {
    /// Cancellation is a requested stop, not a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A host function callable from scripts
pub type HostFn = Arc<dyn Fn(&[Value]) -> Result<Value, ScriptError> + Send + Sync>;

/// A named group of host functions, exposed to scripts as one global table
pub trait ScriptBridge: Send + Sync {
    /// Short name; scripts see it lower-cased
    fn name(&self) -> &str;

    fn exports(self: Arc<Self>) -> Vec<(&'static str, HostFn)>;
}

/// One isolated interpreter
pub trait Sandbox {
    fn register_global(&self, name: &str, function: HostFn) -> Result<(), ScriptError>;

    fn register_bridge(&self, bridge: Arc<dyn ScriptBridge>) -> Result<(), ScriptError>;

    /// Run `source` to completion, blocking the calling thread. Returns
    /// early with [`ScriptError::Cancelled`] once `cancel` fires.
    fn run(&self, source: &str, cancel: &CancellationToken) -> Result<(), ScriptError>;
}
