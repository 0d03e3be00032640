//! Locally registered methods that other peers may invoke with `run`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::host::{FullscreenOptions, Host, HostError};

/// Builtin method names. These always resolve to the host capability.
pub const FOCUS: &str = "_focus";
pub const MOVE_TO: &str = "_moveTo";
pub const RESIZE_TO: &str = "_resizeTo";
pub const REQUEST_FULLSCREEN: &str = "_requestFullscreen";

/// Implementation of one method. Calls are one-way; nothing is returned to
/// a remote caller.
pub type MethodFn = Box<dyn FnMut(&[Value]) -> Result<(), MethodError> + Send>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MethodError {
    #[error("no method named {0}")]
    NotFound(String),

    #[error("invalid arguments for {method}: {reason}")]
    InvalidArguments { method: String, reason: String },

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("{0}")]
    Failed(String),
}

/// Method name → implementation.
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<String, MethodFn>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `method` under `name`, replacing any previous entry.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        method: impl FnMut(&[Value]) -> Result<(), MethodError> + Send + 'static,
    ) -> &mut Self {
        self.methods.insert(name.into(), Box::new(method));
        self
    }

    /// Builder form of [`MethodTable::register`].
    #[must_use]
    pub fn with(
        mut self,
        name: impl Into<String>,
        method: impl FnMut(&[Value]) -> Result<(), MethodError> + Send + 'static,
    ) -> Self {
        self.register(name, method);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Installs the builtin window methods on top of the caller's table.
    pub fn install_builtins(&mut self, host: Arc<dyn Host>) {
        let focus_host = Arc::clone(&host);
        self.register(FOCUS, move |_args| Ok(focus_host.focus()?));

        let move_host = Arc::clone(&host);
        self.register(MOVE_TO, move |args| {
            let x: i32 = arg(MOVE_TO, args, 0)?;
            let y: i32 = arg(MOVE_TO, args, 1)?;
            Ok(move_host.move_to(x, y)?)
        });

        let resize_host = Arc::clone(&host);
        self.register(RESIZE_TO, move |args| {
            let width: u32 = arg(RESIZE_TO, args, 0)?;
            let height: u32 = arg(RESIZE_TO, args, 1)?;
            Ok(resize_host.resize_to(width, height)?)
        });

        self.register(REQUEST_FULLSCREEN, move |args| {
            let options: FullscreenOptions = match args.first() {
                None | Some(Value::Null) => FullscreenOptions::default(),
                Some(_) => arg(REQUEST_FULLSCREEN, args, 0)?,
            };
            Ok(host.request_fullscreen(&options)?)
        });
    }

    /// Runs `name` with `args`.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<(), MethodError> {
        let method = self
            .methods
            .get_mut(name)
            .ok_or_else(|| MethodError::NotFound(name.to_string()))?;
        method(args)
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.names())
            .finish()
    }
}

/// Decodes positional argument `index` of `method`.
pub fn arg<T: DeserializeOwned>(method: &str, args: &[Value], index: usize) -> Result<T, MethodError> {
    let value = args.get(index).ok_or_else(|| MethodError::InvalidArguments {
        method: method.to_string(),
        reason: format!("missing argument {index}"),
    })?;
    serde_json::from_value(value.clone()).map_err(|e| MethodError::InvalidArguments {
        method: method.to_string(),
        reason: format!("argument {index}: {e}"),
    })
}
