//! Lua 5.4 sandbox
//!
//! Only the table, string, math, utf8 and coroutine libraries are opened.
//! An instruction-count hook enforces the deadline and observes cancellation,
//! so even a tight loop with no host calls can be stopped. The error it
//! raises is re-raised after every protected call, so scripts cannot catch
//! it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mlua::{
    Error as LuaError, Function, HookTriggers, Lua, LuaOptions, MultiValue, StdLib, Table,
    Value as LuaValue, Variadic, VmState,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{HostFn, Sandbox, ScriptBridge, ScriptError};
use crate::core::{BotLogger, Value};

/// Instructions between two deadline/cancellation checks
const HOOK_INTERVAL: u32 = 1000;

/// Rewraps the error-catching builtins so their results pass through
/// `check`, which re-raises cancellation and the deadline. A script cannot
/// swallow its own termination with `pcall`, `xpcall` or `coroutine.resume`.
const GUARD_PROTECTED_CALLS: &str = r#"
local check, raw_pcall, raw_xpcall, raw_resume = ...
pcall = function(...) return check(raw_pcall(...)) end
xpcall = function(...) return check(raw_xpcall(...)) end
coroutine.resume = function(...) return check(raw_resume(...)) end
"#;

/// Nested tables deeper than this are passed to the host as `Null`
const MAX_TABLE_DEPTH: usize = 16;

pub struct LuaSandbox {
    lua: Lua,
    logger: BotLogger,
    runtime: Handle,
    timeout: Duration,
}

impl LuaSandbox {
    /// `runtime` drives `sleep`; the sandbox itself must run on a thread
    /// where blocking is allowed.
    pub fn new(logger: BotLogger, runtime: Handle, timeout: Duration) -> Result<Self, ScriptError> {
        let libs = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE;
        let lua = Lua::new_with(libs, LuaOptions::default()).map_err(runtime_error)?;
        Ok(Self {
            lua,
            logger,
            runtime,
            timeout,
        })
    }

    fn install_builtins(&self, cancel: &CancellationToken, deadline: Instant) -> mlua::Result<()> {
        let globals = self.lua.globals();

        let tostring: Function = globals.get("tostring")?;
        let logger = self.logger.clone();
        let print = self.lua.create_function(move |_, args: Variadic<LuaValue>| {
            let parts = args
                .iter()
                .map(|arg| tostring.call::<String>(arg.clone()))
                .collect::<mlua::Result<Vec<_>>>()?;
            logger.info(parts.join(" "));
            Ok(())
        })?;

        let sleep = {
            let runtime = self.runtime.clone();
            let cancel = cancel.clone();
            let timeout = self.timeout;
            self.lua.create_function(move |_, ms: LuaValue| {
                let ms = from_lua(&ms, 0).as_i64_or(0).max(0) as u64;
                cooperative_sleep(&runtime, &cancel, deadline, timeout, Duration::from_millis(ms))
                    .map_err(LuaError::external)
            })?
        };

        let util = self.lua.create_table()?;
        util.set("log", print.clone())?;
        util.set("sleep", sleep.clone())?;

        globals.set("print", print)?;
        globals.set("sleep", sleep)?;
        globals.set("util", util)?;
        Ok(())
    }

    fn install_call_guard(&self, cancel: &CancellationToken, deadline: Instant) -> mlua::Result<()> {
        let cancel = cancel.clone();
        let timeout = self.timeout;
        let check = self.lua.create_function(move |_, results: MultiValue| {
            match abort_reason(&cancel, deadline, timeout) {
                Some(reason) => Err(LuaError::external(reason)),
                None => Ok(results),
            }
        })?;

        let globals = self.lua.globals();
        let pcall: Function = globals.get("pcall")?;
        let xpcall: Function = globals.get("xpcall")?;
        let coroutine: Table = globals.get("coroutine")?;
        let resume: Function = coroutine.get("resume")?;
        self.lua
            .load(GUARD_PROTECTED_CALLS)
            .set_name("guard")
            .call::<()>((check, pcall, xpcall, resume))
    }

    fn install_hook(&self, cancel: &CancellationToken, deadline: Instant) {
        let cancel = cancel.clone();
        let timeout = self.timeout;
        let triggers = HookTriggers::new().every_nth_instruction(HOOK_INTERVAL);
        let _ = self.lua.set_hook(triggers, move |_, _| {
            match abort_reason(&cancel, deadline, timeout) {
                Some(reason) => Err(LuaError::external(reason)),
                None => Ok(VmState::Continue),
            }
        });
    }

    fn host_function(&self, function: HostFn) -> mlua::Result<Function> {
        self.lua.create_function(move |lua, args: Variadic<LuaValue>| {
            let values: Vec<Value> = args.iter().map(|arg| from_lua(arg, 0)).collect();
            let result = function(&values).map_err(LuaError::external)?;
            to_lua(lua, &result)
        })
    }

    fn classify(&self, error: LuaError, cancel: &CancellationToken, deadline: Instant) -> ScriptError {
        if cancel.is_cancelled() {
            return ScriptError::Cancelled;
        }
        if let Some(inner) = find_script_error(&error) {
            return inner.clone();
        }
        if Instant::now() >= deadline {
            return ScriptError::Timeout(self.timeout);
        }
        ScriptError::Runtime(error.to_string())
    }
}

impl Sandbox for LuaSandbox {
    fn register_global(&self, name: &str, function: HostFn) -> Result<(), ScriptError> {
        let function = self.host_function(function).map_err(runtime_error)?;
        self.lua
            .globals()
            .set(name, function)
            .map_err(runtime_error)
    }

    fn register_bridge(&self, bridge: Arc<dyn ScriptBridge>) -> Result<(), ScriptError> {
        let name = bridge.name().to_lowercase();
        let table = self.lua.create_table().map_err(runtime_error)?;
        for (export, function) in bridge.exports() {
            let function = self.host_function(function).map_err(runtime_error)?;
            table.set(export, function).map_err(runtime_error)?;
        }
        debug!("Registered bridge '{}'", name);
        self.lua.globals().set(name, table).map_err(runtime_error)
    }

    fn run(&self, source: &str, cancel: &CancellationToken) -> Result<(), ScriptError> {
        if cancel.is_cancelled() {
            return Err(ScriptError::Cancelled);
        }
        let deadline = Instant::now() + self.timeout;

        self.install_builtins(cancel, deadline)
            .and_then(|()| self.install_call_guard(cancel, deadline))
            .map_err(runtime_error)?;
        self.install_hook(cancel, deadline);

        let result = self.lua.load(source).set_name("bot").exec();
        self.lua.remove_hook();

        result.map_err(|e| self.classify(e, cancel, deadline))
    }
}

/// Why the run has to end now, if it does
fn abort_reason(cancel: &CancellationToken, deadline: Instant, timeout: Duration) -> Option<ScriptError> {
    if cancel.is_cancelled() {
        Some(ScriptError::Cancelled)
    } else if Instant::now() >= deadline {
        Some(ScriptError::Timeout(timeout))
    } else {
        None
    }
}

/// Sleep on the host runtime without holding up cancellation. A sleep that
/// would pass the deadline is cut short and reported as a timeout.
fn cooperative_sleep(
    runtime: &Handle,
    cancel: &CancellationToken,
    deadline: Instant,
    timeout: Duration,
    wanted: Duration,
) -> Result<(), ScriptError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(ScriptError::Timeout(timeout));
    }

    runtime.block_on(async {
        tokio::select! {
            _ = cancel.cancelled() => Err(ScriptError::Cancelled),
            _ = tokio::time::sleep(wanted.min(remaining)) => Ok(()),
        }
    })?;

    if wanted > remaining {
        Err(ScriptError::Timeout(timeout))
    } else {
        Ok(())
    }
}

/// Our own error, if one is buried in the callback chain
fn find_script_error(error: &LuaError) -> Option<&ScriptError> {
    match error {
        LuaError::ExternalError(inner) => inner.downcast_ref::<ScriptError>(),
        LuaError::CallbackError { cause, .. } => find_script_error(cause),
        LuaError::WithContext { cause, .. } => find_script_error(cause),
        _ => None,
    }
}

fn runtime_error(error: LuaError) -> ScriptError {
    ScriptError::Runtime(error.to_string())
}

fn from_lua(value: &LuaValue, depth: usize) -> Value {
    match value {
        LuaValue::Nil => Value::Null,
        LuaValue::Boolean(b) => Value::Bool(*b),
        LuaValue::Integer(i) => Value::Number(*i as f64),
        LuaValue::Number(n) => Value::Number(*n),
        LuaValue::String(s) => Value::String(s.to_string_lossy().to_string()),
        LuaValue::Table(table) if depth < MAX_TABLE_DEPTH => table_to_value(table, depth + 1),
        _ => Value::Null,
    }
}

/// Sequences become lists, anything else a map with stringified keys
fn table_to_value(table: &Table, depth: usize) -> Value {
    if table.raw_len() > 0 {
        let items = table
            .clone()
            .sequence_values::<LuaValue>()
            .filter_map(Result::ok)
            .map(|v| from_lua(&v, depth))
            .collect();
        return Value::List(items);
    }

    let mut map = BTreeMap::new();
    for (key, value) in table.clone().pairs::<LuaValue, LuaValue>().flatten() {
        let key = from_lua(&key, depth).to_text();
        map.insert(key, from_lua(&value, depth));
    }
    Value::Map(map)
}

fn to_lua(lua: &Lua, value: &Value) -> mlua::Result<LuaValue> {
    Ok(match value {
        Value::Null => LuaValue::Nil,
        Value::Bool(b) => LuaValue::Boolean(*b),
        Value::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
            LuaValue::Integer(*n as i64)
        }
        Value::Number(n) => LuaValue::Number(*n),
        Value::String(s) => LuaValue::String(lua.create_string(s)?),
        Value::List(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, to_lua(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
        Value::Map(entries) => {
            let table = lua.create_table()?;
            for (key, item) in entries {
                table.raw_set(key.as_str(), to_lua(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
    })
}
