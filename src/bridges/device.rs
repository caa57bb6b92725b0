//! `adb` bridge - Input injection on the bot's instance

use std::sync::Arc;

use super::BridgeContext;
use crate::core::{Args, Value};
use crate::scripting::{HostFn, ScriptBridge, ScriptError};

const DEFAULT_SWIPE_MS: i64 = 300;

pub struct DeviceBridge {
    ctx: Arc<BridgeContext>,
}

impl DeviceBridge {
    pub fn new(ctx: Arc<BridgeContext>) -> Self {
        Self { ctx }
    }

    pub fn tap(&self, x: i64, y: i64) -> Result<bool, ScriptError> {
        let ctx = &self.ctx;
        let ok = ctx.block_on(ctx.emulator.tap(&ctx.instance, x, y, &ctx.cancel))?;
        Ok(self.report(ok, || format!("tap({}, {})", x, y)))
    }

    pub fn swipe(&self, x1: i64, y1: i64, x2: i64, y2: i64, duration_ms: i64) -> Result<bool, ScriptError> {
        let ctx = &self.ctx;
        let ok = ctx.block_on(ctx.emulator.swipe(
            &ctx.instance,
            x1,
            y1,
            x2,
            y2,
            duration_ms,
            &ctx.cancel,
        ))?;
        Ok(self.report(ok, || format!("swipe({}, {}, {}, {})", x1, y1, x2, y2)))
    }

    pub fn input_text(&self, text: &str) -> Result<bool, ScriptError> {
        let ctx = &self.ctx;
        let ok = ctx.block_on(ctx.emulator.input_text(&ctx.instance, text, &ctx.cancel))?;
        Ok(self.report(ok, || "inputText".to_string()))
    }

    pub fn key_event(&self, code: i64) -> Result<bool, ScriptError> {
        let ctx = &self.ctx;
        let ok = ctx.block_on(ctx.emulator.key_event(&ctx.instance, code, &ctx.cancel))?;
        Ok(self.report(ok, || format!("keyEvent({})", code)))
    }

    pub fn shell(&self, command: &str) -> Result<bool, ScriptError> {
        let ctx = &self.ctx;
        let ok = ctx.block_on(ctx.emulator.shell(&ctx.instance, command, &ctx.cancel))?;
        Ok(self.report(ok, || format!("shell({})", command)))
    }

    fn report(&self, ok: bool, call: impl FnOnce() -> String) -> bool {
        if !ok {
            self.ctx.logger.warn(format!(
                "adb.{} failed on '{}'.",
                call(),
                self.ctx.instance
            ));
        }
        ok
    }
}

impl ScriptBridge for DeviceBridge {
    fn name(&self) -> &str {
        "adb"
    }

    fn exports(self: Arc<Self>) -> Vec<(&'static str, HostFn)> {
        let bridge = Arc::clone(&self);
        let tap: HostFn = Arc::new(move |args: &[Value]| {
            bridge
                .tap(args.arg(0).as_i64_or(0), args.arg(1).as_i64_or(0))
                .map(Value::Bool)
        });

        let bridge = Arc::clone(&self);
        let swipe: HostFn = Arc::new(move |args: &[Value]| {
            bridge
                .swipe(
                    args.arg(0).as_i64_or(0),
                    args.arg(1).as_i64_or(0),
                    args.arg(2).as_i64_or(0),
                    args.arg(3).as_i64_or(0),
                    args.arg(4).as_i64_or(DEFAULT_SWIPE_MS),
                )
                .map(Value::Bool)
        });

        let bridge = Arc::clone(&self);
        let input_text: HostFn =
            Arc::new(move |args: &[Value]| bridge.input_text(&args.arg(0).to_text()).map(Value::Bool));

        let bridge = Arc::clone(&self);
        let key_event: HostFn =
            Arc::new(move |args: &[Value]| bridge.key_event(args.arg(0).as_i64_or(0)).map(Value::Bool));

        let bridge = self;
        let shell: HostFn =
            Arc::new(move |args: &[Value]| bridge.shell(&args.arg(0).to_text()).map(Value::Bool));

        vec![
            ("tap", tap),
            ("swipe", swipe),
            ("inputText", input_text),
            ("keyEvent", key_event),
            ("shell", shell),
        ]
    }
}
