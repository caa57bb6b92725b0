//! Script composition - Turning a visual script model into Lua source

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::model::{ScriptModel, ScriptStep};
use crate::core::Value;

static VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z0-9_.-]+)\}").expect("variable pattern is valid")
});

const INDENT: &str = "    ";

/// Replace every `${name}` with its value; unknown names become empty
pub fn substitute(input: &str, lookup: &HashMap<String, String>) -> String {
    VARIABLE
        .replace_all(input, |caps: &Captures| {
            lookup.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Lua source for `model`. Values supplied by the bot take precedence over
/// the model's variable defaults.
pub fn compose(model: &ScriptModel, variables: &BTreeMap<String, Value>) -> String {
    let mut lookup: HashMap<String, String> = model
        .variables
        .iter()
        .filter(|v| !v.key.is_empty())
        .map(|v| (v.key.clone(), v.default.clone()))
        .collect();
    for (key, value) in variables {
        lookup.insert(key.clone(), value.to_text());
    }

    let mut out = String::new();
    let title = if model.name.is_empty() { "script" } else { model.name.as_str() };
    let _ = writeln!(out, "-- {}", single_line(title));
    Emitter { lookup: &lookup, out: &mut out }.block(&model.steps, 0);
    out
}

struct Emitter<'a> {
    lookup: &'a HashMap<String, String>,
    out: &'a mut String,
}

impl Emitter<'_> {
    /// Emit `steps`; loops left open at the end of the block are closed there
    fn block(&mut self, steps: &[ScriptStep], depth: usize) {
        let mut open_loops = 0;
        for step in steps {
            let level = depth + open_loops;
            match step.kind.trim().to_ascii_uppercase().as_str() {
                "TAP" => {
                    let x = self.int(step, "x", 0);
                    let y = self.int(step, "y", 0);
                    self.line(level, &format!("adb.tap({}, {})", x, y));
                    let delay = self.int(step, "delay", 0);
                    if delay > 0 {
                        self.line(level, &format!("sleep({})", delay));
                    }
                }
                "WAIT" => {
                    let delay = self.int(step, "delay", 1000).max(0);
                    self.line(level, &format!("sleep({})", delay));
                }
                "INPUT" => {
                    let text = self.text(step, "text");
                    self.line(level, &format!("adb.inputText({})", lua_quote(&text)));
                }
                "LOG" => {
                    let message = self.text(step, "message");
                    self.line(level, &format!("print({})", lua_quote(&message)));
                }
                "IF_IMAGE" => self.if_image(step, level),
                "LOOP" => {
                    let count = self.int(step, "count", 1).max(0);
                    self.line(level, &format!("for _ = 1, {} do", count));
                    open_loops += 1;
                }
                "ENDLOOP" => {
                    // A stray ENDLOOP closes nothing
                    if open_loops > 0 {
                        open_loops -= 1;
                        self.line(depth + open_loops, "end");
                    }
                }
                "CUSTOM" => {
                    let code = self.text(step, "code");
                    for line in code.lines() {
                        self.line(level, line);
                    }
                }
                other => {
                    self.line(level, &format!("-- unsupported step: {}", single_line(other)));
                }
            }
        }

        while open_loops > 0 {
            open_loops -= 1;
            self.line(depth + open_loops, "end");
        }
    }

    fn if_image(&mut self, step: &ScriptStep, level: usize) {
        let path = self.text(step, "imagePath");
        let confidence = self.float(step, "confidence", 0.9);
        self.line(
            level,
            &format!("if cv.find({}, {}) then", lua_quote(&path), confidence),
        );
        if let Some(found) = &step.action_if_found {
            self.block(found, level + 1);
        }
        if let Some(not_found) = step.action_if_not_found.as_deref().filter(|s| !s.is_empty()) {
            self.line(level, "else");
            self.block(not_found, level + 1);
        }
        self.line(level, "end");
    }

    fn line(&mut self, level: usize, text: &str) {
        for _ in 0..level {
            self.out.push_str(INDENT);
        }
        self.out.push_str(text.trim_end());
        self.out.push('\n');
    }

    /// String parameters are substituted before conversion
    fn resolved(&self, step: &ScriptStep, key: &str) -> Value {
        match step.param(key) {
            Value::String(s) => Value::String(substitute(s, self.lookup)),
            other => other.clone(),
        }
    }

    fn text(&self, step: &ScriptStep, key: &str) -> String {
        self.resolved(step, key).to_text()
    }

    fn int(&self, step: &ScriptStep, key: &str, default: i64) -> i64 {
        self.resolved(step, key).as_i64_or(default)
    }

    fn float(&self, step: &ScriptStep, key: &str, default: f64) -> f64 {
        self.resolved(step, key).as_f64_or(default)
    }
}

/// Double-quoted Lua string literal
fn lua_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        match ch {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            c if c.is_ascii_control() => {
                let _ = write!(quoted, "\\{:03}", c as u32);
            }
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::ScriptVariable;

    fn model(steps: Vec<ScriptStep>) -> ScriptModel {
        ScriptModel {
            name: "Test".into(),
            steps,
            ..Default::default()
        }
    }

    fn body(source: &str) -> Vec<&str> {
        source.lines().skip(1).collect()
    }

    #[test]
    fn substitutes_known_and_missing_variables() {
        let lookup = HashMap::from([
            ("name".to_string(), "Alice".to_string()),
            ("n".to_string(), "42".to_string()),
        ]);
        assert_eq!(substitute("Hello ${name}, number ${n}", &lookup), "Hello Alice, number 42");
        assert_eq!(substitute("Missing ${nope}", &lookup), "Missing ");
        assert_eq!(substitute("Plain $name {n}", &lookup), "Plain $name {n}");
    }

    #[test]
    fn basic_steps_become_host_calls() {
        let source = compose(
            &model(vec![
                ScriptStep::new("TAP").with_param("x", 10i64).with_param("y", 20i64).with_param("delay", 50i64),
                ScriptStep::new("wait").with_param("delay", 200i64),
                ScriptStep::new("INPUT").with_param("text", "say \"hi\""),
                ScriptStep::new("LOG").with_param("message", "done"),
            ]),
            &BTreeMap::new(),
        );

        assert!(source.starts_with("-- Test\n"));
        assert_eq!(
            body(&source),
            [
                "adb.tap(10, 20)",
                "sleep(50)",
                "sleep(200)",
                r#"adb.inputText("say \"hi\"")"#,
                r#"print("done")"#,
            ]
        );
    }

    #[test]
    fn bot_values_override_model_defaults() {
        let mut script = model(vec![
            ScriptStep::new("LOG").with_param("message", "${user}/${server}"),
            ScriptStep::new("TAP").with_param("x", "${x}").with_param("y", 5i64),
        ]);
        script.variables = vec![
            ScriptVariable { key: "user".into(), default: "duck".into(), ..Default::default() },
            ScriptVariable { key: "server".into(), default: "eu".into(), ..Default::default() },
        ];
        let values = BTreeMap::from([
            ("server".to_string(), Value::from("na")),
            ("x".to_string(), Value::from(7i64)),
        ]);

        let source = compose(&script, &values);

        assert_eq!(body(&source), [r#"print("duck/na")"#, "adb.tap(7, 5)"]);
    }

    #[test]
    fn image_branches_nest() {
        let mut step = ScriptStep::new("IF_IMAGE").with_param("imagePath", "ok.png");
        step.action_if_found = Some(vec![ScriptStep::new("LOG").with_param("message", "yes")]);
        step.action_if_not_found = Some(vec![ScriptStep::new("LOG").with_param("message", "no")]);

        let source = compose(&model(vec![step]), &BTreeMap::new());

        assert_eq!(
            body(&source),
            [
                r#"if cv.find("ok.png", 0.9) then"#,
                r#"    print("yes")"#,
                "else",
                r#"    print("no")"#,
                "end",
            ]
        );
    }

    #[test]
    fn loops_are_balanced() {
        let source = compose(
            &model(vec![
                ScriptStep::new("ENDLOOP"),
                ScriptStep::new("LOOP").with_param("count", 3i64),
                ScriptStep::new("LOOP").with_param("count", 2i64),
                ScriptStep::new("WAIT").with_param("delay", 10i64),
                ScriptStep::new("ENDLOOP"),
            ]),
            &BTreeMap::new(),
        );

        assert_eq!(
            body(&source),
            [
                "for _ = 1, 3 do",
                "    for _ = 1, 2 do",
                "        sleep(10)",
                "    end",
                "end",
            ]
        );
    }

    #[test]
    fn custom_code_is_inlined_and_unknown_steps_commented() {
        let source = compose(
            &model(vec![
                ScriptStep::new("CUSTOM").with_param("code", "local a = 1\nprint(a)"),
                ScriptStep::new("SWIPE_UP"),
            ]),
            &BTreeMap::new(),
        );

        assert_eq!(
            body(&source),
            ["local a = 1", "print(a)", "-- unsupported step: SWIPE_UP"]
        );
    }

    #[test]
    fn quoting_escapes_control_characters() {
        assert_eq!(lua_quote("a\\b\n\u{1}"), "\"a\\\\b\\n\\001\"");
    }
}
