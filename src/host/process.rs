//! Evaluator that runs script text through an external interpreter.
//!
//! The interpreter speaks newline-delimited JSON on its stdio:
//! - it reads `{"script": ...}` and evaluates it, awaiting thenables
//! - if the outcome is a function it prints `{"callable": true}` and reads
//!   `{"arg": ...}` (or `{}` when there is no argument) before calling it
//! - the settled outcome is printed as `{"value": ...}`
//!
//! Output that is not a `value` line is parsed as plain JSON (or kept as a
//! string). A non-zero exit is an error carrying stderr. The child is killed
//! when the evaluation is dropped.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, instrument};

use super::{Deferred, Evaluated, Evaluator};

/// Stdin driver for `node`.
const NODE_DRIVER: &str = r#"
const rl = require('readline').createInterface({ input: process.stdin });
const lines = rl[Symbol.asyncIterator]();
const read = async () => {
  const { value, done } = await lines.next();
  return done ? {} : JSON.parse(value);
};
const write = (msg) => process.stdout.write(JSON.stringify(msg) + '\n');
(async () => {
  try {
    const { script } = await read();
    let v = await (0, eval)(script);
    if (typeof v === 'function') {
      write({ callable: true });
      const call = await read();
      v = await ('arg' in call ? v(call.arg) : v());
    }
    if (typeof v === 'function') write({ callable: true });
    else write({ value: v === undefined ? null : v });
  } catch (e) {
    process.stderr.write(String(e));
    process.exitCode = 1;
  } finally {
    rl.close();
  }
})();
"#;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CallableLine {
    callable: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ValueLine {
    value: Value,
}

/// Evaluator backed by an interpreter process.
#[derive(Debug, Clone)]
pub struct ProcessEvaluator {
    program: String,
    args: Vec<String>,
}

impl ProcessEvaluator {
    /// Default interpreter command: `node` running a small stdin driver.
    pub const NODE_COMMAND: [&'static str; 3] = ["node", "-e", NODE_DRIVER];

    /// Create an evaluator from `[program, args...]`.
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .context("Evaluator command is empty")?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl Evaluator for ProcessEvaluator {
    #[instrument(skip(self, script), fields(program = %self.program))]
    async fn evaluate(&self, script: &str) -> Result<Evaluated> {
        debug!(script_len = script.len(), "Spawning interpreter");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn interpreter: {}", self.program))?;

        let stdin = child.stdin.take().context("Failed to open stdin")?;
        let stdout = child.stdout.take().context("Failed to open stdout")?;
        let mut session = Session {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            program: self.program.clone(),
        };
        session.send(&json!({ "script": script })).await?;

        Ok(Evaluated::Deferred(session.next()))
    }
}

/// An interpreter partway through one evaluation.
struct Session {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    program: String,
}

impl Session {
    async fn send(&mut self, message: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.stdin
            .write_all(&line)
            .await
            .context("Failed to write to interpreter stdin")
    }

    /// Read until the interpreter hands back a function or exits.
    fn next(mut self) -> Deferred {
        Box::pin(async move {
            let mut output = String::new();
            while let Some(line) = self
                .stdout
                .next_line()
                .await
                .context("Failed to read interpreter output")?
            {
                if matches!(
                    serde_json::from_str::<CallableLine>(&line),
                    Ok(CallableLine { callable: true })
                ) {
                    debug!("Interpreter returned a function");
                    return Ok(Evaluated::Callable(Box::new(move |arg| {
                        Ok(Evaluated::Deferred(self.call(arg)))
                    })));
                }
                output.push_str(&line);
                output.push('\n');
            }
            self.finish(output).await
        })
    }

    fn call(mut self, arg: Option<Value>) -> Deferred {
        Box::pin(async move {
            let message = arg.map_or_else(|| json!({}), |arg| json!({ "arg": arg }));
            self.send(&message).await?;
            self.next().await
        })
    }

    async fn finish(self, stdout: String) -> Result<Evaluated> {
        let Self {
            child,
            stdin,
            program,
            ..
        } = self;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for {program}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            if stderr.is_empty() {
                anyhow::bail!("{program} exited with {}", output.status);
            }
            anyhow::bail!("{stderr}");
        }

        debug!(stdout_len = stdout.len(), "Interpreter finished");
        Ok(Evaluated::Value(parse_output(&stdout)))
    }
}

fn parse_output(stdout: &str) -> Value {
    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Value::Null;
    }
    if let Ok(ValueLine { value }) = serde_json::from_str::<ValueLine>(stdout) {
        return value;
    }
    serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::eval::normalize;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> ProcessEvaluator {
        ProcessEvaluator::new(&["sh".to_owned(), "-c".to_owned(), script.to_owned()]).unwrap()
    }

    #[test]
    fn parse_output_prefers_value_lines() {
        assert_eq!(parse_output("{\"value\":[1]}\n"), json!([1]));
        assert_eq!(parse_output(r#"{"value":1,"x":2}"#), json!({"value": 1, "x": 2}));
        assert_eq!(parse_output("42"), json!(42));
        assert_eq!(parse_output("plain text"), json!("plain text"));
        assert_eq!(parse_output(""), Value::Null);
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(ProcessEvaluator::new(&[]).is_err());
    }

    #[tokio::test]
    async fn script_reaches_the_interpreter() {
        // Echo the request line back as the value.
        let evaluator = sh(r#"read -r line; printf '{"value":%s}\n' "$line""#);
        let evaluated = evaluator.evaluate("1 + 1").await.unwrap();
        assert!(matches!(evaluated, Evaluated::Deferred(_)));

        let value = normalize(evaluated, None).await.unwrap();
        assert_eq!(value, json!({"script": "1 + 1"}));
    }

    #[tokio::test]
    async fn raw_output_is_parsed() {
        let evaluator = sh("read -r line; echo 42");
        let evaluated = evaluator.evaluate("42").await.unwrap();
        assert_eq!(normalize(evaluated, None).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn function_is_called_with_arg() {
        let script = r#"read -r s; echo '{"callable":true}'; read -r a; printf '{"value":%s}\n' "$a""#;

        let evaluated = sh(script).evaluate("(a) => a").await.unwrap();
        let value = normalize(evaluated, Some(json!(13))).await.unwrap();
        assert_eq!(value, json!({"arg": 13}));

        let evaluated = sh(script).evaluate("() => 1").await.unwrap();
        let value = normalize(evaluated, None).await.unwrap();
        assert_eq!(value, json!({}));
    }

    #[tokio::test]
    async fn leftover_function_is_null_and_child_is_dropped() {
        let evaluator = sh(
            r#"read -r s; echo '{"callable":true}'; read -r a; echo '{"callable":true}'; sleep 30"#,
        );

        let started = Instant::now();
        let evaluated = evaluator.evaluate("() => () => 1").await.unwrap();
        assert_eq!(normalize(evaluated, None).await.unwrap(), Value::Null);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn failure_carries_stderr() {
        let evaluator = sh("read -r s; echo 'ReferenceError: x is not defined' >&2; exit 1");
        let evaluated = evaluator.evaluate("x").await.unwrap();
        let err = normalize(evaluated, None).await.unwrap_err();
        assert_eq!(err.to_string(), "ReferenceError: x is not defined");
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let evaluator =
            ProcessEvaluator::new(&["/nonexistent/interpreter".to_owned()]).unwrap();
        assert!(evaluator.evaluate("1").await.is_err());
    }
}
