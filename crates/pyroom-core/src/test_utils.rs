//! A scripted stand-in for the interpreter, so the orchestration can be
//! exercised without Python.
//!
//! The fake understands a tiny line-oriented language:
//!
//! - `name = expr` assigns; `print(expr)` writes `value\n` to stdout
//! - a bare trailing `expr` produces an `execute_result`
//! - `expr` is `+`-joined integers, quoted strings and names
//! - `raise Kind("message")` raises; undefined names raise `NameError`
//! - `import mod` / `from mod import x` fail for modules marked missing
//! - `sleep(ms)` delays every later message of the cell
//! - `hang` stops answering until restart; `crash` kills the process
//! - `show_image` / `show_html` emit rich display data

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;

use crate::engine::message::{MSG_DISPLAY_DATA, MSG_ERROR, MSG_EXECUTE_RESULT};
use crate::engine::{Engine, EngineError, EngineFactory, KernelMessage, Recv};

const RECV_SLICE: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Int(i64),
    Str(String),
}

impl Value {
    fn display(&self) -> String {
        match self {
            Value::Int(n) => n.to_string(),
            Value::Str(s) => s.clone(),
        }
    }

    fn repr(&self) -> String {
        match self {
            Value::Int(n) => n.to_string(),
            Value::Str(s) => format!("'{s}'"),
        }
    }
}

struct Raised {
    ename: String,
    evalue: String,
}

impl Raised {
    fn new(ename: &str, evalue: impl Into<String>) -> Self {
        Self {
            ename: ename.to_string(),
            evalue: evalue.into(),
        }
    }
}

#[derive(Default)]
struct FakeState {
    alive: bool,
    hung: bool,
    fail_starts: usize,
    ignored_readiness_checks: usize,
    foreign_noise: bool,
    starts: usize,
    shutdowns: usize,
    variables: HashMap<String, Value>,
    missing_modules: HashSet<String>,
    submitted: Vec<String>,
    queue: VecDeque<(Instant, KernelMessage)>,
}

/// Shared handle for steering and inspecting one [`FakeEngine`].
#[derive(Clone, Default)]
pub struct FakeKernelControl {
    state: Arc<Mutex<FakeState>>,
}

impl FakeKernelControl {
    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` start attempts fail.
    pub fn fail_next_starts(&self, n: usize) {
        self.lock().fail_starts = n;
    }

    /// Leave the next `n` readiness checks unanswered.
    pub fn ignore_next_readiness_checks(&self, n: usize) {
        self.lock().ignored_readiness_checks = n;
    }

    /// Emit messages tagged with an unrelated token ahead of every reply.
    pub fn emit_foreign_noise(&self, enabled: bool) {
        self.lock().foreign_noise = enabled;
    }

    pub fn mark_missing_module(&self, module: &str) {
        self.lock().missing_modules.insert(module.to_string());
    }

    /// Queue a message on the output stream as if the interpreter sent it.
    pub fn inject(&self, msg: KernelMessage) {
        self.lock().queue.push_back((Instant::now(), msg));
    }

    /// Simulate the interpreter process dying.
    pub fn kill(&self) {
        let mut state = self.lock();
        state.alive = false;
        state.queue.clear();
    }

    pub fn is_alive(&self) -> bool {
        self.lock().alive
    }

    pub fn start_count(&self) -> usize {
        self.lock().starts
    }

    pub fn shutdown_count(&self) -> usize {
        self.lock().shutdowns
    }

    /// Every code snippet sent to the interpreter, probes included.
    pub fn submitted(&self) -> Vec<String> {
        self.lock().submitted.clone()
    }

    pub fn variable(&self, name: &str) -> Option<String> {
        self.lock().variables.get(name).map(Value::display)
    }
}

pub struct FakeEngine {
    control: FakeKernelControl,
}

impl FakeEngine {
    pub fn new(control: FakeKernelControl) -> Self {
        Self { control }
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn start(&mut self) -> Result<(), EngineError> {
        let mut state = self.control.lock();
        if state.fail_starts > 0 {
            state.fail_starts -= 1;
            state.alive = false;
            return Err(EngineError::Spawn("simulated start failure".to_string()));
        }
        state.starts += 1;
        state.alive = true;
        state.hung = false;
        state.variables.clear();
        state.queue.clear();
        state
            .queue
            .push_back((Instant::now(), KernelMessage::status(None, "starting")));
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.control.lock().alive
    }

    async fn send_execute(&mut self, token: &str, code: &str) -> Result<(), EngineError> {
        let mut state = self.control.lock();
        if !state.alive {
            return Err(EngineError::Dead);
        }
        state.submitted.push(code.to_string());
        if state.hung {
            return Ok(());
        }
        if code.trim() == crate::readiness::PROBE_CODE && state.ignored_readiness_checks > 0 {
            state.ignored_readiness_checks -= 1;
            return Ok(());
        }
        run_cell(&mut state, token, code);
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> Recv {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            {
                let mut state = self.control.lock();
                let due = state.queue.front().map(|(at, _)| *at <= now);
                match due {
                    Some(true) => {
                        if let Some((_, msg)) = state.queue.pop_front() {
                            return Recv::Message(msg);
                        }
                    }
                    Some(false) => {}
                    None if !state.alive => return Recv::Closed,
                    None => {}
                }
            }
            if now >= deadline {
                return Recv::Timeout;
            }
            tokio::time::sleep(RECV_SLICE.min(deadline - now)).await;
        }
    }

    async fn shutdown(&mut self) {
        let mut state = self.control.lock();
        state.alive = false;
        state.hung = false;
        state.queue.clear();
        state.shutdowns += 1;
    }
}

struct Cell<'a> {
    state: &'a mut FakeState,
    token: &'a str,
    at: Instant,
}

impl Cell<'_> {
    fn emit(&mut self, msg: KernelMessage) {
        self.state.queue.push_back((self.at, msg));
    }

    fn emit_new(&mut self, msg_type: &str, content: serde_json::Value) {
        let msg = KernelMessage::new(msg_type, Some(self.token), content);
        self.emit(msg);
    }
}

enum Flow {
    Continue,
    Hang,
    Crash,
}

fn run_cell(state: &mut FakeState, token: &str, code: &str) {
    if state.foreign_noise {
        let now = Instant::now();
        state
            .queue
            .push_back((now, KernelMessage::stream(Some("foreign"), "noise\n")));
        state
            .queue
            .push_back((now, KernelMessage::status(Some("foreign"), "idle")));
    }

    let mut cell = Cell {
        state,
        token,
        at: Instant::now(),
    };
    cell.emit(KernelMessage::status(Some(token), "busy"));

    let lines: Vec<&str> = code
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();

    for (i, line) in lines.iter().enumerate() {
        let last = i + 1 == lines.len();
        match run_line(&mut cell, line, last) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Hang) => {
                cell.state.hung = true;
                return;
            }
            Ok(Flow::Crash) => {
                cell.state.alive = false;
                return;
            }
            Err(raised) => {
                cell.emit_new(
                    MSG_ERROR,
                    json!({
                        "ename": raised.ename,
                        "evalue": raised.evalue,
                        "traceback": [
                            "Traceback (most recent call last):",
                            format!("{}: {}", raised.ename, raised.evalue),
                        ],
                    }),
                );
                break;
            }
        }
    }
    cell.emit(KernelMessage::status(Some(token), "idle"));
}

fn run_line(cell: &mut Cell<'_>, line: &str, last: bool) -> Result<Flow, Raised> {
    match line {
        "hang" => return Ok(Flow::Hang),
        "crash" => return Ok(Flow::Crash),
        "show_image" => {
            cell.emit_new(
                MSG_DISPLAY_DATA,
                json!({"data": {"image/png": "iVBORw0KGgo=", "text/plain": "<Figure>"}}),
            );
            return Ok(Flow::Continue);
        }
        "show_html" => {
            cell.emit_new(
                MSG_DISPLAY_DATA,
                json!({"data": {"text/html": "<b>hi</b>", "text/plain": "hi"}}),
            );
            return Ok(Flow::Continue);
        }
        _ => {}
    }

    if let Some(ms) = call_arg(line, "sleep") {
        let ms: u64 = ms
            .trim()
            .parse()
            .map_err(|_| Raised::new("TypeError", "sleep() expects milliseconds"))?;
        cell.at += Duration::from_millis(ms);
        return Ok(Flow::Continue);
    }
    if let Some(module) = import_target(line) {
        let root = module.split('.').next().unwrap_or(module);
        if cell.state.missing_modules.contains(root) {
            return Err(Raised::new(
                "ModuleNotFoundError",
                format!("No module named '{root}'"),
            ));
        }
        return Ok(Flow::Continue);
    }
    if let Some(rest) = line.strip_prefix("raise ") {
        let (ename, arg) = match rest.split_once('(') {
            Some((name, arg)) => (name.trim(), arg.trim_end_matches(')')),
            None => (rest.trim(), ""),
        };
        return Err(Raised::new(ename, unquote(arg).unwrap_or(arg)));
    }
    if let Some(arg) = call_arg(line, "print") {
        let text = if arg.trim().is_empty() {
            String::new()
        } else {
            eval(cell.state, arg)?.display()
        };
        cell.emit(KernelMessage::stream(Some(cell.token), &format!("{text}\n")));
        return Ok(Flow::Continue);
    }
    if let Some((name, expr)) = line.split_once('=') {
        let name = name.trim();
        if is_identifier(name) && !expr.starts_with('=') {
            let value = eval(cell.state, expr)?;
            cell.state.variables.insert(name.to_string(), value);
            return Ok(Flow::Continue);
        }
    }

    let value = eval(cell.state, line)?;
    if last {
        cell.emit_new(
            MSG_EXECUTE_RESULT,
            json!({"data": {"text/plain": value.repr()}, "metadata": {}}),
        );
    }
    Ok(Flow::Continue)
}

fn call_arg<'a>(line: &'a str, func: &str) -> Option<&'a str> {
    line.strip_prefix(func)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
}

fn import_target(line: &str) -> Option<&str> {
    if let Some(rest) = line.strip_prefix("import ") {
        return rest.split_whitespace().next();
    }
    let rest = line.strip_prefix("from ")?;
    let (module, _) = rest.split_once(" import ")?;
    Some(module.trim())
}

fn unquote(s: &str) -> Option<&str> {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .or_else(|| s.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn eval(state: &FakeState, expr: &str) -> Result<Value, Raised> {
    let mut acc: Option<Value> = None;
    for term in expr.split('+') {
        let term = term.trim();
        let value = if let Some(text) = unquote(term) {
            Value::Str(text.to_string())
        } else if let Ok(n) = term.parse::<i64>() {
            Value::Int(n)
        } else if is_identifier(term) {
            state
                .variables
                .get(term)
                .cloned()
                .ok_or_else(|| Raised::new("NameError", format!("name '{term}' is not defined")))?
        } else {
            return Err(Raised::new("SyntaxError", "invalid syntax"));
        };
        acc = Some(match (acc, value) {
            (None, v) => v,
            (Some(Value::Int(a)), Value::Int(b)) => Value::Int(a + b),
            (Some(Value::Str(a)), Value::Str(b)) => Value::Str(a + &b),
            (Some(_), _) => {
                return Err(Raised::new(
                    "TypeError",
                    "unsupported operand type(s) for +",
                ));
            }
        });
    }
    acc.ok_or_else(|| Raised::new("SyntaxError", "invalid syntax"))
}

/// Hands out one [`FakeEngine`] per session and keeps their controls.
#[derive(Clone, Default)]
pub struct FakeEngineFactory {
    missing_modules: Arc<Mutex<HashSet<String>>>,
    silent_readiness_checks: Arc<AtomicUsize>,
    created: Arc<Mutex<Vec<(PathBuf, FakeKernelControl)>>>,
}

impl FakeEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every engine created from now on reports `module` as not installed.
    pub fn with_missing_module(self, module: &str) -> Self {
        self.missing_modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(module.to_string());
        self
    }

    /// Every engine created from now on leaves its first `n` readiness
    /// checks unanswered.
    pub fn with_silent_readiness_checks(self, n: usize) -> Self {
        self.silent_readiness_checks.store(n, Ordering::SeqCst);
        self
    }

    pub fn created_count(&self) -> usize {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Control of the most recent engine whose workspace name starts with
    /// the conversation id.
    pub fn control_for(&self, conversation_id: &str) -> Option<FakeKernelControl> {
        let prefix = format!("{}-", crate::session::workspace_dir_name(conversation_id));
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|(dir, _)| {
                dir.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix))
            })
            .map(|(_, control)| control.clone())
    }
}

impl EngineFactory for FakeEngineFactory {
    fn create(&self, workdir: &Path) -> Box<dyn Engine> {
        let control = FakeKernelControl::default();
        {
            let missing = self
                .missing_modules
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for module in missing.iter() {
                control.mark_missing_module(module);
            }
        }
        control.ignore_next_readiness_checks(self.silent_readiness_checks.load(Ordering::SeqCst));
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((workdir.to_path_buf(), control.clone()));
        Box::new(FakeEngine::new(control))
    }
}

/// Installer double that records calls and fails for chosen packages.
#[derive(Clone, Default)]
pub struct FakeInstaller {
    failing: Arc<Mutex<HashSet<String>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(self, package: &str) -> Self {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(package.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl crate::deps::PackageInstaller for FakeInstaller {
    async fn install(&self, package: &str) -> Result<(), crate::deps::InstallError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(package.to_string());
        let fails = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(package);
        if fails {
            return Err(crate::deps::InstallError::Failed {
                status: "exit status: 1".to_string(),
                output: format!("ERROR: No matching distribution found for {package}"),
            });
        }
        Ok(())
    }
}
