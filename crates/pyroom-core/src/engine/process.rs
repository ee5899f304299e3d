use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Engine, EngineError, EngineFactory, KernelMessage, Recv};

const DRIVER_SOURCE: &str = include_str!("driver.py");

/// How long a stopping interpreter gets to exit on its own before it is killed.
const GRACEFUL_EXIT: Duration = Duration::from_secs(2);

/// Program and leading arguments used to launch the interpreter.
/// The driver source is appended as `-c <source>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for InterpreterCommand {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["-u".to_string()],
        }
    }
}

struct Running {
    child: Child,
    stdin: ChildStdin,
    messages: mpsc::UnboundedReceiver<KernelMessage>,
    io_tasks: Vec<JoinHandle<()>>,
}

/// An interpreter running as a child process speaking JSON lines.
pub struct ProcessEngine {
    command: InterpreterCommand,
    workdir: PathBuf,
    running: Option<Running>,
}

impl ProcessEngine {
    pub fn new(command: InterpreterCommand, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            workdir: workdir.into(),
            running: None,
        }
    }

    fn spawn(&self) -> Result<Running, EngineError> {
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .arg("-c")
            .arg(DRIVER_SOURCE)
            .current_dir(&self.workdir)
            .env("PYTHONUNBUFFERED", "1")
            .env("MPLBACKEND", "Agg")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::Spawn(format!("{}: {}", self.command.program, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Spawn("interpreter stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Spawn("interpreter stdout unavailable".to_string()))?;

        let (tx, messages) = mpsc::unbounded_channel();
        let workdir = self.workdir.display().to_string();
        let mut io_tasks = vec![tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<KernelMessage>(&line) {
                            Ok(msg) => {
                                if tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(target: "kernel", workdir = %workdir, error = %e, "Skipping malformed kernel line");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(target: "kernel", workdir = %workdir, error = %e, "Kernel output stream failed");
                        break;
                    }
                }
            }
        })];

        if let Some(stderr) = child.stderr.take() {
            let workdir = self.workdir.display().to_string();
            io_tasks.push(tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut line = String::new();

                while let Ok(len) = reader.read_line(&mut line).await {
                    if len == 0 {
                        break;
                    }
                    debug!(target: "kernel", "[{}] {}", workdir, line.trim_end());
                    line.clear();
                }
            }));
        }

        Ok(Running {
            child,
            stdin,
            messages,
            io_tasks,
        })
    }
}

#[async_trait]
impl Engine for ProcessEngine {
    async fn start(&mut self) -> Result<(), EngineError> {
        if self.running.is_some() {
            self.shutdown().await;
        }
        self.running = Some(self.spawn()?);
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        match self.running.as_mut() {
            Some(running) => matches!(running.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn send_execute(&mut self, token: &str, code: &str) -> Result<(), EngineError> {
        let running = self.running.as_mut().ok_or(EngineError::NotStarted)?;
        let mut line = serde_json::json!({ "msg_id": token, "code": code }).to_string();
        line.push('\n');

        let write = async {
            running.stdin.write_all(line.as_bytes()).await?;
            running.stdin.flush().await
        };
        write.await.map_err(|e| match e.kind() {
            std::io::ErrorKind::BrokenPipe => EngineError::Dead,
            _ => EngineError::Io(e),
        })
    }

    async fn recv(&mut self, timeout: Duration) -> Recv {
        let Some(running) = self.running.as_mut() else {
            return Recv::Closed;
        };
        match tokio::time::timeout(timeout, running.messages.recv()).await {
            Ok(Some(msg)) => Recv::Message(msg),
            Ok(None) => Recv::Closed,
            Err(_) => Recv::Timeout,
        }
    }

    async fn shutdown(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let Running {
            mut child,
            stdin,
            messages,
            io_tasks,
        } = running;

        // Closing stdin ends the driver's read loop.
        drop(stdin);
        drop(messages);

        match tokio::time::timeout(GRACEFUL_EXIT, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Interpreter exited"),
            Ok(Err(e)) => warn!(error = %e, "Failed waiting for interpreter exit"),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill interpreter");
                }
            }
        }

        for task in io_tasks {
            task.abort();
        }
    }
}

/// Creates a [`ProcessEngine`] per session.
#[derive(Debug, Clone, Default)]
pub struct ProcessEngineFactory {
    command: InterpreterCommand,
}

impl ProcessEngineFactory {
    pub fn new(command: InterpreterCommand) -> Self {
        Self { command }
    }
}

impl EngineFactory for ProcessEngineFactory {
    fn create(&self, workdir: &Path) -> Box<dyn Engine> {
        Box::new(ProcessEngine::new(self.command.clone(), workdir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ExecutionState, MessageKind};
    use tempfile::TempDir;

    fn python() -> InterpreterCommand {
        InterpreterCommand::default()
    }

    async fn wait_idle(engine: &mut ProcessEngine, token: &str) -> Vec<KernelMessage> {
        let mut seen = Vec::new();
        loop {
            match engine.recv(Duration::from_secs(10)).await {
                Recv::Message(msg) => {
                    let done = msg.is_idle_for(token);
                    seen.push(msg);
                    if done {
                        return seen;
                    }
                }
                other => panic!("unexpected recv outcome: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_program() {
        let dir = TempDir::new().unwrap();
        let mut engine = ProcessEngine::new(
            InterpreterCommand {
                program: "definitely-not-a-real-interpreter".to_string(),
                args: vec![],
            },
            dir.path(),
        );

        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn(ref msg) if msg.contains("definitely-not-a-real-interpreter")));
        assert!(!engine.is_alive());
    }

    #[tokio::test]
    async fn test_unstarted_engine_is_closed() {
        let dir = TempDir::new().unwrap();
        let mut engine = ProcessEngine::new(python(), dir.path());
        assert!(!engine.is_alive());
        assert!(matches!(
            engine.recv(Duration::from_millis(10)).await,
            Recv::Closed
        ));
        assert!(matches!(
            engine.send_execute("t", "1").await,
            Err(EngineError::NotStarted)
        ));
    }

    #[tokio::test]
    #[ignore = "requires python3 on PATH"]
    async fn test_python_driver_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut engine = ProcessEngine::new(python(), dir.path());
        engine.start().await.unwrap();

        let Recv::Message(first) = engine.recv(Duration::from_secs(10)).await else {
            panic!("expected startup status");
        };
        assert_eq!(first.kind(), MessageKind::Status(ExecutionState::Starting));

        engine.send_execute("t1", "x = 41\nprint('hi')\nx + 1").await.unwrap();
        let messages = wait_idle(&mut engine, "t1").await;
        let kinds: Vec<MessageKind> = messages.iter().map(KernelMessage::kind).collect();
        assert!(kinds.contains(&MessageKind::Stream {
            name: "stdout".to_string(),
            text: "hi".to_string()
        }));
        assert!(kinds.iter().any(|k| matches!(k, MessageKind::ExecuteResult { data } if data.get("text/plain").and_then(|v| v.as_str()) == Some("42"))));

        engine.send_execute("t2", "undefined_name").await.unwrap();
        let messages = wait_idle(&mut engine, "t2").await;
        assert!(messages.iter().any(|m| matches!(m.kind(), MessageKind::Error(ref f) if f.ename == "NameError")));

        engine.shutdown().await;
        assert!(!engine.is_alive());
    }

    #[tokio::test]
    #[ignore = "requires python3 on PATH"]
    async fn test_python_driver_input_cannot_read_requests() {
        let dir = TempDir::new().unwrap();
        let mut engine = ProcessEngine::new(python(), dir.path());
        engine.start().await.unwrap();

        // queue both before the first runs, so a reading input() would eat t2
        engine.send_execute("t1", "name = input('name? ')").await.unwrap();
        engine.send_execute("t2", "print('after')").await.unwrap();

        let messages = wait_idle(&mut engine, "t1").await;
        assert!(messages.iter().any(|m| matches!(m.kind(), MessageKind::Error(ref f) if f.ename == "StdinNotImplementedError")));

        let messages = wait_idle(&mut engine, "t2").await;
        assert!(messages.iter().any(|m| m.kind()
            == MessageKind::Stream {
                name: "stdout".to_string(),
                text: "after".to_string()
            }));

        engine.send_execute("t3", "import os\nos.read(0, 16)").await.unwrap();
        let messages = wait_idle(&mut engine, "t3").await;
        assert!(messages.iter().any(|m| matches!(m.kind(), MessageKind::ExecuteResult { data } if data.get("text/plain").and_then(|v| v.as_str()) == Some("b''"))));

        engine.shutdown().await;
    }

    #[tokio::test]
    #[ignore = "requires python3 on PATH"]
    async fn test_python_driver_exit_closes_stream() {
        let dir = TempDir::new().unwrap();
        let mut engine = ProcessEngine::new(python(), dir.path());
        engine.start().await.unwrap();
        engine.send_execute("t1", "import os; os._exit(3)").await.unwrap();

        let mut closed = false;
        for _ in 0..20 {
            if let Recv::Closed = engine.recv(Duration::from_secs(1)).await {
                closed = true;
                break;
            }
        }
        assert!(closed);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!engine.is_alive());
    }
}
