use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use crate::config::ConfigDoc;
use crate::error::{Error, ErrorKind, Result};
use crate::log_sanitize::sanitize_log_line;
use crate::planner::Plan;
use crate::workspace::{CleanMode, WorkspaceConfig, WorkspacePaths};

pub type StepExecFn = fn(&ConfigDoc, &mut ExecCtx) -> Result<()>;

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskStarted {
        id: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskWarning {
        id: String,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Console sink used by the CLI. The log of a failed task is written to
/// `<log_root>/<timestamp>/<task>.log`.
#[derive(Default)]
pub struct StdoutSink {
    log_root: Option<PathBuf>,
    state: Mutex<StdoutSinkState>,
}

impl StdoutSink {
    pub fn with_log_root(log_root: PathBuf) -> Self {
        Self {
            log_root: Some(log_root),
            state: Mutex::default(),
        }
    }
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    tasks_started: usize,
    tasks_ok: usize,
    tasks_failed: usize,
    warnings: usize,
    total_task_ms: u128,
    failed_tasks: Vec<String>,
    task_logs: BTreeMap<String, VecDeque<String>>,
    error_logs_dir: Option<PathBuf>,
    error_log_paths: Vec<PathBuf>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        let Ok(mut s) = self.state.lock() else {
            return;
        };
        match ev {
            ExecEvent::TaskStarted { id } => {
                s.tasks_started += 1;
                s.started_at.get_or_insert_with(Instant::now);
                println!("RUN: {id}");
            }
            ExecEvent::TaskLog { id, line } => {
                remember_line(&mut s.task_logs, &id, &line);
                println!("[{id}] {line}");
            }
            ExecEvent::TaskWarning { id, line } => {
                s.warnings += 1;
                remember_line(&mut s.task_logs, &id, &format!("WARNING: {line}"));
                println!("[{id}] WARNING: {line}");
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                s.total_task_ms = s.total_task_ms.saturating_add(elapsed_ms);
                if ok {
                    s.tasks_ok += 1;
                    s.task_logs.remove(&id);
                    println!("DONE: {id} ({elapsed_ms}ms)");
                    return;
                }
                s.tasks_failed += 1;
                s.failed_tasks.push(id.clone());
                let err_text = error.unwrap_or_default();
                println!("FAIL: {id} ({elapsed_ms}ms) {err_text}");
                match write_task_error_log(&mut s, self.log_root.as_deref(), &id, &err_text, elapsed_ms) {
                    Ok(path) => println!("ERROR_LOG: {id} => {}", path.display()),
                    Err(e) => println!("WARN: failed to write task error log for {id}: {e}"),
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                println!("SUMMARY:");
                println!("  status: {}", if ok { "ok" } else { "failed" });
                println!(
                    "  tasks: started={} ok={} failed={} warnings={}",
                    s.tasks_started, s.tasks_ok, s.tasks_failed, s.warnings
                );
                println!("  elapsed: {}", format_elapsed_hms(wall.as_secs()));
                println!(
                    "  summed_task_time: {}",
                    format_elapsed_hms((s.total_task_ms / 1000) as u64)
                );
                if !s.failed_tasks.is_empty() {
                    println!("  failed_tasks: {}", s.failed_tasks.join(", "));
                }
                for p in &s.error_log_paths {
                    println!("  error_log: {}", p.display());
                }
                if let Some(e) = error.filter(|_| !ok) {
                    println!("  error: {e}");
                }
                *s = StdoutSinkState::default();
            }
        }
    }
}

/// Keeps every event in memory. Handy for tests and for callers that render
/// progress themselves.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ExecEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<ExecEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                ExecEvent::TaskLog { line, .. } => Some(line),
                ExecEvent::TaskWarning { line, .. } => Some(format!("WARNING: {line}")),
                _ => None,
            })
            .collect()
    }
}

impl ExecSink for MemorySink {
    fn emit(&self, ev: ExecEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(ev);
        }
    }
}

#[derive(Default)]
struct SharedExecState {
    // Set once by core.init; every later step reads it.
    workspace_paths: Mutex<Option<WorkspacePaths>>,
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    /// Skip the pause before continuing past a non-fatal warning.
    pub assume_yes: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_task_id: Option<String>,
    shared: Arc<SharedExecState>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            assume_yes: false,
            sink,
            current_task_id: None,
            shared: Arc::new(SharedExecState::default()),
        }
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    fn task_id(&self) -> String {
        self.current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into())
    }

    pub fn set_workspace_paths(&self, paths: WorkspacePaths) {
        if let Ok(mut g) = self.shared.workspace_paths.lock() {
            *g = Some(paths);
        }
    }

    pub fn workspace_paths(&self) -> Option<WorkspacePaths> {
        self.shared
            .workspace_paths
            .lock()
            .ok()
            .and_then(|g| g.clone())
    }

    /// Workspace paths for steps that run without core.init (single-stage
    /// invocations). Cleaning only ever happens in core.init.
    pub fn workspace_paths_or_init(&self, doc: &ConfigDoc) -> Result<WorkspacePaths> {
        if let Some(p) = self.workspace_paths() {
            return Ok(p);
        }
        let mut ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
        ws.clean = CleanMode::None;
        let paths = crate::workspace::init_dirs(&ws)?;
        self.set_workspace_paths(paths.clone());
        Ok(paths)
    }

    pub fn log(&self, msg: &str) {
        tracing::debug!(task = %self.task_id(), "{msg}");
        self.sink.emit(ExecEvent::TaskLog {
            id: self.task_id(),
            line: msg.to_string(),
        });
    }

    pub fn warn(&self, msg: &str) {
        tracing::warn!(task = %self.task_id(), "{msg}");
        self.sink.emit(ExecEvent::TaskWarning {
            id: self.task_id(),
            line: msg.to_string(),
        });
    }

    /// Run a command, streaming its sanitized output into the task log.
    pub fn run_cmd(&self, mut cmd: Command) -> Result<()> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        if self.dry_run {
            self.log(&format!("DRY-RUN: {:?}", cmd));
            return Ok(());
        }
        tracing::debug!(?cmd, "spawning");

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::missing(format!("failed to spawn {program}: {e}")))?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_log_line(&line);
            if !line.is_empty() {
                self.log(&line);
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait for {program} failed: {e}")))?;
        if !status.success() {
            return Err(Error::new(
                ErrorKind::ToolFailed,
                format!("{program} failed: {status}"),
            ));
        }
        Ok(())
    }

    /// Run a read-only query and return its stdout. Queries run in dry-run
    /// mode too, since guards need their answers.
    pub fn query_cmd(&self, mut cmd: Command) -> Result<String> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        tracing::debug!(?cmd, "query");
        let out = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::missing(format!("failed to spawn {program}: {e}")))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(Error::new(
                ErrorKind::ToolFailed,
                format!("{program} failed: {}: {}", out.status, stderr.trim()),
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

/// Fail with a missing-prerequisite error unless every tool is on `PATH`.
pub fn require_tools(tools: &[&str]) -> Result<()> {
    let path = std::env::var_os("PATH").unwrap_or_default();
    let dirs: Vec<PathBuf> = std::env::split_paths(&path).collect();
    let missing: Vec<&str> = tools
        .iter()
        .copied()
        .filter(|tool| !dirs.iter().any(|d| d.join(tool).is_file()))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(Error::missing(format!(
        "required tool(s) not found on PATH: {}",
        missing.join(", ")
    )))
}

#[derive(Default)]
pub struct StepRegistry {
    exec: BTreeMap<&'static str, StepExecFn>,
}

impl StepRegistry {
    pub fn add(&mut self, id: &'static str, f: StepExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate step executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<StepExecFn> {
        self.exec.get(id).copied()
    }

    pub fn ids(&self) -> BTreeSet<&'static str> {
        self.exec.keys().copied().collect()
    }
}

pub trait StageExec {
    fn register_steps(reg: &mut StepRegistry) -> Result<()>;
}

/// Run every task of the plan in order, stopping at the first failure.
pub fn execute_plan(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &StepRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    let ordered = plan.ordered()?;
    for task in &ordered {
        if reg.get(&task.id).is_none() {
            return Err(Error::msg(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        }
    }

    for task in ordered {
        let Some(exec) = reg.get(&task.id) else {
            continue;
        };
        ctx.sink.emit(ExecEvent::TaskStarted {
            id: task.id.clone(),
        });
        ctx.set_task(task.id.clone());
        let start = Instant::now();
        let res = exec(doc, ctx);
        let elapsed_ms = start.elapsed().as_millis();
        if let Err(e) = res {
            ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: false,
                error: Some(e.to_string()),
                elapsed_ms,
            });
            let e = e.context(format!("task '{}' failed", task.id));
            ctx.sink.emit(ExecEvent::ExecutorDone {
                ok: false,
                error: Some(e.to_string()),
            });
            return Err(e);
        }
        ctx.sink.emit(ExecEvent::TaskFinished {
            id: task.id.clone(),
            ok: true,
            error: None,
            elapsed_ms,
        });
    }
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
    });
    Ok(())
}

pub fn builtin_registry() -> Result<StepRegistry> {
    use crate::stages;

    let mut reg = StepRegistry::default();
    stages::core::CoreStage::register_steps(&mut reg)?;
    stages::source::SourceStage::register_steps(&mut reg)?;
    stages::build::BuildStage::register_steps(&mut reg)?;
    stages::package::PackageStage::register_steps(&mut reg)?;
    stages::publish::PublishStage::register_steps(&mut reg)?;
    Ok(reg)
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let mut flush = |pending: &mut Vec<u8>| {
        if !pending.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(pending).into_owned());
            pending.clear();
        }
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                flush(&mut pending);
            } else {
                pending.push(b);
                if pending.len() >= MAX_PENDING_BYTES {
                    flush(&mut pending);
                }
            }
        }
    }
    flush(&mut pending);
}

fn remember_line(task_logs: &mut BTreeMap<String, VecDeque<String>>, task_id: &str, line: &str) {
    const MAX_LINES: usize = 4000;
    let q = task_logs.entry(task_id.to_string()).or_default();
    while q.len() >= MAX_LINES {
        q.pop_front();
    }
    q.push_back(sanitize_log_line(line));
}

fn write_task_error_log(
    state: &mut StdoutSinkState,
    log_root: Option<&Path>,
    task_id: &str,
    error: &str,
    elapsed_ms: u128,
) -> Result<PathBuf> {
    let dir = match state.error_logs_dir.clone() {
        Some(dir) => dir,
        None => {
            let root = match log_root {
                Some(r) => r.to_path_buf(),
                None => std::env::current_dir()
                    .unwrap_or_else(|_| PathBuf::from("."))
                    .join("build")
                    .join("logs"),
            };
            let dir = root.join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
            fs::create_dir_all(&dir).map_err(|e| {
                Error::msg(format!(
                    "failed to create error logs dir {}: {e}",
                    dir.display()
                ))
            })?;
            state.error_logs_dir = Some(dir.clone());
            dir
        }
    };
    let path = dir.join(format!("{}.log", sanitize_filename_component(task_id)));

    let mut body = format!("task: {task_id}\nstatus: failed\nelapsed_ms: {elapsed_ms}\n");
    if !error.trim().is_empty() {
        body.push_str(&format!("error: {error}\n"));
    }
    body.push_str("\nlogs:\n");
    for line in state.task_logs.get(task_id).into_iter().flatten() {
        body.push_str(line);
        body.push('\n');
    }

    fs::write(&path, body).map_err(|e| {
        Error::msg(format!(
            "failed to write task error log {}: {e}",
            path.display()
        ))
    })?;
    state.error_log_paths.push(path.clone());
    Ok(path)
}

fn sanitize_filename_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "task".into() } else { out }
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
