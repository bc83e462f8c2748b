//! Per-runbook sequencer: owns the runner pools and the store, drives the
//! declared steps in order with conditions, loops and side-runners.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opsbook_core::book::{Book, RunnerConfig};
use opsbook_core::error::ConfigError;
use opsbook_core::expr::{eval_cond, eval_expand, explain, FuncMap};
use opsbook_core::load_book;
use opsbook_core::step::{IncludeConfig, LoopSpec, Step, StepKind};
use opsbook_core::store::{Store, CURRENT_KEY, INCLUDED_KEY, PREVIOUS_KEY};
use serde_json::{Map, Value};
use tracing::debug;

use crate::capture::{CaptureEvent, Capturer, CapturerList, Debugger};
use crate::error::ExecError;
use crate::profile::Stopwatch;
use crate::result::RunResult;
use crate::retry::Loop;
use crate::runner::bind::BindRunner;
use crate::runner::cdp::CdpRunner;
use crate::runner::db::{parse_db_query, DbRunner};
use crate::runner::dump::DumpRunner;
use crate::runner::exec::{parse_exec_command, ExecRunner};
use crate::runner::grpc::{parse_grpc_request, GrpcRunner};
use crate::runner::http::{parse_http_request, HttpRunner};
use crate::runner::test::TestRunner;
use crate::runner::{stdout_sink, OutSink, RunnerError, StepHandle};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

pub type BeforeHook = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;
pub type AfterHook = Arc<dyn Fn(&RunResult) -> Result<(), String> + Send + Sync>;

/// Build-time options layered over what the book declares.
#[derive(Clone, Default)]
pub struct Options {
    pub debug: Option<bool>,
    pub profile: bool,
    pub fail_fast: Option<bool>,
    pub skip_test: Option<bool>,
    pub interval: Option<Duration>,
    /// Overlaid on the book's `vars`.
    pub vars: Map<String, Value>,
    pub funcs: FuncMap,
    pub capturers: CapturerList,
    pub before_hooks: Vec<BeforeHook>,
    pub after_hooks: Vec<AfterHook>,
    pub stopwatch: Option<Arc<Stopwatch>>,
    pub out: Option<OutSink>,
}

/// The typed runner pools an operator owns, keyed by the user-chosen
/// runner names.
#[derive(Default)]
pub struct RunnerPools {
    pub http: BTreeMap<String, HttpRunner>,
    pub db: BTreeMap<String, DbRunner>,
    pub grpc: BTreeMap<String, GrpcRunner>,
    pub cdp: BTreeMap<String, CdpRunner>,
}

/// Everything an included child book inherits from its parent.
pub(crate) struct IncludeEnv {
    funcs: FuncMap,
    capturers: CapturerList,
    profile: bool,
    skip_test: bool,
    sw: Arc<Stopwatch>,
    out: OutSink,
    trail: Vec<String>,
}

pub struct Operator {
    id: String,
    desc: String,
    book_path: Option<PathBuf>,
    root: PathBuf,
    steps: Arc<Vec<Step>>,
    store: Store,
    runners: RunnerPools,
    use_map: bool,
    profile: bool,
    interval: Duration,
    cond: Option<String>,
    skip_test: bool,
    fail_fast: bool,
    included: bool,
    skipped: bool,
    capturers: CapturerList,
    before_hooks: Vec<BeforeHook>,
    after_hooks: Vec<AfterHook>,
    sw: Arc<Stopwatch>,
    run_result: RunResult,
    out: OutSink,
    trail: Vec<String>,
}

impl Operator {
    pub fn new(book: Book, opts: &Options) -> Result<Self, ExecError> {
        Self::build(book, opts, false, Vec::new())
    }

    fn build(
        book: Book,
        opts: &Options,
        included: bool,
        parent_trail: Vec<String>,
    ) -> Result<Self, ExecError> {
        let debug = opts.debug.unwrap_or(book.debug);
        let root = book.root();

        let mut vars = book.vars.clone();
        for (k, v) in &opts.vars {
            vars.insert(k.clone(), v.clone());
        }
        let step_keys: Vec<String> = book.steps.iter().map(|s| s.key.clone()).collect();
        let store = Store::new(vars, opts.funcs.clone(), book.use_map, step_keys);

        let mut capturers = opts.capturers.clone();
        if debug {
            capturers = capturers.with(Arc::new(Debugger::stderr()) as Arc<dyn Capturer>);
        }

        let mut runners = RunnerPools::default();
        for (name, cfg) in &book.runners {
            match cfg {
                RunnerConfig::Http(c) => {
                    runners.http.insert(name.clone(), HttpRunner::new(name, c)?);
                }
                RunnerConfig::Db(c) => {
                    runners.db.insert(name.clone(), DbRunner::new(name, c));
                }
                RunnerConfig::Grpc(c) => {
                    // Proto and TLS material paths resolve against the
                    // book's directory.
                    let mut c = c.clone();
                    let rooted = |p: &PathBuf| {
                        if p.is_absolute() {
                            p.clone()
                        } else {
                            root.join(p)
                        }
                    };
                    c.import_paths = c.import_paths.iter().map(&rooted).collect();
                    c.protos = c.protos.iter().map(&rooted).collect();
                    c.cacert = c.cacert.as_ref().map(&rooted);
                    c.cert = c.cert.as_ref().map(&rooted);
                    c.key = c.key.as_ref().map(&rooted);
                    runners.grpc.insert(name.clone(), GrpcRunner::new(name, &c));
                }
                RunnerConfig::Cdp(c) => {
                    runners.cdp.insert(name.clone(), CdpRunner::new(name, c));
                }
            }
        }

        let id = format!("runbook-{:06}", NEXT_ID.fetch_add(1, Ordering::Relaxed));
        let desc = book.desc.clone();
        let book_path = book.path.clone();
        let path_or_id = book_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| id.clone());
        let mut trail = parent_trail;
        trail.push(desc.clone());

        Ok(Self {
            id,
            run_result: RunResult::new(&desc, &path_or_id),
            desc,
            book_path,
            root,
            steps: Arc::new(book.steps),
            store,
            runners,
            use_map: book.use_map,
            profile: opts.profile,
            interval: opts.interval.unwrap_or(book.interval),
            cond: book.cond,
            skip_test: opts.skip_test.unwrap_or(book.skip_test),
            fail_fast: opts.fail_fast.unwrap_or(book.fail_fast),
            included,
            skipped: false,
            capturers,
            before_hooks: opts.before_hooks.clone(),
            after_hooks: opts.after_hooks.clone(),
            sw: opts
                .stopwatch
                .clone()
                .unwrap_or_else(|| Arc::new(Stopwatch::new(opts.profile))),
            out: opts.out.clone().unwrap_or_else(stdout_sink),
            trail,
        })
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn book_path(&self) -> Option<&PathBuf> {
        self.book_path.as_ref()
    }

    pub fn book_path_or_id(&self) -> String {
        self.book_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| self.id.clone())
    }

    pub fn cond(&self) -> Option<&str> {
        self.cond.as_deref()
    }

    pub fn skipped(&self) -> bool {
        self.skipped
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    pub fn result(&self) -> &RunResult {
        &self.run_result
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn runners_mut(&mut self) -> &mut RunnerPools {
        &mut self.runners
    }

    pub fn dump_profile<W: std::io::Write>(&self, w: &mut W) -> std::io::Result<()> {
        self.sw.dump_profile(w)
    }

    /// Paths of books this one includes, used by skip-included filtering.
    pub fn included_paths(&self) -> Vec<PathBuf> {
        self.steps
            .iter()
            .filter_map(|s| match &s.kind {
                StepKind::Include(cfg) => Some(if cfg.path.is_absolute() {
                    cfg.path.clone()
                } else {
                    self.root.join(&cfg.path)
                }),
                _ => None,
            })
            .collect()
    }

    pub async fn run(&mut self) -> Result<(), ExecError> {
        let sw = self.sw.clone();
        let result = {
            let _span = sw.span(format!("runbook {}", self.book_path_or_id()));
            self.capturers
                .capture(CaptureEvent::RunbookStart {
                    trail: self.trail.clone(),
                    path: self.book_path.as_ref().map(|p| p.display().to_string()),
                    desc: self.desc.clone(),
                })
                .await;
            let result = self.run_internal().await;
            match &result {
                Err(e) => {
                    self.capturers
                        .capture(CaptureEvent::RunbookFailure {
                            desc: self.desc.clone(),
                            error: e.to_string(),
                        })
                        .await;
                }
                Ok(()) if self.skipped => {
                    self.capturers
                        .capture(CaptureEvent::RunbookSkipped {
                            desc: self.desc.clone(),
                        })
                        .await;
                }
                Ok(()) => {
                    self.capturers
                        .capture(CaptureEvent::RunbookSuccess {
                            desc: self.desc.clone(),
                        })
                        .await;
                }
            }
            self.capturers
                .capture(CaptureEvent::RunbookEnd {
                    trail: self.trail.clone(),
                    path: self.book_path.as_ref().map(|p| p.display().to_string()),
                    desc: self.desc.clone(),
                })
                .await;
            result
        };
        self.close().await;
        result.map_err(|e| ExecError::Book {
            book: self.book_path_or_id(),
            source: Box::new(e),
        })
    }

    async fn close(&mut self) {
        for r in self.runners.grpc.values_mut() {
            r.close();
        }
        for r in self.runners.cdp.values_mut() {
            r.close().await;
        }
    }

    async fn run_internal(&mut self) -> Result<(), ExecError> {
        if let Some(cond) = self.cond.clone() {
            let mut snapshot = self.store.to_map();
            snapshot.insert(INCLUDED_KEY.to_string(), Value::Bool(self.included));
            if !eval_cond(&cond, &self.store.env(&snapshot))? {
                debug!(desc = %self.desc, "skipping runbook (if condition is false)");
                self.skipped = true;
                self.run_result.skipped = true;
                return Ok(());
            }
        }

        let sw = self.sw.clone();
        for (i, hook) in self.before_hooks.iter().enumerate() {
            let _span = sw.span(format!("before hook {i}"));
            hook().map_err(|message| ExecError::BeforeFunc { index: i, message })?;
        }

        let result = self.run_steps().await;

        self.run_result.error = result.as_ref().err().map(|e| e.to_string());
        self.run_result.skipped = self.skipped;

        // After hooks run in order regardless of the step outcome; a hook
        // failure overrides the outgoing error.
        let mut out = result;
        for (i, hook) in self.after_hooks.iter().enumerate() {
            let _span = sw.span(format!("after hook {i}"));
            if let Err(message) = hook(&self.run_result) {
                out = Err(ExecError::AfterFunc { index: i, message });
            }
        }
        out
    }

    async fn run_steps(&mut self) -> Result<(), ExecError> {
        let steps = Arc::clone(&self.steps);
        let sw = self.sw.clone();
        for (i, step) in steps.iter().enumerate() {
            let step_name = step_display_name(&self.desc, &step.key, i, self.use_map);
            self.capturers
                .capture(CaptureEvent::StepStart {
                    step: step_name.clone(),
                    runner: runner_label(step),
                })
                .await;
            let _span = sw.span(step_name.clone());

            if i != 0 && !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }

            if let Some(cond) = &step.cond {
                let mut snapshot = self.store.to_map();
                snapshot.insert(INCLUDED_KEY.to_string(), Value::Bool(self.included));
                let pass = eval_cond(cond, &self.store.env(&snapshot))?;
                if !pass {
                    debug!(step = %step_name, "skipping step (if condition is false)");
                    self.capturers
                        .capture(CaptureEvent::StepSkipped {
                            step: step_name.clone(),
                        })
                        .await;
                    self.store.skip_step();
                    continue;
                }
            }

            let result = if let Some(spec) = &step.loop_spec {
                self.run_step_with_loop(step, spec, &step_name).await
            } else {
                self.run_step_once(step, &step_name).await
            };
            result.map_err(|e| match e {
                wrapped @ ExecError::Step { .. } => wrapped,
                other => other.on_step(step.kind.label(), step_name.clone()),
            })?;
        }
        Ok(())
    }

    async fn run_step_with_loop(
        &mut self,
        step: &Step,
        spec: &LoopSpec,
        step_name: &str,
    ) -> Result<(), ExecError> {
        let lp = Loop::new(spec);
        let count = {
            let snapshot = self.store.to_map();
            lp.count(&self.store.env(&snapshot))?
        };
        let mut success = lp.until().is_none();
        let mut tree = String::new();
        let mut j = 0;
        while j < count {
            self.store.set_loop_index(j);
            if let Err(e) = self.run_step_once(step, step_name).await {
                self.store.clear_loop_index();
                return Err(e);
            }
            if let Some(until) = lp.until() {
                let mut snapshot = self.store.to_map();
                if let Some(previous) = self.store.previous() {
                    snapshot.insert(PREVIOUS_KEY.to_string(), previous.clone());
                }
                if let Some(latest) = self.store.latest() {
                    snapshot.insert(CURRENT_KEY.to_string(), latest.clone());
                }
                let env = self.store.env(&snapshot);
                tree = explain(until, &env);
                let pass = match eval_cond(until, &env) {
                    Ok(pass) => pass,
                    Err(e) => {
                        self.store.clear_loop_index();
                        return Err(e.into());
                    }
                };
                if pass {
                    success = true;
                    break;
                }
            }
            j += 1;
            if j < count {
                tokio::time::sleep(lp.interval(j - 1)).await;
            }
        }
        self.store.clear_loop_index();
        if !success {
            return Err(ExecError::LoopExhausted {
                until: lp.until().unwrap_or_default().to_string(),
                count,
                tree,
            });
        }
        Ok(())
    }

    async fn run_step_once(&mut self, step: &Step, step_name: &str) -> Result<(), ExecError> {
        let include_env = self.include_env();
        let mut handle = StepHandle {
            store: &mut self.store,
            capturers: &self.capturers,
            root: &self.root,
            included: self.included,
            skip_test: self.skip_test,
            out: &self.out,
        };
        run_step_fn(step, &mut self.runners, &mut handle, &include_env, step_name).await
    }

    fn include_env(&self) -> IncludeEnv {
        IncludeEnv {
            funcs: self.store.funcs().clone(),
            capturers: self.capturers.clone(),
            profile: self.profile,
            skip_test: self.skip_test,
            sw: self.sw.clone(),
            out: self.out.clone(),
            trail: self.trail.clone(),
        }
    }
}

fn step_display_name(desc: &str, key: &str, index: usize, use_map: bool) -> String {
    if use_map {
        format!("'{desc}'.steps.{key}")
    } else {
        format!("'{desc}'.steps[{index}]")
    }
}

fn runner_label(step: &Step) -> String {
    match &step.kind {
        StepKind::Http { runner, .. }
        | StepKind::Db { runner, .. }
        | StepKind::Grpc { runner, .. }
        | StepKind::Cdp { runner, .. } => runner.clone(),
        StepKind::Exec { .. } => "exec".to_string(),
        StepKind::Include(_) => "include".to_string(),
        StepKind::None => {
            if step.test_cond.is_some() {
                "test".to_string()
            } else if step.dump.is_some() {
                "dump".to_string()
            } else {
                "bind".to_string()
            }
        }
    }
}

fn missing_runner(step_name: &str, key: &str) -> ExecError {
    ExecError::Config(ConfigError::UnknownRunnerKey {
        step: step_name.to_string(),
        key: key.to_string(),
    })
}

async fn run_step_fn(
    step: &Step,
    runners: &mut RunnerPools,
    h: &mut StepHandle<'_>,
    inc: &IncludeEnv,
    step_name: &str,
) -> Result<(), ExecError> {
    let mut ran = false;
    match &step.kind {
        StepKind::Http { runner, request } => {
            let Some(r) = runners.http.get_mut(runner) else {
                return Err(missing_runner(step_name, runner));
            };
            let expanded = h.expand(request)?;
            let req = parse_http_request(&expanded)?;
            r.run(h, req).await?;
            ran = true;
        }
        StepKind::Db { runner, query } => {
            let Some(r) = runners.db.get_mut(runner) else {
                return Err(missing_runner(step_name, runner));
            };
            let expanded = h.expand(query)?;
            let q = parse_db_query(&expanded)?;
            r.run(h, q).await?;
            ran = true;
        }
        StepKind::Grpc { runner, request } => {
            let Some(r) = runners.grpc.get_mut(runner) else {
                return Err(missing_runner(step_name, runner));
            };
            // Params stay raw here; each message expands right before it
            // is sent.
            let req = parse_grpc_request(request)?;
            r.run(h, req).await?;
            ran = true;
        }
        StepKind::Cdp { runner, actions } => {
            let Some(r) = runners.cdp.get_mut(runner) else {
                return Err(missing_runner(step_name, runner));
            };
            let expanded = h.expand(actions)?;
            r.run(h, expanded).await?;
            ran = true;
        }
        StepKind::Exec { command } => {
            let expanded = h.expand(command)?;
            let c = parse_exec_command(&expanded)?;
            ExecRunner.run(h, c).await?;
            ran = true;
        }
        StepKind::Include(cfg) => {
            run_include(cfg, h, inc).await?;
            ran = true;
        }
        StepKind::None => {}
    }

    if let Some(d) = &step.dump {
        DumpRunner
            .run(h, d, !ran)
            .await
            .map_err(|e| ExecError::from(e).on_step("dump", step_name.to_string()))?;
        ran = true;
    }
    if !step.bind.is_empty() {
        if !ran {
            h.store.record(Map::new());
            ran = true;
        }
        BindRunner
            .run(h, &step.bind)
            .await
            .map_err(|e| ExecError::from(e).on_step("bind", step_name.to_string()))?;
    }
    if let Some(cond) = &step.test_cond {
        if h.skip_test {
            debug!(step = %step_name, "skipping test (skipTest is set)");
            if !ran {
                h.store.skip_step();
            }
            return Ok(());
        }
        if !ran {
            h.store.record(Map::new());
            ran = true;
        }
        TestRunner
            .run(h, cond)
            .await
            .map_err(|e| ExecError::from(e).on_step("test", step_name.to_string()))?;
    }

    if !ran {
        return Err(RunnerError::invalid("step", "step declares no runner").into());
    }
    Ok(())
}

fn run_include<'a>(
    cfg: &'a IncludeConfig,
    h: &'a mut StepHandle<'_>,
    inc: &'a IncludeEnv,
) -> Pin<Box<dyn Future<Output = Result<(), ExecError>> + Send + 'a>> {
    Box::pin(async move {
        let path = if cfg.path.is_absolute() {
            cfg.path.clone()
        } else {
            h.root.join(&cfg.path)
        };
        let book = load_book(&path)?;

        // The include's vars expand against the parent snapshot before the
        // child ever runs.
        let overlay = {
            let snapshot = h.store.to_map();
            let env = h.store.env(&snapshot);
            match eval_expand(&Value::Object(cfg.vars.clone()), &env)? {
                Value::Object(m) => m,
                _ => Map::new(),
            }
        };

        let opts = Options {
            debug: Some(false),
            profile: inc.profile,
            fail_fast: None,
            skip_test: Some(inc.skip_test || cfg.skip_test),
            interval: None,
            vars: overlay,
            funcs: inc.funcs.clone(),
            capturers: inc.capturers.clone(),
            before_hooks: Vec::new(),
            after_hooks: Vec::new(),
            stopwatch: Some(inc.sw.clone()),
            out: Some(inc.out.clone()),
        };
        let mut child = Operator::build(book, &opts, true, inc.trail.clone())?;
        child.run().await?;
        h.store.record(child.store.to_map());
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_names_follow_the_recording_mode() {
        assert_eq!(step_display_name("b", "2", 2, false), "'b'.steps[2]");
        assert_eq!(step_display_name("b", "login", 0, true), "'b'.steps.login");
    }
}
