// Scripted stand-in for the Docker engine

use crate::engine::{CompileOutcome, ExecutionEngine, ExecutionSession, RunOutcome, RunOutput};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use exam_common::types::Language;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub fn ok(stdout: &str) -> RunOutput {
    RunOutput {
        outcome: RunOutcome::Ok,
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: Some(0),
        execution_time_ms: 5,
    }
}

pub fn crash() -> RunOutput {
    RunOutput {
        outcome: RunOutcome::RuntimeError,
        stdout: String::new(),
        stderr: "Traceback".to_string(),
        exit_code: Some(1),
        execution_time_ms: 5,
    }
}

pub fn hang() -> RunOutput {
    RunOutput::timed_out(1200)
}

#[derive(Default)]
struct Log {
    sessions: Vec<(Language, String)>,
    inputs: Vec<String>,
    closed: usize,
}

/// Answers each run by looking the input up in a script
#[derive(Clone)]
pub struct ScriptedEngine {
    compile: CompileOutcome,
    script: HashMap<String, RunOutput>,
    unavailable: bool,
    log: Arc<Mutex<Log>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            compile: CompileOutcome::Compiled,
            script: HashMap::new(),
            unavailable: false,
            log: Arc::default(),
        }
    }

    pub fn on(mut self, input: &str, output: RunOutput) -> Self {
        self.script.insert(input.to_string(), output);
        self
    }

    pub fn compile_with(mut self, outcome: CompileOutcome) -> Self {
        self.compile = outcome;
        self
    }

    /// Every session fails to open, like a missing daemon
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn inputs(&self) -> Vec<String> {
        self.log.lock().unwrap().inputs.clone()
    }

    pub fn sessions(&self) -> usize {
        self.log.lock().unwrap().sessions.len()
    }

    pub fn closed(&self) -> usize {
        self.log.lock().unwrap().closed
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    async fn open_session(&self, language: Language, source: &str) -> Result<Box<dyn ExecutionSession>> {
        if self.unavailable {
            bail!("Docker daemon unreachable");
        }
        self.log
            .lock()
            .unwrap()
            .sessions
            .push((language, source.to_string()));
        Ok(Box::new(ScriptedSession {
            engine: self.clone(),
        }))
    }
}

struct ScriptedSession {
    engine: ScriptedEngine,
}

#[async_trait]
impl ExecutionSession for ScriptedSession {
    async fn compile(&mut self) -> Result<CompileOutcome> {
        Ok(self.engine.compile.clone())
    }

    async fn run(&mut self, input: &str) -> Result<RunOutput> {
        self.engine.log.lock().unwrap().inputs.push(input.to_string());
        self.engine
            .script
            .get(input)
            .cloned()
            .ok_or_else(|| anyhow!("no scripted output for input {:?}", input))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.engine.log.lock().unwrap().closed += 1;
        Ok(())
    }
}
