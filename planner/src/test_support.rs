//! Test-only helpers: spec-tree builders and a scripted oracle.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::types::{
    CompileRequest, CompileResponse, GenerateRequest, GenerateResponse, GeneratedFile,
    ProposedChild,
};
use crate::error::ProviderError;
use crate::io::provider::Provider;
use crate::spec::{LEAF_PARAM, Parameter, SourceRange, SpecKind, SpecNode};

/// Root of a parsed tree.
pub fn root(children: Vec<SpecNode>) -> SpecNode {
    SpecNode {
        kind: SpecKind::Root { children },
        source: SourceRange::default(),
    }
}

/// Module with no parameters.
pub fn module(name: &str, children: Vec<SpecNode>) -> SpecNode {
    module_with(name, Vec::new(), children)
}

/// Module whose first parameter is the bare `leaf` marker.
pub fn leaf_module(name: &str, children: Vec<SpecNode>) -> SpecNode {
    module_with(name, vec![param(LEAF_PARAM, None)], children)
}

pub fn module_with(name: &str, parameters: Vec<Parameter>, children: Vec<SpecNode>) -> SpecNode {
    SpecNode {
        kind: SpecKind::Module {
            name: name.to_string(),
            parameters,
            children,
        },
        source: SourceRange::default(),
    }
}

pub fn prose(text: &str) -> SpecNode {
    SpecNode {
        kind: SpecKind::Prose {
            text: text.to_string(),
        },
        source: SourceRange::default(),
    }
}

pub fn param(name: &str, value: Option<&str>) -> Parameter {
    Parameter {
        name: name.to_string(),
        value: value.map(str::to_string),
    }
}

/// Oracle-proposed child.
pub fn child(name: &str, is_leaf: bool, spec: &str) -> ProposedChild {
    ProposedChild {
        name: name.to_string(),
        is_leaf,
        spec: spec.to_string(),
        context: None,
        files: Vec::new(),
        commands: Vec::new(),
    }
}

pub fn file(path: &str, content: &str) -> GeneratedFile {
    GeneratedFile {
        path: path.to_string(),
        content: content.to_string(),
    }
}

type CompileFn = Box<dyn Fn(&CompileRequest) -> CompileResponse + Send + Sync>;

/// Deterministic oracle answering from per-node scripts.
///
/// Replies queued for a node path are consumed in order; the last one is
/// repeated once the queue is down to one entry. Unscripted nodes get an
/// empty answer (no children, no files) unless a fallback is installed.
#[derive(Default)]
pub struct ScriptedProvider {
    compile_replies: Mutex<BTreeMap<String, VecDeque<Result<CompileResponse, String>>>>,
    generate_replies: Mutex<BTreeMap<String, VecDeque<Result<GenerateResponse, String>>>>,
    compile_fallback: Option<CompileFn>,
    compile_log: Mutex<Vec<CompileRequest>>,
    generate_log: Mutex<Vec<GenerateRequest>>,
    compile_calls: AtomicUsize,
    generate_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    reachable: bool,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            reachable: true,
            ..Self::default()
        }
    }

    pub fn compile_reply(self, node_path: &str, response: CompileResponse) -> Self {
        self.push_compile(node_path, Ok(response))
    }

    pub fn fail_compile(self, node_path: &str, message: &str) -> Self {
        self.push_compile(node_path, Err(message.to_string()))
    }

    pub fn generate_reply(self, node_path: &str, response: GenerateResponse) -> Self {
        self.push_generate(node_path, Ok(response))
    }

    pub fn fail_generate(self, node_path: &str, message: &str) -> Self {
        self.push_generate(node_path, Err(message.to_string()))
    }

    /// Answer every unscripted compile request with `f`.
    pub fn compile_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&CompileRequest) -> CompileResponse + Send + Sync + 'static,
    {
        self.compile_fallback = Some(Box::new(f));
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    pub fn compile_calls(&self) -> usize {
        self.compile_calls.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    /// Most compile calls that were ever awaiting a reply at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Compile requests received for `node_path`, in arrival order.
    pub fn compile_requests(&self, node_path: &str) -> Vec<CompileRequest> {
        self.compile_log
            .lock()
            .expect("compile log")
            .iter()
            .filter(|r| r.node_path == node_path)
            .cloned()
            .collect()
    }

    pub fn generate_requests(&self) -> Vec<GenerateRequest> {
        self.generate_log.lock().expect("generate log").clone()
    }

    fn push_compile(self, node_path: &str, reply: Result<CompileResponse, String>) -> Self {
        self.compile_replies
            .lock()
            .expect("compile replies")
            .entry(node_path.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    fn push_generate(self, node_path: &str, reply: Result<GenerateResponse, String>) -> Self {
        self.generate_replies
            .lock()
            .expect("generate replies")
            .entry(node_path.to_string())
            .or_default()
            .push_back(reply);
        self
    }
}

fn next_reply<T: Clone>(
    replies: &Mutex<BTreeMap<String, VecDeque<Result<T, String>>>>,
    node_path: &str,
) -> Option<Result<T, String>> {
    let mut replies = replies.lock().expect("scripted replies");
    let queue = replies.get_mut(node_path)?;
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

impl Provider for ScriptedProvider {
    async fn compile(&self, request: &CompileRequest) -> Result<CompileResponse, ProviderError> {
        self.compile_calls.fetch_add(1, Ordering::SeqCst);
        self.compile_log
            .lock()
            .expect("compile log")
            .push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        // Let sibling branches interleave like a real backend would.
        tokio::task::yield_now().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match next_reply(&self.compile_replies, &request.node_path) {
            Some(reply) => reply.map_err(ProviderError::Call),
            None => Ok(self
                .compile_fallback
                .as_ref()
                .map_or_else(CompileResponse::default, |f| f(request))),
        }
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.generate_log
            .lock()
            .expect("generate log")
            .push(request.clone());
        tokio::task::yield_now().await;
        match next_reply(&self.generate_replies, &request.node_path) {
            Some(reply) => reply.map_err(ProviderError::Call),
            None => Ok(GenerateResponse::default()),
        }
    }

    async fn test_connection(&self) -> Result<(), ProviderError> {
        if self.reachable {
            Ok(())
        } else {
            Err(ProviderError::Call("scripted provider unreachable".to_string()))
        }
    }
}
