//! Scripted collaborators for runtime tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skillgate::approval::channel::{pump, ApprovalResponse};
use skillgate::approval::{
    ApprovalChannel, ApprovalError, ApprovalGateway, ApprovalPrompt, Decision, Scope,
};
use skillgate::config::Config;
use skillgate::executor::{
    ExecRequest, ExecResult, Executor, ExecutorError, ExecutorKind, HealthStatus, Limits,
    SkillInput, Violation,
};
use skillgate::ledger::TrustLedger;
use skillgate::runtime::SkillRuntime;
use skillgate::skill::SkillId;
use tokio::sync::mpsc;

pub const ARXIV_MANIFEST: &str = "---\nname: arxiv-search\ndescription: Search arXiv papers\ndependencies: [python]\nsecurity:\n  egress: [export.arxiv.org]\n  egress_wrappers: [search.py]\n---\n# arxiv-search\n\n## Commands\n- search: `python search.py {query}`\n- fetch: `curl -s {url}`\n";

pub const ARXIV_SOURCE: &str = "import sys\nfrom urllib.request import urlopen\n\nAPI = \"https://export.arxiv.org/api/query\"\n\n\ndef main():\n    query = sys.argv[1]\n    with urlopen(API + \"?search_query=\" + query) as resp:\n        print(resp.read()[:200])\n\n\nmain()\n";

/// Executor that replays scripted results, defaulting to a clean success.
pub struct ScriptedExecutor {
    kind: ExecutorKind,
    outputs_dir: PathBuf,
    script: Mutex<VecDeque<Result<ExecResult, ExecutorError>>>,
    runs: AtomicUsize,
    delay: Duration,
}

impl ScriptedExecutor {
    pub fn new(kind: ExecutorKind, outputs_dir: &Path) -> Self {
        Self {
            kind,
            outputs_dir: outputs_dir.to_path_buf(),
            script: Mutex::new(VecDeque::new()),
            runs: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push(&self, result: Result<ExecResult, ExecutorError>) {
        self.script.lock().expect("script lock").push_back(result);
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Executor for ScriptedExecutor {
    async fn run(&self, _request: &ExecRequest) -> Result<ExecResult, ExecutorError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().expect("script lock").pop_front();
        next.unwrap_or_else(|| Ok(success()))
    }

    async fn health_check(&self) -> Result<HealthStatus, ExecutorError> {
        Ok(HealthStatus::Healthy {
            kind: self.kind,
            details: "scripted".to_owned(),
        })
    }

    fn outputs_dir(&self) -> &Path {
        &self.outputs_dir
    }

    fn ceilings(&self) -> Limits {
        Limits::from_config(&Config::default().sandbox)
    }

    fn kind(&self) -> ExecutorKind {
        self.kind
    }
}

pub fn success() -> ExecResult {
    ExecResult {
        exit_code: Some(0),
        stdout: "ok\n".to_owned(),
        stderr: String::new(),
        duration: Duration::from_millis(5),
        violation: None,
    }
}

pub fn failure() -> ExecResult {
    ExecResult {
        exit_code: Some(1),
        stdout: String::new(),
        stderr: "boom\n".to_owned(),
        duration: Duration::from_millis(5),
        violation: None,
    }
}

pub fn violation(violation: Violation) -> ExecResult {
    ExecResult {
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        duration: Duration::from_millis(5),
        violation: Some(violation),
    }
}

/// How the scripted human answers the next prompt.
#[derive(Debug, Clone)]
pub enum Answer {
    Approve(&'static str),
    Deny(&'static str),
    Silent,
}

/// Channel that records prompts and answers from a script.
pub struct ScriptedChannel {
    tx: mpsc::Sender<ApprovalResponse>,
    answers: Mutex<VecDeque<Answer>>,
    prompts: Mutex<Vec<ApprovalPrompt>>,
}

impl ScriptedChannel {
    pub fn answer(&self, answer: Answer) {
        self.answers.lock().expect("answers lock").push_back(answer);
    }

    pub fn prompts(&self) -> Vec<ApprovalPrompt> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

#[async_trait::async_trait]
impl ApprovalChannel for ScriptedChannel {
    async fn send(&self, prompt: &ApprovalPrompt) -> Result<(), ApprovalError> {
        self.prompts.lock().expect("prompts lock").push(prompt.clone());
        let answer = self
            .answers
            .lock()
            .expect("answers lock")
            .pop_front()
            .unwrap_or(Answer::Silent);
        let (decision, who) = match answer {
            Answer::Approve(who) => (Decision::Approved, who),
            Answer::Deny(who) => (Decision::Denied, who),
            Answer::Silent => return Ok(()),
        };
        self.tx
            .send(ApprovalResponse {
                request_id: prompt.request_id.clone(),
                decision,
                approver_identity: who.to_owned(),
            })
            .await
            .map_err(|e| ApprovalError::Channel(e.to_string()))
    }
}

/// Fully wired runtime over scripted collaborators.
pub struct Harness {
    pub runtime: Arc<SkillRuntime>,
    pub sandbox: Arc<ScriptedExecutor>,
    pub host: Arc<ScriptedExecutor>,
    pub channel: Arc<ScriptedChannel>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub async fn new(config: Config) -> Self {
        Self::with_sandbox_delay(config, Duration::ZERO).await
    }

    pub async fn with_sandbox_delay(config: Config, delay: Duration) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let outputs = dir.path().join("outputs");
        let ledger = Arc::new(
            TrustLedger::in_memory(config.trust.promotion_threshold)
                .await
                .expect("ledger"),
        );

        let (tx, rx) = mpsc::channel(16);
        let channel = Arc::new(ScriptedChannel {
            tx,
            answers: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
        });
        let gateway = Arc::new(ApprovalGateway::new(
            Arc::clone(&channel) as Arc<dyn ApprovalChannel>,
            config.approval.clone(),
        ));
        tokio::spawn(pump(Arc::clone(&gateway), rx));

        let sandbox =
            Arc::new(ScriptedExecutor::new(ExecutorKind::Sandbox, &outputs).with_delay(delay));
        let host = Arc::new(ScriptedExecutor::new(ExecutorKind::Host, &outputs));
        let runtime = Arc::new(SkillRuntime::new(
            config,
            ledger,
            gateway,
            Arc::clone(&sandbox) as Arc<dyn Executor>,
            Arc::clone(&host) as Arc<dyn Executor>,
        ));
        Self {
            runtime,
            sandbox,
            host,
            channel,
            dir,
        }
    }

    /// Write the arxiv-search fixture and return its directory.
    pub fn write_arxiv(&self) -> PathBuf {
        self.write_skill("arxiv-search", ARXIV_MANIFEST, &[("search.py", ARXIV_SOURCE)])
    }

    pub fn write_skill(&self, dir: &str, manifest: &str, files: &[(&str, &str)]) -> PathBuf {
        let root = self.dir.path().join("skills").join(dir);
        std::fs::create_dir_all(&root).expect("skill dir");
        std::fs::write(root.join("SKILL.md"), manifest).expect("manifest");
        for (name, contents) in files {
            std::fs::write(root.join(name), contents).expect("source file");
        }
        root
    }
}

pub fn arxiv() -> SkillId {
    SkillId::parse("arxiv-search").expect("valid id")
}

pub fn search() -> SkillInput {
    SkillInput::new("search").arg("query", "quantum error correction")
}

pub fn scope() -> Scope {
    Scope::new("alice", "research")
}

/// Config with a small promotion threshold and short approval windows.
pub fn fast_config(threshold: u32) -> Config {
    let mut config = Config::default();
    config.trust.promotion_threshold = threshold;
    config.approval.timeout_secs = 1;
    config.approval.promotion_timeout_secs = 1;
    config.sandbox.fault_retries = 2;
    config
}
