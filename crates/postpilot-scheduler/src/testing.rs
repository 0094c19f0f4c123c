//! Shared test fixtures: a scripted agent whose outcomes are queued per
//! account, a factory that can be told to fail reconstruction, and a harness
//! wiring registry + dispatcher + control plane over a scratch directory.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use postpilot_agent::{
    AgentBlueprint, AgentError, AgentFactory, LoginHandshake, LoginProbe, OperatorAgent,
    RunContext,
};
use postpilot_core::types::{SysType, TaskType};

use crate::clock::{FixedClock, HourWindow};
use crate::control::ControlPlane;
use crate::dispatcher::Dispatcher;
use crate::exec_lock::ExecutionLock;
use crate::license::{LicenseGate, LicenseState};
use crate::registry::Registry;
use crate::snapshot::SnapshotStore;
use crate::task::CreateTaskRequest;

/// Wall-clock span of one scripted run, for overlap assertions.
#[derive(Debug, Clone)]
pub struct RunSpan {
    pub task_id: String,
    pub started: Instant,
    pub finished: Instant,
}

type Script = VecDeque<Result<bool, String>>;

pub struct ScriptedAgent {
    account_id: String,
    delay: Duration,
    spans: Arc<Mutex<Vec<RunSpan>>>,
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    login: LoginProbe,
}

#[async_trait]
impl OperatorAgent for ScriptedAgent {
    async fn run_once(&self, ctx: RunContext) -> Result<bool, AgentError> {
        let started = Instant::now();
        tokio::time::sleep(self.delay).await;
        let outcome = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&self.account_id)
            .and_then(|q| q.pop_front())
            .unwrap_or(Ok(true));
        self.spans.lock().unwrap().push(RunSpan {
            task_id: ctx.task_id,
            started,
            finished: Instant::now(),
        });
        outcome.map_err(AgentError::Service)
    }

    async fn login_status(&self) -> Result<LoginProbe, AgentError> {
        Ok(self.login)
    }

    async fn begin_login(&self) -> Result<LoginHandshake, AgentError> {
        Ok(LoginHandshake::QrCode(vec![0x89, b'P', b'N', b'G']))
    }

    async fn confirm_login(&self) -> Result<bool, AgentError> {
        Ok(true)
    }
}

pub struct ScriptedFactory {
    pub delay: Duration,
    pub spans: Arc<Mutex<Vec<RunSpan>>>,
    pub scripts: Arc<Mutex<HashMap<String, Script>>>,
    /// Account ids whose reconstruction fails, to exercise snapshot skips.
    pub broken_accounts: Mutex<HashSet<String>>,
}

impl ScriptedFactory {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            spans: Arc::new(Mutex::new(Vec::new())),
            scripts: Arc::new(Mutex::new(HashMap::new())),
            broken_accounts: Mutex::new(HashSet::new()),
        })
    }

    /// Queue the next run outcomes for one account.
    pub fn script(&self, account_id: &str, outcomes: Vec<Result<bool, String>>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(account_id.to_string())
            .or_default()
            .extend(outcomes);
    }
}

impl AgentFactory for ScriptedFactory {
    fn build(&self, blueprint: &AgentBlueprint) -> Result<Arc<dyn OperatorAgent>, AgentError> {
        if self
            .broken_accounts
            .lock()
            .unwrap()
            .contains(&blueprint.account_id)
        {
            return Err(AgentError::Service(format!(
                "no automation backend for '{}'",
                blueprint.account_id
            )));
        }
        Ok(Arc::new(ScriptedAgent {
            account_id: blueprint.account_id.clone(),
            delay: self.delay,
            spans: Arc::clone(&self.spans),
            scripts: Arc::clone(&self.scripts),
            login: LoginProbe::LoggedIn,
        }))
    }
}

pub struct Harness {
    pub dir: PathBuf,
    pub clock: Arc<FixedClock>,
    pub factory: Arc<ScriptedFactory>,
    pub exec_lock: Arc<ExecutionLock>,
    pub registry: Arc<Registry>,
    pub dispatcher: Arc<Dispatcher>,
}

pub fn ten_am() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 3, 2)
        .unwrap()
        .and_hms_opt(10, 0, 0)
        .unwrap()
}

impl Harness {
    pub fn new(tag: &str, at: NaiveDateTime) -> Self {
        Self::with_delay(tag, at, Duration::from_millis(0))
    }

    pub fn with_delay(tag: &str, at: NaiveDateTime, run_delay: Duration) -> Self {
        let dir = std::env::temp_dir().join(format!("postpilot-test-{tag}"));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();

        let clock = Arc::new(FixedClock::at(at));
        let factory = ScriptedFactory::new(run_delay);
        let registry = Arc::new(Registry::new(
            clock.clone(),
            factory.clone(),
            SnapshotStore::new(dir.join("dispatcher").join("snapshot.json")),
            dir.join("tasks"),
        ));
        let exec_lock = Arc::new(ExecutionLock::new());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            exec_lock.clone(),
            clock.clone(),
            dir.join("automation").join("cookies.json"),
            Duration::from_secs(60),
            Duration::from_secs(5),
        );
        Self {
            dir,
            clock,
            factory,
            exec_lock,
            registry,
            dispatcher,
        }
    }

    /// A fresh registry over the same snapshot store and factory, as a
    /// restarted process would build it.
    pub fn reopened_registry(&self) -> Registry {
        Registry::new(
            self.clock.clone(),
            self.factory.clone(),
            SnapshotStore::new(self.dir.join("dispatcher").join("snapshot.json")),
            self.dir.join("tasks"),
        )
    }

    pub fn control(&self, license: LicenseState) -> ControlPlane {
        ControlPlane::new(
            self.registry.clone(),
            self.dispatcher.clone(),
            self.exec_lock.clone(),
            LicenseGate::new(license, self.clock.clone()),
            self.clock.clone(),
            Duration::from_millis(200),
        )
    }

    pub fn licensed(&self) -> ControlPlane {
        self.control(LicenseState::Activated {
            task_num: 100,
            end_time: NaiveDate::from_ymd_opt(2030, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        })
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.dir).ok();
    }
}

/// Create-task request with sensible test defaults.
pub fn create_req(account_id: &str) -> CreateTaskRequest {
    CreateTaskRequest {
        account_id: account_id.to_string(),
        account_name: format!("{account_id} operator"),
        task_type: TaskType::SocialOperator,
        sys_type: SysType::MacIntel,
        mode: None,
        params: None,
        interval_secs: Some(3600),
        valid_hours: Some(HourWindow { start: 8, end: 22 }),
        end_date: Some(NaiveDate::from_ymd_opt(2026, 4, 1).unwrap()),
    }
}
