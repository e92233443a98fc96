mod actions;
pub mod command;
pub mod disks;
pub mod healing;
pub mod local;
pub mod network;
pub mod params;
pub mod snapshot;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{ErrorCode, GraphError, SessionError, Status};
use crate::fsm::{Driver, Fsm, Graph, LogProgress, NodeDecl, Progress};
use crate::hypervisor::probe::{self, Resolution};
use crate::hypervisor::{Args, ControlPlane, ExecOptions, MachineState, VBoxManage};
use crate::media::{CachedDownloads, ContextBuilder, LocalContextBuilder, MediaProvider};
use crate::template;
use crate::util::lock;

pub use command::CommandAdapter;
pub use healing::{ErrorContext, HealingPolicy, Remedy};
pub use local::LocalState;
pub use params::{Flags, Parameters};
pub use snapshot::MachineSnapshot;

/// Nodes of the session graph. States first, then actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    Entry,
    Error,
    Destroyed,
    PowerOff,
    Saved,
    Paused,
    Running,

    Initialize,
    UpdateSession,
    HandleError,
    CureError,
    CreateVm,
    ReleaseScratch,
    ReleaseBoot,
    DestroyVm,
    PrepareBoot,
    ConfigNetwork,
    ConfigureVm,
    DownloadMedia,
    ConfigureBoot,
    ConfigureScratch,
    ConfigureApi,
    StartVm,
    DiscardState,
    ReleaseApi,
    CheckApi,
    SaveState,
    PauseVm,
    ResumeVm,
    PowerOffVm,
    FatalSink,
}

impl Node {
    /// Coarse state recorded when the session enters this node.
    pub fn machine_state(self) -> Option<MachineState> {
        match self {
            Node::Destroyed => Some(MachineState::Missing),
            Node::PowerOff => Some(MachineState::PowerOff),
            Node::Saved => Some(MachineState::Saved),
            Node::Paused => Some(MachineState::Paused),
            Node::Running => Some(MachineState::Running),
            _ => None,
        }
    }

    pub fn for_state(state: MachineState) -> Node {
        match state {
            MachineState::Missing => Node::Destroyed,
            MachineState::PowerOff => Node::PowerOff,
            MachineState::Saved => Node::Saved,
            MachineState::Paused => Node::Paused,
            MachineState::Running => Node::Running,
        }
    }
}

/// The VM lifecycle graph.
pub fn session_graph() -> Result<Graph<Node, Node>, GraphError> {
    use Node::*;
    Graph::build(
        Entry,
        vec![
            NodeDecl::state(Entry, [Initialize]),
            NodeDecl::state(Error, [HandleError, FatalSink]),
            NodeDecl::state(Destroyed, [CreateVm]),
            NodeDecl::state(PowerOff, [ReleaseScratch, PrepareBoot]),
            NodeDecl::state(Saved, [DiscardState, CheckApi]),
            NodeDecl::state(Paused, [SaveState, ResumeVm]),
            NodeDecl::state(Running, [PauseVm, PowerOffVm]),
            NodeDecl::handler(Initialize, [UpdateSession]),
            NodeDecl::handler(
                UpdateSession,
                [Error, Destroyed, PowerOff, Saved, Paused, Running],
            ),
            NodeDecl::handler(HandleError, [CureError]),
            NodeDecl::handler(CureError, [UpdateSession]),
            NodeDecl::handler(CreateVm, [PowerOff]),
            NodeDecl::handler(ReleaseScratch, [ReleaseBoot]),
            NodeDecl::handler(ReleaseBoot, [DestroyVm]),
            NodeDecl::handler(DestroyVm, [Destroyed]),
            NodeDecl::handler(PrepareBoot, [ConfigNetwork]),
            NodeDecl::handler(ConfigNetwork, [ConfigureVm]),
            NodeDecl::handler(ConfigureVm, [DownloadMedia]),
            NodeDecl::handler(DownloadMedia, [ConfigureBoot]),
            NodeDecl::handler(ConfigureBoot, [ConfigureScratch]),
            NodeDecl::handler(ConfigureScratch, [ConfigureApi]),
            NodeDecl::handler(ConfigureApi, [StartVm]),
            NodeDecl::handler(StartVm, [Running]),
            NodeDecl::handler(DiscardState, [ReleaseApi]),
            NodeDecl::handler(ReleaseApi, [PowerOff]),
            NodeDecl::handler(CheckApi, [StartVm]),
            NodeDecl::handler(SaveState, [Saved]),
            NodeDecl::handler(PauseVm, [Paused]),
            NodeDecl::handler(ResumeVm, [Running]),
            NodeDecl::handler(PowerOffVm, [ReleaseApi]),
            NodeDecl::handler(FatalSink, []),
        ],
    )
}

/// Notifications for session observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged { state: MachineState },
    ResolutionChanged { resolution: Resolution },
    Failed { code: ErrorCode, message: String },
}

/// External collaborators of a session.
#[derive(Clone)]
pub struct SessionDeps {
    pub control: Arc<dyn ControlPlane>,
    pub media: Arc<dyn MediaProvider>,
    pub context: Arc<dyn ContextBuilder>,
}

impl SessionDeps {
    /// Process-backed collaborators as configured.
    pub fn from_config(config: &Config) -> Self {
        Self {
            control: Arc::new(VBoxManage::new(&config.hypervisor.binary)),
            media: Arc::new(CachedDownloads::new(
                &config.media.cache_dir,
                &config.media.download_tool,
            )),
            context: Arc::new(LocalContextBuilder::new(&config.media.iso_tool)),
        }
    }
}

/// One managed VM. Transition requests only pick a target node and return
/// [`Status::Scheduled`]; handler failures go through the [`HealingPolicy`].
pub struct VmSession {
    id: String,
    config: Config,
    fsm: Fsm<VmSession>,
    commands: CommandAdapter,
    media: Arc<dyn MediaProvider>,
    context: Arc<dyn ContextBuilder>,
    parameters: Mutex<Parameters>,
    user_data: Mutex<BTreeMap<String, String>>,
    local: Mutex<LocalState>,
    machine: Mutex<MachineSnapshot>,
    video_mode: Mutex<Option<Resolution>>,
    last_log_time: Mutex<Option<SystemTime>>,
    healing: Mutex<HealingPolicy>,
    events: broadcast::Sender<SessionEvent>,
}

impl VmSession {
    /// Build a session for `id`, loading its local state from the state
    /// directory. The worker is not started until [`VmSession::open`].
    pub fn new(
        id: impl Into<String>,
        parameters: Parameters,
        config: Config,
        deps: SessionDeps,
    ) -> Result<Arc<Self>> {
        let id = id.into();
        let graph = session_graph()?;
        let local = LocalState::load(config.session.state_file(&id))?;
        let commands = CommandAdapter::new(deps.control, ExecOptions::from_config(&config.hypervisor));
        let machine = MachineSnapshot::new(config.session.snapshot_ttl());
        let healing = HealingPolicy::new(config.session.heal_window(), config.session.heal_budget);
        let (events, _) = broadcast::channel(64);

        let session = Arc::new_cyclic(|weak| VmSession {
            fsm: Fsm::new(graph, weak.clone()),
            commands,
            media: deps.media,
            context: deps.context,
            parameters: Mutex::new(parameters),
            user_data: Mutex::new(BTreeMap::new()),
            local: Mutex::new(local),
            machine: Mutex::new(machine),
            video_mode: Mutex::new(None),
            last_log_time: Mutex::new(None),
            healing: Mutex::new(healing),
            events,
            config,
            id,
        });
        session
            .fsm
            .set_progress(Arc::new(LogProgress::new(session.id.clone())), "Reconfiguring session");
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Replace the progress sink that handlers report to.
    pub fn set_progress(&self, progress: Arc<dyn Progress>) {
        self.fsm.set_progress(progress, "Reconfiguring session");
    }

    /// Node the FSM is currently at.
    pub fn current(&self) -> Node {
        self.fsm.current()
    }

    /// Last recorded coarse state.
    pub fn state(&self) -> MachineState {
        lock(&self.local).state()
    }

    pub fn parameters(&self) -> Parameters {
        lock(&self.parameters).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn error_context(&self) -> ErrorContext {
        lock(&self.healing).context()
    }

    // -----------------------------------------------------------------------
    // transitions
    // -----------------------------------------------------------------------

    /// Start the worker and discover the machine's current state.
    pub fn open(&self) -> Status {
        self.fsm.start();
        self.fsm.goto(Node::UpdateSession, 1);
        Status::Scheduled
    }

    /// Merge `user_data`, apply permitted parameter overrides and boot.
    pub fn start(&self, user_data: BTreeMap<String, String>) -> Status {
        lock(&self.parameters).apply_overrides(&user_data);
        lock(&self.user_data).extend(user_data);
        info!(vm = %self.id, "start requested");
        self.fsm.goto(Node::Running, 1);
        Status::Scheduled
    }

    pub fn pause(&self) -> Status {
        self.fsm.goto(Node::Paused, 1);
        Status::Scheduled
    }

    pub fn resume(&self) -> Status {
        self.fsm.goto(Node::Running, 1);
        Status::Scheduled
    }

    pub fn stop(&self) -> Status {
        self.fsm.goto(Node::PowerOff, 1);
        Status::Scheduled
    }

    /// Save the machine state to disk.
    pub fn hibernate(&self) -> Status {
        self.fsm.goto(Node::Saved, 1);
        Status::Scheduled
    }

    /// Power off and destroy the machine with all its media.
    pub fn close(&self) -> Status {
        self.fsm.goto(Node::Destroyed, 1);
        Status::Scheduled
    }

    pub fn reset(&self) -> Result<Status, SessionError> {
        Err(SessionError::new(
            ErrorCode::NotImplemented,
            "forced reboot is not supported",
        ))
    }

    /// Stop the worker after the handler in flight.
    pub async fn abort(&self) {
        self.fsm.stop().await;
    }

    /// Wait until the worker has nothing left to do. Returns false on
    /// timeout or when the session was aborted.
    pub async fn wait(&self) -> bool {
        self.fsm
            .wait_inactive(Some(self.config.session.wait_timeout()))
            .await
    }

    // -----------------------------------------------------------------------
    // runtime settings and queries
    // -----------------------------------------------------------------------

    /// Change the CPU execution cap, live if the machine is running.
    pub async fn set_execution_cap(&self, cap: u32) -> Result<Status, SessionError> {
        lock(&self.parameters).set("executionCap", cap.to_string());

        let state = self.state();
        let vm = match (state, self.vm_id()) {
            (MachineState::Missing | MachineState::Paused, _) | (_, None) => {
                return Err(SessionError::new(
                    ErrorCode::InvalidState,
                    format!("cannot change execution cap while {state}"),
                ));
            }
            (_, Some(vm)) => vm,
        };

        let args = if state == MachineState::Running {
            Args::new("controlvm").arg(&vm).arg("cpuexecutioncap").arg(cap)
        } else {
            Args::new("modifyvm").arg(&vm).opt("--cpuexecutioncap", cap)
        };
        let out = self.commands.run(args).await;
        if !out.success() {
            return Err(SessionError::external(format!(
                "unable to change execution cap: {}",
                out.stderr
            )));
        }
        Ok(Status::Ok)
    }

    pub fn set_property(&self, name: &str, value: &str) {
        self.with_local(|local| local.set_property(name, value));
    }

    pub fn property(&self, name: &str) -> Option<String> {
        lock(&self.local).property(name).map(str::to_string)
    }

    /// Where the remote display listens.
    pub fn rdp_address(&self) -> Option<String> {
        self.local_value("rdpPort").map(|port| format!("127.0.0.1:{port}"))
    }

    pub fn api_host(&self) -> Option<String> {
        self.local_value("apiHost")
    }

    pub fn api_port(&self) -> Option<u16> {
        lock(&self.local).get_num("apiPort")
    }

    /// Last display mode seen in the hypervisor log, as `WxHxBPP`.
    pub fn video_mode(&self) -> Option<String> {
        lock(&self.video_mode)
            .map(|r| format!("{}x{}x{}", r.width, r.height, r.bpp))
    }

    /// Parameters' `userData` with `${...}` macros expanded from the data
    /// passed to `start`.
    pub fn user_data(&self) -> String {
        let template = lock(&self.parameters).get_or("userData", "");
        if template.is_empty() {
            return template;
        }
        template::expand(&template, &*lock(&self.user_data))
    }

    /// Look for state changes made outside this session.
    ///
    /// Re-reads the local state file first; if another process did not
    /// change the coarse state, the hypervisor log is probed instead. A
    /// mismatch moves the FSM to the matching state node without running
    /// any handler.
    pub async fn update(&self, wait: bool) -> Status {
        if !wait && self.fsm.is_active() {
            return Status::Scheduled;
        }
        self.wait().await;

        let last = self.state();
        let mut observed = {
            let mut local = lock(&self.local);
            if let Err(e) = local.reload() {
                warn!(vm = %self.id, error = %e, "failed to reload local state");
            }
            local.state()
        };

        if observed == last {
            if let Some(state) = self.probe_log().await {
                observed = state;
            }
        }

        if observed != last {
            info!(vm = %self.id, from = %last, to = %observed, "state changed outside the session");
            self.fsm.skew(Node::for_state(observed));
        }
        Status::Ok
    }

    /// State reported by the hypervisor log, if it changed since the last
    /// probe. A vanished log means the machine is gone.
    async fn probe_log(&self) -> Option<MachineState> {
        let folder = lock(&self.machine).get("Log folder").map(PathBuf::from)?;
        let path = folder.join("VBox.log");

        let modified = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.modified().ok(),
            Err(_) => {
                debug!(vm = %self.id, path = %path.display(), "hypervisor log is gone");
                return Some(MachineState::Missing);
            }
        };
        {
            let mut last = lock(&self.last_log_time);
            if modified.is_some() && *last == modified {
                return None;
            }
            *last = modified;
        }

        let report = match probe::probe(&path).await {
            Ok(report) => report,
            Err(e) => {
                warn!(vm = %self.id, error = %e, "failed to probe hypervisor log");
                return None;
            }
        };

        if let Some(resolution) = report.resolution {
            let changed = lock(&self.video_mode).replace(resolution) != Some(resolution);
            if changed {
                let _ = self.events.send(SessionEvent::ResolutionChanged { resolution });
            }
        }
        report.state
    }

    // -----------------------------------------------------------------------
    // helpers shared with handlers
    // -----------------------------------------------------------------------

    fn vm_id(&self) -> Option<String> {
        self.local_value("vboxid")
    }

    fn local_value(&self, key: &str) -> Option<String> {
        lock(&self.local).get(key).map(str::to_string)
    }

    /// Mutate local state and write it out.
    fn with_local<R>(&self, f: impl FnOnce(&mut LocalState) -> R) -> R {
        let mut local = lock(&self.local);
        let result = f(&mut local);
        if let Err(e) = local.save() {
            warn!(vm = %self.id, error = %e, "failed to persist local state");
        }
        result
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Driver for VmSession {
    type Node = Node;
    type Action = Node;
    type Error = SessionError;

    fn fsm(&self) -> &Fsm<Self> {
        &self.fsm
    }

    async fn execute(self: Arc<Self>, action: Node) -> Result<(), SessionError> {
        self.run_action(action).await
    }

    async fn on_failure(self: Arc<Self>, node: Node, error: SessionError) {
        self.fsm.fail(&error.message, error.code.code());
        self.emit(SessionEvent::Failed {
            code: error.code,
            message: error.message.clone(),
        });

        let remedy = lock(&self.healing).record(&error);
        match remedy {
            Remedy::Heal => {
                warn!(vm = %self.id, node = ?node, error = %error, "handler failed, healing");
                self.fsm.skew(Node::Error);
            }
            Remedy::Fatal => {
                error!(vm = %self.id, node = ?node, error = %error, "too many errors, giving up");
                self.fsm.jump(Node::FatalSink).await;
            }
        }
    }

    fn entering_state(&self, node: Node, is_final: bool) {
        let Some(state) = node.machine_state() else {
            return;
        };
        self.with_local(|local| local.set_state(state));
        if is_final {
            debug!(vm = %self.id, %state, "arrived");
            self.emit(SessionEvent::StateChanged { state });
        }
    }
}
