use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::disks::{
    DiskKind, DiskSlot, MountOutcome, Reconciler, BOOT_SLOT, CONTEXT_SLOT, FLOPPY_SLOT,
    GUEST_ADDITIONS_SLOT, SCRATCH_SLOT,
};
use super::network::{free_local_port, host_only_adapter};
use super::params::{Flags, Parameters};
use super::{Node, VmSession};
use crate::error::{ErrorCode, SessionError};
use crate::hypervisor::parse::{parse_created_uuid, parse_leading_number, parse_properties, parse_vrde};
use crate::hypervisor::probe;
use crate::hypervisor::{Args, ExecOutput, MachineState, EXIT_SPAWN_FAILED, EXIT_TIMEOUT};
use crate::media::Checksum;
use crate::util::lock;

/// Synthetic exit code for a tolerated "already exists" on NAT rules.
const ERR_TOLERATED: i32 = 100;
/// Synthetic exit code for any error reported by `startvm`.
const ERR_START_FAILED: i32 = 200;
/// Synthetic exit code for `createvm` name clashes.
const ERR_ALREADY_EXISTS: i32 = 500;

const API_RULE: &str = "guestapi";

fn is_disabled(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.is_empty() || v == "disabled")
}

/// `modifyvm` arguments that bring the machine in line with `params`.
///
/// Only settings that differ from `machine` are emitted, except for the
/// execution cap and the NAT DNS resolver which are always re-applied.
pub(super) fn configuration_args(
    vm: &str,
    params: &Parameters,
    machine: &BTreeMap<String, String>,
    rdp_port: u16,
    host_only: Option<&str>,
) -> Args {
    let flags = params.flags();
    let current = |key: &str| machine.get(key).map(String::as_str);
    let mut args = Args::new("modifyvm").arg(vm);

    let cpus = params.get_or("cpus", "2");
    if current("Number of CPUs") != Some(cpus.as_str()) {
        args.push_opt("--cpus", &cpus);
    }

    let memory = params.get_num::<u64>("memory", 1024);
    if current("Memory size").map(parse_leading_number) != Some(memory) {
        args.push_opt("--memory", memory);
    }

    args.push_opt("--cpuexecutioncap", params.get_or("executionCap", "80"));

    let vram = params.get_num::<u64>("vram", 32);
    if current("VRAM size").map(parse_leading_number) != Some(vram) {
        args.push_opt("--vram", vram);
    }

    if current("ACPI") != Some("on") {
        args.push_opt("--acpi", "on");
    }
    if current("IOAPIC") != Some("on") {
        args.push_opt("--ioapic", "on");
    }

    let vrde = current("VRDE");
    if is_disabled(vrde) {
        args.push_opt("--vrde", "on");
        args.push_opt("--vrdeaddress", "127.0.0.1");
        args.push_opt("--vrdeauthtype", "null");
        args.push_opt("--vrdemulticon", "on");
        args.push_opt("--vrdeport", rdp_port);
    } else {
        let options = parse_vrde(vrde.unwrap_or_default());
        let option = |key: &str| options.get(key).map(String::as_str);
        if option("Address") != Some("127.0.0.1") {
            args.push_opt("--vrdeaddress", "127.0.0.1");
        }
        if option("Authentication type") != Some("null") {
            args.push_opt("--vrdeauthtype", "null");
        }
        if option("Ports") != Some(rdp_port.to_string().as_str()) {
            args.push_opt("--vrdeport", rdp_port);
        }
        if option("MultiConn") != Some("on") {
            args.push_opt("--vrdemulticon", "on");
        }
        if !vrde.is_some_and(|v| v.starts_with("enabled")) {
            args.push_opt("--vrde", "on");
        }
    }

    let boot = if flags.has(Flags::DEPLOYMENT_HDD) { "disk" } else { "dvd" };
    let shown = current("Boot Device (1)").unwrap_or_default().to_lowercase();
    let shown = if shown == "harddisk" { "disk".to_string() } else { shown };
    if shown != boot {
        args.push_opt("--boot1", boot);
    }

    if is_disabled(current("NIC 1")) {
        args.push_opt("--nic1", "nat");
    }
    args.push_opt("--natdnshostresolver1", "on");

    if flags.has(Flags::GRAPHICAL) {
        args.push_opt("--draganddrop", "hosttoguest");
        args.push_opt("--clipboard", "bidirectional");
    }

    if flags.has(Flags::DUAL_NIC) && is_disabled(current("NIC 2")) {
        if let Some(adapter) = host_only {
            args.push_opt("--nic2", "hostonly");
            args.push_opt("--hostonlyadapter2", adapter);
        }
    }
    args
}

/// URL of a micro-ISO release for the given architecture.
fn release_iso_url(base: &str, version: &str, flavor: &str, arch: &str) -> String {
    format!(
        "{}/ucernvm-images.{version}.cernvm.{arch}/ucernvm-{flavor}.{version}.cernvm.{arch}.iso",
        base.trim_end_matches('/')
    )
}

impl VmSession {
    pub(super) async fn run_action(&self, action: Node) -> Result<(), SessionError> {
        match action {
            Node::Initialize => {
                self.fsm.doing("Initializing session");
                self.fsm.done("Session initialized");
                Ok(())
            }
            Node::UpdateSession => self.update_session().await,
            Node::HandleError => {
                self.fsm.doing("Handling error");
                self.fsm.done("Error handled");
                Ok(())
            }
            Node::CureError => {
                self.fsm.doing("Curing error");
                lock(&self.machine).invalidate();
                self.fsm.done("Error cured");
                Ok(())
            }
            Node::CreateVm => self.create_vm().await,
            Node::ReleaseScratch => self.release_scratch().await,
            Node::ReleaseBoot => self.release_boot().await,
            Node::DestroyVm => {
                self.fsm.doing("Destroying VM");
                self.destroy_vm().await?;
                self.fsm.done("VM destroyed");
                Ok(())
            }
            Node::PrepareBoot => {
                self.fsm.doing("Preparing for VM boot");
                self.fsm.done("VM prepared for boot");
                Ok(())
            }
            Node::ConfigNetwork => self.config_network().await,
            Node::ConfigureVm => self.configure_vm().await,
            Node::DownloadMedia => self.download_media().await,
            Node::ConfigureBoot => self.configure_boot().await,
            Node::ConfigureScratch => self.configure_scratch().await,
            Node::ConfigureApi => self.configure_api().await,
            Node::StartVm => self.start_vm().await,
            Node::DiscardState => {
                self.fsm.doing("Discarding saved VM state");
                let vm = self.require_vm()?;
                let out = self.commands.run(Args::new("discardstate").arg(&vm)).await;
                lock(&self.machine).invalidate();
                if !out.success() {
                    return Err(SessionError::control(format!(
                        "unable to discard the saved VM state: {}",
                        out.stderr
                    )));
                }
                self.fsm.done("Saved VM state discarded");
                Ok(())
            }
            Node::ReleaseApi => self.release_api().await,
            Node::CheckApi => {
                self.fsm.doing("Checking VM API medium");
                let data = self.user_data();
                let mounted = self.local_value("vmapi_contents").unwrap_or_default();
                if data != mounted {
                    info!(vm = %self.id, "context data changed, rebooting from scratch");
                    self.fsm.skew(Node::DiscardState);
                    self.fsm.done("VM API medium has changed");
                } else {
                    self.fsm.done("VM API medium does not need to be modified");
                }
                Ok(())
            }
            Node::SaveState => self.control_step("savestate", "Saving VM state", "VM state saved").await,
            Node::PauseVm => self.control_step("pause", "Pausing the VM", "VM paused").await,
            Node::ResumeVm => self.control_step("resume", "Resuming VM", "VM resumed").await,
            Node::PowerOffVm => self.control_step("poweroff", "Powering VM off", "VM powered off").await,
            Node::FatalSink => {
                self.fsm.doing("Session unable to continue, cleaning up");
                if self.vm_id().is_some() {
                    if let Err(e) = self.destroy_vm().await {
                        warn!(vm = %self.id, error = %e, "cleanup after fatal error failed");
                    }
                }
                self.fsm.done("Session cleaned up");
                Ok(())
            }
            state => {
                debug!(node = ?state, "no handler for state node");
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // shared helpers
    // -----------------------------------------------------------------------

    fn flags(&self) -> Flags {
        lock(&self.parameters).flags()
    }

    fn param(&self, key: &str, default: &str) -> String {
        lock(&self.parameters).get_or(key, default)
    }

    fn require_vm(&self) -> Result<String, SessionError> {
        self.vm_id()
            .ok_or_else(|| SessionError::new(ErrorCode::NotFound, "session has no virtual machine"))
    }

    fn reconciler<'a>(&'a self, vm: &'a str) -> Reconciler<'a> {
        Reconciler::new(&self.commands, &self.machine, vm)
    }

    /// `showvminfo` attributes, reusing a recent answer. The raw output of
    /// a failed query is returned as the error.
    async fn query_machine(&self) -> Result<BTreeMap<String, String>, ExecOutput> {
        {
            let machine = lock(&self.machine);
            if machine.is_fresh() {
                return Ok(machine.info().clone());
            }
        }
        let Some(vm) = self.vm_id() else {
            return Err(ExecOutput::failed(1, "session has no virtual machine"));
        };
        let out = self.commands.run(Args::new("showvminfo").arg(&vm)).await;
        if !out.success() {
            return Err(out);
        }
        let info = parse_properties(&out.stdout);
        lock(&self.machine).replace(info.clone());
        Ok(info)
    }

    async fn refresh_machine(&self) -> Result<BTreeMap<String, String>, ExecOutput> {
        lock(&self.machine).invalidate();
        self.query_machine().await
    }

    /// Folder holding the machine's settings file, where generated media go.
    fn data_folder(&self) -> Option<PathBuf> {
        let config = lock(&self.machine).get("Config file").map(str::to_string);
        if let Some(config) = config {
            let config = config.trim_matches(|c| c == '"' || c == '\'');
            if let Some(parent) = Path::new(config).parent() {
                return Some(parent.to_path_buf());
            }
        }
        self.local_value("baseFolder").map(PathBuf::from)
    }

    /// Unregister the machine with its media, remove its folder and forget
    /// its id.
    async fn destroy_vm(&self) -> Result<(), SessionError> {
        let vm = self.require_vm()?;
        let out = self
            .commands
            .run(Args::new("unregistervm").arg(&vm).arg("--delete"))
            .await;
        if !out.success() {
            return Err(SessionError::external(format!(
                "unable to destroy the virtual machine: {}",
                out.stderr
            )));
        }

        if let Some(folder) = self.local_value("baseFolder") {
            if let Err(e) = tokio::fs::remove_dir_all(&folder).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(vm = %self.id, folder = %folder, error = %e, "failed to remove VM folder");
                }
            }
        }

        self.with_local(|local| {
            local.set("initialized", 0);
            local.remove("vboxid");
        });
        lock(&self.machine).clear();
        info!(vm = %self.id, machine = %vm, "virtual machine destroyed");
        Ok(())
    }

    async fn control_vm(&self, how: &str) -> Result<(), SessionError> {
        let vm = self.require_vm()?;
        let out = self.commands.run(Args::new("controlvm").arg(&vm).arg(how)).await;
        lock(&self.machine).invalidate();
        if !out.success() {
            return Err(SessionError::control(format!(
                "controlvm {how} failed: {}",
                out.stderr
            )));
        }
        Ok(())
    }

    async fn control_step(&self, how: &str, doing: &str, done: &str) -> Result<(), SessionError> {
        self.fsm.doing(doing);
        self.control_vm(how).await?;
        self.fsm.done(done);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // discovery
    // -----------------------------------------------------------------------

    async fn update_session(&self) -> Result<(), SessionError> {
        self.fsm.doing("Loading session information");

        if self.vm_id().is_none() {
            self.fsm.skew(Node::Destroyed);
            self.fsm.done("Session has no hypervisor reflection");
            return Ok(());
        }

        let info = match self.query_machine().await {
            Ok(info) => info,
            Err(out) if out.code == EXIT_SPAWN_FAILED || out.code == EXIT_TIMEOUT => {
                return Err(SessionError::query(format!(
                    "unable to query the virtual machine: {}",
                    out.stderr
                )));
            }
            Err(out) => {
                debug!(vm = %self.id, stderr = %out.stderr, "machine query failed, treating as gone");
                self.with_local(|local| {
                    if local.get_num::<i32>("initialized").unwrap_or(0) != 0 {
                        local.clear();
                    }
                    local.remove("vboxid");
                });
                lock(&self.machine).clear();
                self.fsm.skew(Node::Destroyed);
                self.fsm.done("Virtual machine has gone away");
                return Ok(());
            }
        };

        let Some(state) = info.get("State") else {
            return Err(SessionError::query("machine information has no state"));
        };
        let Some(state) = MachineState::from_info(state) else {
            return Err(SessionError::query(format!("unknown machine state: {state}")));
        };
        self.fsm.skew(Node::for_state(state));
        self.fsm.done(&format!("Session is {state}"));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // creation and teardown
    // -----------------------------------------------------------------------

    async fn create_vm(&self) -> Result<(), SessionError> {
        self.fsm.doing("Creating virtual machine");

        let os_type = if self.flags().has(Flags::SYSTEM_64BIT) {
            "Linux26_64"
        } else {
            "Linux26"
        };
        let name = self.param("name", &self.id);
        let base = self.config.session.runtime_dir.join(&self.id);
        self.with_local(|local| local.set("baseFolder", base.display()));

        let options = self
            .commands
            .options()
            .map_error("already exists", ERR_ALREADY_EXISTS);
        let out = self
            .commands
            .run_with(
                Args::new("createvm")
                    .opt("--name", &name)
                    .opt("--ostype", os_type)
                    .opt("--basefolder", base.display())
                    .arg("--register"),
                &options,
            )
            .await;
        if out.code == ERR_ALREADY_EXISTS {
            return Err(SessionError::create(format!(
                "a virtual machine named {name} already exists"
            )));
        }
        if !out.success() {
            return Err(SessionError::create(format!(
                "unable to create a new virtual machine: {}",
                out.stderr
            )));
        }
        let Some(vm) = parse_created_uuid(&out.stdout) else {
            return Err(SessionError::create(
                "unable to detect the id of the newly created virtual machine",
            ));
        };
        self.with_local(|local| local.set("vboxid", &vm));
        info!(vm = %self.id, machine = %vm, "virtual machine created");

        for (controller, bus) in [("IDE", "ide"), ("SATA", "sata"), ("Floppy", "floppy")] {
            let out = self
                .commands
                .run(
                    Args::new("storagectl")
                        .arg(&vm)
                        .opt("--name", controller)
                        .opt("--add", bus),
                )
                .await;
            if !out.success() {
                if let Err(e) = self.destroy_vm().await {
                    warn!(vm = %self.id, error = %e, "failed to roll back machine creation");
                }
                return Err(SessionError::create(format!(
                    "unable to attach a new {controller} controller: {}",
                    out.stderr
                )));
            }
        }

        lock(&self.machine).invalidate();
        self.fsm.done("Virtual machine created");
        Ok(())
    }

    async fn release_scratch(&self) -> Result<(), SessionError> {
        self.fsm.doing("Releasing scratch storage");
        if let Some(vm) = self.vm_id() {
            let _ = self.refresh_machine().await;
            if let Err(e) = self.reconciler(&vm).unmount(SCRATCH_SLOT, DiskKind::Hdd, true).await {
                warn!(vm = %self.id, error = %e, "failed to release scratch disk");
            }
        }
        self.fsm.done("Scratch storage released");
        Ok(())
    }

    async fn release_boot(&self) -> Result<(), SessionError> {
        self.fsm.doing("Releasing boot medium");
        if let Some(vm) = self.vm_id() {
            let reconciler = self.reconciler(&vm);
            let result = if self.flags().has(Flags::DEPLOYMENT_HDD) {
                reconciler.unmount(BOOT_SLOT, DiskKind::Hdd, true).await
            } else {
                reconciler.unmount(BOOT_SLOT, DiskKind::Dvd, false).await
            };
            if let Err(e) = result {
                warn!(vm = %self.id, error = %e, "failed to release boot medium");
            }
            if self.uses_guest_additions() {
                if let Err(e) = reconciler.unmount(GUEST_ADDITIONS_SLOT, DiskKind::Dvd, false).await {
                    warn!(vm = %self.id, error = %e, "failed to release guest additions");
                }
            }
        }
        self.fsm.done("Boot medium released");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // boot preparation
    // -----------------------------------------------------------------------

    async fn config_network(&self) -> Result<(), SessionError> {
        if self.flags().has(Flags::DUAL_NIC) {
            self.fsm.doing("Configuring host-only adapter");
            let configured = lock(&self.local).contains("hostonlyif");
            if configured {
                self.fsm.done("VM network configured");
                return Ok(());
            }
            let progress = self.fsm.begin("Configuring VM network");
            let adapter = host_only_adapter(&self.commands, &*progress).await?;
            let api_port = self.param("apiPort", "80");
            self.with_local(|local| {
                local.set("hostonlyif", &adapter);
                local.set("apiPort", &api_port);
                local.set("apiHost", "127.0.0.1");
            });
            self.fsm.done("VM network configured");
            return Ok(());
        }

        self.fsm.doing("Looking up a free API port");
        let known = lock(&self.local).get_num::<u16>("apiPort").unwrap_or(0);
        if known == 0 {
            let port = free_local_port()
                .await
                .map_err(|e| SessionError::external(format!("unable to allocate an API port: {e:#}")))?;
            self.with_local(|local| {
                local.set("apiPort", port);
                local.set("apiHost", "127.0.0.1");
            });
            debug!(vm = %self.id, port, "api port allocated");
        }
        self.fsm.done("Network configuration obtained");
        Ok(())
    }

    async fn configure_vm(&self) -> Result<(), SessionError> {
        self.fsm.doing("Configuring virtual machine");
        let vm = self.require_vm()?;

        let mut rdp_port = lock(&self.local).get_num::<u16>("rdpPort").unwrap_or(0);
        if rdp_port == 0 {
            rdp_port = free_local_port()
                .await
                .map_err(|e| SessionError::external(format!("unable to allocate a display port: {e:#}")))?;
            self.with_local(|local| local.set("rdpPort", rdp_port));
        }

        let machine = self.refresh_machine().await.map_err(|out| {
            SessionError::query(format!("unable to query the virtual machine: {}", out.stderr))
        })?;
        let host_only = self.local_value("hostonlyif");
        let args = {
            let params = lock(&self.parameters);
            configuration_args(&vm, &params, &machine, rdp_port, host_only.as_deref())
        };
        let out = self.commands.run(args).await;
        lock(&self.machine).invalidate();
        if !out.success() {
            return Err(SessionError::external(format!(
                "unable to modify the virtual machine: {}",
                out.stderr
            )));
        }

        // NAT rules go in a second call: a NIC enabled by the call above
        // had no rules to compare against.
        if !self.flags().has(Flags::DUAL_NIC) {
            let host_port = self.local_value("apiPort").unwrap_or_default();
            let guest_port = self.param("apiPort", "80");
            let options = self
                .commands
                .options()
                .map_error("A NAT rule of this name already exists", ERR_TOLERATED);
            let out = self
                .commands
                .run_with(
                    Args::new("modifyvm").arg(&vm).opt(
                        "--natpf1",
                        format!("{API_RULE},tcp,127.0.0.1,{host_port},,{guest_port}"),
                    ),
                    &options,
                )
                .await;
            if !out.success() && out.code != ERR_TOLERATED {
                return Err(SessionError::external(format!(
                    "unable to forward the API port: {}",
                    out.stderr
                )));
            }
        }

        self.with_local(|local| local.set("initialized", 1));
        self.fsm.done("Virtual machine configured");
        Ok(())
    }

    async fn download_media(&self) -> Result<(), SessionError> {
        let progress = self.fsm.begin("Downloading required media");
        progress.set_max(2);
        let flags = self.flags();

        if flags.has(Flags::DEPLOYMENT_HDD) {
            let url = self.param("diskURL", "");
            let checksum = self.param("diskChecksum", "");
            if url.is_empty() || checksum.is_empty() {
                return Err(SessionError::new(
                    ErrorCode::NotValidated,
                    "missing disk and/or checksum parameters",
                ));
            }
            let path = self
                .media
                .fetch(&url, &Checksum::Sha256(checksum), progress.begin("Downloading disk image"))
                .await
                .map_err(|e| SessionError::external(format!("unable to download the disk image: {e:#}")))?;
            self.with_local(|local| local.set("bootDisk", path.display()));
        } else {
            let arch = if flags.has(Flags::SYSTEM_64BIT) { "x86_64" } else { "i386" };
            let version = self.param("cernvmVersion", &self.config.media.default_version);
            let flavor = self.param("cernvmFlavor", &self.config.media.default_flavor);
            let url = release_iso_url(&self.config.media.release_url, &version, &flavor, arch);
            let checksum = Checksum::Url(format!("{url}.sha256"));
            let path = self
                .media
                .fetch(&url, &checksum, progress.begin("Downloading boot ISO"))
                .await
                .map_err(|e| SessionError::external(format!("unable to download the boot ISO: {e:#}")))?;
            self.with_local(|local| local.set("bootISO", path.display()));
        }

        progress.done("Required media downloaded");
        Ok(())
    }

    fn uses_guest_additions(&self) -> bool {
        self.flags().has(Flags::GUEST_ADDITIONS) && self.config.hypervisor.guest_additions_iso.is_some()
    }

    async fn mount_step(
        &self,
        vm: &str,
        slot: DiskSlot,
        kind: DiskKind,
        source: &str,
        multi_attach: bool,
        label: &str,
    ) -> Result<(), SessionError> {
        match self.reconciler(vm).mount(slot, kind, source, multi_attach).await? {
            MountOutcome::AlreadyInPlace => self.fsm.doing(&format!("{label} already in place")),
            MountOutcome::Mounted => debug!(vm = %self.id, slot = %slot, "{label} mounted"),
        }
        Ok(())
    }

    async fn configure_boot(&self) -> Result<(), SessionError> {
        self.fsm.doing("Preparing boot medium");
        let vm = self.require_vm()?;

        let (key, kind, multi) = if self.flags().has(Flags::DEPLOYMENT_HDD) {
            ("bootDisk", DiskKind::Hdd, true)
        } else {
            ("bootISO", DiskKind::Dvd, false)
        };
        let Some(source) = self.local_value(key) else {
            return Err(SessionError::new(ErrorCode::NotFound, "boot medium was not downloaded"));
        };
        self.mount_step(&vm, BOOT_SLOT, kind, &source, multi, "Boot medium").await?;

        if self.uses_guest_additions() {
            if let Some(iso) = self.config.hypervisor.guest_additions_iso.as_ref() {
                let iso = iso.display().to_string();
                self.mount_step(&vm, GUEST_ADDITIONS_SLOT, DiskKind::Dvd, &iso, false, "Guest additions")
                    .await?;
            }
        }

        self.fsm.done("Boot medium prepared");
        Ok(())
    }

    async fn configure_scratch(&self) -> Result<(), SessionError> {
        self.fsm.doing("Preparing scratch storage");
        let vm = self.require_vm()?;

        let attached = lock(&self.machine).has_medium(&SCRATCH_SLOT.key());
        if attached {
            self.fsm.done("Scratch disk already exists");
            return Ok(());
        }

        let Some(folder) = self.data_folder() else {
            return Err(SessionError::new(ErrorCode::NotFound, "machine has no data folder"));
        };
        let disk = folder.join(format!("scratch-{}.vdi", uuid::Uuid::new_v4().simple()));
        let disk = disk.display().to_string();
        let out = self
            .commands
            .run(
                Args::new("createhd")
                    .opt("--filename", &disk)
                    .opt("--size", self.param("disk", "1024")),
            )
            .await;
        if !out.success() {
            return Err(SessionError::external(format!(
                "unable to allocate a scratch disk: {}",
                out.stderr
            )));
        }

        self.reconciler(&vm)
            .mount(SCRATCH_SLOT, DiskKind::Hdd, &disk, false)
            .await
            .map_err(|e| SessionError::external(format!("unable to attach the scratch disk: {}", e.message)))?;
        self.fsm.done("Scratch storage prepared");
        Ok(())
    }

    fn api_slot(&self) -> (DiskSlot, DiskKind) {
        if self.flags().has(Flags::FLOPPY_IO) {
            (FLOPPY_SLOT, DiskKind::Floppy)
        } else {
            (CONTEXT_SLOT, DiskKind::Dvd)
        }
    }

    async fn configure_api(&self) -> Result<(), SessionError> {
        self.fsm.doing("Preparing VM API medium");
        let vm = self.require_vm()?;
        let (slot, kind) = self.api_slot();

        self.reconciler(&vm)
            .unmount(slot, kind, true)
            .await
            .map_err(|e| SessionError::external(format!("unable to detach the previous context medium: {}", e.message)))?;

        let data = self.user_data();
        self.with_local(|local| local.set("vmapi_contents", &data));

        let Some(folder) = self.data_folder() else {
            return Err(SessionError::new(ErrorCode::NotFound, "machine has no data folder"));
        };
        let built = if kind == DiskKind::Floppy {
            self.context.floppy(&data, &folder).await
        } else {
            self.context.iso(&data, &folder).await
        };
        let medium = built
            .map_err(|e| SessionError::external(format!("unable to create the context medium: {e:#}")))?;

        self.mount_step(&vm, slot, kind, &medium.display().to_string(), false, "Context medium")
            .await?;
        self.fsm.done("VM API medium prepared");
        Ok(())
    }

    async fn release_api(&self) -> Result<(), SessionError> {
        self.fsm.doing("Releasing VM API medium");
        if let Some(vm) = self.vm_id() {
            let _ = self.query_machine().await;
            let (slot, kind) = self.api_slot();
            if let Err(e) = self.reconciler(&vm).unmount(slot, kind, true).await {
                warn!(vm = %self.id, error = %e, "failed to release context medium");
            }
        }
        self.fsm.done("VM API medium released");
        Ok(())
    }

    async fn start_vm(&self) -> Result<(), SessionError> {
        self.fsm.doing("Starting VM");
        let vm = self.require_vm()?;

        let kind = if self.flags().has(Flags::HEADFUL) { "gui" } else { "headless" };
        let options = self
            .commands
            .options()
            .map_error("VBoxManage: error:", ERR_START_FAILED);
        let out = self
            .commands
            .run_with(Args::new("startvm").arg(&vm).opt("--type", kind), &options)
            .await;
        if !out.success() {
            return Err(SessionError::control(format!(
                "unable to start the VM: {}",
                out.stderr
            )));
        }

        if let Ok(info) = self.refresh_machine().await {
            if let Some(folder) = info.get("Log folder") {
                let log = Path::new(folder).join("VBox.log");
                match probe::read_pid(&log).await {
                    Ok(Some(pid)) => self.with_local(|local| local.set("pid", pid)),
                    Ok(None) => debug!(vm = %self.id, "no process id in the VM log yet"),
                    Err(e) => debug!(vm = %self.id, error = %e, "VM log not readable"),
                }
            }
        }

        info!(vm = %self.id, machine = %vm, kind, "virtual machine started");
        self.fsm.done("VM started");
        Ok(())
    }
}
