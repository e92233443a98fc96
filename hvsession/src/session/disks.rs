use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use super::command::CommandAdapter;
use super::snapshot::MachineSnapshot;
use crate::error::{ErrorCode, SessionError};
use crate::hypervisor::parse::{parse_attachment, parse_blocks, parse_properties};
use crate::hypervisor::Args;
use crate::util::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskKind {
    Hdd,
    Dvd,
    Floppy,
}

impl DiskKind {
    /// Value for `storageattach --type`.
    fn attach_type(self) -> &'static str {
        match self {
            DiskKind::Hdd => "hdd",
            DiskKind::Dvd => "dvddrive",
            DiskKind::Floppy => "fdd",
        }
    }

    /// Medium class for `closemedium`.
    fn medium_class(self) -> &'static str {
        match self {
            DiskKind::Hdd => "disk",
            DiskKind::Dvd => "dvd",
            DiskKind::Floppy => "floppy",
        }
    }
}

/// A (controller, port, device) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSlot {
    pub controller: &'static str,
    pub port: u32,
    pub device: u32,
}

impl DiskSlot {
    pub const fn new(controller: &'static str, port: u32, device: u32) -> Self {
        Self {
            controller,
            port,
            device,
        }
    }

    /// Attribute name under which `showvminfo` reports the slot.
    pub fn key(&self) -> String {
        self.to_string()
    }

    fn attach_args(&self, vm: &str) -> Args {
        Args::new("storageattach")
            .arg(vm)
            .opt("--storagectl", self.controller)
            .opt("--port", self.port)
            .opt("--device", self.device)
    }
}

impl fmt::Display for DiskSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.controller, self.port, self.device)
    }
}

pub const BOOT_SLOT: DiskSlot = DiskSlot::new("IDE", 0, 0);
pub const GUEST_ADDITIONS_SLOT: DiskSlot = DiskSlot::new("IDE", 0, 1);
pub const CONTEXT_SLOT: DiskSlot = DiskSlot::new("IDE", 1, 0);
pub const SCRATCH_SLOT: DiskSlot = DiskSlot::new("SATA", 0, 0);
pub const FLOPPY_SLOT: DiskSlot = DiskSlot::new("Floppy", 0, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    Mounted,
    /// The slot already held the requested medium; nothing was changed.
    AlreadyInPlace,
}

/// Mounts and unmounts media on one VM, keeping its snapshot in step.
pub struct Reconciler<'a> {
    commands: &'a CommandAdapter,
    machine: &'a Mutex<MachineSnapshot>,
    vm: &'a str,
}

impl<'a> Reconciler<'a> {
    pub fn new(commands: &'a CommandAdapter, machine: &'a Mutex<MachineSnapshot>, vm: &'a str) -> Self {
        Self {
            commands,
            machine,
            vm,
        }
    }

    fn attached(&self, slot: &DiskSlot) -> Option<String> {
        let machine = lock(self.machine);
        let key = slot.key();
        machine
            .has_medium(&key)
            .then(|| machine.get(&key).unwrap_or_default().to_string())
    }

    async fn disk_info(&self, reference: &str) -> BTreeMap<String, String> {
        let out = self
            .commands
            .run(Args::new("showhdinfo").arg(reference))
            .await;
        if out.success() {
            parse_properties(&out.stdout)
        } else {
            BTreeMap::new()
        }
    }

    /// UUID of the registered multi-attach base image stored at `path`.
    async fn master_uuid(&self, path: &str) -> Option<String> {
        let out = self.commands.run(Args::new("list").arg("hdds")).await;
        if !out.success() {
            return None;
        }
        parse_blocks(&out.stdout).into_iter().find_map(|disk| {
            let is_master = disk.get("Type").map(String::as_str) == Some("multiattach")
                && disk.get("Parent UUID").map(String::as_str) == Some("base")
                && disk.get("Location").map(String::as_str) == Some(path);
            if is_master {
                disk.get("UUID").cloned()
            } else {
                None
            }
        })
    }

    /// Attach `source` to `slot`, replacing whatever is there.
    ///
    /// Multi-attach only applies to hard disks. A failed detach of the stale
    /// medium is reported as [`ErrorCode::DeleteError`].
    pub async fn mount(
        &self,
        slot: DiskSlot,
        kind: DiskKind,
        source: &str,
        multi_attach: bool,
    ) -> Result<MountOutcome, SessionError> {
        let multi = multi_attach && kind == DiskKind::Hdd;

        if let Some(current) = self.attached(&slot) {
            let (path, uuid) = parse_attachment(&current);
            if path == source {
                debug!(slot = %slot, %source, "medium already attached");
                return Ok(MountOutcome::AlreadyInPlace);
            }
            if multi {
                if let Some(uuid) = uuid {
                    let child = self.disk_info(&uuid).await;
                    let base = self.disk_info(source).await;
                    if let (Some(parent), Some(base)) = (child.get("Parent UUID"), base.get("UUID")) {
                        if parent == base {
                            debug!(slot = %slot, %source, "differencing child of base already attached");
                            return Ok(MountOutcome::AlreadyInPlace);
                        }
                    }
                }
            }
            self.unmount(slot, kind, multi).await.map_err(|e| {
                SessionError::new(
                    ErrorCode::DeleteError,
                    format!("unable to detach previous medium from {slot}: {}", e.message),
                )
            })?;
        }

        let master = if multi {
            self.master_uuid(source).await
        } else {
            None
        };

        let guid = uuid::Uuid::new_v4().to_string();
        let mut args = slot
            .attach_args(self.vm)
            .opt("--type", kind.attach_type())
            .opt("--medium", source);
        if kind != DiskKind::Dvd {
            args.push_opt("--setuuid", &guid);
        }
        if multi {
            args.push_opt("--mtype", "multiattach");
        }
        let mut out = self.commands.run(args).await;

        if !out.success() {
            if let Some(master) = master.as_deref() {
                debug!(slot = %slot, %master, "attach by path failed, retrying by base uuid");
                let args = slot
                    .attach_args(self.vm)
                    .opt("--type", kind.attach_type())
                    .opt("--mtype", "multiattach")
                    .opt("--setuuid", &guid)
                    .opt("--medium", master);
                out = self.commands.run(args).await;
            }
        }

        if !out.success() {
            return Err(SessionError::external(format!(
                "unable to attach {source} to {slot}: {}",
                out.stderr
            )));
        }

        let shown_uuid = if kind == DiskKind::Dvd {
            "<irrelevant>"
        } else {
            guid.as_str()
        };
        lock(self.machine).set(slot.key(), format!("{source} (UUID: {shown_uuid})"));
        info!(vm = %self.vm, slot = %slot, %source, "medium attached");
        Ok(MountOutcome::Mounted)
    }

    /// Detach whatever `slot` holds. With `delete`, the medium is also
    /// closed and its file removed.
    pub async fn unmount(&self, slot: DiskSlot, kind: DiskKind, delete: bool) -> Result<(), SessionError> {
        let Some(current) = self.attached(&slot) else {
            return Ok(());
        };

        let out = self
            .commands
            .run(slot.attach_args(self.vm).opt("--medium", "none"))
            .await;
        if !out.success() {
            return Err(SessionError::external(format!(
                "unable to detach medium from {slot}: {}",
                out.stderr
            )));
        }

        if delete {
            let (path, uuid) = parse_attachment(&current);
            let class = kind.medium_class();
            let mut closed = self
                .commands
                .run(Args::new("closemedium").arg(class).arg(&path).arg("--delete"))
                .await
                .success();
            if !closed {
                if let Some(uuid) = uuid.as_deref() {
                    closed = self
                        .commands
                        .run(Args::new("closemedium").arg(class).arg(uuid).arg("--delete"))
                        .await
                        .success();
                }
            }
            if !closed {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path, error = %e, "failed to remove detached medium");
                    }
                }
            }
        }

        lock(self.machine).remove(&slot.key());
        debug!(vm = %self.vm, slot = %slot, delete, "medium detached");
        Ok(())
    }
}
