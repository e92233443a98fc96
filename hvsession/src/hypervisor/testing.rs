//! In-memory stand-in for `VBoxManage`, used by the session tests.
//!
//! Models just enough of the tool to drive the session graph: registered
//! machines with their `showvminfo` attributes, storage slots, the media
//! registry, NAT rules and host-only/DHCP networking. Every invocation is
//! recorded, and scripted failures can be injected by substring.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use super::{ControlPlane, ExecOptions, ExecOutput};

const SINCE: &str = "(since 2024-01-01T00:00:00.000000000)";

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeVm {
    pub(crate) info: BTreeMap<String, String>,
    pub(crate) state: String,
    pub(crate) nat_rules: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeDisk {
    pub(crate) uuid: String,
    pub(crate) location: String,
    pub(crate) parent: String,
    pub(crate) kind: String,
}

struct Failure {
    pattern: String,
    code: i32,
    stderr: String,
    remaining: usize,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Vec<String>>,
    vms: BTreeMap<String, FakeVm>,
    disks: Vec<FakeDisk>,
    failures: Vec<Failure>,
    hostonly: Vec<BTreeMap<String, String>>,
    dhcp: Vec<BTreeMap<String, String>>,
    next_id: u32,
}

impl FakeState {
    fn new_uuid(&mut self) -> String {
        self.next_id += 1;
        format!("00000000-0000-4000-8000-{:012}", self.next_id)
    }

    fn disk_by_ref(&self, reference: &str) -> Option<&FakeDisk> {
        self.disks
            .iter()
            .find(|d| d.uuid == reference || d.location == reference)
    }
}

#[derive(Default)]
pub(crate) struct FakeVBox {
    state: Mutex<FakeState>,
}

fn opt<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn not_found(what: &str) -> ExecOutput {
    ExecOutput::failed(
        1,
        format!("VBoxManage: error: Could not find a registered machine named '{what}'"),
    )
}

impl FakeVBox {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every invocation so far, each rendered as a space-joined line.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|c| c.join(" "))
            .collect()
    }

    pub(crate) fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub(crate) fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Fail the next `times` invocations whose command line contains `pattern`.
    pub(crate) fn fail_when(&self, pattern: &str, code: i32, stderr: &str, times: usize) {
        self.state.lock().unwrap().failures.push(Failure {
            pattern: pattern.to_string(),
            code,
            stderr: stderr.to_string(),
            remaining: times,
        });
    }

    pub(crate) fn vm(&self, id: &str) -> Option<FakeVm> {
        self.state.lock().unwrap().vms.get(id).cloned()
    }

    pub(crate) fn vm_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().vms.keys().cloned().collect()
    }

    pub(crate) fn insert_vm(&self, id: &str, state: &str, info: &[(&str, &str)]) {
        let mut vm = FakeVm {
            state: state.to_string(),
            ..Default::default()
        };
        vm.info.insert("UUID".into(), id.to_string());
        for (k, v) in info {
            vm.info.insert(k.to_string(), v.to_string());
        }
        self.state.lock().unwrap().vms.insert(id.to_string(), vm);
    }

    pub(crate) fn add_disk(&self, uuid: &str, location: &str, parent: &str, kind: &str) {
        self.state.lock().unwrap().disks.push(FakeDisk {
            uuid: uuid.to_string(),
            location: location.to_string(),
            parent: parent.to_string(),
            kind: kind.to_string(),
        });
    }

    pub(crate) fn disks(&self) -> Vec<FakeDisk> {
        self.state.lock().unwrap().disks.clone()
    }

    pub(crate) fn add_hostonly(&self, name: &str, ip: &str) {
        let mut iface = BTreeMap::new();
        iface.insert("Name".into(), name.to_string());
        iface.insert(
            "VBoxNetworkName".into(),
            format!("HostInterfaceNetworking-{name}"),
        );
        iface.insert("IPAddress".into(), ip.to_string());
        iface.insert("NetworkMask".into(), "255.255.255.0".into());
        self.state.lock().unwrap().hostonly.push(iface);
    }

    pub(crate) fn dhcp_servers(&self) -> Vec<BTreeMap<String, String>> {
        self.state.lock().unwrap().dhcp.clone()
    }

    fn respond(&self, args: &[String]) -> ExecOutput {
        let mut st = self.state.lock().unwrap();
        st.calls.push(args.to_vec());

        let line = args.join(" ");
        if let Some(f) = st
            .failures
            .iter_mut()
            .find(|f| f.remaining > 0 && line.contains(&f.pattern))
        {
            f.remaining -= 1;
            return ExecOutput::failed(f.code, f.stderr.clone());
        }

        let verb = args.first().map(String::as_str).unwrap_or("");
        let target = args.get(1).cloned().unwrap_or_default();
        match verb {
            "showvminfo" => match st.vms.get(&target) {
                Some(vm) => {
                    let mut lines: Vec<String> = vm
                        .info
                        .iter()
                        .map(|(k, v)| format!("{k}: {v}"))
                        .collect();
                    lines.push(format!("State: {} {}", vm.state, SINCE));
                    for (i, rule) in vm.nat_rules.iter().enumerate() {
                        lines.push(format!("NIC 1 Rule({i}): {rule}"));
                    }
                    ExecOutput::ok(lines)
                }
                None => not_found(&target),
            },
            "createvm" => {
                let name = opt(args, "--name").unwrap_or("vm").to_string();
                let base = opt(args, "--basefolder").unwrap_or("/tmp").to_string();
                let id = st.new_uuid();
                let mut vm = FakeVm {
                    state: "powered off".into(),
                    ..Default::default()
                };
                vm.info.insert("Name".into(), name.clone());
                vm.info.insert("UUID".into(), id.clone());
                vm.info
                    .insert("Config file".into(), format!("{base}/{name}/{name}.vbox"));
                vm.info.insert("Log folder".into(), format!("{base}/{name}/Logs"));
                vm.info.insert("Number of CPUs".into(), "1".into());
                vm.info.insert("Memory size".into(), "128MB".into());
                vm.info.insert("VRAM size".into(), "8MB".into());
                vm.info.insert("ACPI".into(), "off".into());
                vm.info.insert("IOAPIC".into(), "off".into());
                vm.info.insert("Boot Device (1)".into(), "Floppy".into());
                vm.info.insert("NIC 1".into(), "disabled".into());
                vm.info.insert("VRDE".into(), "disabled".into());
                st.vms.insert(id.clone(), vm);
                ExecOutput::ok(vec![
                    format!("Virtual machine '{name}' is created and registered."),
                    format!("UUID: {id}"),
                    format!("Settings file: '{base}/{name}/{name}.vbox'"),
                ])
            }
            "storagectl" => {
                if st.vms.contains_key(&target) {
                    ExecOutput::ok(vec![])
                } else {
                    not_found(&target)
                }
            }
            "modifyvm" => {
                let Some(vm) = st.vms.get_mut(&target) else {
                    return not_found(&target);
                };
                if let Some(rule) = opt(args, "--natpf1") {
                    let name = rule.split(',').next().unwrap_or("").to_string();
                    if vm.nat_rules.iter().any(|r| r.starts_with(&format!("name = {name},"))) {
                        return ExecOutput::failed(
                            1,
                            "VBoxManage: error: A NAT rule of this name already exists",
                        );
                    }
                    vm.nat_rules.push(format!("name = {name}, rule = {rule}"));
                }
                apply_modify(vm, args);
                ExecOutput::ok(vec![])
            }
            "storageattach" => storage_attach(&mut st, args),
            "closemedium" => {
                let reference = args.get(2).cloned().unwrap_or_default();
                let before = st.disks.len();
                st.disks.retain(|d| d.uuid != reference && d.location != reference);
                if st.disks.len() == before {
                    ExecOutput::failed(1, format!("VBoxManage: error: Could not find file for the medium '{reference}'"))
                } else {
                    ExecOutput::ok(vec![])
                }
            }
            "showhdinfo" => match st.disk_by_ref(&target) {
                Some(disk) => ExecOutput::ok(vec![
                    format!("UUID: {}", disk.uuid),
                    format!("Parent UUID: {}", disk.parent),
                    format!("Location: {}", disk.location),
                    format!("Type: {}", disk.kind),
                ]),
                None => ExecOutput::failed(1, "VBoxManage: error: Could not find file for the medium"),
            },
            "createhd" | "createmedium" => {
                let location = opt(args, "--filename").unwrap_or("").to_string();
                let uuid = st.new_uuid();
                st.disks.push(FakeDisk {
                    uuid: uuid.clone(),
                    location,
                    parent: "base".into(),
                    kind: "normal (base)".into(),
                });
                ExecOutput::ok(vec![format!("Medium created. UUID: {uuid}")])
            }
            "list" => match target.as_str() {
                "hdds" => {
                    let mut lines = Vec::new();
                    for disk in &st.disks {
                        lines.push(format!("UUID: {}", disk.uuid));
                        lines.push(format!("Parent UUID: {}", disk.parent));
                        lines.push(format!("Location: {}", disk.location));
                        lines.push(format!("Type: {}", disk.kind));
                        lines.push(String::new());
                    }
                    ExecOutput::ok(lines)
                }
                "hostonlyifs" => ExecOutput::ok(blocks(&st.hostonly)),
                "dhcpservers" => ExecOutput::ok(blocks(&st.dhcp)),
                _ => ExecOutput::failed(1, "unknown list"),
            },
            "hostonlyif" => {
                let name = format!("vboxnet{}", st.hostonly.len());
                drop(st);
                self.add_hostonly(&name, "192.168.56.1");
                ExecOutput::ok(vec![format!("Interface '{name}' was successfully created")])
            }
            "dhcpserver" => {
                let ifname = opt(args, "--ifname").unwrap_or("").to_string();
                let network = format!("HostInterfaceNetworking-{ifname}");
                let enabled = args.iter().any(|a| a == "--enable");
                match target.as_str() {
                    "add" => {
                        let mut server = BTreeMap::new();
                        server.insert("NetworkName".into(), network);
                        server.insert("IP".into(), opt(args, "--ip").unwrap_or("").to_string());
                        server.insert(
                            "Enabled".into(),
                            if enabled { "Yes" } else { "No" }.to_string(),
                        );
                        st.dhcp.push(server);
                        ExecOutput::ok(vec![])
                    }
                    "modify" => {
                        for server in st.dhcp.iter_mut() {
                            if server.get("NetworkName") == Some(&network) && enabled {
                                server.insert("Enabled".into(), "Yes".into());
                            }
                        }
                        ExecOutput::ok(vec![])
                    }
                    _ => ExecOutput::failed(1, "unknown dhcpserver verb"),
                }
            }
            "startvm" => match st.vms.get_mut(&target) {
                Some(vm) => {
                    vm.state = "running".into();
                    ExecOutput::ok(vec![format!(
                        "VM \"{target}\" has been successfully started."
                    )])
                }
                None => not_found(&target),
            },
            "controlvm" => {
                let action = args.get(2).cloned().unwrap_or_default();
                let Some(vm) = st.vms.get_mut(&target) else {
                    return not_found(&target);
                };
                match action.as_str() {
                    "pause" => vm.state = "paused".into(),
                    "resume" => vm.state = "running".into(),
                    "savestate" => vm.state = "saved".into(),
                    "poweroff" => vm.state = "powered off".into(),
                    _ => {}
                }
                ExecOutput::ok(vec![])
            }
            "discardstate" => match st.vms.get_mut(&target) {
                Some(vm) => {
                    vm.state = "powered off".into();
                    ExecOutput::ok(vec![])
                }
                None => not_found(&target),
            },
            "unregistervm" => match st.vms.remove(&target) {
                Some(_) => ExecOutput::ok(vec![]),
                None => not_found(&target),
            },
            _ => ExecOutput::failed(1, format!("unsupported command: {line}")),
        }
    }
}

fn blocks(entries: &[BTreeMap<String, String>]) -> Vec<String> {
    let mut lines = Vec::new();
    for entry in entries {
        for (k, v) in entry {
            lines.push(format!("{k}: {v}"));
        }
        lines.push(String::new());
    }
    lines
}

fn apply_modify(vm: &mut FakeVm, args: &[String]) {
    let mut vrde = BTreeMap::new();
    let mut i = 2;
    while i + 1 < args.len() {
        let (flag, value) = (args[i].as_str(), args[i + 1].as_str());
        match flag {
            "--cpus" => {
                vm.info.insert("Number of CPUs".into(), value.into());
            }
            "--memory" => {
                vm.info.insert("Memory size".into(), format!("{value}MB"));
            }
            "--vram" => {
                vm.info.insert("VRAM size".into(), format!("{value}MB"));
            }
            "--acpi" => {
                vm.info.insert("ACPI".into(), value.into());
            }
            "--ioapic" => {
                vm.info.insert("IOAPIC".into(), value.into());
            }
            "--boot1" => {
                let shown = match value {
                    "dvd" => "DVD",
                    "disk" => "HardDisk",
                    other => other,
                };
                vm.info.insert("Boot Device (1)".into(), shown.into());
            }
            "--nic1" if value == "nat" => {
                vm.info.insert(
                    "NIC 1".into(),
                    "MAC: 080027000001, Attachment: NAT, Cable connected: on".into(),
                );
            }
            "--nic2" if value == "hostonly" => {
                vm.info.insert(
                    "NIC 2".into(),
                    "MAC: 080027000002, Attachment: Host-only Interface".into(),
                );
            }
            "--cpuexecutioncap" => {
                vm.info.insert("CPU exec cap".into(), format!("{value}%"));
            }
            "--vrde" | "--vrdeaddress" | "--vrdeport" | "--vrdemulticon" | "--vrdeauthtype" => {
                vrde.insert(flag.to_string(), value.to_string());
            }
            _ => {}
        }
        i += 2;
    }
    if vrde.get("--vrde").map(String::as_str) == Some("on") {
        let get = |k: &str| vrde.get(k).cloned().unwrap_or_default();
        vm.info.insert(
            "VRDE".into(),
            format!(
                "enabled (Address {}, Ports {}, MultiConn: {}, ReuseSingleConn: off, Authentication type: {})",
                get("--vrdeaddress"),
                get("--vrdeport"),
                get("--vrdemulticon"),
                get("--vrdeauthtype"),
            ),
        );
    }
}

fn storage_attach(st: &mut FakeState, args: &[String]) -> ExecOutput {
    let target = args.get(1).cloned().unwrap_or_default();
    if !st.vms.contains_key(&target) {
        return not_found(&target);
    }
    let slot = format!(
        "{} ({}, {})",
        opt(args, "--storagectl").unwrap_or(""),
        opt(args, "--port").unwrap_or("0"),
        opt(args, "--device").unwrap_or("0")
    );
    let medium = opt(args, "--medium").unwrap_or("none").to_string();
    let kind = opt(args, "--type").unwrap_or("hdd").to_string();
    let multi = opt(args, "--mtype") == Some("multiattach");
    let setuuid = opt(args, "--setuuid").map(str::to_string);

    if medium == "none" {
        if let Some(vm) = st.vms.get_mut(&target) {
            vm.info.remove(&slot);
        }
        return ExecOutput::ok(vec![]);
    }

    let (location, uuid) = if kind == "hdd" && multi {
        // Attach a differencing child of the registered base.
        let base = match st.disk_by_ref(&medium) {
            Some(disk) => disk.clone(),
            None => {
                let uuid = st.new_uuid();
                let disk = FakeDisk {
                    uuid,
                    location: medium.clone(),
                    parent: "base".into(),
                    kind: "multiattach".into(),
                };
                st.disks.push(disk.clone());
                disk
            }
        };
        let child = setuuid.unwrap_or_else(|| st.new_uuid());
        st.disks.push(FakeDisk {
            uuid: child.clone(),
            location: format!("{}/Snapshots/{{{child}}}.vdi", target),
            parent: base.uuid.clone(),
            kind: "normal (differencing)".into(),
        });
        (base.location, child)
    } else {
        let uuid = match st.disk_by_ref(&medium) {
            Some(disk) => disk.uuid.clone(),
            None => {
                let uuid = setuuid.clone().unwrap_or_else(|| st.new_uuid());
                if kind == "hdd" {
                    st.disks.push(FakeDisk {
                        uuid: uuid.clone(),
                        location: medium.clone(),
                        parent: "base".into(),
                        kind: "normal (base)".into(),
                    });
                }
                uuid
            }
        };
        (medium.clone(), uuid)
    };

    if let Some(vm) = st.vms.get_mut(&target) {
        vm.info.insert(slot, format!("{location} (UUID: {uuid})"));
    }
    ExecOutput::ok(vec![])
}

#[async_trait]
impl ControlPlane for FakeVBox {
    async fn exec(&self, args: &[String], options: &ExecOptions) -> Result<ExecOutput> {
        let out = self.respond(args);
        match options.classify(&out.stderr) {
            Some(code) => Ok(ExecOutput { code, ..out }),
            None => Ok(out),
        }
    }
}
