use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::command::CommandAdapter;
use crate::error::{ErrorCode, SessionError};
use crate::fsm::Progress;
use crate::hypervisor::parse::parse_blocks;
use crate::hypervisor::Args;

/// Ask the kernel for a currently unused TCP port on the loopback interface.
pub async fn free_local_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .context("binding an ephemeral port")?;
    let port = listener.local_addr().context("reading bound address")?.port();
    Ok(port)
}

/// `ip` with its last octet replaced.
pub fn change_upper_ip(ip: &str, last: u8) -> Option<String> {
    let addr: Ipv4Addr = ip.trim().parse().ok()?;
    let [a, b, c, _] = addr.octets();
    Some(Ipv4Addr::new(a, b, c, last).to_string())
}

struct Interface {
    name: String,
    network: String,
    ip: String,
    mask: String,
}

impl Interface {
    fn from_block(block: &BTreeMap<String, String>) -> Option<Self> {
        Some(Self {
            name: block.get("Name")?.clone(),
            network: block.get("VBoxNetworkName")?.clone(),
            ip: block.get("IPAddress")?.clone(),
            mask: block.get("NetworkMask")?.clone(),
        })
    }

    /// Server at `.100`, leases `.101` to `.254`.
    fn dhcp_range(&self) -> Option<(String, String, String)> {
        Some((
            change_upper_ip(&self.ip, 100)?,
            change_upper_ip(&self.ip, 101)?,
            change_upper_ip(&self.ip, 254)?,
        ))
    }
}

async fn list(commands: &CommandAdapter, what: &str) -> Result<Vec<BTreeMap<String, String>>, SessionError> {
    let out = commands.run(Args::new("list").arg(what)).await;
    if !out.success() {
        return Err(SessionError::query(format!("unable to list {what}: {}", out.stderr)));
    }
    Ok(parse_blocks(&out.stdout))
}

/// Try to bring up the disabled DHCP server of `iface`. Returns true once
/// the server is enabled.
async fn enable_dhcp(
    commands: &CommandAdapter,
    iface: &Interface,
    server: &BTreeMap<String, String>,
) -> bool {
    let unset = ["IP", "lowerIPAddress", "upperIPAddress", "NetworkMask"]
        .iter()
        .any(|k| server.get(*k).map(String::as_str) == Some("0.0.0.0"));
    if unset {
        let Some((ip, lower, upper)) = iface.dhcp_range() else {
            return false;
        };
        let out = commands
            .run(
                Args::new("dhcpserver")
                    .arg("modify")
                    .opt("--ifname", &iface.name)
                    .opt("--ip", ip)
                    .opt("--netmask", &iface.mask)
                    .opt("--lowerip", lower)
                    .opt("--upperip", upper),
            )
            .await;
        if !out.success() {
            return false;
        }
    }
    commands
        .run(
            Args::new("dhcpserver")
                .arg("modify")
                .opt("--ifname", &iface.name)
                .arg("--enable"),
        )
        .await
        .success()
}

/// Pick a host-only adapter with a running DHCP server, creating the
/// adapter and the server as needed. Returns the adapter name.
pub async fn host_only_adapter(
    commands: &CommandAdapter,
    progress: &dyn Progress,
) -> Result<String, SessionError> {
    progress.set_max(4);

    progress.doing("Enumerating host-only adapters");
    let mut blocks = list(commands, "hostonlyifs").await?;
    if blocks.is_empty() {
        progress.doing("Creating missing host-only adapter");
        let out = commands.run(Args::new("hostonlyif").arg("create")).await;
        if !out.success() {
            return Err(SessionError::create(format!(
                "unable to create a host-only adapter: {}",
                out.stderr
            )));
        }
        blocks = list(commands, "hostonlyifs").await?;
        if blocks.is_empty() {
            return Err(SessionError::new(
                ErrorCode::NotValidated,
                "unable to verify the creation of the host-only adapter",
            ));
        }
        progress.done("Adapter created");
    } else {
        progress.done("Adapter exists");
    }

    let interfaces: Vec<Interface> = blocks.iter().filter_map(Interface::from_block).collect();
    let Some(first) = interfaces.first() else {
        return Err(SessionError::new(
            ErrorCode::NotValidated,
            "no usable host-only adapter found",
        ));
    };

    progress.doing("Checking for DHCP server on the adapters");
    let servers = list(commands, "dhcpservers").await?;
    for iface in &interfaces {
        let matching = servers.iter().filter(|s| {
            s.get("NetworkName") == Some(&iface.network) && s.contains_key("Enabled")
        });
        for server in matching {
            let enabled = server.get("Enabled").map(String::as_str) == Some("Yes");
            if enabled || enable_dhcp(commands, iface, server).await {
                debug!(adapter = %iface.name, "dhcp server running");
                progress.done("DHCP server is running");
                return Ok(iface.name.clone());
            }
        }
    }
    progress.done("DHCP information recovered");

    progress.doing("Adding a DHCP server");
    let Some((ip, lower, upper)) = first.dhcp_range() else {
        return Err(SessionError::new(
            ErrorCode::NotValidated,
            format!("adapter {} has an invalid address {}", first.name, first.ip),
        ));
    };
    let out = commands
        .run(
            Args::new("dhcpserver")
                .arg("add")
                .opt("--ifname", &first.name)
                .opt("--ip", ip)
                .opt("--netmask", &first.mask)
                .opt("--lowerip", lower)
                .opt("--upperip", upper)
                .arg("--enable"),
        )
        .await;
    if !out.success() {
        return Err(SessionError::create(format!(
            "unable to add a DHCP server on {}: {}",
            first.name, out.stderr
        )));
    }
    info!(adapter = %first.name, "dhcp server added");
    progress.done("DHCP server added");
    Ok(first.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::progress::testing::RecordingProgress;
    use crate::hypervisor::testing::FakeVBox;
    use crate::hypervisor::ExecOptions;
    use std::sync::Arc;
    use std::time::Duration;

    fn adapter(fake: &Arc<FakeVBox>) -> CommandAdapter {
        CommandAdapter::new(
            fake.clone(),
            ExecOptions::new(Duration::from_secs(5), 0, Duration::ZERO),
        )
    }

    #[test]
    fn test_change_upper_ip() {
        assert_eq!(change_upper_ip("192.168.56.1", 100).as_deref(), Some("192.168.56.100"));
        assert_eq!(change_upper_ip(" 10.0.0.7 ", 254).as_deref(), Some("10.0.0.254"));
        assert_eq!(change_upper_ip("not-an-ip", 1), None);
    }

    #[tokio::test]
    async fn test_free_local_port_is_bindable() {
        let port = free_local_port().await.unwrap();
        assert_ne!(port, 0);
        tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_creates_adapter_and_dhcp_server() {
        let fake = FakeVBox::new();
        let commands = adapter(&fake);
        let progress = RecordingProgress::default();

        let name = host_only_adapter(&commands, &progress).await.unwrap();
        assert_eq!(name, "vboxnet0");
        assert_eq!(fake.calls_starting_with("hostonlyif create").len(), 1);

        let add = fake.calls_starting_with("dhcpserver add");
        assert_eq!(
            add,
            vec![
                "dhcpserver add --ifname vboxnet0 --ip 192.168.56.100 --netmask 255.255.255.0 \
                 --lowerip 192.168.56.101 --upperip 192.168.56.254 --enable"
            ]
        );
        assert_eq!(fake.dhcp_servers()[0]["Enabled"], "Yes");
    }

    #[tokio::test]
    async fn test_reuses_running_dhcp_server() {
        let fake = FakeVBox::new();
        fake.add_hostonly("vboxnet3", "10.1.2.1");
        let commands = adapter(&fake);
        host_only_adapter(&commands, &RecordingProgress::default())
            .await
            .unwrap();
        fake.clear_calls();

        let name = host_only_adapter(&commands, &RecordingProgress::default())
            .await
            .unwrap();
        assert_eq!(name, "vboxnet3");
        assert!(fake.calls_starting_with("dhcpserver").is_empty());
        assert!(fake.calls_starting_with("hostonlyif").is_empty());
    }

    #[tokio::test]
    async fn test_enables_disabled_server() {
        let fake = FakeVBox::new();
        fake.add_hostonly("vboxnet0", "192.168.56.1");
        let commands = adapter(&fake);
        commands
            .run(
                Args::new("dhcpserver")
                    .arg("add")
                    .opt("--ifname", "vboxnet0")
                    .opt("--ip", "192.168.56.100"),
            )
            .await;
        assert_eq!(fake.dhcp_servers()[0]["Enabled"], "No");
        fake.clear_calls();

        let name = host_only_adapter(&commands, &RecordingProgress::default())
            .await
            .unwrap();
        assert_eq!(name, "vboxnet0");
        assert_eq!(
            fake.calls_starting_with("dhcpserver"),
            vec!["dhcpserver modify --ifname vboxnet0 --enable"]
        );
        assert_eq!(fake.dhcp_servers()[0]["Enabled"], "Yes");
    }

    #[tokio::test]
    async fn test_create_failure_is_create_error() {
        let fake = FakeVBox::new();
        fake.fail_when("hostonlyif create", 1, "VBoxManage: error: denied", 1);
        let err = host_only_adapter(&adapter(&fake), &RecordingProgress::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CreateError);
    }

    #[tokio::test]
    async fn test_list_failure_is_query_error() {
        let fake = FakeVBox::new();
        fake.fail_when("list hostonlyifs", 1, "VBoxManage: error: broken", 1);
        let err = host_only_adapter(&adapter(&fake), &RecordingProgress::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::QueryError);
    }
}
