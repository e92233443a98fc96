//! Hypervisor session manager.
//!
//! A [`session::VmSession`] keeps one VirtualBox machine in step with the
//! state its caller asks for. Every transition is a route through a graph
//! of state and action nodes, walked by the [`fsm`] worker; each action
//! shells out to `VBoxManage` through [`hypervisor::ControlPlane`].

pub mod config;
pub mod error;
pub mod fsm;
pub mod hypervisor;
pub mod media;
pub mod session;
pub mod template;
mod util;
