// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host-side queries and device changes for Hyper-V guests.

use crate::SIZE_1_MB;
use anyhow::Context;
use powershell_builder::PowerShellBuilder;
use powershell_builder::RawVal;
use serde::Deserialize;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

/// The power state of a VM as reported by `Get-VM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmState {
    /// The VM is powered off.
    Off,
    /// The VM is running.
    Running,
    /// The VM is starting.
    Starting,
    /// The VM is shutting down.
    Stopping,
    /// The VM has been saved.
    Saved,
    /// The VM has been paused.
    Paused,
    /// Any state this harness does not care about.
    Other(String),
}

impl FromStr for VmState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "Off" => VmState::Off,
            "Running" => VmState::Running,
            "Starting" => VmState::Starting,
            "Stopping" => VmState::Stopping,
            "Saved" => VmState::Saved,
            "Paused" => VmState::Paused,
            other => VmState::Other(other.to_owned()),
        })
    }
}

/// A SCSI disk attached while the VM is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotAddDisk {
    /// The backing VHDX on the host.
    pub path: PathBuf,
    /// The SCSI controller it is attached to.
    pub controller_number: u32,
    /// The location on that controller.
    pub controller_location: u32,
}

/// The host operations test cases rely on.
pub trait Hypervisor {
    /// The VM's power state.
    fn vm_state(&self, vm: &str) -> anyhow::Result<VmState>;
    /// Memory currently assigned to the VM, in bytes.
    fn memory_assigned(&self, vm: &str) -> anyhow::Result<u64>;
    /// Memory the VM currently demands, in bytes.
    fn memory_demand(&self, vm: &str) -> anyhow::Result<u64>;
    /// Creates a dynamic VHDX of `size_bytes` and attaches it to the VM's
    /// SCSI controller.
    fn add_scsi_disk(&self, vm: &str, size_bytes: u64) -> anyhow::Result<HotAddDisk>;
    /// Detaches and deletes a disk added with [`Self::add_scsi_disk`].
    fn remove_scsi_disk(&self, vm: &str, disk: &HotAddDisk) -> anyhow::Result<()>;
}

/// [`Hypervisor`] backed by the Hyper-V PowerShell module on this machine.
pub struct HyperVHost {
    vhd_dir: PathBuf,
}

impl HyperVHost {
    /// Hot-added disks are created in `vhd_dir`.
    pub fn new(vhd_dir: impl Into<PathBuf>) -> Self {
        Self {
            vhd_dir: vhd_dir.into(),
        }
    }
}

fn get_vm_property(vm: &str, property: &str) -> PowerShellBuilder {
    PowerShellBuilder::new()
        .cmdlet("Get-VM")
        .arg("Name", vm)
        .pipeline()
        .select_object_property(property)
        .finish()
}

fn new_vhd(path: &Path, size_bytes: u64) -> PowerShellBuilder {
    PowerShellBuilder::new()
        .cmdlet("New-VHD")
        .arg("Path", path)
        .arg("SizeBytes", size_bytes)
        .flag("Dynamic")
        .pipeline()
        .cmdlet("Out-Null")
        .finish()
}

fn add_vm_hard_disk_drive(vm: &str, path: &Path) -> PowerShellBuilder {
    PowerShellBuilder::new()
        .cmdlet("Add-VMHardDiskDrive")
        .arg("VMName", vm)
        .arg("ControllerType", RawVal::new("SCSI"))
        .arg("Path", path)
        .flag("Passthru")
        .pipeline()
        .cmdlet("Select-Object")
        .positional(RawVal::new("ControllerNumber,ControllerLocation"))
        .pipeline()
        .cmdlet("ConvertTo-Json")
        .flag("Compress")
        .finish()
}

fn remove_vm_hard_disk_drive(vm: &str, disk: &HotAddDisk) -> PowerShellBuilder {
    PowerShellBuilder::new()
        .cmdlet("Remove-VMHardDiskDrive")
        .arg("VMName", vm)
        .arg("ControllerType", RawVal::new("SCSI"))
        .arg("ControllerNumber", disk.controller_number)
        .arg("ControllerLocation", disk.controller_location)
        .finish()
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DriveLocation {
    controller_number: u32,
    controller_location: u32,
}

impl Hypervisor for HyperVHost {
    fn vm_state(&self, vm: &str) -> anyhow::Result<VmState> {
        let out = get_vm_property(vm, "State")
            .output()
            .context("get_vm_state")?;
        let Ok(state) = out.parse::<VmState>();
        Ok(state)
    }

    fn memory_assigned(&self, vm: &str) -> anyhow::Result<u64> {
        get_vm_property(vm, "MemoryAssigned")
            .output()
            .context("get_vm_memory_assigned")?
            .parse()
            .context("MemoryAssigned is not a number")
    }

    fn memory_demand(&self, vm: &str) -> anyhow::Result<u64> {
        get_vm_property(vm, "MemoryDemand")
            .output()
            .context("get_vm_memory_demand")?
            .parse()
            .context("MemoryDemand is not a number")
    }

    fn add_scsi_disk(&self, vm: &str, size_bytes: u64) -> anyhow::Result<HotAddDisk> {
        let stamp = jiff::Timestamp::now().as_second();
        let path = self.vhd_dir.join(format!("{vm}-hotadd-{stamp}.vhdx"));
        tracing::info!(
            vm,
            path = %path.display(),
            size_mb = size_bytes / SIZE_1_MB,
            "creating hot-add disk"
        );
        new_vhd(&path, size_bytes).run().context("new_vhd")?;
        let location = add_vm_hard_disk_drive(vm, &path)
            .output()
            .context("add_vm_hard_disk_drive")?;
        let location: DriveLocation =
            serde_json::from_str(&location).context("unexpected Add-VMHardDiskDrive output")?;
        Ok(HotAddDisk {
            path,
            controller_number: location.controller_number,
            controller_location: location.controller_location,
        })
    }

    fn remove_scsi_disk(&self, vm: &str, disk: &HotAddDisk) -> anyhow::Result<()> {
        tracing::info!(vm, path = %disk.path.display(), "removing hot-add disk");
        remove_vm_hard_disk_drive(vm, disk)
            .run()
            .context("remove_vm_hard_disk_drive")?;
        fs_err::remove_file(&disk.path)?;
        Ok(())
    }
}
