// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scripted fakes for the guest, host and clock.

use crate::hyperv::HotAddDisk;
use crate::hyperv::Hypervisor;
use crate::hyperv::VmState;
use crate::poll::Clock;
use crate::remote::CommandOutput;
use crate::remote::GuestShell;
use crate::remote::RemoteError;
use crate::remote::RunOptions;
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

/// Marker for a scripted reply that simulates an unreachable guest.
#[derive(Debug, Clone, Copy)]
pub struct Unreachable;

#[derive(Debug, Clone)]
enum Reply {
    Output { status: i32, stdout: String },
    Unreachable,
}

impl From<Result<&str, Unreachable>> for Reply {
    fn from(r: Result<&str, Unreachable>) -> Self {
        match r {
            Ok(stdout) => Reply::Output {
                status: 0,
                stdout: stdout.to_owned(),
            },
            Err(Unreachable) => Reply::Unreachable,
        }
    }
}

struct Rule {
    pattern: String,
    reply: Reply,
}

/// A [`GuestShell`] that answers commands from a script.
///
/// One-shot rules added with [`on`](Self::on) are consumed in order: a
/// command takes the first remaining rule whose pattern it contains. Commands
/// no one-shot rule matches fall through to the [`always`](Self::always)
/// rules, then to the fallback, then to a successful empty reply.
#[derive(Default)]
pub struct ScriptedShell {
    once: Mutex<VecDeque<Rule>>,
    always: Vec<Rule>,
    fallback: Option<Reply>,
    files: Mutex<BTreeMap<String, String>>,
    commands: Mutex<Vec<String>>,
    uploads: Mutex<Vec<(String, String)>>,
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_error() -> Result<&'static str, Unreachable> {
        Err(Unreachable)
    }

    pub fn on(self, pattern: &str, reply: Result<&str, Unreachable>) -> Self {
        self.once.lock().push_back(Rule {
            pattern: pattern.into(),
            reply: reply.into(),
        });
        self
    }

    pub fn on_status(self, pattern: &str, status: i32, stdout: &str) -> Self {
        self.once.lock().push_back(Rule {
            pattern: pattern.into(),
            reply: Reply::Output {
                status,
                stdout: stdout.into(),
            },
        });
        self
    }

    pub fn always(mut self, pattern: &str, reply: Result<&str, Unreachable>) -> Self {
        self.always.push(Rule {
            pattern: pattern.into(),
            reply: reply.into(),
        });
        self
    }

    pub fn fallback(mut self, reply: Result<&str, Unreachable>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    /// Makes `contents` downloadable from any remote path ending in `name`.
    pub fn file(self, name: &str, contents: &str) -> Self {
        self.files.lock().insert(name.into(), contents.into());
        self
    }

    /// Every command run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Returns true if some command contained `pattern`.
    pub fn ran(&self, pattern: &str) -> bool {
        self.commands.lock().iter().any(|c| c.contains(pattern))
    }

    /// The contents of the uploaded file called `name`.
    pub fn uploaded(&self, name: &str) -> Option<String> {
        self.uploads
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c.clone())
    }

    fn reply_for(&self, command: &str) -> Reply {
        let mut once = self.once.lock();
        if let Some(i) = once.iter().position(|r| command.contains(&r.pattern)) {
            if let Some(rule) = once.remove(i) {
                return rule.reply;
            }
        }
        if let Some(rule) = self.always.iter().find(|r| command.contains(&r.pattern)) {
            return rule.reply.clone();
        }
        self.fallback.clone().unwrap_or(Reply::Output {
            status: 0,
            stdout: String::new(),
        })
    }
}

impl GuestShell for ScriptedShell {
    fn run(&self, command: &str, options: &RunOptions) -> Result<CommandOutput, RemoteError> {
        self.commands.lock().push(command.to_owned());
        match self.reply_for(command) {
            Reply::Unreachable => Err(RemoteError::Connect {
                host: "fake".into(),
                message: "Connection refused".into(),
            }),
            Reply::Output { status, stdout } => {
                if status != 0 && !options.allow_failure {
                    return Err(RemoteError::CommandFailed {
                        command: command.to_owned(),
                        status,
                        stderr: String::new(),
                    });
                }
                Ok(CommandOutput {
                    status,
                    stdout: stdout.trim_end().to_owned(),
                    stderr: String::new(),
                })
            }
        }
    }

    fn upload(&self, local: &Path, _remote_dir: &str) -> Result<(), RemoteError> {
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let contents = fs_err::read_to_string(local)?;
        self.uploads.lock().push((name, contents));
        Ok(())
    }

    fn download(&self, remote_path: &str, local_dir: &Path) -> Result<PathBuf, RemoteError> {
        let files = self.files.lock();
        let (name, contents) = files
            .iter()
            .find(|(name, _)| remote_path.ends_with(name.as_str()))
            .ok_or_else(|| RemoteError::Transfer {
                path: remote_path.into(),
                message: "No such file or directory".into(),
            })?;
        let file_name = name.rsplit('/').next().unwrap_or(name);
        fs_err::create_dir_all(local_dir)?;
        let local = local_dir.join(file_name);
        fs_err::write(&local, contents)?;
        Ok(local)
    }
}

/// A [`Clock`] whose `sleep` advances virtual time instantly.
pub struct FakeClock {
    base: Instant,
    offset: Cell<Duration>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Cell::new(Duration::ZERO),
        }
    }

    /// Virtual time slept so far.
    pub fn elapsed(&self) -> Duration {
        self.offset.get()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.base + self.offset.get()
    }

    fn sleep(&self, duration: Duration) {
        self.offset.set(self.offset.get() + duration);
    }
}

/// A [`Hypervisor`] with scripted memory readings and recorded disk changes.
#[derive(Default)]
pub struct FakeHost {
    assigned: Mutex<VecDeque<u64>>,
    demand: Mutex<VecDeque<u64>>,
    fail_add: bool,
    added: Mutex<Vec<HotAddDisk>>,
    removed: Mutex<Vec<HotAddDisk>>,
}

/// Pops the next reading, repeating the last one once the script runs out.
fn next_reading(readings: &Mutex<VecDeque<u64>>) -> anyhow::Result<u64> {
    let mut readings = readings.lock();
    match readings.len() {
        0 => anyhow::bail!("no reading scripted"),
        1 => Ok(readings[0]),
        _ => Ok(readings.pop_front().unwrap_or_default()),
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory_assigned_readings(self, readings: &[u64]) -> Self {
        self.assigned.lock().extend(readings);
        self
    }

    pub fn memory_demand_readings(self, readings: &[u64]) -> Self {
        self.demand.lock().extend(readings);
        self
    }

    pub fn failing_disk_add(mut self) -> Self {
        self.fail_add = true;
        self
    }

    pub fn added_disks(&self) -> Vec<HotAddDisk> {
        self.added.lock().clone()
    }

    pub fn removed_disks(&self) -> Vec<HotAddDisk> {
        self.removed.lock().clone()
    }
}

impl Hypervisor for FakeHost {
    fn vm_state(&self, _vm: &str) -> anyhow::Result<VmState> {
        Ok(VmState::Running)
    }

    fn memory_assigned(&self, _vm: &str) -> anyhow::Result<u64> {
        next_reading(&self.assigned)
    }

    fn memory_demand(&self, _vm: &str) -> anyhow::Result<u64> {
        next_reading(&self.demand)
    }

    fn add_scsi_disk(&self, vm: &str, _size_bytes: u64) -> anyhow::Result<HotAddDisk> {
        if self.fail_add {
            anyhow::bail!("Add-VMHardDiskDrive failed for {vm}");
        }
        let mut added = self.added.lock();
        let disk = HotAddDisk {
            path: PathBuf::from(format!("{vm}-hotadd-{}.vhdx", added.len())),
            controller_number: 0,
            controller_location: added.len() as u32 + 1,
        };
        added.push(disk.clone());
        Ok(disk)
    }

    fn remove_scsi_disk(&self, _vm: &str, disk: &HotAddDisk) -> anyhow::Result<()> {
        self.removed.lock().push(disk.clone());
        Ok(())
    }
}
