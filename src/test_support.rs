//! Test support utilities shared across unit and integration tests.
//!
//! The doubles here stand in for the provider API, the instance metadata
//! service, and the guest's device tooling so that lifecycle and resolution
//! behaviour can be driven deterministically.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::future;
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::device::{DeviceError, DeviceSlot, LocalDevices};
use crate::metadata::{MetadataError, MetadataSource};
use crate::provider::{
    InstanceDescription, ProviderClient, ProviderFuture, ResourceKind, ResourceStatus, VolumeSpec,
};
use crate::types::{InstanceId, SnapshotId, VolumeId};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// In-memory stand-in for the guest's block device tooling.
///
/// Listings are returned in FIFO order; the final listing keeps being
/// returned once the queue is down to one entry. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct FakeDevices {
    listings: Rc<RefCell<VecDeque<BTreeSet<String>>>>,
    paths: Rc<RefCell<BTreeMap<String, Vec<Utf8PathBuf>>>>,
    existing: Rc<RefCell<BTreeSet<Utf8PathBuf>>>,
    settles: Rc<Cell<u32>>,
}

impl FakeDevices {
    /// Creates a device set with no listings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a device listing.
    #[must_use]
    pub fn with_listing<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push_listing(names);
        self
    }

    /// Registers `path` as an existing node for kernel device `name`.
    #[must_use]
    pub fn with_path(self, name: &str, path: &str) -> Self {
        self.push_path(name, path, true);
        self
    }

    /// Registers `path` for kernel device `name` without creating the node.
    #[must_use]
    pub fn with_missing_path(self, name: &str, path: &str) -> Self {
        self.push_path(name, path, false);
        self
    }

    /// Queues a device listing through a shared handle.
    pub fn push_listing<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.listings
            .borrow_mut()
            .push_back(names.into_iter().map(Into::into).collect());
    }

    /// Number of times udev was asked to settle.
    #[must_use]
    pub fn settle_calls(&self) -> u32 {
        self.settles.get()
    }

    fn push_path(&self, name: &str, raw_path: &str, exists: bool) {
        let node = Utf8PathBuf::from(raw_path);
        if exists {
            self.existing.borrow_mut().insert(node.clone());
        }
        self.paths
            .borrow_mut()
            .entry(name.to_owned())
            .or_default()
            .push(node);
    }
}

impl LocalDevices for FakeDevices {
    fn list_block_devices(&self) -> Result<BTreeSet<String>, DeviceError> {
        let mut listings = self.listings.borrow_mut();
        if listings.len() > 1 {
            return Ok(listings.pop_front().unwrap_or_default());
        }
        Ok(listings.front().cloned().unwrap_or_default())
    }

    fn settle(&self) -> Result<(), DeviceError> {
        self.settles.set(self.settles.get() + 1);
        Ok(())
    }

    fn resolve_device_path(&self, name: &str) -> Result<Vec<Utf8PathBuf>, DeviceError> {
        Ok(self.paths.borrow().get(name).cloned().unwrap_or_default())
    }

    fn path_exists(&self, path: &Utf8Path) -> Result<bool, DeviceError> {
        Ok(self.existing.borrow().contains(path))
    }
}

/// Metadata source returning a fixed boot mapping or a fixed error.
#[derive(Clone, Debug)]
pub struct StaticMetadata {
    response: Result<Vec<String>, MetadataError>,
}

impl StaticMetadata {
    /// Serves `names` as the boot-time device mapping.
    #[must_use]
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            response: Ok(names.into_iter().map(Into::into).collect()),
        }
    }

    /// Fails every read with `error`.
    #[must_use]
    pub const fn failing(error: MetadataError) -> Self {
        Self { response: Err(error) }
    }
}

impl MetadataSource for StaticMetadata {
    fn boot_device_names(&self) -> ProviderFuture<'_, Vec<String>, MetadataError> {
        Box::pin(future::ready(self.response.clone()))
    }
}

/// Provider request kinds that [`ScriptedProvider`] can be told to reject.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ScriptedCall {
    /// `create_volume`.
    Create,
    /// `describe_instance`.
    Describe,
    /// `attach_volume`.
    Attach,
    /// `detach_volume`.
    Detach,
    /// `delete_volume`.
    Delete,
    /// `create_snapshot`.
    Snapshot,
}

/// Mutating or descriptive request recorded by [`ScriptedProvider`].
///
/// Status polls are counted separately through
/// [`ScriptedProvider::status_polls`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProviderCall {
    /// Volume creation with the submitted parameters.
    Create(VolumeSpec),
    /// Instance description.
    Describe {
        /// Instance described.
        instance: String,
    },
    /// Attach request.
    Attach {
        /// Volume attached.
        volume: String,
        /// Target instance.
        instance: String,
        /// Requested slot.
        slot: String,
    },
    /// Detach request.
    Detach {
        /// Volume detached.
        volume: String,
        /// Instance holding the attachment.
        instance: String,
        /// Slot released.
        slot: String,
    },
    /// Delete request.
    Delete {
        /// Volume deleted.
        volume: String,
    },
    /// Snapshot request.
    Snapshot {
        /// Source volume.
        volume: String,
    },
}

/// Error returned by [`ScriptedProvider`] for rejected requests.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScriptedProviderError {
    /// Raised when a request was scripted to fail.
    #[error("scripted provider rejected {call:?}")]
    Rejected {
        /// Request that was rejected.
        call: ScriptedCall,
    },
}

#[derive(Debug, Default)]
struct ProviderState {
    next_volume: u32,
    next_snapshot: u32,
    instance_devices: Vec<String>,
    queued: HashMap<ResourceKind, VecDeque<ResourceStatus>>,
    sticky: HashMap<ResourceKind, ResourceStatus>,
    failing: HashSet<ScriptedCall>,
    calls: Vec<ProviderCall>,
    polls: HashMap<ResourceKind, u32>,
}

/// In-memory provider with scripted statuses and failures.
///
/// Attach and detach requests update the instance's reported device names,
/// so repeated attaches see the slots the provider currently holds. Clones
/// share state.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl ScriptedProvider {
    /// Creates a provider that reports every wait target as reached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the device names reported for every instance.
    pub fn set_instance_devices<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().instance_devices = names.into_iter().map(Into::into).collect();
    }

    /// Queues statuses returned by successive polls of `kind`.
    pub fn queue_statuses<I>(&self, kind: ResourceKind, statuses: I)
    where
        I: IntoIterator<Item = ResourceStatus>,
    {
        self.state()
            .queued
            .entry(kind)
            .or_default()
            .extend(statuses);
    }

    /// Returns `status` for every poll of `kind` once the queue is empty.
    pub fn stick_status(&self, kind: ResourceKind, status: ResourceStatus) {
        self.state().sticky.insert(kind, status);
    }

    /// Rejects the next request of the given kind.
    pub fn fail_next(&self, call: ScriptedCall) {
        self.state().failing.insert(call);
    }

    /// Returns every request recorded so far, excluding status polls.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.state().calls.clone()
    }

    /// Number of status polls made for `kind`.
    #[must_use]
    pub fn status_polls(&self, kind: ResourceKind) -> u32 {
        self.state().polls.get(&kind).copied().unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: ScriptedCall, entry: ProviderCall) -> Result<(), ScriptedProviderError> {
        let mut state = self.state();
        state.calls.push(entry);
        if state.failing.remove(&call) {
            return Err(ScriptedProviderError::Rejected { call });
        }
        Ok(())
    }

    const fn default_status(kind: ResourceKind) -> ResourceStatus {
        match kind {
            ResourceKind::Volume => ResourceStatus::Available,
            ResourceKind::Attachment => ResourceStatus::Attached,
            ResourceKind::Snapshot => ResourceStatus::Completed,
        }
    }
}

impl ProviderClient for ScriptedProvider {
    type Error = ScriptedProviderError;

    fn create_volume<'a>(
        &'a self,
        spec: &'a VolumeSpec,
    ) -> ProviderFuture<'a, VolumeId, Self::Error> {
        let result = self
            .record(ScriptedCall::Create, ProviderCall::Create(spec.clone()))
            .map(|()| {
                let mut state = self.state();
                state.next_volume += 1;
                VolumeId::new(format!("vol-{}", state.next_volume))
            });
        Box::pin(future::ready(result))
    }

    fn describe_instance<'a>(
        &'a self,
        instance: &'a InstanceId,
    ) -> ProviderFuture<'a, InstanceDescription, Self::Error> {
        let entry = ProviderCall::Describe {
            instance: instance.to_string(),
        };
        let result = self
            .record(ScriptedCall::Describe, entry)
            .map(|()| InstanceDescription {
                device_names: self.state().instance_devices.clone(),
            });
        Box::pin(future::ready(result))
    }

    fn attach_volume<'a>(
        &'a self,
        volume: &'a VolumeId,
        instance: &'a InstanceId,
        slot: &'a DeviceSlot,
    ) -> ProviderFuture<'a, (), Self::Error> {
        let entry = ProviderCall::Attach {
            volume: volume.to_string(),
            instance: instance.to_string(),
            slot: slot.to_string(),
        };
        let result = self.record(ScriptedCall::Attach, entry).map(|()| {
            self.state().instance_devices.push(slot.device_name());
        });
        Box::pin(future::ready(result))
    }

    fn detach_volume<'a>(
        &'a self,
        volume: &'a VolumeId,
        instance: &'a InstanceId,
        slot: &'a DeviceSlot,
    ) -> ProviderFuture<'a, (), Self::Error> {
        let entry = ProviderCall::Detach {
            volume: volume.to_string(),
            instance: instance.to_string(),
            slot: slot.to_string(),
        };
        let result = self.record(ScriptedCall::Detach, entry).map(|()| {
            let device = slot.device_name();
            self.state().instance_devices.retain(|name| *name != device);
        });
        Box::pin(future::ready(result))
    }

    fn delete_volume<'a>(&'a self, volume: &'a VolumeId) -> ProviderFuture<'a, (), Self::Error> {
        let entry = ProviderCall::Delete {
            volume: volume.to_string(),
        };
        Box::pin(future::ready(self.record(ScriptedCall::Delete, entry)))
    }

    fn create_snapshot<'a>(
        &'a self,
        volume: &'a VolumeId,
    ) -> ProviderFuture<'a, SnapshotId, Self::Error> {
        let entry = ProviderCall::Snapshot {
            volume: volume.to_string(),
        };
        let result = self.record(ScriptedCall::Snapshot, entry).map(|()| {
            let mut state = self.state();
            state.next_snapshot += 1;
            SnapshotId::new(format!("snap-{}", state.next_snapshot))
        });
        Box::pin(future::ready(result))
    }

    fn resource_status<'a>(
        &'a self,
        kind: ResourceKind,
        _id: &'a str,
    ) -> ProviderFuture<'a, ResourceStatus, Self::Error> {
        let mut state = self.state();
        *state.polls.entry(kind).or_default() += 1;
        let queued = state.queued.get_mut(&kind).and_then(VecDeque::pop_front);
        let status = queued
            .or_else(|| state.sticky.get(&kind).cloned())
            .unwrap_or_else(|| Self::default_status(kind));
        drop(state);
        Box::pin(future::ready(Ok(status)))
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
