//! Device path resolution driven through the `lsblk` and `udevadm` wrappers.

use std::time::Duration;

use bootvol::test_support::{
    ScriptedProvider, ScriptedProviderError, ScriptedRunner, StaticMetadata,
};
use bootvol::{
    DevicePathResolver, InstanceId, LocalDevices, PollConfig, ResolvedDevice, SystemDevices,
    VolumeError, VolumeId,
};
use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use rstest::{fixture, rstest};
use tempfile::TempDir;

/// Temporary directory standing in for `/dev`.
struct DevDir {
    _tmp: TempDir,
    root: Utf8PathBuf,
}

impl DevDir {
    fn node(&self, name: &str) -> Utf8PathBuf {
        self.root.join(name)
    }

    fn create_node(&self, name: &str) -> Utf8PathBuf {
        Dir::open_ambient_dir(&self.root, ambient_authority())
            .unwrap_or_else(|err| panic!("open temp dir: {err}"))
            .write(name, "")
            .unwrap_or_else(|err| panic!("create device node: {err}"));
        self.node(name)
    }
}

#[fixture]
fn dev_dir() -> DevDir {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp dir should be utf8: {}", path.display()));
    DevDir { _tmp: tmp, root }
}

fn script_attach(runner: &ScriptedRunner, after: &str, udev_paths: &str) {
    runner.push_output(Some(0), "sda\nsdb\n", "");
    runner.push_success();
    runner.push_output(Some(0), after, "");
    runner.push_output(Some(0), udev_paths, "");
}

async fn resolve(
    runner: &ScriptedRunner,
) -> Result<ResolvedDevice, VolumeError<ScriptedProviderError>> {
    let provider = ScriptedProvider::new();
    let metadata = StaticMetadata::new(["/dev/sda1", "/dev/sdb"]);
    let local = SystemDevices::new(runner.clone()).with_udevadm_bin("/usr/bin/udevadm");
    DevicePathResolver::new(&provider, &metadata, &local)
        .with_attach_poll(PollConfig::new(Duration::from_millis(1), 3))
        .resolve(&VolumeId::from("vol-1"), &InstanceId::from("i-123"))
        .await
}

#[rstest]
#[tokio::test]
async fn resolves_device_node_reported_by_udev(dev_dir: DevDir) {
    let node = dev_dir.create_node("sdc");
    let runner = ScriptedRunner::new();
    script_attach(&runner, "sda\nsdb\nsdc\n", &format!("{node}\n"));

    let resolved = resolve(&runner)
        .await
        .unwrap_or_else(|err| panic!("resolution should succeed: {err}"));

    assert_eq!(resolved.kernel_name, "sdc");
    assert_eq!(resolved.path, node);
    let commands: Vec<String> = runner
        .invocations()
        .iter()
        .map(|invocation| invocation.command_string())
        .collect();
    assert_eq!(
        commands,
        vec![
            String::from("lsblk --noheadings --list --nodeps --output NAME"),
            String::from("/usr/bin/udevadm settle --timeout=30"),
            String::from("lsblk --noheadings --list --nodeps --output NAME"),
            String::from("/usr/bin/udevadm info --root --query=name --name sdc"),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn absent_device_node_is_not_returned(dev_dir: DevDir) {
    let node = dev_dir.node("sdc");
    let runner = ScriptedRunner::new();
    script_attach(&runner, "sda\nsdb\nsdc\n", &format!("{node}\n"));

    let err = resolve(&runner).await.expect_err("node was never created");

    assert!(matches!(
        err,
        VolumeError::DevicePathNotFound { ref device, ref candidates }
            if device == "sdc" && candidates == &vec![node.clone()]
    ));
}

#[tokio::test]
async fn vanished_device_breaks_correlation() {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "sda\nsdb\n", "");
    runner.push_success();
    runner.push_output(Some(0), "sda\nsdc\n", "");

    let err = resolve(&runner).await.expect_err("sdb disappeared");

    assert!(matches!(
        err,
        VolumeError::DeviceCorrelation { ref added, ref removed, .. }
            if added == &vec![String::from("sdc")] && removed == &vec![String::from("sdb")]
    ));
}

#[tokio::test]
async fn failing_settle_is_a_device_error() {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "sda\n", "");
    runner.push_failure(2);

    let err = resolve(&runner).await.expect_err("udevadm settle fails");

    assert!(matches!(err, VolumeError::DeviceInspection(_)));
}

#[rstest]
fn path_exists_checks_the_filesystem(dev_dir: DevDir) {
    let present = dev_dir.create_node("nvme1n1");
    let devices = SystemDevices::new(ScriptedRunner::new());

    let found = devices
        .path_exists(&present)
        .unwrap_or_else(|err| panic!("inspect {present}: {err}"));
    let missing = devices
        .path_exists(&dev_dir.node("nvme2n1"))
        .unwrap_or_else(|err| panic!("inspect missing node: {err}"));

    assert!(found);
    assert!(!missing);
}
