//! End-to-end tests of the runtime pipeline that need no privileges.
//!
//! 1. Bundle generation and conversion
//! 2. Factory registration and validation
//! 3. Persisted state and reload through a lookup-only handle
//! 4. Destroy of a Created container
//! 5. Address allocation for a bridge subnet
//! 6. Log discovery

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::process::Command;

use capsule_common::config::RuntimeConfig;
use capsule_common::constants::NOT_EXEC_FLAG_FILENAME;
use capsule_common::error::ErrorKind;
use capsule_common::types::Status;
use capsule_core::network::Subnet;
use capsule_core::network::ipam::Ipam;
use capsule_core::proc::ProcessStat;
use capsule_runtime::bundle::Spec;
use capsule_runtime::factory::Factory;
use capsule_runtime::logs;
use capsule_runtime::state::StateStorage;

fn factory(dir: &tempfile::TempDir) -> Factory {
    Factory::new(RuntimeConfig::with_root(dir.path().join("run")))
        .expect("factory")
        .with_cgroup_root(dir.path().join("cgroup"))
}

fn bundle(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let bundle = dir.path().join("bundle");
    std::fs::create_dir_all(bundle.join("rootfs")).expect("rootfs");
    let _ = Spec::example().write(&bundle).expect("write config.json");
    bundle
}

// ── Bundle → factory ─────────────────────────────────────────────────

#[test]
fn pipeline_bundle_to_registered_container() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bundle = bundle(&dir);

    let spec = Spec::load(&bundle).expect("load bundle");
    let (config, process) = spec.to_configs(&bundle).expect("convert");
    assert_eq!(process.args, vec!["sh"]);

    let factory = factory(&dir);
    let container = factory.create("web", config).expect("create");
    assert_eq!(container.status().unwrap(), Status::Stopped);
    assert!(container.root().is_dir());
    assert_eq!(factory.ids().unwrap(), vec!["web"]);

    let err = factory
        .create("web", container.config().clone())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContainerIdExists);
}

#[test]
fn pipeline_rejects_config_before_touching_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bundle = bundle(&dir);
    let (mut config, _) = Spec::load(&bundle)
        .unwrap()
        .to_configs(&bundle)
        .unwrap();
    config.namespaces.retain(|ns| ns.ns_type != capsule_common::types::NamespaceType::Uts);

    let factory = factory(&dir);
    let err = factory.create("bad", config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    assert!(!factory.exists("bad"));
}

// ── Persisted state ──────────────────────────────────────────────────

#[test]
fn pipeline_reload_tracks_live_init_process() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bundle = bundle(&dir);
    let (config, _) = Spec::load(&bundle).unwrap().to_configs(&bundle).unwrap();
    let factory = factory(&dir);
    let container = factory.create("svc", config).expect("create");

    let mut child = Command::new("sleep").arg("30").spawn().expect("spawn");
    let pid = i32::try_from(child.id()).unwrap();
    let mut state = container.state().expect("state");
    state.init_process_pid = pid;
    state.init_process_start_time = ProcessStat::read(pid).unwrap().unwrap().start_time;
    state.save(container.root()).expect("save");

    let loaded = factory.load("svc").expect("load");
    assert_eq!(loaded.status().unwrap(), Status::Running);
    let reread = StateStorage::load("svc", loaded.root()).expect("reread");
    assert_eq!(reread.init_process_pid, pid);

    let err = loaded.destroy().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContainerStillRunning);

    child.kill().unwrap();
    let _ = child.wait().unwrap();
    assert_eq!(loaded.status().unwrap(), Status::Stopped);
    loaded.destroy().expect("destroy stopped");
    assert!(!factory.exists("svc"));
}

#[test]
fn pipeline_destroy_created_container_within_budget() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bundle = bundle(&dir);
    let (config, _) = Spec::load(&bundle).unwrap().to_configs(&bundle).unwrap();
    let factory = factory(&dir);
    let container = factory.create("blocked", config).expect("create");

    let mut child = Command::new("sleep").arg("30").spawn().expect("spawn");
    let pid = i32::try_from(child.id()).unwrap();
    let cgroup_dir = dir.path().join("cgroup/memory/capsule/blocked");
    std::fs::create_dir_all(&cgroup_dir).unwrap();

    let mut state = container.state().expect("state");
    state.init_process_pid = pid;
    state.init_process_start_time = ProcessStat::read(pid).unwrap().unwrap().start_time;
    state.cgroup_paths = BTreeMap::from([("memory".to_owned(), cgroup_dir.clone())]);
    state.save(container.root()).expect("save");
    std::fs::write(container.root().join(NOT_EXEC_FLAG_FILENAME), "").unwrap();

    let loaded = factory.load("blocked").expect("load");
    assert_eq!(loaded.status().unwrap(), Status::Created);
    loaded.destroy().expect("destroy");

    assert_eq!(loaded.status().unwrap(), Status::Stopped);
    assert!(!factory.exists("blocked"));
    assert!(!cgroup_dir.exists());
    let _ = child.wait().unwrap();
}

// ── Addressing ───────────────────────────────────────────────────────

#[test]
fn pipeline_endpoint_addresses_avoid_gateway() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ipam = Ipam::load(dir.path().join("subnet.json")).expect("ipam");
    let subnet: Subnet = "192.168.50.0/24".parse().unwrap();

    let gateway = ipam.allocate(&subnet).expect("gateway");
    let first = ipam.allocate(&subnet).expect("first");
    let second = ipam.allocate(&subnet).expect("second");
    assert!(subnet.contains(first) && subnet.contains(second));
    assert_ne!(first, gateway);
    assert_ne!(first, second);

    ipam.release(&subnet, first).expect("release");
    let reloaded = Ipam::load(dir.path().join("subnet.json")).expect("reload");
    assert_eq!(reloaded.allocate(&subnet).expect("reuse"), first);
}

// ── Logs ─────────────────────────────────────────────────────────────

#[test]
fn pipeline_logs_live_in_container_root() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bundle = bundle(&dir);
    let (config, _) = Spec::load(&bundle).unwrap().to_configs(&bundle).unwrap();
    let factory = factory(&dir);
    let container = factory.create("logged", config).expect("create");

    std::fs::write(logs::init_log_path(container.root()), "booted\n").unwrap();
    std::fs::write(logs::exec_log_path(container.root(), "e1"), "ran\n").unwrap();

    assert_eq!(
        logs::read_logs(&logs::init_log_path(container.root())).unwrap(),
        "booted\n"
    );
    assert_eq!(logs::exec_log_ids(container.root()).unwrap(), vec!["e1"]);
}
