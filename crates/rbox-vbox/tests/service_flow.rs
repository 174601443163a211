use rbox_vbox::reconcile::ItemOutcome;
use rbox_vbox::testing::ScriptedRunner;
use rbox_vbox::types::{RunState, SharedFolder, StartMode};
use rbox_vbox::{ServerParams, VboxErrorKind, VboxService, VmSetting};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

const VM: &str = "a1b2";

const SHOWVMINFO: &str = r#"name="web"
UUID="a1b2"
ostype="Ubuntu (64-bit)"
VMState="poweroff"
cpus=2
memory=2048
SharedFolderNameMachineMapping1="share"
SharedFolderPathMachineMapping1="/srv/share"
"#;

async fn connected(runner: &Arc<ScriptedRunner>) -> VboxService {
    runner.respond("--version", 0, "7.0.12r159484\n");
    runner.respond("list vms", 0, "\"web\" {a1b2}\n");
    runner.respond("showvminfo a1b2 --machinereadable", 0, SHOWVMINFO);

    let service = VboxService::default();
    let server = assert_ok!(service.add_server(ServerParams::local("lab")).await);
    assert_ok!(server.connect_with_runner(runner.clone()).await);
    assert_ok!(service.list_vms("lab").await);
    service
}

#[tokio::test]
async fn summary_reads_through_the_cache() {
    let runner = ScriptedRunner::new();
    let service = connected(&runner).await;

    assert_eq!(assert_ok!(service.version("lab").await), "7.0.12r159484");
    let summary = assert_ok!(service.vm_summary("lab", "web").await);
    assert_eq!(summary.uuid, VM);
    assert_eq!(summary.state, RunState::Off);
    assert_eq!(summary.cpus, Some(2));
    assert_eq!(summary.memory_mb, Some(2048));
    // Version came from connect, not a second invocation.
    assert_eq!(runner.count("--version"), 1);
}

#[tokio::test]
async fn start_waits_for_the_settled_refresh() {
    let runner = ScriptedRunner::new();
    let service = connected(&runner).await;
    runner.respond(
        "startvm a1b2",
        0,
        "Waiting for VM \"web\" to power on...\nVM \"web\" has been successfully started.\n",
    );

    let op = assert_ok!(service.start_vm("lab", VM, StartMode::Headless).await);
    assert_ok!(op.settled.wait().await);

    let lines = runner.issued_lines();
    let start = lines.iter().position(|l| l == "startvm a1b2 --type headless");
    let refresh = lines.iter().rposition(|l| l == "showvminfo a1b2 --machinereadable");
    assert!(start.is_some() && refresh > start);
}

#[tokio::test]
async fn locked_machine_is_reported_without_refresh() {
    let runner = ScriptedRunner::new();
    let service = connected(&runner).await;
    runner.respond_stderr(
        "modifyvm",
        1,
        "VBoxManage: error: The machine 'web' is already locked for a session (or being unlocked)\n\
         VBoxManage: error: Details: code VBOX_E_INVALID_OBJECT_STATE (0x80bb0007)\n",
    );
    let before = runner.count("showvminfo");

    let err = assert_err!(
        service
            .modify_vm("lab", VM, &[VmSetting::MemoryMb(4096)])
            .await
    );
    assert_eq!(err.kind, VboxErrorKind::CommandFailed);
    assert!(err.user_message().contains("VBOX_E_INVALID_OBJECT_STATE"));
    tokio::task::yield_now().await;
    assert_eq!(runner.count("showvminfo"), before);
}

#[tokio::test]
async fn shared_folders_reconcile_in_order() {
    let runner = ScriptedRunner::new();
    let service = connected(&runner).await;

    let desired = vec![SharedFolder {
        name: "iso".into(),
        host_path: "/srv/iso".into(),
        read_only: true,
        auto_mount: false,
    }];
    let report = assert_ok!(service.apply_shared_folders("lab", VM, &desired).await);

    assert!(report.is_clean());
    assert!(report
        .items
        .iter()
        .all(|i| matches!(i.outcome, ItemOutcome::Applied)));
    let issued: Vec<String> = runner
        .issued_lines()
        .into_iter()
        .filter(|l| l.starts_with("sharedfolder"))
        .collect();
    assert_eq!(
        issued,
        vec![
            "sharedfolder remove a1b2 --name share",
            "sharedfolder add a1b2 --name iso --hostpath /srv/iso --readonly",
        ]
    );
}

#[tokio::test]
async fn removed_server_is_gone() {
    let runner = ScriptedRunner::new();
    let service = connected(&runner).await;
    assert_ok!(service.remove_server("lab").await);
    let err = assert_err!(service.list_vms("lab").await);
    assert_eq!(err.kind, VboxErrorKind::NotFound);
}
