//! Snapshot operations.

use crate::error::VboxResult;
use crate::parse::{parse_machine_readable, snapshot_tree, COMPLETE_MARKER};
use crate::task::Operation;
use crate::transport::Args;
use crate::types::SnapshotNode;
use crate::vm::{long_operation, Check, VmContext};
use log::info;

pub struct SnapshotManager;

impl SnapshotManager {
    /// The snapshot tree, or `None` when the VM has no snapshots.
    pub async fn list(ctx: &VmContext) -> VboxResult<Option<SnapshotNode>> {
        let args = Args::new("snapshot")
            .arg(ctx.uuid())
            .arg("list")
            .arg("--machinereadable");
        let output = ctx.machine.invoke(&ctx.transport, args.as_slice()).await;
        match output {
            Ok(output) => Ok(snapshot_tree(&parse_machine_readable(&output.lines))),
            // `snapshot list` exits non-zero on a VM without snapshots.
            Err(e) if e.mentions("does not have any snapshots") => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn take(ctx: &VmContext, name: &str, description: Option<&str>) -> Operation {
        info!("Taking snapshot '{}' of VM {}", name, ctx.uuid());
        let mut args = Args::new("snapshot").arg(ctx.uuid()).arg("take").arg(name);
        if let Some(text) = description.filter(|d| !d.is_empty()) {
            args = args.flag("--description", text);
        }
        long_operation(ctx, format!("snapshot {}", name), args, Check::Marker(&*COMPLETE_MARKER))
    }

    pub fn restore(ctx: &VmContext, snapshot: &str) -> Operation {
        info!("Restoring snapshot '{}' of VM {}", snapshot, ctx.uuid());
        let args = Args::new("snapshot").arg(ctx.uuid()).arg("restore").arg(snapshot);
        long_operation(ctx, format!("restore {}", snapshot), args, Check::Marker(&*COMPLETE_MARKER))
    }

    pub fn restore_current(ctx: &VmContext) -> Operation {
        info!("Restoring current snapshot of VM {}", ctx.uuid());
        let args = Args::new("snapshot").arg(ctx.uuid()).arg("restorecurrent");
        long_operation(ctx, "restore current", args, Check::Marker(&*COMPLETE_MARKER))
    }

    pub fn delete(ctx: &VmContext, snapshot: &str) -> Operation {
        info!("Deleting snapshot '{}' of VM {}", snapshot, ctx.uuid());
        let args = Args::new("snapshot").arg(ctx.uuid()).arg("delete").arg(snapshot);
        long_operation(ctx, format!("delete {}", snapshot), args, Check::Marker(&*COMPLETE_MARKER))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VboxErrorKind;
    use crate::machine::Machine;
    use crate::testing::ScriptedRunner;
    use crate::transport::Transport;
    use std::sync::Arc;

    fn context(runner: &Arc<ScriptedRunner>) -> VmContext {
        let transport = Arc::new(Transport::new(runner.clone(), "VBoxManage"));
        VmContext::new(transport, Arc::new(Machine::new("u1", "web", 8)))
    }

    #[tokio::test]
    async fn list_builds_tree() {
        let runner = ScriptedRunner::new();
        runner.respond(
            "snapshot u1 list",
            0,
            "SnapshotName=\"base\"\nSnapshotUUID=\"s1\"\nSnapshotName-1=\"patched\"\nSnapshotUUID-1=\"s2\"\nCurrentSnapshotUUID=\"s2\"\n",
        );
        let tree = SnapshotManager::list(&context(&runner)).await.unwrap().unwrap();
        assert_eq!(tree.name, "base");
        assert_eq!(tree.children.len(), 1);
        assert!(tree.children[0].is_current);
    }

    #[tokio::test]
    async fn list_without_snapshots_is_none() {
        let runner = ScriptedRunner::new();
        runner.respond_stderr(
            "snapshot u1 list",
            1,
            "This machine does not have any snapshots\n",
        );
        assert!(SnapshotManager::list(&context(&runner)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn take_passes_description_and_refreshes() {
        let runner = ScriptedRunner::new();
        runner.respond_stderr("snapshot u1 take", 0, "0%...50%...100%\n");
        let ctx = context(&runner);
        SnapshotManager::take(&ctx, "before upgrade", Some("pre 7.1"))
            .wait()
            .await
            .unwrap();
        let issued = runner.issued();
        assert_eq!(
            issued[0],
            vec!["snapshot", "u1", "take", "before upgrade", "--description", "pre 7.1"]
        );
        assert_eq!(runner.count("showvminfo u1"), 1);
    }

    #[tokio::test]
    async fn failed_delete_does_not_refresh() {
        let runner = ScriptedRunner::new();
        runner.respond_stderr(
            "snapshot u1 delete",
            1,
            "VBoxManage: error: Could not find a snapshot named 'nope'\n",
        );
        let ctx = context(&runner);
        let err = SnapshotManager::delete(&ctx, "nope").wait().await.unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::CommandFailed);
        assert_eq!(runner.count("showvminfo"), 0);
    }
}
