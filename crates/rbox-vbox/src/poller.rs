//! Periodic VM state polling.

use crate::entity::RefreshOutcome;
use crate::server::Server;
use futures::future::join_all;
use log::{trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

/// Counts from one polling round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollRound {
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// `try_refresh` every VM of `server` once, concurrently. VMs whose
/// refresh is still running from elsewhere are skipped.
pub async fn poll_once(server: &Server) -> PollRound {
    let transport = match server.transport().await {
        Ok(t) => t,
        Err(_) => return PollRound::default(),
    };
    let machines = server.machines().await;
    let results = join_all(machines.iter().map(|m| m.try_refresh(&transport))).await;

    let mut round = PollRound::default();
    for (machine, result) in machines.iter().zip(results) {
        match result {
            Ok(RefreshOutcome::Refreshed) => round.refreshed += 1,
            Ok(RefreshOutcome::Skipped) => {
                trace!("Poll of {} skipped, refresh in progress", machine.uuid());
                round.skipped += 1;
            }
            Err(e) => {
                warn!("Poll of {} on {} failed: {}", machine.uuid(), server.name(), e);
                round.failed += 1;
            }
        }
    }
    round
}

/// Background polling loop; stops when dropped.
pub struct Poller {
    handle: tokio::task::JoinHandle<()>,
}

impl Poller {
    pub fn spawn(server: Arc<Server>, every: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(every);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let round = poll_once(&server).await;
                trace!("Poll of {}: {:?}", server.name(), round);
            }
        });
        Self { handle }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerParams;
    use crate::testing::ScriptedRunner;
    use crate::types::VboxConfig;

    async fn server_with_two_vms(runner: &Arc<ScriptedRunner>) -> Arc<Server> {
        runner.respond("--version", 0, "7.0.12r159484\n");
        runner.respond("list vms", 0, "\"web\" {a1}\n\"db\" {a2}\n");
        runner.respond("showvminfo", 0, "VMState=\"running\"\n");
        let server = Arc::new(Server::new(ServerParams::local("lab"), VboxConfig::default()));
        server.connect_with_runner(runner.clone()).await.unwrap();
        server.refresh_machines().await.unwrap();
        server
    }

    #[tokio::test]
    async fn round_refreshes_every_vm() {
        let runner = ScriptedRunner::new();
        let server = server_with_two_vms(&runner).await;
        let round = poll_once(&server).await;
        assert_eq!(round, PollRound { refreshed: 2, skipped: 0, failed: 0 });
    }

    #[tokio::test]
    async fn overlapping_rounds_skip() {
        let runner = ScriptedRunner::new();
        let server = server_with_two_vms(&runner).await;
        runner.set_delay(Duration::from_millis(50));

        let (first, second) = tokio::join!(poll_once(&server), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            poll_once(&server).await
        });
        assert_eq!(first.refreshed, 2);
        assert_eq!(second.skipped, 2);
        assert_eq!(runner.count("showvminfo"), 2);
    }

    #[tokio::test]
    async fn disconnected_server_polls_nothing() {
        let server = Server::new(ServerParams::local("lab"), VboxConfig::default());
        assert_eq!(poll_once(&server).await, PollRound::default());
    }
}
