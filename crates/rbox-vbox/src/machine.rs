//! A managed virtual machine.

use crate::entity::{EntityState, RefreshOutcome};
use crate::error::VboxResult;
use crate::parse::{parse_extended, parse_machine_readable};
use crate::projection::{self, VmSummary};
use crate::transport::{CommandOutput, LiveOutput, Transport};
use crate::types::{
    NicSummary, PropertyMap, RunState, SharedFolder, StorageController, Transcript, UsbFilter,
};
use log::debug;
use std::sync::{Arc, RwLock};

pub struct Machine {
    uuid: String,
    listed_name: RwLock<String>,
    state: EntityState,
}

impl Machine {
    pub fn new(uuid: impl Into<String>, name: impl Into<String>, transcript_capacity: usize) -> Self {
        Self {
            uuid: uuid.into(),
            listed_name: RwLock::new(name.into()),
            state: EntityState::new(transcript_capacity),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Name from the last refresh, else the name it was listed under.
    pub async fn name(&self) -> String {
        match self.state.property("name").await {
            Some(name) => name,
            None => self.listed_name(),
        }
    }

    pub fn listed_name(&self) -> String {
        self.listed_name
            .read()
            .map(|n| n.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub(crate) fn set_listed_name(&self, name: &str) {
        let mut slot = self
            .listed_name
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *slot != name {
            *slot = name.to_string();
        }
    }

    pub fn state(&self) -> &EntityState {
        &self.state
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Run a command against this VM, keep its transcript, and require a
    /// zero exit. On failure the error carries the output lines.
    pub async fn invoke(&self, transport: &Transport, args: &[String]) -> VboxResult<CommandOutput> {
        self.invoke_live(transport, args, LiveOutput::none()).await
    }

    pub async fn invoke_live(
        &self,
        transport: &Transport,
        args: &[String],
        live: LiveOutput,
    ) -> VboxResult<CommandOutput> {
        let output = match transport.run_live(args, live).await {
            Ok(output) => output,
            Err(e) => {
                self.state.record_failure(&args.join(" "), &e);
                return Err(e);
            }
        };
        self.state.record_output(&output);
        output.check_ok()?;
        Ok(output)
    }

    async fn load(&self, transport: &Transport) -> VboxResult<PropertyMap> {
        let args = vec![
            "showvminfo".to_string(),
            self.uuid.clone(),
            "--machinereadable".to_string(),
        ];
        let output = self.invoke(transport, &args).await?;
        Ok(parse_machine_readable(&output.lines))
    }

    async fn load_extended(&self, transport: &Transport) -> VboxResult<PropertyMap> {
        let args = vec!["showvminfo".to_string(), self.uuid.clone()];
        let output = self.invoke(transport, &args).await?;
        Ok(parse_extended(&output.lines))
    }

    // ── Refresh ──────────────────────────────────────────────────────

    pub async fn refresh(&self, transport: &Transport) -> VboxResult<()> {
        self.state.refresh(|| self.load(transport)).await?;
        self.sync_name().await;
        Ok(())
    }

    pub async fn try_refresh(&self, transport: &Transport) -> VboxResult<RefreshOutcome> {
        let outcome = self.state.try_refresh(|| self.load(transport)).await?;
        if outcome == RefreshOutcome::Refreshed {
            self.sync_name().await;
        } else {
            debug!("Refresh of {} already running, skipped", self.uuid);
        }
        Ok(outcome)
    }

    /// Merge NIC, audio and USB summaries from the plain `showvminfo`.
    pub async fn refresh_extended(&self, transport: &Transport) -> VboxResult<()> {
        self.state.refresh_merge(|| self.load_extended(transport)).await
    }

    async fn sync_name(&self) {
        if let Some(name) = self.state.property("name").await {
            self.set_listed_name(&name);
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub async fn properties(&self) -> Option<Arc<PropertyMap>> {
        self.state.snapshot().await
    }

    pub async fn property(&self, key: &str) -> Option<String> {
        self.state.property(key).await
    }

    pub async fn run_state(&self) -> RunState {
        self.state.run_state().await
    }

    pub fn transcripts(&self) -> Vec<Transcript> {
        self.state.transcripts()
    }

    pub async fn summary(&self) -> Option<VmSummary> {
        self.properties().await.map(|m| projection::summary(&m))
    }

    pub async fn storage_controllers(&self) -> Vec<StorageController> {
        self.project(projection::storage_controllers).await
    }

    pub async fn usb_filters(&self) -> Vec<UsbFilter> {
        self.project(projection::usb_filters).await
    }

    pub async fn shared_folders(&self) -> Vec<SharedFolder> {
        self.project(projection::shared_folders).await
    }

    pub async fn nic_summaries(&self) -> Vec<NicSummary> {
        self.project(projection::nic_summaries).await
    }

    async fn project<T>(&self, view: fn(&PropertyMap) -> Vec<T>) -> Vec<T> {
        self.properties()
            .await
            .map(|m| view(&m))
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("uuid", &self.uuid)
            .field("name", &self.listed_name())
            .finish()
    }
}
