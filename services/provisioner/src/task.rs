//! The provisioner task: the reconciliation control loop.
//!
//! One task owns one environment. It serializes consumption of the
//! machine-change watch, the retry watch, environment config updates,
//! and operator controls; exactly one reconciliation pass is current at
//! a time. Within a pass, per-machine start actions run concurrently on
//! a [`JoinSet`] and are joined before the orphan sweep, so the sweep
//! always observes this pass's freshly bound instances.
//!
//! Failures of a single machine never terminate the task. The task only
//! exits on shutdown, on clean closure of its watch streams, or on a
//! watch source reporting failure.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use convoy_id::{InstanceId, MachineId, Nonce};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::broker::{InstanceBroker, MachineConfig, StartInstanceParams, StartedInstance};
use crate::environ::EnvironConfig;
use crate::machine::{Life, MachineRecord, MachineStatus};
use crate::registry::ProviderRegistry;
use crate::store::{StoreError, StoreFacade};
use crate::tools::{ToolsCatalogue, ToolsError};
use crate::watcher::WatchError;

/// Fatal task failures.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A watch source failed. The task cannot reconcile without its
    /// notification inputs.
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// The task aborted or panicked instead of running to completion.
    #[error("provisioner task did not complete: {0}")]
    Aborted(String),
}

/// Operator controls, delivered through the task's mailbox.
#[derive(Debug)]
pub enum Control {
    /// Toggles safe mode, effective from the next pass. A later
    /// environment config update overrides this again.
    SetSafeMode(bool),

    /// Installs a hook observing every config the task receives, used
    /// to synchronize with asynchronous config propagation.
    SetObserver(mpsc::UnboundedSender<EnvironConfig>),
}

/// Everything a task needs at spawn time.
pub struct TaskParams {
    /// Machine id of the authority this task runs under; stamped into
    /// every nonce it generates.
    pub authority: MachineId,
    /// Machine store capabilities.
    pub store: StoreFacade,
    /// Source of agent binaries.
    pub catalogue: Arc<dyn ToolsCatalogue>,
    /// Resolves provider types named by environment configs.
    pub registry: ProviderRegistry,
    /// Live environment configuration.
    pub environ: watch::Receiver<EnvironConfig>,
    /// Ceiling on transient-error retries per machine. `None` trusts
    /// the retry watcher and retries for as long as it redelivers.
    pub retry_limit: Option<u32>,
}

/// Owner-side handle to a spawned task.
pub struct ProvisionerHandle {
    control: mpsc::UnboundedSender<Control>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<Result<(), TaskError>>,
}

impl ProvisionerHandle {
    /// Toggles safe mode for subsequent passes.
    pub fn set_safe_mode(&self, on: bool) {
        let _ = self.control.send(Control::SetSafeMode(on));
    }

    /// Installs a config observation hook.
    pub fn set_observer(&self, tx: mpsc::UnboundedSender<EnvironConfig>) {
        let _ = self.control.send(Control::SetObserver(tx));
    }

    /// Requests shutdown and waits for the task to finish its current
    /// pass and exit.
    pub async fn stop(self) -> Result<(), TaskError> {
        let _ = self.shutdown.send(true);
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(TaskError::Aborted(err.to_string())),
        }
    }
}

/// The reconciliation loop state. Constructed and driven by
/// [`ProvisionerTask::spawn`].
pub struct ProvisionerTask {
    authority: MachineId,
    store: StoreFacade,
    catalogue: Arc<dyn ToolsCatalogue>,
    registry: ProviderRegistry,
    environ: watch::Receiver<EnvironConfig>,
    retry_limit: Option<u32>,

    control: mpsc::UnboundedReceiver<Control>,
    shutdown: watch::Receiver<bool>,

    // Broker for the most recent config the registry accepted. None
    // until a config opens successfully; passes without a broker defer
    // their work instead of failing machines.
    broker: Option<Arc<dyn InstanceBroker>>,
    safe_mode: bool,
    observer: Option<mpsc::UnboundedSender<EnvironConfig>>,

    // Read-through cache of machine records, refreshed per pass from
    // the store. The store stays the source of truth.
    machines: HashMap<MachineId, MachineRecord>,
    // Set once the first machine-watch batch has been consumed. The
    // watch's initial batch carries the full inventory; until it has
    // been seen the cache may miss live machines, so orphans cannot be
    // judged.
    inventory_warmed: bool,
    // Containers and broker-less work waiting for a later pass.
    deferred: BTreeSet<MachineId>,
    retry_counts: HashMap<MachineId, u32>,
}

impl ProvisionerTask {
    /// Spawns the task onto the runtime and returns its handle.
    pub fn spawn(params: TaskParams) -> ProvisionerHandle {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = ProvisionerTask {
            authority: params.authority,
            store: params.store,
            catalogue: params.catalogue,
            registry: params.registry,
            environ: params.environ,
            retry_limit: params.retry_limit,
            control: control_rx,
            shutdown: shutdown_rx,
            broker: None,
            safe_mode: false,
            observer: None,
            machines: HashMap::new(),
            inventory_warmed: false,
            deferred: BTreeSet::new(),
            retry_counts: HashMap::new(),
        };
        let join = tokio::spawn(task.run());
        ProvisionerHandle {
            control: control_tx,
            shutdown: shutdown_tx,
            join,
        }
    }

    /// Runs the loop to completion.
    pub async fn run(mut self) -> Result<(), TaskError> {
        let mut machine_watch = self.store.watches.watch_machines();
        let mut retry_watch = self.store.watches.watch_retryable();

        let initial = self.environ.borrow_and_update().clone();
        self.apply_config(initial).await?;

        let mut environ_live = true;
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("provisioner task shutting down");
                        return Ok(());
                    }
                }
                changed = self.environ.changed(), if environ_live => {
                    match changed {
                        Ok(()) => {
                            let config = self.environ.borrow_and_update().clone();
                            self.apply_config(config).await?;
                        }
                        // Config source gone; keep the current broker.
                        Err(_) => environ_live = false,
                    }
                }
                Some(control) = self.control.recv() => match control {
                    Control::SetSafeMode(on) => {
                        info!(safe_mode = on, "safe mode toggled");
                        self.safe_mode = on;
                    }
                    Control::SetObserver(tx) => self.observer = Some(tx),
                },
                batch = machine_watch.recv() => match batch {
                    None => {
                        info!("machine watch closed, stopping");
                        return Ok(());
                    }
                    Some(Err(err)) => return Err(err.into()),
                    Some(Ok(ids)) => {
                        self.inventory_warmed = true;
                        self.run_pass(ids, BTreeSet::new()).await?;
                    }
                },
                batch = retry_watch.recv() => match batch {
                    None => {
                        info!("retry watch closed, stopping");
                        return Ok(());
                    }
                    Some(Err(err)) => return Err(err.into()),
                    Some(Ok(ids)) => self.run_pass(BTreeSet::new(), ids).await?,
                },
            }
        }
    }

    /// Applies a new environment config: opens a broker for it, adopts
    /// its safe-mode setting, and notifies any observer. A config the
    /// registry rejects leaves the previous broker in place; the task
    /// keeps running and resumes once a fixed config arrives.
    async fn apply_config(&mut self, config: EnvironConfig) -> Result<(), TaskError> {
        match self.registry.open(&config) {
            Ok(broker) => {
                info!(
                    environment = %config.name,
                    provider = %config.provider_type,
                    safe_mode = config.safe_mode,
                    "environment config applied"
                );
                self.broker = Some(broker);
                self.safe_mode = config.safe_mode;
            }
            Err(err) => {
                warn!(error = %err, "cannot open environment, keeping previous broker");
            }
        }
        if let Some(observer) = &self.observer {
            if observer.send(config).is_err() {
                self.observer = None;
            }
        }
        // A config fix may unblock machines seen under a broken or
        // missing broker; reconsider everything we know about.
        if self.broker.is_some() {
            let known: BTreeSet<MachineId> = self.machines.keys().cloned().collect();
            if !known.is_empty() || !self.deferred.is_empty() {
                self.run_pass(known, BTreeSet::new()).await?;
            }
        }
        Ok(())
    }

    /// One reconciliation pass: refresh changed records, start what
    /// should be running, stop what should not, then sweep orphans
    /// under the current safe-mode policy.
    async fn run_pass(
        &mut self,
        changed: BTreeSet<MachineId>,
        retries: BTreeSet<MachineId>,
    ) -> Result<(), TaskError> {
        let mut pending = std::mem::take(&mut self.deferred);
        pending.extend(changed);
        pending.extend(retries.iter().cloned());

        self.refresh(&pending).await;

        let Some(broker) = self.broker.clone() else {
            warn!("no usable environment config yet, deferring pass");
            self.deferred = pending;
            return Ok(());
        };

        let mut starts: Vec<MachineRecord> = Vec::new();
        let mut stops: BTreeSet<InstanceId> = BTreeSet::new();
        for id in &pending {
            let Some(record) = self.machines.get(id).cloned() else {
                // Removed from the store; any instance it leaves behind
                // is reclaimed by the orphan sweep.
                continue;
            };
            if record.life.is_dying_or_dead() {
                if let Some(instance_id) = &record.instance_id {
                    stops.insert(instance_id.clone());
                }
                continue;
            }
            if record.is_provisioned() {
                self.retry_counts.remove(id);
                continue;
            }
            let retrying = match &record.status {
                MachineStatus::Pending => false,
                MachineStatus::Error { transient: true, .. } if retries.contains(id) => true,
                // Non-transient errors wait for an operator; Started
                // without an instance id cannot happen (write-once
                // commit precedes the status change).
                _ => continue,
            };
            if !self.host_ready(id).await {
                debug!(machine_id = %id, "host not provisioned yet, deferring container");
                self.deferred.insert(id.clone());
                continue;
            }
            // A deferred machine burns no retry attempt; only a start
            // actually dispatched counts against the ceiling.
            if retrying && !self.retry_allowed(id, &record).await {
                continue;
            }
            starts.push(record);
        }

        // Dispatch starts concurrently, join before the sweep so just
        // started instances are never misread as orphans.
        let mut join_set = JoinSet::new();
        for record in starts {
            let store = self.store.clone();
            let catalogue = self.catalogue.clone();
            let broker = broker.clone();
            let authority = self.authority.clone();
            join_set.spawn(async move {
                let id = record.id.clone();
                if let Err(err) = start_machine(&store, &*catalogue, &*broker, &authority, record).await
                {
                    warn!(machine_id = %id, error = %err, "cannot record provisioning outcome");
                }
                id
            });
        }
        let mut started_ids = BTreeSet::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(id) => {
                    started_ids.insert(id);
                }
                Err(err) => warn!(error = %err, "start action aborted"),
            }
        }
        self.refresh(&started_ids).await;
        for id in &started_ids {
            if self
                .machines
                .get(id)
                .is_some_and(|r| matches!(r.status, MachineStatus::Started))
            {
                self.retry_counts.remove(id);
            }
        }

        self.stop_and_sweep(&broker, stops).await;
        Ok(())
    }

    /// Refreshes the record cache for the given ids. A machine the
    /// store no longer knows is dropped from the cache.
    async fn refresh(&mut self, ids: &BTreeSet<MachineId>) {
        for id in ids {
            match self.store.get_machine(id).await {
                Ok(record) => {
                    self.machines.insert(id.clone(), record);
                }
                Err(StoreError::NotFound(_)) => {
                    if self.machines.remove(id).is_some() {
                        debug!(machine_id = %id, "machine removed from store");
                    }
                    self.retry_counts.remove(id);
                }
                Err(err) => {
                    warn!(machine_id = %id, error = %err, "cannot refresh machine record");
                }
            }
        }
    }

    /// Accounts one retry attempt and reports whether it may proceed.
    /// On exceeding the ceiling the transient flag is cleared so the
    /// retry watcher stops redelivering the machine.
    async fn retry_allowed(&mut self, id: &MachineId, record: &MachineRecord) -> bool {
        let count = self.retry_counts.entry(id.clone()).or_insert(0);
        *count += 1;
        let Some(limit) = self.retry_limit else {
            return true;
        };
        if *count <= limit {
            return true;
        }
        warn!(machine_id = %id, limit, "giving up on transient error");
        if let MachineStatus::Error { message, .. } = &record.status {
            let status = MachineStatus::error(message.clone());
            if let Err(err) = self.store.set_status(id, status).await {
                warn!(machine_id = %id, error = %err, "cannot clear transient flag");
            }
        }
        false
    }

    /// Containers wait until their host machine holds an instance. An
    /// unprovisioned cache entry is re-read from the store first; the
    /// host may have been provisioned since the last refresh.
    async fn host_ready(&mut self, id: &MachineId) -> bool {
        let Some(host) = id.parent() else {
            return true;
        };
        if self.machines.get(&host).is_some_and(MachineRecord::is_provisioned) {
            return true;
        }
        let singleton: BTreeSet<MachineId> = [host.clone()].into_iter().collect();
        self.refresh(&singleton).await;
        self.machines.get(&host).is_some_and(MachineRecord::is_provisioned)
    }

    /// Stops instances of dying and dead machines, plus orphans when
    /// safe mode is off. Stop and listing failures are logged and left
    /// to a later sweep; they never fail the pass.
    async fn stop_and_sweep(&mut self, broker: &Arc<dyn InstanceBroker>, stops: BTreeSet<InstanceId>) {
        let safe_mode = self.safe_mode;
        let mut targets = stops;
        match broker.all_instances().await {
            Ok(all) => {
                // Instances already gone from the backend need no stop.
                let visible: BTreeSet<InstanceId> = all.into_iter().map(|i| i.id).collect();
                targets.retain(|id| visible.contains(id));

                if !self.inventory_warmed {
                    // The full inventory has not been observed yet; an
                    // unrecognized instance may belong to a live machine
                    // the cache has not seen.
                    debug!("machine inventory not observed yet, skipping orphan sweep");
                } else {
                    let known = self.known_instances();
                    let orphans: Vec<InstanceId> = visible
                        .into_iter()
                        .filter(|id| !known.contains(id) && !targets.contains(id))
                        .collect();
                    if safe_mode {
                        if !orphans.is_empty() {
                            info!(
                                count = orphans.len(),
                                "safe mode on, leaving unknown instances alone"
                            );
                        }
                    } else {
                        targets.extend(orphans);
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot list instances, skipping orphan sweep");
            }
        }
        if targets.is_empty() {
            return;
        }
        let ids: Vec<InstanceId> = targets.into_iter().collect();
        info!(count = ids.len(), "stopping instances");
        if let Err(err) = broker.stop_instances(&ids).await {
            warn!(error = %err, "cannot stop some instances");
        }
    }

    /// Instance ids bound to known machines that are not dead. A dead
    /// machine's instance is stopped through the stop list or, once the
    /// record is removed, reclaimed as an orphan.
    fn known_instances(&self) -> BTreeSet<InstanceId> {
        self.machines
            .values()
            .filter(|r| r.life != Life::Dead)
            .filter_map(|r| r.instance_id.clone())
            .collect()
    }
}

/// Provisions one machine end to end. Per-machine failures are recorded
/// as machine status; only failures to write status itself surface as
/// errors.
async fn start_machine(
    store: &StoreFacade,
    catalogue: &dyn ToolsCatalogue,
    broker: &dyn InstanceBroker,
    authority: &MachineId,
    record: MachineRecord,
) -> Result<(), StoreError> {
    let id = record.id.clone();
    let tools = match catalogue.find_tools(&record.series, &record.constraints).await {
        Ok(tools) => tools,
        Err(err) => {
            info!(machine_id = %id, series = %record.series, "no tools for machine");
            return store.set_status(&id, MachineStatus::error(err.to_string())).await;
        }
    };

    // The catalogue contract guarantees a non-empty list.
    let Some(best) = tools.first().cloned() else {
        let status = MachineStatus::error(ToolsError::NotFound.to_string());
        return store.set_status(&id, status).await;
    };
    let nonce = Nonce::generate(authority);
    let machine_config = MachineConfig {
        machine_id: id.clone(),
        nonce: nonce.clone(),
        tools: best,
    };
    let avoid_instances = match store.distribution_group(&id).await {
        Ok(group) => group,
        Err(err) => {
            warn!(machine_id = %id, error = %err, "cannot fetch distribution group");
            Vec::new()
        }
    };
    let params = StartInstanceParams {
        constraints: record.constraints.clone(),
        tools,
        machine_config,
        include_networks: record.include_networks.clone(),
        exclude_networks: record.exclude_networks.clone(),
        avoid_instances,
    };

    let started = match broker.start_instance(params).await {
        Ok(started) => started,
        Err(err) => {
            warn!(machine_id = %id, error = %err, "cannot start instance");
            return store.set_status(&id, MachineStatus::error(err.to_string())).await;
        }
    };

    if let Err(err) = commit(store, &id, &nonce, &started).await {
        // Never leak a running instance with no committed record: stop
        // it before reporting the failure.
        warn!(
            machine_id = %id,
            instance_id = %started.instance.id,
            error = %err,
            "aborting instance after failed commit"
        );
        if let Err(stop_err) = broker.stop_instances(&[started.instance.id.clone()]).await {
            warn!(
                instance_id = %started.instance.id,
                error = %stop_err,
                "cannot stop aborted instance"
            );
        }
        let message = format!("aborted instance {:?}: {err}", started.instance.id.as_str());
        return store.set_status(&id, MachineStatus::error(message)).await;
    }

    store.set_status(&id, MachineStatus::Started).await?;
    info!(machine_id = %id, instance_id = %started.instance.id, "machine provisioned");
    Ok(())
}

/// Commits the provisioning outcome: the write-once instance binding,
/// then interface metadata for each reported network.
async fn commit(
    store: &StoreFacade,
    id: &MachineId,
    nonce: &Nonce,
    started: &StartedInstance,
) -> Result<(), StoreError> {
    store
        .set_provisioned(
            id,
            started.instance.id.clone(),
            nonce.clone(),
            started.hardware.clone(),
        )
        .await?;
    for info in &started.networks {
        store.add_network_interface(id, info).await?;
    }
    Ok(())
}
