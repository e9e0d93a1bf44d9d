//! DeviceState: the device-state controller.
//!
//! Prepare and Unprepare run under one controller lock that covers the
//! whole checkpoint read-modify-write. Lock order is controller lock, then
//! the partition manager lock, then the inventory leaf lock; the
//! subdivision observer only ever takes the last one.
//!
//! A prepare that fails part way leaves the checkpoint untouched, removes
//! the CDI spec it wrote and releases the slices it allocated, so a retry
//! starts from a clean slate.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use npudra_checkpoint::{
    Checkpoint, CheckpointManager, ContainerEdits, PreparedClaims, PreparedDevice, SliceGrant,
};
use npudra_core::{CHECKPOINT_KEY, DeviceName, VISIBLE_DEVICES_ENV, VNPU_SPECS_ENV};
use npudra_partition::{PartitionManager, PartitionResult, PhysicalDevice, Slice};

use crate::cdi::CdiHandler;
use crate::claim::{DeviceRequestAllocationResult, ResourceClaim};
use crate::config::{NpuConfig, OpaqueDeviceConfig, resolve_opaque_configs};
use crate::error::{PluginError, PluginResult, ReleaseWarning};
use crate::inventory::{AllocatableDevices, Inventory};

/// Identity of the driver instance.
#[derive(Debug, Clone)]
pub struct StateConfig {
    pub driver_name: String,
    pub node_name: String,
}

/// Slices taken and files written by one prepare attempt.
#[derive(Default)]
struct PrepareAttempt {
    slices: Vec<String>,
    cdi_written: bool,
}

/// A result mapped to the device that will actually be handed out.
struct Placement<'a> {
    result: &'a DeviceRequestAllocationResult,
    device_name: String,
    slice: Option<SliceGrant>,
    config_index: usize,
}

pub struct DeviceState {
    config: StateConfig,
    inventory: Inventory,
    partitions: Option<Arc<PartitionManager>>,
    cdi: Box<dyn CdiHandler>,
    checkpoints: Mutex<Box<dyn CheckpointManager>>,
}

impl DeviceState {
    /// Wire the controller up and bring the checkpoint in line with the
    /// partition manager: an empty checkpoint is created on first start,
    /// an existing one is replayed so allocated slices survive restarts.
    pub fn new(
        config: StateConfig,
        inventory: Inventory,
        partitions: Option<Arc<PartitionManager>>,
        cdi: Box<dyn CdiHandler>,
        checkpoints: Box<dyn CheckpointManager>,
    ) -> PluginResult<Self> {
        if let Some(partitions) = &partitions {
            partitions.set_observer(Arc::new(inventory.clone()));
        }
        cdi.create_common_spec_file()?;

        let state = Self {
            config,
            inventory,
            partitions,
            cdi,
            checkpoints: Mutex::new(checkpoints),
        };

        let existing = state.lock_checkpoints().list_checkpoints()?;
        if existing.iter().any(|k| k == CHECKPOINT_KEY) {
            let restored = state.restore()?;
            info!(slices = restored, "checkpoint replayed");
        } else {
            let mut checkpoint = Checkpoint::new();
            state.record_slice_counters(&mut checkpoint);
            state
                .lock_checkpoints()
                .create_checkpoint(CHECKPOINT_KEY, &checkpoint)?;
            info!("empty checkpoint created");
        }
        Ok(state)
    }

    fn lock_checkpoints(&self) -> MutexGuard<'_, Box<dyn CheckpointManager>> {
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn driver_name(&self) -> &str {
        &self.config.driver_name
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    pub fn partitions(&self) -> Option<&Arc<PartitionManager>> {
        self.partitions.as_ref()
    }

    pub fn allocatable_devices(&self) -> AllocatableDevices {
        self.inventory.snapshot()
    }

    pub fn prepared_claims(&self) -> PluginResult<PreparedClaims> {
        let store = self.lock_checkpoints();
        Ok(store.get_checkpoint(CHECKPOINT_KEY)?.v1.prepared_claims)
    }

    /// Publish a slice of `physical` if it is not allocatable yet.
    pub fn update_allocatable_device(&self, device_name: &str, physical: &PhysicalDevice) -> bool {
        self.inventory.update_allocatable_device(device_name, physical)
    }

    /// Copy the partition manager's slice counters into `checkpoint`.
    fn record_slice_counters(&self, checkpoint: &mut Checkpoint) {
        if let Some(partitions) = &self.partitions {
            checkpoint.set_slice_counters(partitions.slice_counters());
        }
    }

    /// Bring slice counters back first, so every id published before the
    /// restart is republished and none is reused, then re-mark every
    /// checkpointed slice as allocated. Returns how many slices were
    /// restored; slices that no longer resolve are logged and skipped.
    fn restore(&self) -> PluginResult<usize> {
        let store = self.lock_checkpoints();
        let checkpoint = store.get_checkpoint(CHECKPOINT_KEY)?;
        let Some(partitions) = &self.partitions else {
            return Ok(0);
        };

        for (&logical_index, &next) in checkpoint.slice_counters() {
            if let Err(e) = partitions.restore_slice_counter(logical_index, next) {
                warn!(card = logical_index, error = %e, "failed to restore slice counter");
            }
        }

        let mut restored = 0;
        for (claim_uid, devices) in checkpoint.prepared_claims() {
            for device in devices {
                let Some(grant) = &device.slice else { continue };
                match partitions.restore_slice(&device.device_name, grant.template_name.as_deref()) {
                    Ok(_) => {
                        restored += 1;
                        if !self.inventory.contains(&device.device_name)
                            && let Some(physical) = partitions.physical_device(&device.device_name)
                        {
                            self.inventory
                                .update_allocatable_device(&device.device_name, &physical);
                        }
                    }
                    Err(e) => warn!(
                        claim = %claim_uid,
                        device = %device.device_name,
                        error = %e,
                        "failed to restore slice from checkpoint"
                    ),
                }
            }
        }
        Ok(restored)
    }

    /// Prepare every device allocated to `claim`.
    ///
    /// Idempotent per claim UID: a claim already in the checkpoint gets its
    /// stored devices back without touching any other state.
    pub fn prepare(&self, claim: &ResourceClaim) -> PluginResult<Vec<PreparedDevice>> {
        validate_claim_uid(&claim.uid)?;
        let store = self.lock_checkpoints();
        let mut checkpoint = store.get_checkpoint(CHECKPOINT_KEY)?;
        if let Some(existing) = checkpoint.prepared_claims().get(&claim.uid) {
            debug!(claim = %claim.uid, "claim already prepared");
            return Ok(existing.clone());
        }

        let mut attempt = PrepareAttempt::default();
        let result = self
            .prepare_devices(claim, &mut attempt)
            .and_then(|prepared| {
                self.cdi.create_claim_spec_file(&claim.uid, &prepared)?;
                attempt.cdi_written = true;
                checkpoint
                    .prepared_claims_mut()
                    .insert(claim.uid.clone(), prepared.clone());
                self.record_slice_counters(&mut checkpoint);
                store.create_checkpoint(CHECKPOINT_KEY, &checkpoint)?;
                Ok(prepared)
            });

        match result {
            Ok(prepared) => {
                info!(
                    claim = %claim.uid,
                    namespace = %claim.namespace,
                    name = %claim.name,
                    devices = prepared.len(),
                    "claim prepared"
                );
                Ok(prepared)
            }
            Err(e) => {
                warn!(claim = %claim.uid, error = %e, "prepare failed, rolling back");
                self.abort(&claim.uid, attempt);
                Err(e)
            }
        }
    }

    fn abort(&self, claim_uid: &str, attempt: PrepareAttempt) {
        if attempt.cdi_written
            && let Err(e) = self.cdi.delete_claim_spec_file(claim_uid)
        {
            warn!(claim = %claim_uid, error = %e, "failed to remove CDI spec of failed prepare");
        }
        let Some(partitions) = &self.partitions else {
            return;
        };
        for slice in attempt.slices {
            if let Err(e) = partitions.release_slice(&slice) {
                warn!(claim = %claim_uid, slice = %slice, error = %e, "failed to release slice of failed prepare");
            }
        }
    }

    fn prepare_devices(
        &self,
        claim: &ResourceClaim,
        attempt: &mut PrepareAttempt,
    ) -> PluginResult<Vec<PreparedDevice>> {
        let allocation = claim
            .allocation
            .as_ref()
            .ok_or_else(|| PluginError::ClaimNotAllocated(claim.uid.clone()))?;

        let mut configs = vec![OpaqueDeviceConfig {
            requests: Vec::new(),
            config: NpuConfig::default_config(),
        }];
        configs.extend(resolve_opaque_configs(
            self.driver_name(),
            &allocation.config,
        )?);

        let results: Vec<&DeviceRequestAllocationResult> = allocation
            .results
            .iter()
            .filter(|r| r.driver.is_empty() || r.driver == self.config.driver_name)
            .collect();

        // Everything that can be rejected is checked before the first slice
        // is carved, since a carved slice keeps its template and remainder.
        // The default config at index 0 matches every request.
        let mut normalized: BTreeMap<usize, NpuConfig> = BTreeMap::new();
        let mut config_indices = Vec::with_capacity(results.len());
        for result in &results {
            if !self.inventory.contains(&result.device) {
                return Err(PluginError::NotAllocatable(result.device.clone()));
            }
            let config_index = configs
                .iter()
                .rposition(|c| c.applies_to(&result.request))
                .unwrap_or(0);
            if !normalized.contains_key(&config_index) {
                let mut config = configs[config_index].config.clone();
                config.normalize();
                config.validate()?;
                normalized.insert(config_index, config);
            }
            config_indices.push(config_index);
        }

        let mut placements = Vec::with_capacity(results.len());
        for (result, config_index) in results.into_iter().zip(config_indices) {
            let (device_name, slice) = match self.try_allocate_slice(result, &configs) {
                Some(Ok(slice)) => {
                    attempt.slices.push(slice.slice_id.clone());
                    let grant = SliceGrant {
                        template_name: slice.template_name,
                    };
                    (slice.slice_id, Some(grant))
                }
                Some(Err(e)) => {
                    warn!(
                        claim = %claim.uid,
                        device = %result.device,
                        error = %e,
                        "slice allocation failed, using the allocated device as-is"
                    );
                    (result.device.clone(), None)
                }
                None => (result.device.clone(), None),
            };
            placements.push(Placement {
                result,
                device_name,
                slice,
                config_index,
            });
        }

        let cdi_device_ids = self.cdi.claim_devices(&claim.uid);
        let mut prepared = Vec::with_capacity(placements.len());
        for placement in placements {
            let config = normalized
                .get(&placement.config_index)
                .ok_or_else(|| PluginError::InvalidConfig("config was not validated".to_string()))?;
            let container_edits =
                self.container_edits(&placement.device_name, placement.slice.as_ref(), config);
            prepared.push(PreparedDevice {
                request_name: placement.result.request.clone(),
                pool_name: placement.result.pool.clone(),
                device_name: placement.device_name,
                cdi_device_ids: cdi_device_ids.clone(),
                container_edits,
                slice: placement.slice,
            });
        }
        Ok(prepared)
    }

    /// Try to carve a slice for one result. `None` when partitioning is off.
    ///
    /// The template hint comes from the last applicable config that names a
    /// template the catalog knows; without one the whole card is requested.
    fn try_allocate_slice(
        &self,
        result: &DeviceRequestAllocationResult,
        configs: &[OpaqueDeviceConfig],
    ) -> Option<PartitionResult<Slice>> {
        let partitions = self.partitions.as_ref()?;
        let template = configs
            .iter()
            .rev()
            .filter(|c| c.applies_to(&result.request))
            .filter_map(|c| c.config.template_name())
            .find_map(|name| {
                let template = partitions.template(name);
                if template.is_none() {
                    warn!(template = name, request = %result.request, "unknown vNPU template");
                }
                template
            });
        let (ai_core, memory_gb) = template
            .map(|t| (t.ai_core, t.memory_gb))
            .unwrap_or((0, 0));
        Some(partitions.allocate_slice(&result.device, ai_core, memory_gb))
    }

    fn container_edits(
        &self,
        device_name: &str,
        slice: Option<&SliceGrant>,
        config: &NpuConfig,
    ) -> ContainerEdits {
        let parsed = DeviceName::parse(device_name);
        let visible = self
            .inventory
            .logical_index(device_name)
            .map(|i| i.to_string())
            .unwrap_or_else(|| device_name.to_string());
        let mut env = vec![format!("{VISIBLE_DEVICES_ENV}={visible}")];

        if slice.is_some()
            && let Some(partitions) = &self.partitions
        {
            match partitions.vnpu_spec(device_name) {
                Ok(Some(template)) => env.push(format!("{VNPU_SPECS_ENV}={template}")),
                Ok(None) => {}
                Err(e) => warn!(device = device_name, error = %e, "failed to look up vNPU spec"),
            }
        }

        let suffix = parsed
            .map(|d| d.env_suffix())
            .unwrap_or_else(|| device_name.replace('-', "_"));
        env.extend(config.sharing_env(&suffix));
        ContainerEdits::from_env(env)
    }

    /// Undo `prepare` for a claim. Unknown claims are a no-op.
    ///
    /// The CDI spec and checkpoint entry go first; slices are released
    /// after the checkpoint commit, so a crash in between frees them on
    /// replay instead of leaking them. Slices that cannot be released are
    /// returned as warnings.
    pub fn unprepare(&self, claim_uid: &str) -> PluginResult<Vec<ReleaseWarning>> {
        let store = self.lock_checkpoints();
        let mut checkpoint = store.get_checkpoint(CHECKPOINT_KEY)?;
        let Some(devices) = checkpoint.prepared_claims_mut().remove(claim_uid) else {
            debug!(claim = %claim_uid, "claim not prepared, nothing to do");
            return Ok(Vec::new());
        };

        self.cdi.delete_claim_spec_file(claim_uid)?;
        self.record_slice_counters(&mut checkpoint);
        store.create_checkpoint(CHECKPOINT_KEY, &checkpoint)?;

        let warnings = self.release_devices(claim_uid, &devices);
        info!(
            claim = %claim_uid,
            devices = devices.len(),
            warnings = warnings.len(),
            "claim unprepared"
        );
        Ok(warnings)
    }

    fn release_devices(&self, claim_uid: &str, devices: &[PreparedDevice]) -> Vec<ReleaseWarning> {
        let mut warnings = Vec::new();
        for device in devices.iter().filter(|d| d.slice.is_some()) {
            let Some(partitions) = &self.partitions else {
                debug!(device = %device.device_name, "partitioning disabled, slice not tracked");
                continue;
            };
            if let Err(source) = partitions.release_slice(&device.device_name) {
                warn!(
                    claim = %claim_uid,
                    device = %device.device_name,
                    error = %source,
                    "failed to release slice"
                );
                warnings.push(ReleaseWarning {
                    device_name: device.device_name.clone(),
                    source,
                });
            }
        }
        warnings
    }
}

/// Claim UIDs end up in CDI spec file names.
fn validate_claim_uid(uid: &str) -> PluginResult<()> {
    if uid.is_empty() || uid == "." || uid == ".." || uid.contains(['/', '\\']) {
        return Err(PluginError::InvalidClaim(format!(
            "claim uid {uid:?} is not usable as a file name"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use npudra_checkpoint::{CheckpointError, CheckpointResult, CheckpointStore};
    use npudra_core::DRIVER_NAME;
    use npudra_core::config::DeviceConfig;
    use npudra_partition::{PartitionTemplate, TemplateCatalog, TemplateFamily};
    use serde_json::json;

    use crate::claim::{
        AllocationResult, ConfigSource, DeviceAllocationConfiguration, OpaqueDeviceConfiguration,
    };
    use crate::config::API_VERSION;
    use crate::discovery::{StaticDeviceManager, enumerate_devices};

    // ── Fixtures ───────────────────────────────────────────────────

    #[derive(Clone, Default)]
    struct RecordingCdi {
        specs: Arc<Mutex<BTreeMap<String, ContainerEdits>>>,
        fail_writes: Arc<AtomicBool>,
    }

    impl RecordingCdi {
        fn spec(&self, uid: &str) -> Option<ContainerEdits> {
            self.specs.lock().unwrap().get(uid).cloned()
        }
    }

    impl CdiHandler for RecordingCdi {
        fn create_common_spec_file(&self) -> PluginResult<()> {
            Ok(())
        }

        fn create_claim_spec_file(&self, claim_uid: &str, devices: &[PreparedDevice]) -> PluginResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(PluginError::Cdi("disk full".to_string()));
            }
            let mut merged = ContainerEdits::default();
            for d in devices {
                merged.append(&d.container_edits);
            }
            self.specs.lock().unwrap().insert(claim_uid.to_string(), merged);
            Ok(())
        }

        fn delete_claim_spec_file(&self, claim_uid: &str) -> PluginResult<()> {
            self.specs.lock().unwrap().remove(claim_uid);
            Ok(())
        }

        fn claim_devices(&self, claim_uid: &str) -> Vec<String> {
            vec![format!("k8s.npu.example.com/npu={claim_uid}")]
        }
    }

    /// Checkpoint store whose writes can be made to fail.
    #[derive(Clone)]
    struct FlakyStore {
        inner: CheckpointStore,
        fail_writes: Arc<AtomicBool>,
    }

    impl CheckpointManager for FlakyStore {
        fn get_checkpoint(&self, key: &str) -> CheckpointResult<Checkpoint> {
            self.inner.get_checkpoint(key)
        }

        fn create_checkpoint(&self, key: &str, checkpoint: &Checkpoint) -> CheckpointResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(CheckpointError::Write("injected".to_string()));
            }
            self.inner.create_checkpoint(key, checkpoint)
        }

        fn list_checkpoints(&self) -> CheckpointResult<Vec<String>> {
            self.inner.list_checkpoints()
        }
    }

    struct Harness {
        state: DeviceState,
        cdi: RecordingCdi,
        store: FlakyStore,
    }

    fn catalog() -> TemplateCatalog {
        TemplateCatalog::new(
            vec![
                PartitionTemplate::new("T1", 8, 8),
                PartitionTemplate::new("T2", 16, 16),
                PartitionTemplate::new("T3", 32, 32),
                PartitionTemplate::new("huge", 64, 64),
            ],
            vec![TemplateFamily {
                model_match: "Ascend910".to_string(),
                templates: vec!["T1".to_string(), "T2".to_string(), "T3".to_string()],
            }],
        )
    }

    fn devices() -> Vec<DeviceConfig> {
        (0..2)
            .map(|i| DeviceConfig {
                logic_id: i,
                phy_id: i,
                model: "Ascend910B".to_string(),
                aicore: Some(32),
                memory_gb: Some(32),
            })
            .collect()
    }

    fn harness_with(store: CheckpointStore, partitioning: bool) -> Harness {
        let found = enumerate_devices(
            &StaticDeviceManager::new(devices()),
            catalog(),
            DRIVER_NAME,
            "node-a",
            partitioning,
        )
        .unwrap();
        let cdi = RecordingCdi::default();
        let store = FlakyStore {
            inner: store,
            fail_writes: Arc::new(AtomicBool::new(false)),
        };
        let state = DeviceState::new(
            StateConfig {
                driver_name: DRIVER_NAME.to_string(),
                node_name: "node-a".to_string(),
            },
            found.inventory,
            found.partitions,
            Box::new(cdi.clone()),
            Box::new(store.clone()),
        )
        .unwrap();
        Harness { state, cdi, store }
    }

    fn harness() -> Harness {
        harness_with(CheckpointStore::open_in_memory().unwrap(), true)
    }

    fn claim(uid: &str, results: &[(&str, &str)], config: Vec<DeviceAllocationConfiguration>) -> ResourceClaim {
        ResourceClaim {
            uid: uid.to_string(),
            namespace: "default".to_string(),
            name: format!("claim-{uid}"),
            allocation: Some(AllocationResult {
                results: results
                    .iter()
                    .map(|(request, device)| DeviceRequestAllocationResult {
                        request: request.to_string(),
                        driver: DRIVER_NAME.to_string(),
                        pool: "node-a".to_string(),
                        device: device.to_string(),
                    })
                    .collect(),
                config,
            }),
        }
    }

    fn opaque(source: ConfigSource, requests: &[&str], parameters: serde_json::Value) -> DeviceAllocationConfiguration {
        DeviceAllocationConfiguration {
            source,
            requests: requests.iter().map(|r| r.to_string()).collect(),
            opaque: Some(OpaqueDeviceConfiguration {
                driver: DRIVER_NAME.to_string(),
                parameters,
            }),
        }
    }

    fn template(name: &str) -> serde_json::Value {
        json!({"apiVersion": API_VERSION, "kind": "NpuConfig", "vnpuSpec": {"templateName": name}})
    }

    fn card(h: &Harness, logical: u32) -> PhysicalDevice {
        h.state
            .partitions()
            .unwrap()
            .physical_device(&DeviceName::full_card(logical).to_string())
            .unwrap()
    }

    // ── Prepare ────────────────────────────────────────────────────

    #[test]
    fn full_card_prepare_sets_only_visible_devices() {
        let h = harness();
        let prepared = h.state.prepare(&claim("uid-1", &[("npu", "npu-0-0")], Vec::new())).unwrap();

        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].device_name, "npu-0-0");
        assert_eq!(prepared[0].container_edits.env, vec!["ASCEND_VISIBLE_DEVICES=0"]);
        assert_eq!(prepared[0].cdi_device_ids, vec!["k8s.npu.example.com/npu=uid-1"]);
        assert_eq!(prepared[0].slice, Some(SliceGrant { template_name: None }));
        assert!(card(&h, 0).is_allocated("npu-0-0"));
        assert_eq!(h.cdi.spec("uid-1").unwrap().env, vec!["ASCEND_VISIBLE_DEVICES=0"]);
        assert!(h.state.prepared_claims().unwrap().contains_key("uid-1"));
    }

    #[test]
    fn template_prepare_subdivides_and_publishes_remainder() {
        let h = harness();
        let prepared = h
            .state
            .prepare(&claim(
                "uid-1",
                &[("npu", "npu-0-0")],
                vec![opaque(ConfigSource::FromClass, &[], template("T2"))],
            ))
            .unwrap();

        assert!(DeviceName::parse(&prepared[0].device_name).is_some());
        assert_eq!(
            prepared[0].container_edits.env,
            vec!["ASCEND_VISIBLE_DEVICES=0", "ASCEND_VNPU_SPECS=T2"]
        );
        let devices = h.state.allocatable_devices();
        let remainder = devices.get("npu-0-1").unwrap();
        assert_eq!(remainder.string_attribute(DRIVER_NAME, "type"), Some("vNPU"));
        assert_eq!(remainder.int_attribute(DRIVER_NAME, "aicore"), Some(32));
    }

    #[test]
    fn prepare_is_idempotent() {
        let h = harness();
        let c = claim(
            "uid-1",
            &[("npu", "npu-0-0")],
            vec![opaque(ConfigSource::FromClaim, &[], template("T1"))],
        );
        let first = h.state.prepare(&c).unwrap();
        let before = card(&h, 0);
        let second = h.state.prepare(&c).unwrap();

        assert_eq!(first, second);
        assert_eq!(card(&h, 0), before);
        assert_eq!(before.next_slice_index, 2);
    }

    #[test]
    fn claim_config_overrides_class_config_per_request() {
        let h = harness();
        let class = json!({
            "apiVersion": API_VERSION,
            "kind": "NpuConfig",
            "sharing": {"strategy": "TimeSlicing", "timeSlicingConfig": {"interval": "Long"}}
        });
        let claim_cfg = json!({
            "apiVersion": API_VERSION,
            "kind": "NpuConfig",
            "sharing": {"strategy": "SpacePartitioning", "spacePartitioningConfig": {"partitionCount": 4}}
        });
        let prepared = h
            .state
            .prepare(&claim(
                "uid-1",
                &[("a", "npu-0-0"), ("b", "npu-1-0")],
                vec![
                    opaque(ConfigSource::FromClaim, &["b"], claim_cfg),
                    opaque(ConfigSource::FromClass, &[], class),
                ],
            ))
            .unwrap();

        assert_eq!(prepared[0].request_name, "a");
        assert_eq!(
            prepared[0].container_edits.env,
            vec![
                "ASCEND_VISIBLE_DEVICES=0",
                "NPU_DEVICE_0_0_SHARING_STRATEGY=TimeSlicing",
                "NPU_DEVICE_0_0_TIMESLICE_INTERVAL=Long",
            ]
        );
        assert_eq!(
            prepared[1].container_edits.env,
            vec![
                "ASCEND_VISIBLE_DEVICES=1",
                "NPU_DEVICE_1_0_SHARING_STRATEGY=SpacePartitioning",
                "NPU_DEVICE_1_0_PARTITION_COUNT=4",
            ]
        );
        let merged = h.cdi.spec("uid-1").unwrap();
        assert_eq!(merged.env.len(), 6);
    }

    #[test]
    fn unknown_device_is_not_allocatable() {
        let h = harness_with(CheckpointStore::open_in_memory().unwrap(), false);
        let err = h
            .state
            .prepare(&claim("uid-1", &[("npu", "npu-7-0")], Vec::new()))
            .unwrap_err();

        assert!(matches!(err, PluginError::NotAllocatable(ref d) if d == "npu-7-0"));
        assert!(h.state.prepared_claims().unwrap().is_empty());
        assert!(h.cdi.spec("uid-1").is_none());
    }

    #[test]
    fn unallocated_claim_is_rejected() {
        let h = harness();
        let mut c = claim("uid-1", &[], Vec::new());
        c.allocation = None;
        assert!(matches!(h.state.prepare(&c), Err(PluginError::ClaimNotAllocated(_))));
    }

    #[test]
    fn invalid_config_leaves_card_untouched() {
        let h = harness();
        let before = card(&h, 0);
        let devices_before = h.state.allocatable_devices();
        let bad = json!({
            "apiVersion": API_VERSION,
            "kind": "NpuConfig",
            "sharing": {"strategy": "SpacePartitioning", "spacePartitioningConfig": {"partitionCount": 0}},
            "vnpuSpec": {"templateName": "T1"}
        });
        let err = h
            .state
            .prepare(&claim("uid-1", &[("npu", "npu-0-0")], vec![opaque(ConfigSource::FromClaim, &[], bad)]))
            .unwrap_err();

        assert!(matches!(err, PluginError::InvalidConfig(_)));
        assert_eq!(card(&h, 0), before);
        assert_eq!(h.state.allocatable_devices(), devices_before);
        assert!(h.state.prepared_claims().unwrap().is_empty());

        // A plain full-card claim afterwards sees no trace of the template.
        let prepared = h
            .state
            .prepare(&claim("uid-2", &[("npu", "npu-0-0")], Vec::new()))
            .unwrap();
        assert_eq!(prepared[0].container_edits.env, vec!["ASCEND_VISIBLE_DEVICES=0"]);
    }

    #[test]
    fn claim_uid_with_path_separator_is_rejected() {
        let h = harness();
        for uid in ["../escape", "a/b", "a\\b", "", ".."] {
            let err = h
                .state
                .prepare(&claim(uid, &[("npu", "npu-0-0")], Vec::new()))
                .unwrap_err();
            assert!(matches!(err, PluginError::InvalidClaim(_)), "uid {uid:?}");
        }
        assert!(h.state.prepared_claims().unwrap().is_empty());
        assert!(!card(&h, 0).is_allocated("npu-0-0"));
    }

    #[test]
    fn non_opaque_config_is_invalid() {
        let h = harness();
        let c = claim(
            "uid-1",
            &[("npu", "npu-0-0")],
            vec![DeviceAllocationConfiguration {
                source: ConfigSource::FromClaim,
                requests: Vec::new(),
                opaque: None,
            }],
        );
        assert!(matches!(h.state.prepare(&c), Err(PluginError::InvalidConfig(_))));
    }

    #[test]
    fn checkpoint_failure_removes_cdi_spec_and_releases_slices() {
        let h = harness();
        h.store.fail_writes.store(true, Ordering::SeqCst);
        let err = h
            .state
            .prepare(&claim(
                "uid-1",
                &[("npu", "npu-0-0")],
                vec![opaque(ConfigSource::FromClaim, &[], template("T2"))],
            ))
            .unwrap_err();

        assert!(matches!(err, PluginError::Persistence(_)));
        assert!(h.cdi.spec("uid-1").is_none());
        assert!(card(&h, 0).allocated_slices.is_empty());

        h.store.fail_writes.store(false, Ordering::SeqCst);
        assert!(h.state.prepared_claims().unwrap().is_empty());
    }

    #[test]
    fn cdi_failure_leaves_checkpoint_untouched() {
        let h = harness();
        h.cdi.fail_writes.store(true, Ordering::SeqCst);
        let err = h
            .state
            .prepare(&claim("uid-1", &[("npu", "npu-0-0")], Vec::new()))
            .unwrap_err();

        assert!(matches!(err, PluginError::Cdi(_)));
        assert!(h.state.prepared_claims().unwrap().is_empty());
        assert!(!card(&h, 0).is_allocated("npu-0-0"));
    }

    #[test]
    fn partition_failure_falls_back_to_allocated_device() {
        let h = harness();
        // "huge" is in the catalog but no Ascend910 card supports it.
        let prepared = h
            .state
            .prepare(&claim(
                "uid-1",
                &[("npu", "npu-0-0")],
                vec![opaque(ConfigSource::FromClaim, &[], template("huge"))],
            ))
            .unwrap();

        assert_eq!(prepared[0].device_name, "npu-0-0");
        assert_eq!(prepared[0].slice, None);
        assert_eq!(prepared[0].container_edits.env, vec!["ASCEND_VISIBLE_DEVICES=0"]);
        assert!(card(&h, 0).allocated_slices.is_empty());
    }

    #[test]
    fn unknown_template_requests_full_card() {
        let h = harness();
        let prepared = h
            .state
            .prepare(&claim(
                "uid-1",
                &[("npu", "npu-1-0")],
                vec![opaque(ConfigSource::FromClaim, &[], template("vir99"))],
            ))
            .unwrap();
        assert_eq!(prepared[0].slice, Some(SliceGrant { template_name: None }));
        assert!(card(&h, 1).is_allocated("npu-1-0"));
    }

    #[test]
    fn results_for_other_drivers_are_skipped() {
        let h = harness();
        let mut c = claim("uid-1", &[("npu", "npu-0-0"), ("gpu", "gpu-0")], Vec::new());
        if let Some(allocation) = c.allocation.as_mut() {
            allocation.results[1].driver = "gpu.example.com".to_string();
        }
        let prepared = h.state.prepare(&c).unwrap();
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].device_name, "npu-0-0");
    }

    // ── Unprepare ──────────────────────────────────────────────────

    #[test]
    fn unprepare_unknown_claim_is_noop() {
        let h = harness();
        assert!(h.state.unprepare("ghost").unwrap().is_empty());
        assert!(h.state.unprepare("ghost").unwrap().is_empty());
    }

    #[test]
    fn unprepare_releases_slices_and_removes_claim() {
        let h = harness();
        h.state
            .prepare(&claim(
                "uid-1",
                &[("npu", "npu-0-0")],
                vec![opaque(ConfigSource::FromClaim, &[], template("T1"))],
            ))
            .unwrap();

        let warnings = h.state.unprepare("uid-1").unwrap();
        assert!(warnings.is_empty());
        assert!(h.cdi.spec("uid-1").is_none());
        assert!(h.state.prepared_claims().unwrap().is_empty());

        let card = card(&h, 0);
        assert!(card.allocated_slices.is_empty());
        let released = card.available_slices.iter().find(|s| s.slice_id == "npu-0-0").unwrap();
        assert_eq!(released.template_name.as_deref(), Some("T1"));
        assert!(card.slices_disjoint());
    }

    #[test]
    fn unprepare_collects_release_failures() {
        let h = harness();
        h.state.prepare(&claim("uid-1", &[("npu", "npu-0-0")], Vec::new())).unwrap();
        h.state.partitions().unwrap().release_slice("npu-0-0").unwrap();

        let warnings = h.state.unprepare("uid-1").unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].device_name, "npu-0-0");
        assert!(h.state.prepared_claims().unwrap().is_empty());
    }

    #[test]
    fn failed_unprepare_keeps_claim_for_retry() {
        let h = harness();
        h.state
            .prepare(&claim(
                "uid-1",
                &[("npu", "npu-0-0")],
                vec![opaque(ConfigSource::FromClaim, &[], template("T1"))],
            ))
            .unwrap();
        h.store.fail_writes.store(true, Ordering::SeqCst);
        assert!(h.state.unprepare("uid-1").is_err());
        assert!(card(&h, 0).is_allocated("npu-0-0"));

        h.store.fail_writes.store(false, Ordering::SeqCst);
        assert!(h.state.prepared_claims().unwrap().contains_key("uid-1"));
        assert!(h.state.unprepare("uid-1").unwrap().is_empty());
        assert!(!card(&h, 0).is_allocated("npu-0-0"));
    }

    #[test]
    fn prepare_unprepare_prepare_without_partitioning() {
        let h = harness_with(CheckpointStore::open_in_memory().unwrap(), false);
        let c = claim("uid-1", &[("npu", "npu-1-0")], Vec::new());

        let first = h.state.prepare(&c).unwrap();
        assert!(h.state.unprepare("uid-1").unwrap().is_empty());
        let second = h.state.prepare(&c).unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0].slice, None);
        assert_eq!(first[0].container_edits.env, vec!["ASCEND_VISIBLE_DEVICES=1"]);
    }

    // ── Restart and concurrency ────────────────────────────────────

    #[test]
    fn restart_replays_checkpointed_slices() {
        let store = CheckpointStore::open_in_memory().unwrap();
        {
            let h = harness_with(store.clone(), true);
            h.state
                .prepare(&claim(
                    "uid-1",
                    &[("npu", "npu-0-0")],
                    vec![opaque(ConfigSource::FromClaim, &[], template("T2"))],
                ))
                .unwrap();
        }

        let h = harness_with(store, true);
        let card = card(&h, 0);
        assert!(card.is_allocated("npu-0-0"));
        assert_eq!(card.slice("npu-0-0").unwrap().template_name.as_deref(), Some("T2"));
        assert_eq!(card.next_slice_index, 2);
        assert!(h.state.allocatable_devices().contains_key("npu-0-1"));

        // The remainder is usable and the restored claim can be unprepared.
        h.state
            .prepare(&claim(
                "uid-2",
                &[("npu", "npu-0-1")],
                vec![opaque(ConfigSource::FromClaim, &[], template("T1"))],
            ))
            .unwrap();
        assert!(h.state.unprepare("uid-1").unwrap().is_empty());
    }

    #[test]
    fn restart_keeps_slice_counters_and_published_remainders() {
        let store = CheckpointStore::open_in_memory().unwrap();
        let t1 = || vec![opaque(ConfigSource::FromClaim, &[], template("T1"))];
        {
            let h = harness_with(store.clone(), true);
            for (uid, device) in [("uid-a", "npu-0-0"), ("uid-b", "npu-0-1"), ("uid-c", "npu-0-2")] {
                h.state.prepare(&claim(uid, &[("npu", device)], t1())).unwrap();
            }
            assert!(h.state.unprepare("uid-c").unwrap().is_empty());
            assert_eq!(card(&h, 0).next_slice_index, 4);
        }

        let h = harness_with(store, true);
        let card0 = card(&h, 0);
        assert_eq!(card0.next_slice_index, 4);
        assert!(card0.is_allocated("npu-0-0"));
        assert!(card0.is_allocated("npu-0-1"));
        let mut available: Vec<&str> = card0.available_slices.iter().map(|s| s.slice_id.as_str()).collect();
        available.sort();
        assert_eq!(available, vec!["npu-0-2", "npu-0-3"]);
        assert!(card0.slices_disjoint());
        assert!(h.state.allocatable_devices().contains_key("npu-0-3"));

        // The next subdivision continues past every id published before.
        h.state.prepare(&claim("uid-d", &[("npu", "npu-0-3")], t1())).unwrap();
        let card0 = card(&h, 0);
        assert_eq!(card0.next_slice_index, 5);
        assert!(card0.available_slices.iter().any(|s| s.slice_id == "npu-0-4"));
    }

    #[test]
    fn concurrent_prepares_on_distinct_claims() {
        let h = harness();
        std::thread::scope(|scope| {
            for i in 0..8 {
                let state = &h.state;
                scope.spawn(move || {
                    let device = format!("npu-{}-0", i % 2);
                    let uid = format!("uid-{i}");
                    state
                        .prepare(&claim(
                            &uid,
                            &[("npu", device.as_str())],
                            vec![opaque(ConfigSource::FromClaim, &[], template("T1"))],
                        ))
                        .unwrap();
                });
            }
        });

        assert_eq!(h.state.prepared_claims().unwrap().len(), 8);
        for logical in 0..2 {
            assert!(card(&h, logical).slices_disjoint());
        }
    }
}
