// SPDX-License-Identifier: MPL-2.0

//! The device: zone wiring and the per-I/O state machines.

use std::{
    collections::HashMap as StdHashMap,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    sync::mpsc,
    time::{Duration, Instant},
};

use super::{
    admin::{AdminStateMachine, SuspendPhase},
    config::DeviceConfig,
    data_vio::{DataVio, DataVioPool, DeviceStats, IoCompletion, IoDescriptor, IoFlags, VioOp},
    packer::{
        compress_block, decompress_fragment, extract_fragment, Packer, SealedBin,
    },
    read_only::{ReadOnlyNotifier, RecordOutcome},
    super_block::{DeviceGeometry, SuperBlock, SuperBlockPayload},
};
use crate::{
    error::Errno,
    layers::{
        bio::{BlockSet, Buf, Pbn, BLOCK_SIZE, ZERO_BLOCK},
        bmap::{
            compute_forest_height, compute_forest_size, format_roots, BlockMapState, BlockMapZone,
            PreparePut, ENTRIES_PER_PAGE,
        },
        dedupe::{
            ChunkName, DedupeAdvice, IndexAction, IndexConfig, IndexControl, IndexRequest,
            IndexStats, IndexZone,
        },
        depot::{
            AllocResult, BlockAllocator, DepotState, PbnLockIndex, PbnLockPool, PbnLockType,
            ReferenceCount, Slab, SlabDepot, SlabSummary, SummaryUpdate,
        },
        journal::{
            validate_entry, BlockMapEntry, JournalEntrySlot, JournalOperation, JournalPoint,
            MappingState, RecoveryJournal, RecoveryJournalEntry, RecoveryJournalState,
            ScannedJournal,
        },
    },
    os::{Arc, Box, Condvar, HashMap, JoinHandle, Mutex, String, ToString, Vec},
    prelude::*,
    util::{WaitQueue, Waiter},
    zone::{Priority, Serviceable, WorkQueue, Worker, WorkerWakeup, ZoneCell, ZoneHandle},
};

/// The bounds every storage provider for a device must satisfy.
pub trait Disk: BlockSet + Clone + 'static {}
impl<T: BlockSet + Clone + 'static> Disk for T {}

const DATA_VIO_POOL_SIZE: usize = 256;
const PBN_LOCK_POOL_SLACK: usize = 32;

// ---------------------------------------------------------------------------
// Dedupe advice timer
// ---------------------------------------------------------------------------

/// A vio parked while its index query is outstanding. Whoever takes the
/// vio first (the index answer or the timeout) continues the pipeline.
type AdviceSlot = Arc<Mutex<Option<DataVio>>>;

struct TimerInner {
    pending: Mutex<Vec<(Instant, Box<dyn FnOnce() + Send>)>>,
    cvar: Condvar,
    stopping: AtomicBool,
}

/// The dedupe thread: fires advice timeouts so a write never waits on
/// the index longer than the configured interval.
struct DedupeTimer {
    inner: Arc<TimerInner>,
    handle: Mutex<Option<JoinHandle>>,
}

impl DedupeTimer {
    fn spawn() -> Self {
        let inner = Arc::new(TimerInner {
            pending: Mutex::new(Vec::new()),
            cvar: Condvar::new(),
            stopping: AtomicBool::new(false),
        });
        let thread_inner = inner.clone();
        let handle = crate::os::spawn("vdo-dedupe-timer".to_string(), move || {
            Self::run(thread_inner);
        });
        Self {
            inner,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn run(inner: Arc<TimerInner>) {
        let mut pending = inner.pending.lock();
        loop {
            if inner.stopping.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            let mut due = Vec::new();
            pending.retain_mut(|(deadline, callback)| {
                if *deadline <= now {
                    // `retain_mut` gives us `&mut`; swap the callback out.
                    let fired: Box<dyn FnOnce() + Send> = core::mem::replace(
                        callback,
                        Box::new(|| ()),
                    );
                    due.push(fired);
                    false
                } else {
                    true
                }
            });
            if !due.is_empty() {
                drop(pending);
                for callback in due {
                    callback();
                }
                pending = inner.pending.lock();
                continue;
            }
            let wait = pending
                .iter()
                .map(|(deadline, _)| deadline.saturating_duration_since(now))
                .min()
                .unwrap_or(Duration::from_millis(100));
            let (guard, _timed_out) = inner.cvar.wait_timeout(pending, wait);
            pending = guard;
        }
    }

    fn register(&self, deadline: Instant, callback: Box<dyn FnOnce() + Send>) {
        self.inner.pending.lock().push((deadline, callback));
        self.inner.cvar.notify_one();
    }

    fn stop(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.cvar.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// The immutable wiring of a running device: one handle per zone queue
/// plus the few cells the host boundary needs without a zone hop.
pub struct Router<D: Disk> {
    logical: Vec<ZoneHandle<LogicalZone<D>>>,
    physical: Vec<ZoneHandle<PhysicalZone<D>>>,
    hash: Vec<ZoneHandle<HashZone<D>>>,
    journal: ZoneHandle<JournalZone<D>>,
    packer: ZoneHandle<PackerZone<D>>,
    admin: ZoneHandle<AdminZone<D>>,
    bio: Vec<ZoneHandle<BioZone<D>>>,
    cpu: Vec<ZoneHandle<CpuZone<D>>>,
    ack: Option<ZoneHandle<AckZone<D>>>,
    notifier: ReadOnlyNotifier,
    vio_pool: DataVioPool,
    timer: DedupeTimer,
    config: DeviceConfig,
    geometry: DeviceGeometry,
    depot_state: DepotState,
    bmap_state: BlockMapState,
    nonce: u64,
    suspended: AtomicBool,
    logical_limit: AtomicU64,
    /// Test hook: stall the index this long before answering.
    index_delay: Mutex<Option<Duration>>,
}

impl<D: Disk> Router<D> {
    fn logical_zone_of(&self, lbn: u64) -> &ZoneHandle<LogicalZone<D>> {
        let zone = self.bmap_state.tree_of(lbn) % self.logical.len() as u32;
        &self.logical[zone as usize]
    }

    fn physical_zone_index_of(&self, pbn: Pbn) -> u32 {
        let slab = self
            .depot_state
            .slab_index_of(pbn)
            .expect("a counted pbn lies in the slab region");
        (slab % self.physical.len() as u64) as u32
    }

    fn physical_zone_of(&self, pbn: Pbn) -> &ZoneHandle<PhysicalZone<D>> {
        &self.physical[self.physical_zone_index_of(pbn) as usize]
    }

    fn hash_zone_of(&self, name: &ChunkName) -> &ZoneHandle<HashZone<D>> {
        &self.hash[name.zone_of(self.hash.len() as u32) as usize]
    }

    fn bio_zone_of(&self, pbn: Pbn) -> &ZoneHandle<BioZone<D>> {
        &self.bio[(pbn % self.bio.len() as u64) as usize]
    }

    fn cpu_zone_of(&self, lbn: u64) -> &ZoneHandle<CpuZone<D>> {
        &self.cpu[(lbn % self.cpu.len() as u64) as usize]
    }

    /// Requests read-only entry; the winning caller schedules listener
    /// notification on the admin thread.
    fn enter_read_only(self: &Arc<Self>, errno: Errno) {
        match self.notifier.record(errno) {
            RecordOutcome::NotifyNow => {
                let router = self.clone();
                self.admin
                    .send(Priority::High, move |zone| propagate_read_only(zone, router));
            }
            RecordOutcome::Deferred | RecordOutcome::AlreadyReadOnly => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Zone states
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default)]
struct LogicalStats {
    reads: u64,
    writes: u64,
    discards: u64,
    flushes: u64,
    zero_block_writes: u64,
    dedupe_hits: u64,
    dedupe_verify_failures: u64,
    dedupe_timeouts: u64,
}

struct LogicalZone<D: Disk> {
    zone_index: u32,
    router: Arc<Router<D>>,
    bmap: BlockMapZone<D>,
    /// An entry means the LBN is locked; the queue holds contenders.
    lbn_locks: HashMap<u64, WaitQueue<LogicalZone<D>>>,
    /// Tree-page installs in flight, keyed by (parent page, slot).
    /// Serializes growth so two vios never allocate the same page.
    pending_tree_installs: HashMap<(Pbn, u16), WaitQueue<LogicalZone<D>>>,
    dedupe_enabled: bool,
    compression_enabled: bool,
    is_read_only: bool,
    read_only_listeners: Vec<Box<dyn FnMut() + Send>>,
    stats: LogicalStats,
}

struct PhysicalZone<D: Disk> {
    zone_index: u32,
    router: Arc<Router<D>>,
    allocator: BlockAllocator<D>,
    lock_pool: PbnLockPool,
    locks: HashMap<Pbn, PbnLockIndex>,
    /// Set while an amortized slab-journal commit pass is queued.
    slab_commit_scheduled: bool,
    /// Allocations stalled on scrubbing producing a clean slab.
    scrub_waiters: WaitQueue<PhysicalZone<D>>,
    /// Borrowers stalled on the lock pool.
    pool_waiters: WaitQueue<PhysicalZone<D>>,
    is_read_only: bool,
    read_only_listeners: Vec<Box<dyn FnMut() + Send>>,
}

struct HashZone<D: Disk> {
    router: Arc<Router<D>>,
    index: IndexZone,
    is_read_only: bool,
    read_only_listeners: Vec<Box<dyn FnMut() + Send>>,
}

struct JournalZone<D: Disk> {
    router: Arc<Router<D>>,
    journal: RecoveryJournal<D>,
    next_token: u64,
    /// vio token -> journal sequence floor the block map still needs.
    bmap_floors: StdHashMap<u64, u64>,
    /// vio token -> journal sequence floor the slab journals still need.
    slab_floors: StdHashMap<u64, u64>,
    /// vio token -> counted deltas whose slab-journal mirror is not yet
    /// durable; the slab floor lifts when this reaches zero.
    slab_floor_refs: StdHashMap<u64, u32>,
    /// Per logical zone, the era of its oldest dirty block-map page.
    zone_dirty_eras: Vec<Option<u64>>,
    /// Set while an amortized partial-block commit is queued.
    commit_scheduled: bool,
    is_read_only: bool,
    read_only_listeners: Vec<Box<dyn FnMut() + Send>>,
}

impl<D: Disk> JournalZone<D> {
    fn take_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn recompute_heads(&mut self) {
        let tail = self.journal.tail_sequence();
        let bmap_head = self
            .bmap_floors
            .values()
            .copied()
            .chain(self.zone_dirty_eras.iter().flatten().copied())
            .min()
            .unwrap_or(tail);
        self.journal.advance_block_map_head(bmap_head);
        let slab_head = self.slab_floors.values().copied().min().unwrap_or(tail);
        self.journal.advance_slab_journal_head(slab_head);
    }
}

struct PackerZone<D: Disk> {
    router: Arc<Router<D>>,
    packer: Packer,
    /// Set while suspend drains the packer; late fragments bypass
    /// compression so the vio pool can empty.
    draining: bool,
    is_read_only: bool,
    read_only_listeners: Vec<Box<dyn FnMut() + Send>>,
}

struct GatherOp {
    remaining: usize,
    stats: DeviceStats,
    done: mpsc::Sender<DeviceStats>,
}

struct SuspendOp {
    phase: SuspendPhase,
    pending: usize,
    journal_state: Option<RecoveryJournalState>,
    done: mpsc::Sender<Result<()>>,
}

struct AdminZone<D: Disk> {
    router: Arc<Router<D>>,
    storage: D,
    summary: SlabSummary<D>,
    machine: AdminStateMachine,
    payload: SuperBlockPayload,
    suspend: Option<SuspendOp>,
    gather: Option<GatherOp>,
    read_only_pending: usize,
    is_read_only: bool,
    read_only_listeners: Vec<Box<dyn FnMut() + Send>>,
}

struct BioZone<D: Disk> {
    router: Arc<Router<D>>,
    storage: D,
}

struct CpuZone<D: Disk> {
    router: Arc<Router<D>>,
}

struct AckZone<D: Disk> {
    router: Arc<Router<D>>,
}

/// The stat flags a finished vio reports back to its logical zone.
#[derive(Clone, Copy, Debug, Default)]
struct VioOutcome {
    dedupe_hit: bool,
    verify_failed: bool,
    timed_out: bool,
}

impl VioOutcome {
    fn of(vio: &DataVio) -> Self {
        Self {
            dedupe_hit: vio.is_duplicate,
            verify_failed: vio.verify_failed,
            timed_out: vio.advice_timed_out,
        }
    }
}

// ---------------------------------------------------------------------------
// The device
// ---------------------------------------------------------------------------

/// A virtual data optimizer device.
///
/// Construct with [`Vdo::format`] then [`Vdo::load`]; submit I/O with
/// [`Vdo::submit`] or the blocking helpers; administer with
/// [`Vdo::suspend`], [`Vdo::resume`], and friends; stop with
/// [`Vdo::close`].
pub struct Vdo<D: Disk> {
    router: Arc<Router<D>>,
    workers: Vec<Worker>,
}

impl<D: Disk> Vdo<D> {
    /// Computes the on-disk layout for a device of this configuration.
    fn compute_geometry(config: &DeviceConfig) -> Result<(DeviceGeometry, DepotState)> {
        let physical = config.physical_blocks;
        let journal_blocks = ((physical / 64).max(8)).next_power_of_two().min(1024);
        let journal_origin = 1;
        let summary_origin = journal_origin + journal_blocks;
        let summary_blocks = 4;
        let (logical_zones, _, _) = config.threads.effective_zones();
        let root_count = logical_zones.max(2).min(16);
        let root_origin = summary_origin + summary_blocks;
        let depot_origin = root_origin + u64::from(root_count);
        if physical <= depot_origin + config.slab_blocks {
            return_errno_with_msg!(BadConfiguration, "device too small for its metadata");
        }
        let slab_count = (physical - depot_origin) / config.slab_blocks;
        let geometry = DeviceGeometry {
            physical_blocks: physical,
            logical_blocks: config.logical_blocks,
            journal_origin,
            journal_blocks,
            summary_origin,
            summary_blocks,
            root_origin,
            root_count,
        };
        let depot_state = DepotState {
            origin: depot_origin,
            slab_blocks: config.slab_blocks,
            slab_count,
        };
        Ok((geometry, depot_state))
    }

    fn derive_nonce(config: &DeviceConfig) -> u64 {
        let mut seed = Vec::new();
        seed.extend_from_slice(config.parent_device.as_bytes());
        seed.extend_from_slice(&config.physical_blocks.to_le_bytes());
        seed.extend_from_slice(&config.logical_blocks.to_le_bytes());
        let name = ChunkName::of(&seed);
        u64::from_le_bytes(name.0[0..8].try_into().unwrap())
    }

    /// Formats `storage` as a new device.
    pub fn format(storage: &D, config: &DeviceConfig) -> Result<()> {
        config.threads.validate()?;
        if storage.nblocks() < config.physical_blocks {
            return_errno_with_msg!(BadConfiguration, "backing device is too small");
        }
        let (geometry, depot_state) = Self::compute_geometry(config)?;
        let nonce = Self::derive_nonce(config);
        let height = compute_forest_height(config.logical_blocks, geometry.root_count);
        let bmap_state = BlockMapState {
            root_origin: geometry.root_origin,
            root_count: geometry.root_count,
            height,
        };
        if bmap_state.addressable_blocks() < config.logical_blocks {
            return_errno_with_msg!(BadConfiguration, "logical size exceeds the forest");
        }

        let journal_region = storage.subset(
            geometry.journal_origin..geometry.journal_origin + geometry.journal_blocks,
        )?;
        RecoveryJournal::format(&journal_region)?;

        let summary_region = storage
            .subset(geometry.summary_origin..geometry.summary_origin + geometry.summary_blocks)?;
        let slab_config = depot_state.slab_config()?;
        SlabSummary::format(summary_region, depot_state.slab_count, slab_config.data_blocks)?;

        // Thin provisioning permits over-commit, but a forest that could
        // never fit is worth flagging at format time.
        let forest_estimate = compute_forest_size(config.logical_blocks, geometry.root_count);
        let data_blocks = depot_state.slab_count * slab_config.data_blocks;
        if forest_estimate > data_blocks {
            warn!(
                "vdo: a fully-mapped device would need {} tree pages but only {} data blocks exist",
                forest_estimate, data_blocks
            );
        }

        format_roots(storage, nonce, &bmap_state)?;

        let depot_region = storage.subset(
            depot_state.origin
                ..depot_state.origin + depot_state.slab_count * depot_state.slab_blocks,
        )?;
        SlabDepot::format(&depot_region, &depot_state, nonce, 1)?;

        let payload = SuperBlockPayload {
            nonce,
            geometry,
            clean_shutdown: true,
            recovery_count: 0,
            journal_state: RecoveryJournalState {
                journal_start: 1,
                logical_blocks_used: 0,
                block_map_data_blocks: 0,
            }
            .encode(),
            depot_state,
            block_map_state: bmap_state,
        };
        SuperBlock::save(storage, &payload)
    }

    /// Replays the recovery journal and scrubs every slab, bringing the
    /// on-disk state to a consistent point. Returns whether replay found
    /// corruption (the device must come up read-only).
    fn recover(storage: &D, payload: &mut SuperBlockPayload) -> Result<bool> {
        info!("vdo: unclean shutdown detected, recovering");
        let geometry = payload.geometry;
        let depot_state = payload.depot_state;

        // After a crash no summary bit can be trusted; scrub every slab.
        let depot_region = storage.subset(
            depot_state.origin
                ..depot_state.origin + depot_state.slab_count * depot_state.slab_blocks,
        )?;
        let mut allocators =
            SlabDepot::open(&depot_region, &depot_state, payload.nonce, 1, false, false)?;
        let allocator = &mut allocators[0];
        while allocator.scrub_step()? {}

        let journal_region = storage.subset(
            geometry.journal_origin..geometry.journal_origin + geometry.journal_blocks,
        )?;
        let scanned = ScannedJournal::load(&journal_region, payload.nonce)?;
        let mut corrupt = false;
        if let Some(found) = scanned.find_head_and_tail() {
            let head = found.block_map_head.min(found.slab_journal_head);
            let entries = match scanned.entries_in_order(head, found.tail) {
                Ok(entries) => entries,
                Err(error) => {
                    error!("vdo: journal replay failed: {:?}", error);
                    return Ok(true);
                }
            };

            let mut bmap = BlockMapZone::new(
                storage.clone(),
                payload.nonce,
                payload.block_map_state,
                0,
                1,
                64,
            );
            for (point, entry) in entries {
                if let Err(error) = validate_entry(
                    &entry,
                    geometry.physical_blocks,
                    ENTRIES_PER_PAGE,
                ) {
                    error!("vdo: invalid journal entry at {:?}: {:?}", point, error);
                    corrupt = true;
                    break;
                }
                if point.sequence_number >= found.block_map_head {
                    bmap.apply_replay_entry(&entry)?;
                }
                if point.sequence_number >= found.slab_journal_head
                    && entry.mapping.state.is_counted()
                {
                    allocator.replay_reference_delta(
                        entry.mapping.pbn,
                        entry.operation,
                        point,
                    )?;
                }
            }
            bmap.flush()?;

            payload.set_journal_state(&RecoveryJournalState {
                journal_start: found.tail + 1,
                logical_blocks_used: found.logical_blocks_used,
                block_map_data_blocks: found.block_map_data_blocks,
            });
        }

        allocator.save_all()?;
        let summary_region = storage
            .subset(geometry.summary_origin..geometry.summary_origin + geometry.summary_blocks)?;
        let slab_config = depot_state.slab_config()?;
        let mut summary =
            SlabSummary::load(summary_region, depot_state.slab_count, slab_config.data_blocks)?;
        for update in allocator.take_summary_updates() {
            summary.update(
                update.slab_index,
                update.tail_block_offset,
                update.is_clean,
                update.free_blocks,
            )?;
        }

        payload.recovery_count = payload.recovery_count.wrapping_add(1);
        SuperBlock::save(storage, payload)?;
        info!(
            "vdo: recovery complete (recovery count {})",
            payload.recovery_count
        );
        Ok(corrupt)
    }

    /// Loads a device, recovering first when the last shutdown was
    /// unclean.
    pub fn load(storage: D, config: DeviceConfig) -> Result<Vdo<D>> {
        config.threads.validate()?;
        let mut payload = SuperBlock::load(&storage)?;
        let mut start_read_only = false;
        if !payload.clean_shutdown {
            start_read_only = Self::recover(&storage, &mut payload)?;
        }
        payload.clean_shutdown = false;
        SuperBlock::save(&storage, &payload)?;

        let geometry = payload.geometry;
        let depot_state = payload.depot_state;
        let bmap_state = payload.block_map_state;
        let nonce = payload.nonce;
        let journal_state = payload.journal_state()?;
        let (logical_count, physical_count, hash_count) = config.threads.effective_zones();
        let single = config.threads.is_single_threaded();

        // One wakeup per worker thread; in the small-device configuration
        // every queue shares the same one.
        let shared_wakeup = WorkerWakeup::new();
        let new_wakeup = || {
            if single {
                shared_wakeup.clone()
            } else {
                WorkerWakeup::new()
            }
        };

        let admin_wakeup = new_wakeup();
        let journal_wakeup = new_wakeup();
        let packer_wakeup = new_wakeup();
        let logical_wakeups: Vec<_> = (0..logical_count).map(|_| new_wakeup()).collect();
        let physical_wakeups: Vec<_> = (0..physical_count).map(|_| new_wakeup()).collect();
        let hash_wakeups: Vec<_> = (0..hash_count).map(|_| new_wakeup()).collect();
        let bio_wakeups: Vec<_> = (0..config.threads.bio_threads)
            .map(|_| new_wakeup())
            .collect();
        let cpu_wakeups: Vec<_> = (0..config.threads.cpu_threads)
            .map(|_| new_wakeup())
            .collect();
        let ack_wakeup = (config.threads.bio_ack_threads > 0).then(new_wakeup);

        let admin_queue = WorkQueue::new("admin", admin_wakeup.clone());
        let journal_queue = WorkQueue::new("journal", journal_wakeup.clone());
        let packer_queue = WorkQueue::new("packer", packer_wakeup.clone());
        let logical_queues: Vec<_> = logical_wakeups
            .iter()
            .map(|w| WorkQueue::new("logical", w.clone()))
            .collect();
        let physical_queues: Vec<_> = physical_wakeups
            .iter()
            .map(|w| WorkQueue::new("physical", w.clone()))
            .collect();
        let hash_queues: Vec<_> = hash_wakeups
            .iter()
            .map(|w| WorkQueue::new("hash", w.clone()))
            .collect();
        let bio_queues: Vec<_> = bio_wakeups
            .iter()
            .map(|w| WorkQueue::new("bio", w.clone()))
            .collect();
        let cpu_queues: Vec<_> = cpu_wakeups
            .iter()
            .map(|w| WorkQueue::new("cpu", w.clone()))
            .collect();
        let ack_queue = ack_wakeup
            .as_ref()
            .map(|w| WorkQueue::new("bio-ack", w.clone()));

        let router = Arc::new(Router {
            logical: logical_queues.clone(),
            physical: physical_queues.clone(),
            hash: hash_queues.clone(),
            journal: journal_queue.clone(),
            packer: packer_queue.clone(),
            admin: admin_queue.clone(),
            bio: bio_queues.clone(),
            cpu: cpu_queues.clone(),
            ack: ack_queue.clone(),
            notifier: ReadOnlyNotifier::new(),
            vio_pool: DataVioPool::new(DATA_VIO_POOL_SIZE),
            timer: DedupeTimer::spawn(),
            config: config.clone(),
            geometry,
            depot_state,
            bmap_state,
            nonce,
            suspended: AtomicBool::new(false),
            logical_limit: AtomicU64::new(geometry.logical_blocks),
            index_delay: Mutex::new(None),
        });

        // Build zone states.
        let depot_region = storage.subset(
            depot_state.origin
                ..depot_state.origin + depot_state.slab_count * depot_state.slab_blocks,
        )?;
        let allocators = SlabDepot::open(
            &depot_region,
            &depot_state,
            nonce,
            physical_count,
            // Recovery already scrubbed everything; a clean load trusts
            // the suspend-time save.
            true,
            false,
        )?;

        let summary_region = storage
            .subset(geometry.summary_origin..geometry.summary_origin + geometry.summary_blocks)?;
        let slab_config = depot_state.slab_config()?;
        let summary = SlabSummary::load(
            summary_region,
            depot_state.slab_count,
            slab_config.data_blocks,
        )?;

        let journal_region = storage.subset(
            geometry.journal_origin..geometry.journal_origin + geometry.journal_blocks,
        )?;
        let journal = RecoveryJournal::open(
            journal_region,
            nonce,
            journal_state,
            payload.recovery_count,
        );

        let cache_per_zone = (config.cache_pages / u64::from(logical_count)).max(4) as usize;

        let mut cells: Vec<(Arc<WorkerWakeup>, Box<dyn Serviceable>)> = Vec::new();
        cells.push((
            admin_wakeup,
            Box::new(ZoneCell::new(
                admin_queue.clone(),
                AdminZone {
                    router: router.clone(),
                    storage: storage.clone(),
                    summary,
                    machine: AdminStateMachine::new(),
                    payload,
                    suspend: None,
                    gather: None,
                    read_only_pending: 0,
                    is_read_only: false,
                    read_only_listeners: Vec::new(),
                },
            )),
        ));
        cells.push((
            journal_wakeup,
            Box::new(ZoneCell::new(
                journal_queue.clone(),
                JournalZone {
                    router: router.clone(),
                    journal,
                    next_token: 0,
                    bmap_floors: StdHashMap::new(),
                    slab_floors: StdHashMap::new(),
                    slab_floor_refs: StdHashMap::new(),
                    zone_dirty_eras: vec![None; logical_count as usize],
                    commit_scheduled: false,
                    is_read_only: false,
                    read_only_listeners: Vec::new(),
                },
            )),
        ));
        cells.push((
            packer_wakeup,
            Box::new(ZoneCell::new(
                packer_queue.clone(),
                PackerZone {
                    router: router.clone(),
                    packer: Packer::new(),
                    draining: false,
                    is_read_only: false,
                    read_only_listeners: Vec::new(),
                },
            )),
        ));
        for (index, queue) in logical_queues.iter().enumerate() {
            cells.push((
                logical_wakeups[index].clone(),
                Box::new(ZoneCell::new(
                    queue.clone(),
                    LogicalZone {
                        zone_index: index as u32,
                        router: router.clone(),
                        bmap: BlockMapZone::new(
                            storage.clone(),
                            nonce,
                            bmap_state,
                            index as u32,
                            logical_count,
                            cache_per_zone,
                        ),
                        lbn_locks: HashMap::new(),
                        pending_tree_installs: HashMap::new(),
                        dedupe_enabled: config.deduplication,
                        compression_enabled: config.compression,
                        is_read_only: false,
                        read_only_listeners: Vec::new(),
                        stats: LogicalStats::default(),
                    },
                )),
            ));
        }
        for (index, (queue, allocator)) in
            physical_queues.iter().zip(allocators.into_iter()).enumerate()
        {
            cells.push((
                physical_wakeups[index].clone(),
                Box::new(ZoneCell::new(
                    queue.clone(),
                    PhysicalZone {
                        zone_index: index as u32,
                        router: router.clone(),
                        allocator,
                        lock_pool: PbnLockPool::new(DATA_VIO_POOL_SIZE + PBN_LOCK_POOL_SLACK),
                        locks: HashMap::new(),
                        slab_commit_scheduled: false,
                        scrub_waiters: WaitQueue::new(),
                        pool_waiters: WaitQueue::new(),
                        is_read_only: false,
                        read_only_listeners: Vec::new(),
                    },
                )),
            ));
        }
        for (index, queue) in hash_queues.iter().enumerate() {
            cells.push((
                hash_wakeups[index].clone(),
                Box::new(ZoneCell::new(
                    queue.clone(),
                    HashZone {
                        router: router.clone(),
                        index: IndexZone::new(index as u32, hash_count, IndexConfig::default()),
                        is_read_only: false,
                        read_only_listeners: Vec::new(),
                    },
                )),
            ));
        }
        for (index, queue) in bio_queues.iter().enumerate() {
            cells.push((
                bio_wakeups[index].clone(),
                Box::new(ZoneCell::new(
                    queue.clone(),
                    BioZone {
                        router: router.clone(),
                        storage: storage.clone(),
                    },
                )),
            ));
        }
        for (index, queue) in cpu_queues.iter().enumerate() {
            cells.push((
                cpu_wakeups[index].clone(),
                Box::new(ZoneCell::new(
                    queue.clone(),
                    CpuZone {
                        router: router.clone(),
                    },
                )),
            ));
        }
        if let (Some(queue), Some(wakeup)) = (ack_queue.clone(), ack_wakeup) {
            cells.push((
                wakeup,
                Box::new(ZoneCell::new(
                    queue,
                    AckZone {
                        router: router.clone(),
                    },
                )),
            ));
        }

        // Spawn workers: one for everything, or one per wakeup.
        let mut workers = Vec::new();
        if single {
            let zones: Vec<Box<dyn Serviceable>> =
                cells.into_iter().map(|(_wakeup, cell)| cell).collect();
            workers.push(Worker::spawn("vdo", shared_wakeup, zones));
        } else {
            for (index, (wakeup, cell)) in cells.into_iter().enumerate() {
                workers.push(Worker::spawn(&format!("vdo{}", index), wakeup, vec![cell]));
            }
        }

        if start_read_only {
            router.enter_read_only(Errno::CorruptJournal);
        }

        Ok(Vdo { router, workers })
    }

    // -- data plane ---------------------------------------------------------

    /// Submits one I/O descriptor. The completion runs on a zone thread
    /// (or the bio-ack thread when configured).
    pub fn submit(&self, descriptor: IoDescriptor) {
        submit_descriptor(&self.router, descriptor);
    }

    /// Blocking write of one block.
    pub fn write_block(&self, lbn: u64, data: &[u8]) -> Result<()> {
        let mut buf = Buf::alloc(1)?;
        buf.as_mut_slice().copy_from_slice(data);
        let (tx, rx) = mpsc::channel();
        self.submit(IoDescriptor {
            op: VioOp::Write,
            lbn,
            data: Some(buf),
            flags: IoFlags::empty(),
            completion: Box::new(move |result| {
                let _ = tx.send(result.map(|_data| ()));
            }),
        });
        rx.recv()
            .map_err(|_| Error::with_msg(BadState, "device stopped during write"))?
    }

    /// Blocking read of one block.
    pub fn read_block(&self, lbn: u64) -> Result<Buf> {
        let (tx, rx) = mpsc::channel();
        self.submit(IoDescriptor {
            op: VioOp::Read,
            lbn,
            data: None,
            flags: IoFlags::empty(),
            completion: Box::new(move |result| {
                let _ = tx.send(result);
            }),
        });
        let data = rx
            .recv()
            .map_err(|_| Error::with_msg(BadState, "device stopped during read"))??;
        data.ok_or(Error::with_msg(BadState, "read completed without data"))
    }

    /// Blocking discard of one block.
    pub fn discard_block(&self, lbn: u64) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.submit(IoDescriptor {
            op: VioOp::Discard,
            lbn,
            data: None,
            flags: IoFlags::empty(),
            completion: Box::new(move |result| {
                let _ = tx.send(result.map(|_data| ()));
            }),
        });
        rx.recv()
            .map_err(|_| Error::with_msg(BadState, "device stopped during discard"))?
    }

    /// Blocking flush barrier.
    pub fn flush(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.submit(IoDescriptor {
            op: VioOp::Flush,
            lbn: 0,
            data: None,
            flags: IoFlags::FLUSH,
            completion: Box::new(move |result| {
                let _ = tx.send(result.map(|_data| ()));
            }),
        });
        rx.recv()
            .map_err(|_| Error::with_msg(BadState, "device stopped during flush"))?
    }

    // -- admin plane --------------------------------------------------------

    /// Suspends the device: drains all work and writes the super block.
    /// A device that entered read-only mode still suspends successfully.
    pub fn suspend(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.router.admin.send(Priority::High, move |zone| {
            if zone.suspend.is_some() {
                let _ = tx.send(Err(Error::with_msg(
                    ComponentBusy,
                    "a suspend is already in progress",
                )));
                return;
            }
            if let Err(error) = zone.machine.start_suspending() {
                let _ = tx.send(Err(error));
                return;
            }
            zone.suspend = Some(SuspendOp {
                phase: SuspendPhase::Start,
                pending: 0,
                journal_state: None,
                done: tx,
            });
            advance_suspend(zone);
        });
        rx.recv()
            .map_err(|_| Error::with_msg(BadState, "device stopped during suspend"))?
    }

    /// Resumes a suspended device.
    pub fn resume(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let router = self.router.clone();
        self.router.admin.send(Priority::High, move |zone| {
            if let Err(error) = zone.machine.start_resuming() {
                let _ = tx.send(Err(error));
                return;
            }
            if router.notifier.allow_notifications() {
                let propagate_router = router.clone();
                router.admin.send(Priority::High, move |zone| {
                    propagate_read_only(zone, propagate_router);
                });
            }
            zone.payload.clean_shutdown = false;
            if let Err(error) = SuperBlock::save(&zone.storage, &zone.payload) {
                router.enter_read_only(error.errno());
            }
            zone.machine.finish_resuming();
            router.suspended.store(false, Ordering::Release);
            router.packer.send(Priority::High, |pz| pz.draining = false);
            for physical in &router.physical {
                physical.send(Priority::Low, run_scrub_step);
            }
            let _ = tx.send(Ok(()));
        });
        rx.recv()
            .map_err(|_| Error::with_msg(BadState, "device stopped during resume"))?
    }

    /// Grows the logical space (within the formatted forest's reach).
    pub fn grow_logical(&self, new_logical_blocks: u64) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let router = self.router.clone();
        self.router.admin.send(Priority::High, move |zone| {
            let result = (|| {
                if new_logical_blocks < zone.payload.geometry.logical_blocks {
                    return_errno_with_msg!(InvalidArgs, "logical space cannot shrink");
                }
                if zone.payload.block_map_state.addressable_blocks() < new_logical_blocks {
                    return_errno_with_msg!(
                        BadConfiguration,
                        "logical size exceeds the formatted forest"
                    );
                }
                zone.payload.geometry.logical_blocks = new_logical_blocks;
                SuperBlock::save(&zone.storage, &zone.payload)?;
                router
                    .logical_limit
                    .store(new_logical_blocks, Ordering::Release);
                Ok(())
            })();
            let _ = tx.send(result);
        });
        rx.recv()
            .map_err(|_| Error::with_msg(BadState, "device stopped during grow"))?
    }

    /// Grows the physical space by formatting the slabs that now fit and
    /// handing them to their zones. The backing device must already
    /// cover the new size.
    pub fn grow_physical(&self, new_physical_blocks: u64) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let router = self.router.clone();
        self.router.admin.send(Priority::High, move |zone| {
            let result = (|| {
                let depot = zone.payload.depot_state;
                if new_physical_blocks < zone.payload.geometry.physical_blocks {
                    return_errno_with_msg!(InvalidArgs, "physical space cannot shrink");
                }
                if zone.storage.nblocks() < new_physical_blocks {
                    return_errno_with_msg!(BadConfiguration, "backing device is too small");
                }
                let new_count = (new_physical_blocks - depot.origin) / depot.slab_blocks;
                if new_count <= depot.slab_count {
                    return_errno_with_msg!(InvalidArgs, "no room for additional slabs");
                }
                let config = depot.slab_config()?;

                // Record the forest's allocated pages; growth must never
                // hand out a block the block map already owns.
                let mut tree_pages = Vec::new();
                let mut bmap = BlockMapZone::new(
                    zone.storage.clone(),
                    zone.payload.nonce,
                    zone.payload.block_map_state,
                    0,
                    1,
                    16,
                );
                bmap.traverse_forest(&mut |pbn| {
                    tree_pages.push(pbn);
                    Ok(())
                })?;

                for index in depot.slab_count..new_count {
                    let origin = depot.slab_origin(index);
                    debug_assert!(tree_pages.iter().all(|&pbn| pbn < origin));
                    let region = zone
                        .storage
                        .subset(origin..origin + depot.slab_blocks)?;
                    let slab =
                        Slab::format(&region, index, origin, config, zone.payload.nonce)?;
                    let target = (index % router.physical.len() as u64) as usize;
                    router.physical[target].send(Priority::High, move |pz| {
                        pz.allocator.adopt_slab(slab);
                        flush_summary_updates(pz);
                    });
                }

                zone.payload.depot_state.slab_count = new_count;
                zone.payload.geometry.physical_blocks = new_physical_blocks;
                SuperBlock::save(&zone.storage, &zone.payload)?;
                Ok(())
            })();
            let _ = tx.send(result);
        });
        rx.recv()
            .map_err(|_| Error::with_msg(BadState, "device stopped during grow"))?
    }

    /// Toggles compression.
    pub fn set_compression(&self, enabled: bool) {
        for logical in &self.router.logical {
            logical.send(Priority::High, move |zone| {
                zone.compression_enabled = enabled;
            });
        }
    }

    /// Toggles deduplication.
    pub fn set_deduplication(&self, enabled: bool) {
        for logical in &self.router.logical {
            logical.send(Priority::High, move |zone| {
                zone.dedupe_enabled = enabled;
            });
        }
    }

    /// Registers a listener run (exactly once) when the device enters
    /// read-only mode.
    pub fn register_read_only_listener(&self, listener: impl FnMut() + Send + 'static) {
        self.router.admin.send(Priority::High, move |zone| {
            zone.read_only_listeners.push(Box::new(listener));
        });
    }

    /// Returns whether the device is in read-only mode.
    pub fn is_read_only(&self) -> bool {
        self.router.notifier.is_read_only()
    }

    /// Gathers a statistics snapshot from every zone.
    pub fn stats(&self) -> Result<DeviceStats> {
        let (tx, rx) = mpsc::channel();
        let router = self.router.clone();
        self.router.admin.send(Priority::High, move |zone| {
            if zone.gather.is_some() {
                // Dropping the sender fails the caller's recv.
                return;
            }
            let remaining =
                1 + router.logical.len() + router.physical.len() + router.hash.len();
            zone.gather = Some(GatherOp {
                remaining,
                stats: DeviceStats {
                    read_only: router.notifier.is_read_only(),
                    ..DeviceStats::default()
                },
                done: tx,
            });

            let journal_router = router.clone();
            router.journal.send(Priority::Normal, move |jz| {
                let entries = jz.journal.committed_entries();
                let blocks = jz.journal.block_writes();
                let used = jz.journal.logical_blocks_used();
                journal_router.admin.send(Priority::High, move |zone| {
                    merge_gather(zone, move |stats| {
                        stats.journal_entries_committed = entries;
                        stats.journal_blocks_written = blocks;
                        stats.logical_blocks_used = used;
                    });
                });
            });
            for logical in &router.logical {
                let admin_router = router.clone();
                logical.send(Priority::Normal, move |lz| {
                    let local = lz.stats;
                    let (loads, writebacks) = lz.bmap.cache_stats();
                    admin_router.admin.send(Priority::High, move |zone| {
                        merge_gather(zone, move |stats| {
                            stats.reads += local.reads;
                            stats.writes += local.writes;
                            stats.discards += local.discards;
                            stats.flushes += local.flushes;
                            stats.zero_block_writes += local.zero_block_writes;
                            stats.dedupe_hits += local.dedupe_hits;
                            stats.dedupe_verify_failures += local.dedupe_verify_failures;
                            stats.dedupe_timeouts += local.dedupe_timeouts;
                            stats.block_map_cache_loads += loads;
                            stats.block_map_cache_writebacks += writebacks;
                        });
                    });
                });
            }
            for physical in &router.physical {
                let admin_router = router.clone();
                physical.send(Priority::Normal, move |pz| {
                    let free = pz.allocator.free_block_count();
                    let allocations = pz.allocator.allocations();
                    let scrubbed = pz.allocator.scrubber_mut().slabs_scrubbed();
                    admin_router.admin.send(Priority::High, move |zone| {
                        merge_gather(zone, move |stats| {
                            stats.free_physical_blocks += free;
                            stats.allocations += allocations;
                            stats.slabs_scrubbed += scrubbed;
                        });
                    });
                });
            }
            for hash in &router.hash {
                let admin_router = router.clone();
                hash.send(Priority::Normal, move |hz| {
                    let local = hz.index.stats();
                    admin_router.admin.send(Priority::High, move |zone| {
                        merge_gather(zone, move |stats| {
                            stats.index.posts_found += local.posts_found;
                            stats.index.posts_not_found += local.posts_not_found;
                            stats.index.queries_found += local.queries_found;
                            stats.index.queries_not_found += local.queries_not_found;
                            stats.index.updates += local.updates;
                            stats.index.deletes += local.deletes;
                            stats.index.chapters_closed += local.chapters_closed;
                        });
                    });
                });
            }
        });
        rx.recv()
            .map_err(|_| Error::with_msg(ComponentBusy, "statistics are unavailable"))
    }

    /// Renders a human-readable snapshot of queues and admin state.
    pub fn dump(&self) -> Result<String> {
        let (tx, rx) = mpsc::channel();
        let router = self.router.clone();
        self.router.admin.send(Priority::High, move |zone| {
            let mut out = String::new();
            out.push_str(&format!(
                "admin state: {:?}, read-only: {}\n",
                zone.machine.state(),
                router.notifier.is_read_only()
            ));
            out.push_str(&format!("data-vios in flight: {}\n", router.vio_pool.in_flight()));
            let queues: Vec<(&str, usize)> = [("journal", router.journal.len()),
                ("packer", router.packer.len()),
                ("admin", router.admin.len())]
            .into_iter()
            .chain(router.logical.iter().map(|q| ("logical", q.len())))
            .chain(router.physical.iter().map(|q| ("physical", q.len())))
            .chain(router.hash.iter().map(|q| ("hash", q.len())))
            .chain(router.bio.iter().map(|q| ("bio", q.len())))
            .collect();
            for (name, len) in queues {
                out.push_str(&format!("queue {}: {} items\n", name, len));
            }
            let _ = tx.send(out);
        });
        rx.recv()
            .map_err(|_| Error::with_msg(BadState, "device stopped during dump"))
    }

    /// Submits a request directly against the dedupe index: `post`,
    /// `update`, `delete`, or `query`. The outcome is delivered
    /// asynchronously to `callback` on the owning hash zone.
    pub fn index_request(
        &self,
        request: IndexRequest,
        callback: impl FnOnce(crate::layers::dedupe::IndexOutcome) + Send + 'static,
    ) {
        let router = self.router.clone();
        self.router
            .hash_zone_of(&request.name)
            .send(Priority::Normal, move |hz| {
                let outcome = hz.index.service(&request);
                if let Some(closed) = outcome.closed_chapter {
                    broadcast_chapter_close(hz, &router, closed);
                }
                callback(outcome);
            });
    }

    /// Test hook: delay every index answer, forcing advice timeouts.
    pub fn set_index_delay_for_testing(&self, delay: Option<Duration>) {
        *self.router.index_delay.lock() = delay;
    }

    /// Suspends the device and stops every worker thread. Closing a
    /// device that is already suspended is fine.
    pub fn close(mut self) -> Result<()> {
        let result = match self.suspend() {
            Err(error) if error.errno() == InvalidAdminState => Ok(()),
            other => other,
        };
        self.stop_workers();
        result
    }

    fn stop_workers(&mut self) {
        // Safe to call twice; `close` and `Drop` share it.
        self.router.timer.stop();
        for worker in core::mem::take(&mut self.workers) {
            worker.stop_and_join();
        }
    }
}

impl<D: Disk> Drop for Vdo<D> {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

// ---------------------------------------------------------------------------
// Read-only propagation
// ---------------------------------------------------------------------------

fn fire_listeners(listeners: &mut Vec<Box<dyn FnMut() + Send>>) {
    for listener in listeners.iter_mut() {
        listener();
    }
}

fn propagate_read_only<D: Disk>(zone: &mut AdminZone<D>, router: Arc<Router<D>>) {
    if !zone.is_read_only {
        zone.is_read_only = true;
        fire_listeners(&mut zone.read_only_listeners);
    }
    zone.read_only_pending =
        router.logical.len() + router.physical.len() + router.hash.len() + 2;

    let ack = |router: &Arc<Router<D>>| {
        let router = router.clone();
        move || {
            router.clone().admin.send(Priority::High, |zone: &mut AdminZone<D>| {
                zone.read_only_pending -= 1;
                if zone.read_only_pending == 0 {
                    zone.router.notifier.finish_notifying();
                }
            });
        }
    };

    for logical in &router.logical {
        let done = ack(&router);
        logical.send(Priority::High, move |lz| {
            lz.is_read_only = true;
            fire_listeners(&mut lz.read_only_listeners);
            done();
        });
    }
    for physical in &router.physical {
        let done = ack(&router);
        physical.send(Priority::High, move |pz| {
            pz.is_read_only = true;
            fire_listeners(&mut pz.read_only_listeners);
            done();
        });
    }
    for hash in &router.hash {
        let done = ack(&router);
        hash.send(Priority::High, move |hz| {
            hz.is_read_only = true;
            fire_listeners(&mut hz.read_only_listeners);
            done();
        });
    }
    let done = ack(&router);
    router.journal.send(Priority::High, move |jz| {
        jz.is_read_only = true;
        fire_listeners(&mut jz.read_only_listeners);
        done();
    });
    let done = ack(&router);
    router.packer.send(Priority::High, move |pz| {
        pz.is_read_only = true;
        fire_listeners(&mut pz.read_only_listeners);
        done();
    });
}

// ---------------------------------------------------------------------------
// Submission and the data-vio pipeline
// ---------------------------------------------------------------------------

fn submit_descriptor<D: Disk>(router: &Arc<Router<D>>, descriptor: IoDescriptor) {
    if router.suspended.load(Ordering::Acquire) {
        (descriptor.completion)(Err(Error::with_msg(
            InvalidAdminState,
            "device is suspended",
        )));
        return;
    }
    if descriptor.op != VioOp::Flush
        && descriptor.lbn >= router.logical_limit.load(Ordering::Acquire)
    {
        (descriptor.completion)(Err(Error::with_msg(
            InvalidArgs,
            "lbn beyond the logical space",
        )));
        return;
    }
    if descriptor.op == VioOp::Write
        && descriptor
            .data
            .as_ref()
            .map(|data| data.nblocks() != 1)
            .unwrap_or(true)
    {
        (descriptor.completion)(Err(Error::with_msg(
            InvalidArgs,
            "writes carry exactly one block",
        )));
        return;
    }

    let Some(descriptor) = router.vio_pool.admit(descriptor) else {
        return;
    };
    dispatch(router, descriptor);
}

fn dispatch<D: Disk>(router: &Arc<Router<D>>, descriptor: IoDescriptor) {
    let vio = DataVio::new(descriptor);
    if vio.op == VioOp::Flush {
        start_flush(router, vio);
        return;
    }
    let router2 = router.clone();
    router
        .logical_zone_of(vio.lbn)
        .send(Priority::Normal, move |zone| {
            logical_start(zone, &router2, vio)
        });
}

fn start_flush<D: Disk>(router: &Arc<Router<D>>, mut vio: DataVio) {
    let router2 = router.clone();
    router.packer.send(Priority::High, move |zone| {
        if let Some(bin) = zone.packer.flush() {
            seal_bin(&router2, bin);
        }
        let router3 = router2.clone();
        router2.journal.send(Priority::High, move |jz| {
            let result = jz.journal.drain();
            let completion = vio.take_completion();
            if let Err(ref error) = result {
                router3.enter_read_only(error.errno());
            }
            let flushes_router = router3.clone();
            let lbn = vio.lbn;
            flushes_router
                .logical_zone_of(lbn)
                .send(Priority::Normal, |lz| lz.stats.flushes += 1);
            complete_without_locks(&router3, completion, result.map(|()| None));
        });
    });
}

/// Completes a vio that never took the lbn lock (flush, early failures).
fn complete_without_locks<D: Disk>(
    router: &Arc<Router<D>>,
    completion: IoCompletion,
    result: Result<Option<Buf>>,
) {
    run_completion(router, completion, result);
    release_pool_permit(router);
}

fn run_completion<D: Disk>(
    router: &Arc<Router<D>>,
    completion: IoCompletion,
    result: Result<Option<Buf>>,
) {
    match &router.ack {
        Some(ack) => ack.send(Priority::Normal, move |_zone| completion(result)),
        None => completion(result),
    }
}

fn release_pool_permit<D: Disk>(router: &Arc<Router<D>>) {
    let (next, waiters) = router.vio_pool.release();
    if let Some(descriptor) = next {
        dispatch(router, descriptor);
    }
    for waiter in waiters {
        waiter();
    }
}

fn logical_start<D: Disk>(zone: &mut LogicalZone<D>, router: &Arc<Router<D>>, mut vio: DataVio) {
    // The lbn lock is taken before anything can fail, so every exit path
    // funnels through `finish_vio`, which releases it.
    if let Some(waiters) = zone.lbn_locks.get_mut(&vio.lbn) {
        let router2 = router.clone();
        waiters.enqueue(Waiter::new(move |zone: &mut LogicalZone<D>| {
            logical_start(zone, &router2, vio)
        }));
        return;
    }
    zone.lbn_locks.insert(vio.lbn, WaitQueue::new());

    match vio.op {
        VioOp::Read => zone.stats.reads += 1,
        VioOp::Write => zone.stats.writes += 1,
        VioOp::Discard => zone.stats.discards += 1,
        VioOp::Flush => unreachable!("flushes do not reach logical zones"),
    }

    if zone.is_read_only && vio.op != VioOp::Read {
        finish_vio(router, vio, Err(Error::new(ReadOnly)));
        return;
    }

    vio.old_mapping = match zone.bmap.get_mapping(vio.lbn) {
        Ok(mapping) => mapping,
        Err(error) => {
            router.enter_read_only(error.errno());
            finish_vio(router, vio, Err(error));
            return;
        }
    };

    match vio.op {
        VioOp::Read => start_read(zone, router, vio),
        VioOp::Write => {
            vio.try_compress = zone.compression_enabled;
            let data_is_zero = vio
                .data
                .as_ref()
                .map(|data| data.as_slice().iter().all(|&byte| byte == 0))
                .unwrap_or(false);
            if data_is_zero {
                zone.stats.zero_block_writes += 1;
                vio.new_mapping = BlockMapEntry::ZERO;
                route_ensure_slot(router, vio);
            } else if zone.dedupe_enabled {
                let router2 = router.clone();
                router
                    .cpu_zone_of(vio.lbn)
                    .send(Priority::Normal, move |cz| cpu_hash(cz, &router2, vio));
            } else {
                compress_or_allocate(router, vio);
            }
        }
        VioOp::Discard => {
            vio.new_mapping = BlockMapEntry::UNMAPPED;
            if vio.old_mapping.is_mapped() {
                route_ensure_slot(router, vio);
            } else {
                // Nothing mapped; nothing to journal.
                finish_vio(router, vio, Ok(None));
            }
        }
        VioOp::Flush => unreachable!(),
    }
}

fn start_read<D: Disk>(_zone: &mut LogicalZone<D>, router: &Arc<Router<D>>, vio: DataVio) {
    match vio.old_mapping.state {
        MappingState::Unmapped | MappingState::ZeroBlock => {
            let zeros = Buf::alloc(1).map(Some);
            finish_vio(router, vio, zeros);
        }
        MappingState::Uncompressed => {
            let pbn = vio.old_mapping.pbn;
            let router2 = router.clone();
            router.bio_zone_of(pbn).send(Priority::Normal, move |bz| {
                let mut data = match Buf::alloc(1) {
                    Ok(buf) => buf,
                    Err(error) => return finish_vio(&router2, vio, Err(error)),
                };
                match bz.storage.read(pbn, data.as_mut()) {
                    Ok(()) => finish_vio(&router2, vio, Ok(Some(data))),
                    Err(error) => finish_vio(&router2, vio, Err(error)),
                }
            });
        }
        MappingState::Compressed(slot) => {
            let pbn = vio.old_mapping.pbn;
            let router2 = router.clone();
            router.bio_zone_of(pbn).send(Priority::Normal, move |bz| {
                let mut raw = match Buf::alloc(1) {
                    Ok(buf) => buf,
                    Err(error) => return finish_vio(&router2, vio, Err(error)),
                };
                if let Err(error) = bz.storage.read(pbn, raw.as_mut()) {
                    return finish_vio(&router2, vio, Err(error));
                }
                let router3 = router2.clone();
                router2
                    .cpu_zone_of(vio.lbn)
                    .send(Priority::Normal, move |_cz| {
                        let result = extract_fragment(raw.as_slice(), slot)
                            .and_then(decompress_fragment)
                            .map(Some);
                        finish_vio(&router3, vio, result);
                    });
            });
        }
    }
}

fn cpu_hash<D: Disk>(_zone: &mut CpuZone<D>, router: &Arc<Router<D>>, mut vio: DataVio) {
    let name = ChunkName::of(vio.data.as_ref().expect("writes carry data").as_slice());
    vio.chunk_name = Some(name);

    // Park the vio; the index answer and the timeout race for it.
    let slot: AdviceSlot = Arc::new(Mutex::new(Some(vio)));
    let deadline = Instant::now() + Duration::from_millis(router.config.dedupe_timeout_ms);
    let timer_slot = slot.clone();
    let timer_router = router.clone();
    router.timer.register(
        deadline,
        Box::new(move || {
            if let Some(mut vio) = timer_slot.lock().take() {
                vio.advice = None;
                vio.advice_timed_out = true;
                compress_or_allocate(&timer_router, vio);
            }
        }),
    );

    let router2 = router.clone();
    router
        .hash_zone_of(&name)
        .send(Priority::Normal, move |hz| hash_query(hz, &router2, name, slot));
}

fn hash_query<D: Disk>(
    zone: &mut HashZone<D>,
    router: &Arc<Router<D>>,
    name: ChunkName,
    slot: AdviceSlot,
) {
    if let Some(delay) = *router.index_delay.lock() {
        // Test hook standing in for a slow index volume.
        std::thread::sleep(delay);
    }
    let outcome = zone.index.service(&IndexRequest {
        action: IndexAction::Query,
        name,
        advice: None,
        requeued: false,
    });
    if let Some(closed) = outcome.closed_chapter {
        broadcast_chapter_close(zone, router, closed);
    }
    if let Some(mut vio) = slot.lock().take() {
        vio.advice = outcome.advice;
        route_after_advice(router, vio);
    }
    // Otherwise the advice arrived after the timeout and is discarded.
}

fn broadcast_chapter_close<D: Disk>(
    zone: &mut HashZone<D>,
    router: &Arc<Router<D>>,
    closed: u64,
) {
    let _ = zone;
    for hash in &router.hash {
        hash.send(Priority::High, move |other| {
            if other.index.virtual_chapter() <= closed {
                other
                    .index
                    .handle_control(IndexControl::AnnounceChapterClosed(closed));
                other
                    .index
                    .handle_control(IndexControl::SparseCacheBarrier(closed));
            }
        });
    }
}

fn route_after_advice<D: Disk>(router: &Arc<Router<D>>, vio: DataVio) {
    match vio.advice {
        // Stale advice may name a block outside the depot; never chase it.
        Some(advice)
            if advice.state == MappingState::Uncompressed
                && router.depot_state.slab_index_of(advice.pbn).is_some() =>
        {
            let router2 = router.clone();
            router
                .physical_zone_of(advice.pbn)
                .send(Priority::Normal, move |pz| physical_verify(pz, &router2, vio));
        }
        _ => compress_or_allocate(router, vio),
    }
}

fn physical_verify<D: Disk>(
    zone: &mut PhysicalZone<D>,
    router: &Arc<Router<D>>,
    mut vio: DataVio,
) {
    let advice = vio.advice.expect("the verify path requires advice");
    let pbn = advice.pbn;

    // The advised block must hold countable references with headroom.
    let increment_limit = match zone.allocator.reference_status(pbn) {
        Some(ReferenceCount::Count(n)) if n < 253 => u32::from(253 - n),
        Some(ReferenceCount::Shared) => 0,
        _ => 0,
    };
    if increment_limit == 0 {
        vio.advice = None;
        compress_or_allocate(router, vio);
        return;
    }

    match zone.locks.get(&pbn) {
        Some(&index) => {
            let lock = zone.lock_pool.get_mut(index);
            if !lock.is_read_lock() {
                // An exclusive writer owns the block; skip dedupe.
                vio.advice = None;
                compress_or_allocate(router, vio);
                return;
            }
            lock.add_holder();
            if !zone.lock_pool.get(index).claim_increment() {
                let lock = zone.lock_pool.get_mut(index);
                lock.remove_holder();
                vio.advice = None;
                compress_or_allocate(router, vio);
                return;
            }
        }
        None => {
            let Ok(index) = zone.lock_pool.borrow(PbnLockType::Read) else {
                vio.advice = None;
                compress_or_allocate(router, vio);
                return;
            };
            zone.lock_pool.get_mut(index).set_increment_limit(increment_limit);
            let claimed = zone.lock_pool.get(index).claim_increment();
            debug_assert!(claimed);
            zone.locks.insert(pbn, index);
        }
    }
    vio.held_locks.push((zone.zone_index, pbn));

    // Advice is a hint: the block's bytes must match before sharing it.
    let router2 = router.clone();
    router.bio_zone_of(pbn).send(Priority::Normal, move |bz| {
        let mut candidate = match Buf::alloc(1) {
            Ok(buf) => buf,
            Err(error) => return finish_vio(&router2, vio, Err(error)),
        };
        if let Err(error) = bz.storage.read(pbn, candidate.as_mut()) {
            return finish_vio(&router2, vio, Err(error));
        }
        let matches = candidate.as_slice()
            == vio.data.as_ref().expect("writes carry data").as_slice();
        if matches {
            vio.is_duplicate = true;
            vio.new_mapping = BlockMapEntry::uncompressed(pbn);
            route_ensure_slot(&router2, vio);
        } else {
            vio.verify_failed = true;
            vio.advice = None;
            // Drop the read lock before falling back to allocation.
            let (zone_index, _) = vio.held_locks.pop().expect("the verify lock is held");
            let router3 = router2.clone();
            router2.physical[zone_index as usize].send(Priority::Normal, move |pz| {
                release_pbn_lock(pz, pbn);
                compress_or_allocate(&router3, vio);
            });
        }
    });
}

fn compress_or_allocate<D: Disk>(router: &Arc<Router<D>>, vio: DataVio) {
    if vio.try_compress && vio.compressed.is_none() {
        let router2 = router.clone();
        router
            .cpu_zone_of(vio.lbn)
            .send(Priority::Normal, move |cz| cpu_compress(cz, &router2, vio));
        return;
    }
    route_allocate(router, vio);
}

fn cpu_compress<D: Disk>(_zone: &mut CpuZone<D>, router: &Arc<Router<D>>, mut vio: DataVio) {
    let compressed = compress_block(vio.data.as_ref().expect("writes carry data").as_slice());
    match compressed {
        Ok(Some(compressed)) => {
            vio.compressed = Some(compressed);
            let router2 = router.clone();
            router.packer.send(Priority::Normal, move |pz| {
                packer_add(pz, &router2, vio)
            });
        }
        Ok(None) | Err(_) => {
            vio.try_compress = false;
            route_allocate(router, vio);
        }
    }
}

fn packer_add<D: Disk>(zone: &mut PackerZone<D>, router: &Arc<Router<D>>, mut vio: DataVio) {
    if zone.is_read_only {
        finish_vio(router, vio, Err(Error::new(ReadOnly)));
        return;
    }
    if zone.draining {
        // The packer is being drained; write the block uncompressed so
        // nothing new lingers in a bin.
        vio.try_compress = false;
        vio.compressed = None;
        route_allocate(router, vio);
        return;
    }
    let compressed = vio.compressed.take().expect("the packer path compresses");
    if let Some(bin) = zone.packer.add(vio, compressed) {
        seal_bin(router, bin);
    }
}

/// Drives a sealed bin: allocate one block, write it, then run every
/// fragment through the journal/block-map/ref-count path as a compressed
/// mapping.
fn seal_bin<D: Disk>(router: &Arc<Router<D>>, bin: SealedBin) {
    // Allocation zone choice: spread bins by fragment count.
    let zone_index = (bin.fragments.len() % router.physical.len()) as usize;
    let router2 = router.clone();
    router.physical[zone_index].send(Priority::Normal, move |pz| {
        physical_alloc_for_bin(pz, &router2, bin, 0)
    });
}

fn physical_alloc_for_bin<D: Disk>(
    zone: &mut PhysicalZone<D>,
    router: &Arc<Router<D>>,
    bin: SealedBin,
    attempts: u32,
) {
    match zone.allocator.allocate() {
        Ok(AllocResult::Allocated(pbn)) => {
            let Ok(index) = zone.lock_pool.borrow(PbnLockType::CompressedWrite) else {
                // No lock to protect the shared block; unpack the bin.
                zone.allocator.release_provisional(pbn);
                fall_back_bin(router, bin);
                return;
            };
            let count = bin.fragments.len() as u32;
            {
                let lock = zone.lock_pool.get_mut(index);
                lock.assign_provisional_reference();
                lock.set_increment_limit(count);
                for _ in 1..count {
                    lock.add_holder();
                }
            }
            zone.locks.insert(pbn, index);

            let block = match bin.encode_block() {
                Ok(block) => block,
                Err(error) => {
                    router.enter_read_only(error.errno());
                    fail_bin(router, bin, error);
                    return;
                }
            };
            let router2 = router.clone();
            let zone_index = zone.zone_index;
            router.bio_zone_of(pbn).send(Priority::Normal, move |bz| {
                if let Err(error) = bz
                    .storage
                    .write(pbn, block.as_ref())
                    .and_then(|()| bz.storage.flush())
                {
                    fail_bin(&router2, bin, error);
                    return;
                }
                for (slot, fragment) in bin.fragments.into_iter().enumerate() {
                    let mut vio = fragment.vio;
                    vio.new_mapping = BlockMapEntry::compressed(pbn, slot as u8);
                    vio.held_locks.push((zone_index, pbn));
                    route_ensure_slot(&router2, vio);
                }
            });
        }
        Ok(AllocResult::WaitForScrub) => {
            let router2 = router.clone();
            zone.scrub_waiters
                .enqueue(Waiter::new(move |pz: &mut PhysicalZone<D>| {
                    physical_alloc_for_bin(pz, &router2, bin, attempts)
                }));
            kick_scrubbing(zone, router);
        }
        Ok(AllocResult::NoSpace) => {
            let next = attempts + 1;
            if (next as usize) < router.physical.len() {
                let target = (zone.zone_index as usize + 1) % router.physical.len();
                let router2 = router.clone();
                router.physical[target].send(Priority::Normal, move |pz| {
                    physical_alloc_for_bin(pz, &router2, bin, next)
                });
            } else {
                fail_bin(router, bin, Error::new(OutOfSpace));
            }
        }
        Err(error) => {
            router.enter_read_only(error.errno());
            fail_bin(router, bin, error);
        }
    }
}

/// Writes each fragment of an unplaceable bin as a normal allocation.
fn fall_back_bin<D: Disk>(router: &Arc<Router<D>>, bin: SealedBin) {
    for fragment in bin.fragments {
        let mut vio = fragment.vio;
        vio.try_compress = false;
        vio.compressed = None;
        route_allocate(router, vio);
    }
}

fn fail_bin<D: Disk>(router: &Arc<Router<D>>, bin: SealedBin, error: Error) {
    for fragment in bin.fragments {
        finish_vio(router, fragment.vio, Err(error.clone()));
    }
}

fn route_allocate<D: Disk>(router: &Arc<Router<D>>, vio: DataVio) {
    let zone = (vio.lbn % router.physical.len() as u64) as usize;
    let router2 = router.clone();
    router.physical[zone].send(Priority::Normal, move |pz| {
        physical_allocate(pz, &router2, vio)
    });
}

fn kick_scrubbing<D: Disk>(zone: &mut PhysicalZone<D>, router: &Arc<Router<D>>) {
    let _ = zone;
    let target = router.physical.iter();
    for handle in target {
        handle.send(Priority::Low, run_scrub_step);
    }
}

fn run_scrub_step<D: Disk>(zone: &mut PhysicalZone<D>) {
    match zone.allocator.scrub_step() {
        Ok(true) => {
            flush_summary_updates(zone);
            let mut waiters = core::mem::take(&mut zone.scrub_waiters);
            waiters.notify_all(zone);
            if zone.allocator.scrubber_mut().has_work() {
                let router = zone.router.clone();
                router.physical[zone.zone_index as usize].send(Priority::Low, run_scrub_step);
            }
        }
        Ok(false) => {}
        Err(error) => {
            let router = zone.router.clone();
            router.enter_read_only(error.errno());
        }
    }
}

fn physical_allocate<D: Disk>(
    zone: &mut PhysicalZone<D>,
    router: &Arc<Router<D>>,
    mut vio: DataVio,
) {
    if zone.is_read_only {
        finish_vio(router, vio, Err(Error::new(ReadOnly)));
        return;
    }
    match zone.allocator.allocate() {
        Ok(AllocResult::Allocated(pbn)) => {
            let index = match zone.lock_pool.borrow(PbnLockType::Write) {
                Ok(index) => index,
                Err(_) => {
                    // Pool exhausted: give the block back and wait.
                    zone.allocator.release_provisional(pbn);
                    let router2 = router.clone();
                    zone.pool_waiters
                        .enqueue(Waiter::new(move |pz: &mut PhysicalZone<D>| {
                            physical_allocate(pz, &router2, vio)
                        }));
                    return;
                }
            };
            zone.lock_pool.get_mut(index).assign_provisional_reference();
            zone.locks.insert(pbn, index);
            vio.allocated_pbn = Some(pbn);
            vio.new_mapping = BlockMapEntry::uncompressed(pbn);
            vio.held_locks.push((zone.zone_index, pbn));

            let router2 = router.clone();
            router.bio_zone_of(pbn).send(Priority::Normal, move |bz| {
                let data = vio.data.as_ref().expect("writes carry data");
                match bz
                    .storage
                    .write(pbn, data.as_ref())
                    .and_then(|()| bz.storage.flush())
                {
                    Ok(()) => route_ensure_slot(&router2, vio),
                    Err(error) => finish_vio(&router2, vio, Err(error)),
                }
            });
        }
        Ok(AllocResult::WaitForScrub) => {
            let router2 = router.clone();
            zone.scrub_waiters
                .enqueue(Waiter::new(move |pz: &mut PhysicalZone<D>| {
                    physical_allocate(pz, &router2, vio)
                }));
            kick_scrubbing(zone, router);
        }
        Ok(AllocResult::NoSpace) => {
            vio.alloc_attempts += 1;
            if (vio.alloc_attempts as usize) < router.physical.len() {
                let target = (zone.zone_index as usize + 1) % router.physical.len();
                let router2 = router.clone();
                router.physical[target].send(Priority::Normal, move |pz| {
                    physical_allocate(pz, &router2, vio)
                });
            } else {
                finish_vio(router, vio, Err(Error::new(OutOfSpace)));
            }
        }
        Err(error) => {
            router.enter_read_only(error.errno());
            finish_vio(router, vio, Err(error));
        }
    }
}

fn route_ensure_slot<D: Disk>(router: &Arc<Router<D>>, vio: DataVio) {
    let router2 = router.clone();
    router
        .logical_zone_of(vio.lbn)
        .send(Priority::Normal, move |lz| {
            logical_ensure_slot(lz, &router2, vio)
        });
}

/// Makes sure the tree path down to `vio.lbn`'s leaf exists, allocating
/// and journaling tree pages as needed, then records the slot and moves
/// on to the journal.
fn logical_ensure_slot<D: Disk>(
    zone: &mut LogicalZone<D>,
    router: &Arc<Router<D>>,
    mut vio: DataVio,
) {
    match zone.bmap.prepare_put(vio.lbn) {
        Ok(PreparePut::Ready) => match zone.bmap.get_slot(vio.lbn) {
            Ok(Some(slot)) => {
                vio.slot = Some(slot);
                let router2 = router.clone();
                router.journal.send(Priority::High, move |jz| {
                    journal_add_entries(jz, &router2, vio)
                });
            }
            Ok(None) | Err(_) => {
                router.enter_read_only(Errno::BadState);
                finish_vio(router, vio, Err(Error::new(BadState)));
            }
        },
        Ok(PreparePut::NeedsPage { parent_pbn, index }) => {
            // Only one vio grows any given slot; the rest wait for the
            // install and then retry their descent.
            let key = (parent_pbn, index);
            if let Some(waiters) = zone.pending_tree_installs.get_mut(&key) {
                let router2 = router.clone();
                waiters.enqueue(Waiter::new(move |lz: &mut LogicalZone<D>| {
                    logical_ensure_slot(lz, &router2, vio)
                }));
                return;
            }
            zone.pending_tree_installs.insert(key, WaitQueue::new());

            // Tree pages allocate near the data they serve.
            let zone_index = (vio.lbn % router.physical.len() as u64) as usize;
            let router2 = router.clone();
            router.physical[zone_index].send(Priority::Normal, move |pz| {
                physical_alloc_tree_page(pz, &router2, parent_pbn, index, vio)
            });
        }
        Err(error) => {
            router.enter_read_only(error.errno());
            finish_vio(router, vio, Err(error));
        }
    }
}

/// Clears the install guard for a slot whose growth failed, letting the
/// waiters retry (and fail, or succeed once space appears), then fails
/// the growing vio itself.
fn fail_tree_install<D: Disk>(
    router: &Arc<Router<D>>,
    parent_pbn: Pbn,
    index: u16,
    vio: DataVio,
    error: Error,
) {
    let lbn = vio.lbn;
    let router2 = router.clone();
    router.logical_zone_of(lbn).send(Priority::Normal, move |lz| {
        if let Some(mut waiters) = lz.pending_tree_installs.remove(&(parent_pbn, index)) {
            waiters.notify_all(lz);
        }
        finish_vio(&router2, vio, Err(error));
    });
}

fn physical_alloc_tree_page<D: Disk>(
    zone: &mut PhysicalZone<D>,
    router: &Arc<Router<D>>,
    parent_pbn: Pbn,
    index: u16,
    vio: DataVio,
) {
    if zone.is_read_only {
        fail_tree_install(router, parent_pbn, index, vio, Error::new(ReadOnly));
        return;
    }
    match zone.allocator.allocate() {
        Ok(AllocResult::Allocated(child_pbn)) => {
            let lock_index = match zone.lock_pool.borrow(PbnLockType::BlockMapWrite) {
                Ok(lock_index) => lock_index,
                Err(_) => {
                    zone.allocator.release_provisional(child_pbn);
                    let router2 = router.clone();
                    zone.pool_waiters
                        .enqueue(Waiter::new(move |pz: &mut PhysicalZone<D>| {
                            physical_alloc_tree_page(pz, &router2, parent_pbn, index, vio)
                        }));
                    return;
                }
            };
            zone.lock_pool
                .get_mut(lock_index)
                .assign_provisional_reference();
            zone.locks.insert(child_pbn, lock_index);
            let zone_index = zone.zone_index;

            let entry = RecoveryJournalEntry {
                operation: JournalOperation::BlockMapIncrement,
                slot: JournalEntrySlot {
                    pbn: parent_pbn,
                    slot_index: index,
                },
                mapping: BlockMapEntry::uncompressed(child_pbn),
            };
            router.journal.send(Priority::High, move |jz| {
                if jz.is_read_only || jz.journal.write_error().is_some() {
                    let journal_router = jz.router.clone();
                    fail_tree_install(
                        &journal_router,
                        parent_pbn,
                        index,
                        vio,
                        Error::new(ReadOnly),
                    );
                    return;
                }
                // The new page pins both heads: the block map until the
                // parent pointer is installed (and its dirty era reported),
                // the slab journals until the child's reference delta is
                // durable.
                let token = jz.take_token();
                let floor = jz.journal.tail_sequence();
                jz.bmap_floors.insert(token, floor);
                jz.slab_floors.insert(token, floor);
                jz.slab_floor_refs.insert(token, 1);

                let journal_router = jz.router.clone();
                jz.journal.append(
                    vec![entry],
                    false,
                    Box::new(move |result| match result {
                        Ok(points) => {
                            let point = points[0];
                            let commit_router = journal_router.clone();
                            journal_router.physical[zone_index as usize].send(
                                Priority::High,
                                move |pz| {
                                    if let Err(error) = pz.allocator.adjust_reference_count(
                                        child_pbn,
                                        JournalOperation::BlockMapIncrement,
                                        point,
                                        token,
                                    ) {
                                        commit_router.enter_read_only(error.errno());
                                        fail_tree_install(
                                            &commit_router,
                                            parent_pbn,
                                            index,
                                            vio,
                                            error,
                                        );
                                        return;
                                    }
                                    flush_summary_updates(pz);
                                    report_released_locks(pz);
                                    schedule_slab_commit(pz);
                                    // The page is committed; drop its lock.
                                    if let Some(&lock_index) = pz.locks.get(&child_pbn) {
                                        pz.lock_pool
                                            .get_mut(lock_index)
                                            .unassign_provisional_reference();
                                    }
                                    release_pbn_lock(pz, child_pbn);

                                    let install_router = commit_router.clone();
                                    commit_router
                                        .logical_zone_of(vio.lbn)
                                        .send(Priority::Normal, move |lz| {
                                            let installed = lz.bmap.install_tree_page(
                                                parent_pbn,
                                                index,
                                                child_pbn,
                                                point.sequence_number,
                                            );
                                            if let Some(mut waiters) = lz
                                                .pending_tree_installs
                                                .remove(&(parent_pbn, index))
                                            {
                                                waiters.notify_all(lz);
                                            }
                                            if let Err(error) = installed {
                                                install_router.enter_read_only(error.errno());
                                                finish_vio(&install_router, vio, Err(error));
                                                return;
                                            }
                                            // The dirty pages now pin the
                                            // block-map head through the
                                            // zone's era report.
                                            let oldest = lz.bmap.oldest_dirty_era();
                                            let report_zone = lz.zone_index as usize;
                                            install_router.journal.send(
                                                Priority::High,
                                                move |jz| {
                                                    jz.bmap_floors.remove(&token);
                                                    jz.zone_dirty_eras[report_zone] = oldest;
                                                    jz.recompute_heads();
                                                    maybe_schedule_commit(jz);
                                                },
                                            );
                                            logical_ensure_slot(lz, &install_router, vio);
                                        });
                                },
                            );
                        }
                        Err(error) => {
                            journal_router.enter_read_only(error.errno());
                            fail_tree_install(
                                &journal_router,
                                parent_pbn,
                                index,
                                vio,
                                Error::new(ReadOnly),
                            );
                        }
                    }),
                );
                maybe_schedule_commit(jz);
            });
        }
        Ok(AllocResult::WaitForScrub) => {
            let router2 = router.clone();
            zone.scrub_waiters
                .enqueue(Waiter::new(move |pz: &mut PhysicalZone<D>| {
                    physical_alloc_tree_page(pz, &router2, parent_pbn, index, vio)
                }));
            kick_scrubbing(zone, router);
        }
        Ok(AllocResult::NoSpace) => {
            fail_tree_install(router, parent_pbn, index, vio, Error::new(OutOfSpace));
        }
        Err(error) => {
            router.enter_read_only(error.errno());
            fail_tree_install(router, parent_pbn, index, vio, error);
        }
    }
}

/// Journals the mapping change as one batch: an increment entry for the
/// new mapping and, when the old mapping held a counted block, a
/// decrement entry. The batch's write is dispatched immediately only for
/// a full block or a flush/FUA vio; otherwise it waits for the next
/// amortized commit.
fn journal_add_entries<D: Disk>(
    zone: &mut JournalZone<D>,
    router: &Arc<Router<D>>,
    mut vio: DataVio,
) {
    if zone.is_read_only || zone.journal.write_error().is_some() {
        finish_vio(router, vio, Err(Error::new(ReadOnly)));
        return;
    }
    let slot = vio.slot.expect("journaled vios carry their slot");
    let slot = JournalEntrySlot {
        pbn: slot.0,
        slot_index: slot.1,
    };

    let mut batch = vec![RecoveryJournalEntry {
        operation: JournalOperation::DataIncrement,
        slot,
        mapping: vio.new_mapping,
    }];
    if vio.old_mapping.state.is_counted() {
        batch.push(RecoveryJournalEntry {
            operation: JournalOperation::DataDecrement,
            slot,
            mapping: vio.old_mapping,
        });
    }

    // Pin the journal heads for this vio before any point is assigned.
    // The slab pin carries one commit-lock reference per counted delta
    // and lifts only when the slab journals make them durable.
    let token = zone.take_token();
    vio.journal_token = token;
    let floor = zone.journal.tail_sequence();
    zone.bmap_floors.insert(token, floor);
    let counted_deltas = u32::from(vio.new_mapping.state.is_counted())
        + u32::from(vio.old_mapping.state.is_counted());
    if counted_deltas > 0 {
        zone.slab_floors.insert(token, floor);
        zone.slab_floor_refs.insert(token, counted_deltas);
    }

    let needs_flush = vio.flags.intersects(IoFlags::FUA | IoFlags::FLUSH);
    let outer_router = router.clone();
    zone.journal.append(
        batch,
        needs_flush,
        Box::new(move |result| match result {
            Ok(points) => {
                vio.journal_points = points;
                outer_router
                    .journal
                    .send(Priority::High, move |jz| after_journal(jz, vio));
            }
            Err(error) => {
                outer_router.enter_read_only(error.errno());
                finish_vio(&outer_router, vio, Err(Error::new(ReadOnly)));
            }
        }),
    );
    maybe_schedule_commit(zone);
}

/// Queues one amortized partial-block commit on the journal zone, at low
/// priority so every append already in flight lands in the same write.
fn maybe_schedule_commit<D: Disk>(zone: &mut JournalZone<D>) {
    if zone.commit_scheduled || !zone.journal.has_uncommitted() {
        return;
    }
    zone.commit_scheduled = true;
    let router = zone.router.clone();
    router.journal.send(Priority::Low, run_journal_commit);
}

fn run_journal_commit<D: Disk>(zone: &mut JournalZone<D>) {
    zone.commit_scheduled = false;
    if let Err(error) = zone.journal.commit_pending() {
        let router = zone.router.clone();
        router.enter_read_only(error.errno());
    }
}

/// Queues one amortized slab-journal commit pass on a physical zone.
fn schedule_slab_commit<D: Disk>(zone: &mut PhysicalZone<D>) {
    if zone.slab_commit_scheduled || !zone.allocator.has_uncommitted_deltas() {
        return;
    }
    zone.slab_commit_scheduled = true;
    let router = zone.router.clone();
    router.physical[zone.zone_index as usize].send(Priority::Low, run_slab_commit);
}

fn run_slab_commit<D: Disk>(zone: &mut PhysicalZone<D>) {
    zone.slab_commit_scheduled = false;
    if let Err(error) = zone.allocator.commit_slab_journals() {
        let router = zone.router.clone();
        router.enter_read_only(error.errno());
    }
    report_released_locks(zone);
}

/// Forwards freshly released commit locks to the journal zone so the
/// slab head can advance.
fn report_released_locks<D: Disk>(zone: &mut PhysicalZone<D>) {
    let tokens = zone.allocator.take_released_commit_locks();
    if tokens.is_empty() {
        return;
    }
    let router = zone.router.clone();
    router
        .journal
        .send(Priority::High, move |jz| note_slab_durable(jz, tokens));
}

fn note_slab_durable<D: Disk>(zone: &mut JournalZone<D>, tokens: Vec<u64>) {
    for token in tokens {
        let Some(refs) = zone.slab_floor_refs.get_mut(&token) else {
            continue;
        };
        *refs -= 1;
        if *refs == 0 {
            zone.slab_floor_refs.remove(&token);
            zone.slab_floors.remove(&token);
        }
    }
    zone.recompute_heads();
    maybe_schedule_commit(zone);
}

fn after_journal<D: Disk>(zone: &mut JournalZone<D>, vio: DataVio) {
    let router = zone.router.clone();
    let max_age = router.config.block_map_maximum_age;
    let tail = zone.journal.tail_sequence();
    let router2 = router.clone();
    router
        .logical_zone_of(vio.lbn)
        .send(Priority::Normal, move |lz| {
            bmap_update(lz, &router2, vio, tail, max_age)
        });
}

fn bmap_update<D: Disk>(
    zone: &mut LogicalZone<D>,
    router: &Arc<Router<D>>,
    mut vio: DataVio,
    journal_tail: u64,
    max_age: u64,
) {
    let era = vio.journal_points[0].sequence_number;
    let old = match zone.bmap.put_mapping(vio.lbn, vio.new_mapping, era) {
        Ok(old) => old,
        Err(error) => {
            router.enter_read_only(error.errno());
            finish_vio(router, vio, Err(error));
            return;
        }
    };
    debug_assert_eq!(old, vio.old_mapping);

    // Era-based writeback: expel pages dirtied too many journal blocks
    // ago, then tell the journal how far its head may advance.
    if let Err(error) = zone.bmap.advance_era(journal_tail, max_age) {
        router.enter_read_only(error.errno());
        finish_vio(router, vio, Err(error));
        return;
    }
    let oldest = zone.bmap.oldest_dirty_era();
    let token = vio.journal_token;
    let zone_index = zone.zone_index as usize;
    router.journal.send(Priority::High, move |jz| {
        jz.bmap_floors.remove(&token);
        jz.zone_dirty_eras[zone_index] = oldest;
        jz.recompute_heads();
        maybe_schedule_commit(jz);
    });

    route_refcounts(router, vio);
}

fn route_refcounts<D: Disk>(router: &Arc<Router<D>>, vio: DataVio) {
    if vio.new_mapping.state.is_counted() {
        let pbn = vio.new_mapping.pbn;
        let router2 = router.clone();
        router
            .physical_zone_of(pbn)
            .send(Priority::Normal, move |pz| {
                physical_commit_new(pz, &router2, vio)
            });
    } else {
        route_decrement(router, vio);
    }
}

fn physical_commit_new<D: Disk>(
    zone: &mut PhysicalZone<D>,
    router: &Arc<Router<D>>,
    vio: DataVio,
) {
    let pbn = vio.new_mapping.pbn;
    let point = vio.journal_points[0];
    if let Err(error) = zone.allocator.adjust_reference_count(
        pbn,
        JournalOperation::DataIncrement,
        point,
        vio.journal_token,
    ) {
        router.enter_read_only(error.errno());
        finish_vio(router, vio, Err(error));
        return;
    }
    if let Some(&index) = zone.locks.get(&pbn) {
        let is_compressed = {
            let lock = zone.lock_pool.get_mut(index);
            // The committed reference replaces the provisional one.
            lock.unassign_provisional_reference();
            lock.lock_type() == PbnLockType::CompressedWrite
        };
        if is_compressed {
            let _ = zone.lock_pool.get(index).claim_increment();
        }
    }
    flush_summary_updates(zone);
    report_released_locks(zone);
    schedule_slab_commit(zone);
    route_decrement(router, vio);
}

fn route_decrement<D: Disk>(router: &Arc<Router<D>>, vio: DataVio) {
    if vio.old_mapping.state.is_counted() {
        let pbn = vio.old_mapping.pbn;
        let router2 = router.clone();
        router
            .physical_zone_of(pbn)
            .send(Priority::Normal, move |pz| {
                physical_decrement_old(pz, &router2, vio)
            });
    } else {
        finish_refcounts(router, vio);
    }
}

fn physical_decrement_old<D: Disk>(
    zone: &mut PhysicalZone<D>,
    router: &Arc<Router<D>>,
    vio: DataVio,
) {
    let pbn = vio.old_mapping.pbn;
    let point = *vio.journal_points.last().expect("entries were journaled");
    if let Err(error) = zone.allocator.adjust_reference_count(
        pbn,
        JournalOperation::DataDecrement,
        point,
        vio.journal_token,
    ) {
        router.enter_read_only(error.errno());
        finish_vio(router, vio, Err(error));
        return;
    }
    flush_summary_updates(zone);
    report_released_locks(zone);
    schedule_slab_commit(zone);
    finish_refcounts(router, vio);
}

fn finish_refcounts<D: Disk>(router: &Arc<Router<D>>, vio: DataVio) {
    // The slab floor stays pinned until the slab journals report the
    // vio's deltas durable; acknowledgement does not wait for that.
    finish_vio(router, vio, Ok(None));
}

fn flush_summary_updates<D: Disk>(zone: &mut PhysicalZone<D>) {
    let updates = zone.allocator.take_summary_updates();
    if updates.is_empty() {
        return;
    }
    let router = zone.router.clone();
    router.admin.send(Priority::Normal, move |az| {
        apply_summary_updates(az, updates);
    });
}

fn apply_summary_updates<D: Disk>(zone: &mut AdminZone<D>, updates: Vec<SummaryUpdate>) {
    for update in updates {
        if let Err(error) = zone.summary.update(
            update.slab_index,
            update.tail_block_offset,
            update.is_clean,
            update.free_blocks,
        ) {
            let router = zone.router.clone();
            router.enter_read_only(error.errno());
            return;
        }
    }
}

/// The single exit of the pipeline: releases PBN locks, the lbn lock,
/// the pool permit, then acknowledges the host. Posts fresh advice for
/// newly written blocks on the way out.
fn finish_vio<D: Disk>(router: &Arc<Router<D>>, mut vio: DataVio, result: Result<Option<Buf>>) {
    let outcome = VioOutcome::of(&vio);
    let succeeded = result.is_ok();

    for (zone_index, pbn) in core::mem::take(&mut vio.held_locks) {
        router.physical[zone_index as usize].send(Priority::Normal, move |pz| {
            release_pbn_lock(pz, pbn);
        });
    }

    // Share what we just wrote with future writes of the same bytes.
    // Compressed fragments are not advertised: advice names whole blocks.
    if succeeded && vio.op == VioOp::Write && !vio.is_duplicate {
        if let (Some(name), true) = (
            vio.chunk_name,
            vio.new_mapping.state == MappingState::Uncompressed,
        ) {
            let advice = DedupeAdvice {
                pbn: vio.new_mapping.pbn,
                state: MappingState::Uncompressed,
            };
            let router2 = router.clone();
            router.hash_zone_of(&name).send(Priority::Normal, move |hz| {
                let outcome = hz.index.service(&IndexRequest {
                    action: IndexAction::Post,
                    name,
                    advice: Some(advice),
                    requeued: false,
                });
                if let Some(closed) = outcome.closed_chapter {
                    broadcast_chapter_close(hz, &router2, closed);
                }
            });
        }
    }

    // Safety net: unpin the block-map head even on failure paths that
    // never reached their note message. The slab pin is left to the
    // durable-delta reports; the paths that skip those all end in
    // read-only mode, where head movement no longer matters.
    if vio.journal_token != 0 {
        let token = vio.journal_token;
        router.journal.send(Priority::High, move |jz| {
            jz.bmap_floors.remove(&token);
            jz.recompute_heads();
            maybe_schedule_commit(jz);
        });
    }

    let lbn = vio.lbn;
    let completion = vio.take_completion();
    let router2 = router.clone();
    router.logical_zone_of(lbn).send(Priority::Normal, move |lz| {
        if outcome.dedupe_hit {
            lz.stats.dedupe_hits += 1;
        }
        if outcome.verify_failed {
            lz.stats.dedupe_verify_failures += 1;
        }
        if outcome.timed_out {
            lz.stats.dedupe_timeouts += 1;
        }
        release_lbn_lock(lz, lbn);
        run_completion(&router2, completion, result);
        release_pool_permit(&router2);
    });
}

fn release_lbn_lock<D: Disk>(zone: &mut LogicalZone<D>, lbn: u64) {
    let Some(mut waiters) = zone.lbn_locks.remove(&lbn) else {
        return;
    };
    // The next waiter retakes the lock; anyone still queued keeps their
    // place behind it. A waiter that somehow finishes without holding
    // the lock hands it to the one after.
    while let Some(next) = waiters.dequeue_next() {
        next.fire(zone);
        if let Some(queue) = zone.lbn_locks.get_mut(&lbn) {
            waiters.transfer_all(queue);
            return;
        }
    }
}

fn release_pbn_lock<D: Disk>(zone: &mut PhysicalZone<D>, pbn: Pbn) {
    let Some(&index) = zone.locks.get(&pbn) else {
        return;
    };
    let lock = zone.lock_pool.get_mut(index);
    if !lock.remove_holder() {
        return;
    }
    if lock.unassign_provisional_reference() {
        // The allocation never committed; give the block back.
        zone.allocator.release_provisional(pbn);
    }
    zone.locks.remove(&pbn);
    zone.lock_pool.release(index);
    let mut waiters = core::mem::take(&mut zone.pool_waiters);
    waiters.notify_all(zone);
}

// ---------------------------------------------------------------------------
// Suspend machinery
// ---------------------------------------------------------------------------

fn suspend_phase_done<D: Disk>(zone: &mut AdminZone<D>) {
    let Some(op) = zone.suspend.as_mut() else {
        return;
    };
    debug_assert!(op.pending > 0);
    op.pending -= 1;
    if op.pending == 0 {
        if let Some(next) = op.phase.next() {
            op.phase = next;
        }
        advance_suspend(zone);
    }
}

fn advance_suspend<D: Disk>(zone: &mut AdminZone<D>) {
    let router = zone.router.clone();
    let Some(op) = zone.suspend.as_mut() else {
        return;
    };
    match op.phase {
        SuspendPhase::Start | SuspendPhase::DrainFlusher | SuspendPhase::WaitReadOnly => {
            if op.phase == SuspendPhase::WaitReadOnly {
                // Hold read-only notifications while the super block is
                // written; a deferred entry replays on resume.
                router.notifier.set_may_not_notify();
            }
            op.phase = op.phase.next().expect("suspend has a next phase");
            advance_suspend(zone);
        }
        SuspendPhase::DrainPacker => {
            op.pending = 1;
            let router2 = router.clone();
            router.packer.send(Priority::High, move |pz| {
                pz.draining = true;
                if let Some(bin) = pz.packer.flush() {
                    seal_bin(&router2, bin);
                }
                router2.admin.send(Priority::High, suspend_phase_done);
            });
        }
        SuspendPhase::DrainDataVios => {
            op.pending = 1;
            let router2 = router.clone();
            router.vio_pool.notify_when_drained(Box::new(move || {
                router2.admin.send(Priority::High, suspend_phase_done);
            }));
        }
        SuspendPhase::DrainLogicalZones => {
            op.pending = router.logical.len();
            for logical in &router.logical {
                let router2 = router.clone();
                logical.send(Priority::Normal, move |_lz| {
                    router2.admin.send(Priority::High, suspend_phase_done);
                });
            }
        }
        SuspendPhase::DrainBlockMap => {
            op.pending = router.logical.len();
            for logical in &router.logical {
                let router2 = router.clone();
                logical.send(Priority::Normal, move |lz| {
                    if let Err(error) = lz.bmap.flush() {
                        router2.enter_read_only(error.errno());
                    }
                    router2.admin.send(Priority::High, suspend_phase_done);
                });
            }
        }
        SuspendPhase::DrainJournal => {
            op.pending = 1;
            let router2 = router.clone();
            router.journal.send(Priority::High, move |jz| {
                let state = jz.journal.state();
                if let Err(error) = jz.journal.drain() {
                    router2.enter_read_only(error.errno());
                }
                router2.admin.send(Priority::High, move |zone| {
                    if let Some(op) = zone.suspend.as_mut() {
                        op.journal_state = Some(state);
                    }
                    suspend_phase_done(zone);
                });
            });
        }
        SuspendPhase::DrainDepot => {
            op.pending = router.physical.len();
            for physical in &router.physical {
                let router2 = router.clone();
                physical.send(Priority::Normal, move |pz| {
                    if let Err(error) = pz.allocator.save_all() {
                        router2.enter_read_only(error.errno());
                    }
                    report_released_locks(pz);
                    let updates = pz.allocator.take_summary_updates();
                    router2.admin.send(Priority::High, move |zone| {
                        apply_summary_updates(zone, updates);
                        suspend_phase_done(zone);
                    });
                });
            }
        }
        SuspendPhase::WriteSuperBlock => {
            if router.notifier.is_read_only() {
                // A read-only device never marks itself clean: the next
                // load must recover (or the operator intervenes).
            } else {
                if let Some(state) = op.journal_state.take() {
                    zone.payload.set_journal_state(&state);
                }
                zone.payload.clean_shutdown = true;
                if let Err(error) = SuperBlock::save(&zone.storage, &zone.payload) {
                    router.enter_read_only(error.errno());
                }
            }
            let Some(op) = zone.suspend.as_mut() else {
                return;
            };
            op.phase = SuspendPhase::End;
            advance_suspend(zone);
        }
        SuspendPhase::End => {
            zone.machine.finish_suspending();
            router.suspended.store(true, Ordering::Release);
            let op = zone.suspend.take().expect("the suspend op is active");
            // Entering read-only during suspend still counts as success:
            // the device is, after all, suspended.
            let _ = op.done.send(Ok(()));
        }
    }
}

fn merge_gather<D: Disk>(zone: &mut AdminZone<D>, merge: impl FnOnce(&mut DeviceStats)) {
    let Some(op) = zone.gather.as_mut() else {
        return;
    };
    merge(&mut op.stats);
    op.remaining -= 1;
    if op.remaining == 0 {
        let op = zone.gather.take().expect("the gather op is active");
        let _ = op.done.send(op.stats);
    }
}


#[cfg(test)]
mod tests {
    use core::ops::Range;
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc as StdArc,
    };
    use std::time::Duration;

    use crate::layers::device::ThreadCountConfig;
    use super::{DeviceConfig, Disk, Vdo};
    use crate::{
        error::Errno,
        layers::{
            bio::{BlockId, BlockSet, Buf, BufMut, BufRef, MemDisk, BLOCK_SIZE},
            device::{IoDescriptor, IoFlags, VioOp},
        },
        os::ToString,
        prelude::Result,
    };

    fn test_config(physical: u64, logical: u64) -> DeviceConfig {
        DeviceConfig {
            parent_device: "memdisk".to_string(),
            physical_blocks: physical,
            logical_blocks: logical,
            logical_block_size: 4096,
            cache_pages: 64,
            block_map_maximum_age: 16,
            max_discard_blocks: 1,
            deduplication: true,
            compression: false,
            dedupe_timeout_ms: 2000,
            slab_blocks: 64,
            threads: ThreadCountConfig::default(),
        }
    }

    fn new_device(blocks: u64) -> (MemDisk, DeviceConfig, Vdo<MemDisk>) {
        let disk = MemDisk::create(blocks).unwrap();
        let config = test_config(blocks, 4096);
        Vdo::format(&disk, &config).unwrap();
        let vdo = Vdo::load(disk.clone(), config.clone()).unwrap();
        (disk, config, vdo)
    }

    fn pattern(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK_SIZE]
    }

    fn varied(seed: u64) -> Vec<u8> {
        // Distinct, incompressible-ish content per seed.
        let mut data = vec![0u8; BLOCK_SIZE];
        let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
        for chunk in data.chunks_mut(8) {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            chunk.copy_from_slice(&state.to_le_bytes()[..chunk.len()]);
        }
        data
    }

    #[test]
    fn dedup_round_trip() {
        let (_disk, _config, vdo) = new_device(1024);
        let before = vdo.stats().unwrap().free_physical_blocks;

        let data = pattern(0x11);
        vdo.write_block(0, &data).unwrap();
        vdo.write_block(1, &data).unwrap();

        assert_eq!(vdo.read_block(0).unwrap().as_slice(), &data[..]);
        assert_eq!(vdo.read_block(1).unwrap().as_slice(), &data[..]);

        let stats = vdo.stats().unwrap();
        assert_eq!(stats.dedupe_hits, 1);
        assert_eq!(stats.logical_blocks_used, 2);
        // One data block and one block-map leaf were allocated; the
        // second write shared the first block.
        assert_eq!(stats.free_physical_blocks, before - 2);
        vdo.close().unwrap();
    }

    #[test]
    fn zero_block_elision() {
        let (_disk, _config, vdo) = new_device(1024);
        let before = vdo.stats().unwrap().free_physical_blocks;

        vdo.write_block(5, &pattern(0)).unwrap();

        let data = vdo.read_block(5).unwrap();
        assert!(data.as_slice().iter().all(|&byte| byte == 0));

        let stats = vdo.stats().unwrap();
        assert_eq!(stats.zero_block_writes, 1);
        assert_eq!(stats.logical_blocks_used, 1);
        // Only the block-map leaf was allocated; no data block was.
        assert_eq!(stats.free_physical_blocks, before - 1);
        vdo.close().unwrap();
    }

    #[test]
    fn rewrite_frees_the_old_block() {
        let (_disk, _config, vdo) = new_device(1024);
        vdo.write_block(3, &varied(1)).unwrap();
        let between = vdo.stats().unwrap().free_physical_blocks;

        vdo.write_block(3, &varied(2)).unwrap();
        assert_eq!(vdo.read_block(3).unwrap().as_slice(), &varied(2)[..]);

        let stats = vdo.stats().unwrap();
        // The new block replaced the old one for free-space purposes.
        assert_eq!(stats.free_physical_blocks, between);
        assert_eq!(stats.logical_blocks_used, 1);
        vdo.close().unwrap();
    }

    #[test]
    fn discard_unmaps_and_frees() {
        let (_disk, _config, vdo) = new_device(1024);
        vdo.write_block(7, &varied(7)).unwrap();
        let stats = vdo.stats().unwrap();
        assert_eq!(stats.logical_blocks_used, 1);
        let used = stats.free_physical_blocks;

        vdo.discard_block(7).unwrap();
        let data = vdo.read_block(7).unwrap();
        assert!(data.as_slice().iter().all(|&byte| byte == 0));

        let stats = vdo.stats().unwrap();
        assert_eq!(stats.logical_blocks_used, 0);
        assert_eq!(stats.free_physical_blocks, used + 1);
        assert_eq!(stats.discards, 1);

        // Discarding an unmapped block is a no-op.
        vdo.discard_block(8).unwrap();
        vdo.close().unwrap();
    }

    #[test]
    fn crash_and_recover() {
        let disk = MemDisk::create(4096).unwrap();
        let config = test_config(4096, 4096);
        Vdo::format(&disk, &config).unwrap();

        let count = 1000u64;
        let free_before_crash;
        {
            let vdo = Vdo::load(disk.clone(), config.clone()).unwrap();
            for lbn in 0..count {
                vdo.write_block(lbn, &varied(lbn)).unwrap();
            }
            free_before_crash = vdo.stats().unwrap().free_physical_blocks;
            // Simulate power loss: no suspend, no super-block write.
            drop(vdo);
        }

        let vdo = Vdo::load(disk.clone(), config).unwrap();
        assert!(!vdo.is_read_only());
        for lbn in 0..count {
            assert_eq!(
                vdo.read_block(lbn).unwrap().as_slice(),
                &varied(lbn)[..],
                "lbn {} must survive the crash",
                lbn
            );
        }
        let stats = vdo.stats().unwrap();
        assert_eq!(stats.logical_blocks_used, count);
        assert_eq!(stats.free_physical_blocks, free_before_crash);

        // The recovered device keeps working.
        vdo.write_block(0, &varied(7777)).unwrap();
        assert_eq!(vdo.read_block(0).unwrap().as_slice(), &varied(7777)[..]);
        vdo.close().unwrap();
    }

    #[test]
    fn clean_reload_preserves_data() {
        let disk = MemDisk::create(1024).unwrap();
        let config = test_config(1024, 4096);
        Vdo::format(&disk, &config).unwrap();
        {
            let vdo = Vdo::load(disk.clone(), config.clone()).unwrap();
            vdo.write_block(11, &varied(11)).unwrap();
            vdo.close().unwrap();
        }
        let vdo = Vdo::load(disk.clone(), config).unwrap();
        assert_eq!(vdo.read_block(11).unwrap().as_slice(), &varied(11)[..]);
        assert_eq!(vdo.stats().unwrap().logical_blocks_used, 1);
        vdo.close().unwrap();
    }

    #[test]
    fn dedupe_index_timeout_falls_back() {
        let disk = MemDisk::create(1024).unwrap();
        let mut config = test_config(1024, 4096);
        config.dedupe_timeout_ms = 1;
        Vdo::format(&disk, &config).unwrap();
        let vdo = Vdo::load(disk.clone(), config).unwrap();
        vdo.set_index_delay_for_testing(Some(Duration::from_millis(50)));

        let data = pattern(0x22);
        vdo.write_block(0, &data).unwrap();
        vdo.write_block(1, &data).unwrap();

        assert_eq!(vdo.read_block(0).unwrap().as_slice(), &data[..]);
        assert_eq!(vdo.read_block(1).unwrap().as_slice(), &data[..]);

        let stats = vdo.stats().unwrap();
        // Both writes proceeded without advice; ref counts and mappings
        // stayed consistent even though dedupe was missed.
        assert!(stats.dedupe_timeouts >= 1);
        assert_eq!(stats.dedupe_hits, 0);
        assert_eq!(stats.logical_blocks_used, 2);
        vdo.set_index_delay_for_testing(None);
        vdo.close().unwrap();
    }

    #[test]
    fn suspend_resume_cycle() {
        let (_disk, _config, vdo) = new_device(1024);
        vdo.write_block(0, &varied(1)).unwrap();
        vdo.suspend().unwrap();

        // A suspended device refuses new work.
        let (tx, rx) = mpsc::channel();
        vdo.submit(IoDescriptor {
            op: VioOp::Read,
            lbn: 0,
            data: None,
            flags: IoFlags::empty(),
            completion: Box::new(move |result| {
                let _ = tx.send(result.map(|_| ()));
            }),
        });
        assert_eq!(
            rx.recv().unwrap().unwrap_err().errno(),
            Errno::InvalidAdminState
        );

        vdo.resume().unwrap();
        assert_eq!(vdo.read_block(0).unwrap().as_slice(), &varied(1)[..]);
        vdo.write_block(1, &varied(2)).unwrap();
        vdo.close().unwrap();
    }

    #[test]
    fn flush_barrier_completes() {
        let (_disk, _config, vdo) = new_device(1024);
        vdo.write_block(0, &varied(5)).unwrap();
        vdo.flush().unwrap();
        assert_eq!(vdo.stats().unwrap().flushes, 1);

        // A FUA-tagged write takes the same durable-journal path.
        let (tx, rx) = mpsc::channel();
        let mut data = Buf::alloc(1).unwrap();
        data.as_mut_slice().copy_from_slice(&varied(6));
        vdo.submit(IoDescriptor {
            op: VioOp::Write,
            lbn: 1,
            data: Some(data),
            flags: IoFlags::FUA,
            completion: Box::new(move |result| {
                let _ = tx.send(result.map(|_| ()));
            }),
        });
        rx.recv().unwrap().unwrap();
        assert_eq!(vdo.read_block(1).unwrap().as_slice(), &varied(6)[..]);
        vdo.close().unwrap();
    }

    #[test]
    fn compression_packs_fragments() {
        let disk = MemDisk::create(1024).unwrap();
        let mut config = test_config(1024, 4096);
        config.compression = true;
        config.deduplication = false;
        Vdo::format(&disk, &config).unwrap();
        let vdo = Vdo::load(disk.clone(), config).unwrap();
        let before = vdo.stats().unwrap().free_physical_blocks;

        // Fourteen compressible blocks of distinct content, submitted
        // asynchronously: the fourteenth fragment fills the bin and the
        // packer writes them all to one physical block.
        let count = 14u64;
        let (tx, rx) = mpsc::channel();
        for lbn in 0..count {
            let tx = tx.clone();
            let mut data = Buf::alloc(1).unwrap();
            data.as_mut_slice().fill(lbn as u8 + 1);
            vdo.submit(IoDescriptor {
                op: VioOp::Write,
                lbn,
                data: Some(data),
                flags: IoFlags::empty(),
                completion: Box::new(move |result| {
                    let _ = tx.send(result.map(|_| ()));
                }),
            });
        }
        for _ in 0..count {
            rx.recv().unwrap().unwrap();
        }

        for lbn in 0..count {
            let data = vdo.read_block(lbn).unwrap();
            assert!(data.as_slice().iter().all(|&byte| byte == lbn as u8 + 1));
        }
        let stats = vdo.stats().unwrap();
        // One shared physical block for all fourteen fragments plus the
        // block-map leaf.
        assert_eq!(stats.free_physical_blocks, before - 2);
        assert_eq!(stats.logical_blocks_used, count);

        // A partial bin left behind by one more write is drained by
        // suspend and acknowledged before the device stops.
        let (tx, rx) = mpsc::channel();
        let mut data = Buf::alloc(1).unwrap();
        data.as_mut_slice().fill(0x33);
        vdo.submit(IoDescriptor {
            op: VioOp::Write,
            lbn: 20,
            data: Some(data),
            flags: IoFlags::empty(),
            completion: Box::new(move |result| {
                let _ = tx.send(result.map(|_| ()));
            }),
        });
        vdo.close().unwrap();
        rx.recv().unwrap().unwrap();
    }

    #[test]
    fn grow_logical_extends_the_address_space() {
        let (_disk, _config, vdo) = new_device(1024);
        assert_eq!(
            vdo.write_block(4096, &varied(1)).unwrap_err().errno(),
            Errno::InvalidArgs
        );
        vdo.grow_logical(8192).unwrap();
        vdo.write_block(6000, &varied(1)).unwrap();
        assert_eq!(vdo.read_block(6000).unwrap().as_slice(), &varied(1)[..]);

        // Shrinking is refused.
        assert_eq!(
            vdo.grow_logical(100).unwrap_err().errno(),
            Errno::InvalidArgs
        );
        vdo.close().unwrap();
    }

    #[test]
    fn grow_physical_adds_slabs() {
        let disk = MemDisk::create(1024).unwrap();
        let config = test_config(512, 4096);
        Vdo::format(&disk, &config).unwrap();
        let vdo = Vdo::load(disk.clone(), config).unwrap();
        let before = vdo.stats().unwrap().free_physical_blocks;

        vdo.grow_physical(1024).unwrap();
        let after = vdo.stats().unwrap().free_physical_blocks;
        assert!(after > before);

        // Growth without new room is refused.
        assert_eq!(
            vdo.grow_physical(1024).unwrap_err().errno(),
            Errno::InvalidArgs
        );
        vdo.write_block(0, &varied(1)).unwrap();
        vdo.close().unwrap();
    }

    #[test]
    fn dump_and_toggles() {
        let (_disk, _config, vdo) = new_device(1024);
        vdo.set_compression(true);
        vdo.set_deduplication(false);
        vdo.write_block(0, &varied(3)).unwrap();
        let dump = vdo.dump().unwrap();
        assert!(dump.contains("admin state"));
        assert!(dump.contains("queue"));
        vdo.close().unwrap();
    }

    /// A disk that can be told to fail writes to a range of physical
    /// blocks, for driving the journal into read-only mode.
    #[derive(Clone)]
    struct FailDisk {
        inner: MemDisk,
        origin: u64,
        fail_range: Range<u64>,
        failing: StdArc<AtomicBool>,
    }

    impl FailDisk {
        fn new(inner: MemDisk, fail_range: Range<u64>) -> Self {
            Self {
                inner,
                origin: 0,
                fail_range,
                failing: StdArc::new(AtomicBool::new(false)),
            }
        }
    }

    impl BlockSet for FailDisk {
        fn read(&self, pos: BlockId, buf: BufMut) -> Result<()> {
            self.inner.read(pos, buf)
        }

        fn write(&self, pos: BlockId, buf: BufRef) -> Result<()> {
            let abs = self.origin + pos;
            if self.failing.load(Ordering::Acquire)
                && abs >= self.fail_range.start
                && abs < self.fail_range.end
            {
                crate::return_errno_with_msg!(crate::error::Errno::IoFailed, "injected failure");
            }
            self.inner.write(pos, buf)
        }

        fn subset(&self, range: Range<BlockId>) -> Result<Self> {
            Ok(Self {
                inner: self.inner.subset(range.clone())?,
                origin: self.origin + range.start,
                fail_range: self.fail_range.clone(),
                failing: self.failing.clone(),
            })
        }

        fn flush(&self) -> Result<()> {
            self.inner.flush()
        }

        fn nblocks(&self) -> u64 {
            self.inner.nblocks()
        }
    }

    #[test]
    fn read_only_escalation() {
        let mem = MemDisk::create(1024).unwrap();
        let config = test_config(1024, 4096);
        // The journal region starts at block 1 and spans 16 blocks.
        let disk = FailDisk::new(mem, 1..17);
        Vdo::format(&disk, &config).unwrap();
        let vdo = Vdo::load(disk.clone(), config).unwrap();

        let notified = StdArc::new(AtomicUsize::new(0));
        let notified_clone = notified.clone();
        vdo.register_read_only_listener(move || {
            notified_clone.fetch_add(1, Ordering::SeqCst);
        });

        vdo.write_block(0, &varied(1)).unwrap();
        disk.failing.store(true, Ordering::Release);

        // The failing journal write forces read-only mode.
        assert_eq!(
            vdo.write_block(1, &varied(2)).unwrap_err().errno(),
            Errno::ReadOnly
        );
        assert!(vdo.is_read_only());

        // Every subsequent write fails fast; reads keep working.
        assert_eq!(
            vdo.write_block(2, &varied(3)).unwrap_err().errno(),
            Errno::ReadOnly
        );
        assert_eq!(vdo.read_block(0).unwrap().as_slice(), &varied(1)[..]);

        // The listener fired exactly once.
        let stats = vdo.stats().unwrap();
        assert!(stats.read_only);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // Suspending a read-only device is still a success.
        vdo.close().unwrap();
    }

    #[test]
    fn multi_zone_configuration() {
        let disk = MemDisk::create(2048).unwrap();
        let mut config = test_config(2048, 4096);
        config.threads.logical_zones = 2;
        config.threads.physical_zones = 2;
        config.threads.hash_zones = 2;
        config.threads.bio_threads = 2;
        config.threads.bio_ack_threads = 1;
        config.threads.cpu_threads = 2;
        Vdo::format(&disk, &config).unwrap();
        let vdo = Vdo::load(disk.clone(), config.clone()).unwrap();

        let data = pattern(0x44);
        for lbn in 0..64u64 {
            vdo.write_block(lbn, &data).unwrap();
        }
        for lbn in 0..64u64 {
            assert_eq!(vdo.read_block(lbn).unwrap().as_slice(), &data[..]);
        }
        let stats = vdo.stats().unwrap();
        assert_eq!(stats.logical_blocks_used, 64);
        assert_eq!(stats.dedupe_hits, 63);
        vdo.close().unwrap();

        // And the multi-zone device reloads cleanly.
        let vdo = Vdo::load(disk, config).unwrap();
        assert_eq!(vdo.read_block(63).unwrap().as_slice(), &data[..]);
        vdo.close().unwrap();
    }
}
