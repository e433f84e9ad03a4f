use std::{
    collections::HashMap,
    sync::{Arc, Barrier, OnceLock},
    thread,
    time::Instant,
};

use parking_lot::Mutex;

use crate::{
    device::{
        cpu::{CpuBuffer, CpuDevice},
        Device, DeviceBuffer,
    },
    logger,
    params::{DeviceParams, ParamsRef},
    rng,
    solver::{self, Solver, Synchronizer},
    sync::{pair, GroupFormationError, RunConfig, SyncError},
};

/// Identifier binding one communicator group together. In multi-process mode
/// one process generates it and passes it to the others out-of-band; every
/// participant then constructs its communicator from the same uid so that
/// collective calls match up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupUid(String);

impl GroupUid {
    pub fn generate() -> Self {
        Self(rng::uid_string(32))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for GroupUid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A communicator handle bound to one device, member of a group executing
/// collective operations jointly. Construction must be matched across the
/// whole group: either every handle comes out of one [`Comm::new_group`]
/// call, or every participant calls [`Comm::from_uid`] with the same uid.
pub trait Comm<D: Device>: Sized + Send {
    /// Single-process mode: constructs all handles of the group together.
    fn new_group(devices: &[Arc<D>]) -> Result<Vec<Self>, SyncError<D>>;

    /// Multi-process mode: constructs this participant's handle from a shared
    /// group identifier.
    fn from_uid(uid: &GroupUid, rank: usize, world_size: usize, device: Arc<D>) -> Result<Self, SyncError<D>>;

    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Element-wise sum over every member's buffer; every member ends up
    /// holding the identical combined result.
    fn all_reduce_sum(&self, buf: &mut D::BufferF32) -> Result<(), SyncError<D>>;

    /// Copies `root`'s buffer into every other member's.
    fn broadcast(&self, buf: &mut D::BufferF32, root: usize) -> Result<(), SyncError<D>>;
}

struct GroupState {
    world_size: usize,
    slots: Mutex<Vec<Option<Vec<f32>>>>,
    barrier: Barrier,
}

impl GroupState {
    fn new(world_size: usize) -> Arc<Self> {
        Arc::new(Self {
            world_size,
            slots: Mutex::new(vec![None; world_size]),
            barrier: Barrier::new(world_size),
        })
    }
}

// Stands in for the out-of-band uid exchange a real collective library needs:
// participants that agree on a uid land in the same group state.
fn registry() -> &'static Mutex<HashMap<String, Arc<GroupState>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<GroupState>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Simulated communicator for `CpuDevice` groups. Members exchange data
/// through a shared slot table; two barrier generations per operation keep
/// successive collectives from overlapping.
pub struct CpuComm {
    rank: usize,
    group: Arc<GroupState>,
}

impl CpuComm {
    fn exchange<R>(&self, publish: Option<Vec<f32>>, read: R) -> Result<Vec<f32>, SyncError<CpuDevice>>
    where
        R: FnOnce(&[Option<Vec<f32>>]) -> Result<Vec<f32>, SyncError<CpuDevice>>,
    {
        if let Some(data) = publish {
            self.group.slots.lock()[self.rank] = Some(data);
        }

        self.group.barrier.wait();

        let result = read(&self.group.slots.lock());

        self.group.barrier.wait();

        result
    }
}

impl Comm<CpuDevice> for CpuComm {
    fn new_group(devices: &[Arc<CpuDevice>]) -> Result<Vec<Self>, SyncError<CpuDevice>> {
        if devices.is_empty() {
            return Err(GroupFormationError::EmptyGroup.into());
        }

        let group = GroupState::new(devices.len());

        Ok((0..devices.len()).map(|rank| Self { rank, group: group.clone() }).collect())
    }

    fn from_uid(
        uid: &GroupUid,
        rank: usize,
        world_size: usize,
        _device: Arc<CpuDevice>,
    ) -> Result<Self, SyncError<CpuDevice>> {
        if world_size == 0 {
            return Err(GroupFormationError::EmptyGroup.into());
        }

        if rank >= world_size {
            return Err(GroupFormationError::RankOutOfRange.into());
        }

        let mut registry = registry().lock();
        let group = registry.entry(uid.as_str().to_string()).or_insert_with(|| GroupState::new(world_size)).clone();

        if group.world_size != world_size {
            return Err(GroupFormationError::WorldSizeMismatch.into());
        }

        Ok(Self { rank, group })
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.world_size
    }

    fn all_reduce_sum(&self, buf: &mut CpuBuffer<f32>) -> Result<(), SyncError<CpuDevice>> {
        let size = buf.size();

        let mut local = vec![0.0; size];
        buf.write_into_slice(&mut local, size).map_err(SyncError::Device)?;

        let sum = self.exchange(Some(local), |slots| {
            let mut sum = vec![0.0; size];

            for slot in slots {
                let slot = slot.as_ref().expect("every rank publishes before the barrier");

                if slot.len() != size {
                    return Err(SyncError::MismatchedBufferSizes);
                }

                for (acc, &x) in sum.iter_mut().zip(slot.iter()) {
                    *acc += x;
                }
            }

            Ok(sum)
        })?;

        buf.load_from_slice(&sum).map_err(SyncError::Device)
    }

    fn broadcast(&self, buf: &mut CpuBuffer<f32>, root: usize) -> Result<(), SyncError<CpuDevice>> {
        if root >= self.group.world_size {
            return Err(GroupFormationError::RankOutOfRange.into());
        }

        let size = buf.size();

        let publish = if self.rank == root {
            let mut local = vec![0.0; size];
            buf.write_into_slice(&mut local, size).map_err(SyncError::Device)?;
            Some(local)
        } else {
            None
        };

        let data = self.exchange(publish, |slots| {
            let slot = slots[root].as_ref().expect("root publishes before the barrier");

            if slot.len() != size {
                return Err(SyncError::MismatchedBufferSizes);
            }

            Ok(slot.clone())
        })?;

        if self.rank != root {
            buf.load_from_slice(&data).map_err(SyncError::Device)?;
        }

        Ok(())
    }
}

/// Flat-group synchronisation engine: one all-reduce combines every device's
/// gradients, then each device applies the identical combined gradient
/// independently, since the reduce result is the same everywhere. No explicit
/// tree, no root-only update.
pub struct CollectiveSync<D: Device, C: Comm<D>> {
    params: ParamsRef<D>,
    comm: C,
    barrier: Option<Arc<Barrier>>,
}

impl<D: Device, C: Comm<D>> CollectiveSync<D, C> {
    pub fn new(params: ParamsRef<D>, comm: C) -> Self {
        Self { params, comm, barrier: None }
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn params(&self) -> &ParamsRef<D> {
        &self.params
    }

    pub fn barrier(&self) -> Option<&Arc<Barrier>> {
        self.barrier.as_ref()
    }

    pub fn set_barrier(&mut self, barrier: Arc<Barrier>) {
        self.barrier = Some(barrier);
    }

    /// Rendezvous immediately after group creation. Works around
    /// initialisation races in some collective implementations; not an engine
    /// invariant.
    pub fn startup_wait(&self) {
        if let Some(barrier) = &self.barrier {
            barrier.wait();
        }
    }

    /// Distributes rank 0's initial weights to every participant, before any
    /// training step. Collective: every rank must call it.
    pub fn broadcast_initial(&mut self) -> Result<(), SyncError<D>> {
        let mut params = self.params.borrow_mut();
        self.comm.broadcast(params.data_mut(), 0)
    }
}

impl<D: Device, C: Comm<D>, S: Solver<D>> Synchronizer<D, S> for CollectiveSync<D, C> {
    /// Nothing to wait for: the all-reduce itself is the step's rendezvous.
    fn on_start(&mut self, _solver: &mut S) -> Result<(), SyncError<D>> {
        Ok(())
    }

    fn on_gradients_ready(&mut self, solver: &mut S) -> Result<(), SyncError<D>> {
        {
            let mut params = self.params.borrow_mut();
            self.comm.all_reduce_sum(params.diff_mut())?;
        }

        solver.apply_update().map_err(SyncError::Device)
    }
}

fn worker<D: Device, C: Comm<D>, S: Solver<D>>(
    mut sync: CollectiveSync<D, C>,
    mut solver: S,
    steps: usize,
    report: bool,
) -> Result<S, SyncError<D>> {
    sync.startup_wait();
    sync.broadcast_initial()?;

    let timer = Instant::now();

    for step in 1..=steps {
        solver::step(&mut solver, &mut sync)?;

        if report && (step % 16 == 0 || step == steps) {
            logger::report_step_progress(step, steps, &timer);
        }
    }

    sync.params.borrow().device().synchronise().map_err(SyncError::Device)?;

    Ok(solver)
}

/// Single-process multi-device run: builds one communicator group over
/// `config.devices`, restores the reference solver from `restore` if given,
/// broadcasts its weights to every device, then drives `config.steps`
/// synchronous steps. Returns the solvers in device order.
///
/// A participant that stalls or dies stalls the whole group: collective calls
/// have no internal timeout, matching the fail-fast, no-partial-recovery
/// policy of the tree engine.
pub fn run<D, S, C, F>(
    reference: S,
    config: &RunConfig<D::IdType>,
    restore: Option<&str>,
    mut make_solver: F,
) -> Result<Vec<S>, SyncError<D>>
where
    D: Device,
    S: Solver<D>,
    C: Comm<D>,
    F: FnMut(Arc<D>) -> Result<S, D::DeviceError>,
{
    // same validation as the tree engine
    pair::compute(&config.devices)?;

    let num_params = reference.num_params();
    let steps = config.steps;

    let mut root_solver = reference;
    if let Some(path) = restore {
        root_solver.restore(path).map_err(SyncError::Device)?;
    }
    let initial_iter = root_solver.iter();

    let mut devices = Vec::with_capacity(config.devices.len());
    for &id in &config.devices {
        devices.push(Arc::new(D::new(id).map_err(SyncError::Device)?));
    }

    let comms = C::new_group(&devices)?;
    let barrier = Arc::new(Barrier::new(devices.len()));

    let mut units = Vec::with_capacity(devices.len());
    let mut root_solver = Some(root_solver);

    for (device, comm) in devices.iter().zip(comms) {
        let params = ParamsRef::new(DeviceParams::new(device.clone(), num_params).map_err(SyncError::Device)?);

        let mut solver = match root_solver.take() {
            Some(solver) => solver,
            None => {
                let mut solver = make_solver(device.clone()).map_err(SyncError::Device)?;
                solver.set_iter(initial_iter);
                solver
            }
        };

        params.configure(&mut solver);

        let mut sync = CollectiveSync::new(params, comm);
        sync.set_barrier(barrier.clone());

        units.push((sync, solver));
    }

    logger::report_run_started(config.devices.len(), steps);
    let timer = Instant::now();

    let mut units = units.into_iter();
    let root = units.next().expect("device list is non-empty");
    let rest: Vec<_> = units.collect();

    let (root_result, peer_results) = thread::scope(|scope| {
        let handles: Vec<_> = rest
            .into_iter()
            .map(|(sync, solver)| scope.spawn(move || worker(sync, solver, steps, false)))
            .collect();

        let root_result = worker(root.0, root.1, steps, true);

        let peer_results: Vec<_> = handles.into_iter().map(|handle| handle.join().unwrap()).collect();

        (root_result, peer_results)
    });

    let mut solvers = vec![root_result?];
    for result in peer_results {
        solvers.push(result?);
    }

    logger::report_run_finished(steps, timer.elapsed().as_secs_f32());

    Ok(solvers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::testing::TestSolver;

    fn read_data(params: &ParamsRef<CpuDevice>) -> Vec<f32> {
        let params = params.borrow();
        let n = params.size();
        let mut out = vec![0.0; n];
        params.data().write_into_slice(&mut out, n).unwrap();
        out
    }

    #[test]
    fn single_process_group_all_reduce() {
        let devices: Vec<_> = (0..3).map(|id| Arc::new(CpuDevice::new(id).unwrap())).collect();
        let comms = CpuComm::new_group(&devices).unwrap();

        assert!(comms.iter().all(|comm| comm.world_size() == 3));

        let results: Vec<Vec<f32>> = thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .zip(devices.iter())
                .map(|(comm, device)| {
                    let device = device.clone();
                    scope.spawn(move || {
                        let mut buf = CpuBuffer::<f32>::new(device, 4).unwrap();
                        buf.load_from_slice(&[comm.rank() as f32 + 1.0; 4]).unwrap();

                        comm.all_reduce_sum(&mut buf).unwrap();

                        let mut out = [0.0; 4];
                        buf.write_into_slice(&mut out, 4).unwrap();
                        out.to_vec()
                    })
                })
                .collect();

            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        for result in results {
            assert_eq!(result, vec![6.0; 4]);
        }
    }

    #[test]
    fn uid_initialised_processes_agree() {
        let uid = GroupUid::generate();

        let results: Vec<Vec<f32>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|rank| {
                    let uid = uid.clone();
                    scope.spawn(move || {
                        let device = Arc::new(CpuDevice::new(rank).unwrap());
                        let comm = CpuComm::from_uid(&uid, rank, 2, device.clone()).unwrap();

                        let mut buf = CpuBuffer::<f32>::new(device, 2).unwrap();
                        buf.load_from_slice(&[rank as f32 + 1.0; 2]).unwrap();

                        comm.all_reduce_sum(&mut buf).unwrap();

                        let mut out = [0.0; 2];
                        buf.write_into_slice(&mut out, 2).unwrap();
                        out.to_vec()
                    })
                })
                .collect();

            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        assert_eq!(results[0], vec![3.0; 2]);
        assert_eq!(results[1], vec![3.0; 2]);
    }

    #[test]
    fn malformed_groups_rejected() {
        assert!(matches!(
            CpuComm::new_group(&[]),
            Err(SyncError::Group(GroupFormationError::EmptyGroup))
        ));

        let device = Arc::new(CpuDevice::new(0).unwrap());
        let uid = GroupUid::generate();

        assert!(matches!(
            CpuComm::from_uid(&uid, 2, 2, device.clone()),
            Err(SyncError::Group(GroupFormationError::RankOutOfRange))
        ));

        CpuComm::from_uid(&uid, 0, 2, device.clone()).unwrap();
        assert!(matches!(
            CpuComm::from_uid(&uid, 1, 3, device),
            Err(SyncError::Group(GroupFormationError::WorldSizeMismatch))
        ));
    }

    #[test]
    fn broadcast_distributes_root_buffer() {
        let devices: Vec<_> = (0..2).map(|id| Arc::new(CpuDevice::new(id).unwrap())).collect();
        let comms = CpuComm::new_group(&devices).unwrap();

        let results: Vec<Vec<f32>> = thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .zip(devices.iter())
                .map(|(comm, device)| {
                    let device = device.clone();
                    scope.spawn(move || {
                        let mut buf = CpuBuffer::<f32>::new(device, 2).unwrap();
                        if comm.rank() == 0 {
                            buf.load_from_slice(&[5.0, 6.0]).unwrap();
                        }

                        comm.broadcast(&mut buf, 0).unwrap();

                        let mut out = [0.0; 2];
                        buf.write_into_slice(&mut out, 2).unwrap();
                        out.to_vec()
                    })
                })
                .collect();

            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        assert_eq!(results[0], vec![5.0, 6.0]);
        assert_eq!(results[1], vec![5.0, 6.0]);
    }

    #[test]
    fn startup_barrier_is_optional() {
        let device = Arc::new(CpuDevice::new(0).unwrap());
        let comm = CpuComm::new_group(&[device.clone()]).unwrap().remove(0);
        let params = ParamsRef::new(DeviceParams::new(device, 1).unwrap());

        let mut sync = CollectiveSync::new(params, comm);
        assert!(sync.barrier().is_none());
        sync.startup_wait();

        sync.set_barrier(Arc::new(Barrier::new(1)));
        assert!(sync.barrier().is_some());
        sync.startup_wait();
        assert_eq!(sync.rank(), 0);
    }

    #[test]
    fn every_device_applies_identical_update() {
        let config = RunConfig { devices: (0..4).collect(), steps: 2 };

        let root = TestSolver::new(vec![1.0; 3], 1.0);

        let solvers = run::<CpuDevice, _, CpuComm, _>(root, &config, None, |device| {
            Ok(TestSolver::new(vec![device.id() as f32 + 1.0; 3], 1.0))
        })
        .unwrap();

        // combined gradient is 10 per element, applied twice on every device
        for solver in &solvers {
            assert_eq!(read_data(solver.params()), vec![-20.0; 3]);
        }
    }

    #[test]
    fn restore_passed_through_to_reference_solver() {
        let config = RunConfig { devices: (0..2).collect(), steps: 1 };

        let root = TestSolver::new(vec![0.0; 2], 1.0);

        let solvers = run::<CpuDevice, _, CpuComm, _>(root, &config, Some("nets/ckpt-40"), |_| {
            Ok(TestSolver::new(vec![0.0; 2], 1.0))
        })
        .unwrap();

        assert_eq!(solvers[0].restored(), Some("nets/ckpt-40"));
        assert_eq!(solvers[1].restored(), None);
    }
}
