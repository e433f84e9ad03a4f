use std::{
    sync::{
        mpsc::{sync_channel, Receiver, SyncSender},
        Arc,
    },
    thread,
    time::Instant,
};

use crate::{
    device::{Device, DeviceBuffer},
    logger,
    params::{DeviceParams, ParamsRef},
    solver::{self, Solver, Synchronizer},
    sync::{pair, RunConfig, SyncError},
};

struct ParentLink {
    reduce: SyncSender<()>,
    update: Receiver<()>,
}

struct ChildLink<D: Device> {
    params: ParamsRef<D>,
    reduce: Receiver<()>,
    update: SyncSender<()>,
}

/// One node of the reduce/broadcast tree, owned by the worker thread driving
/// that device's solver.
///
/// Gradients flow up: each node consumes its children's handoff signals,
/// accumulates their `diff` into its own, then signals its parent. The root
/// applies the fully reduced gradient through its solver's update rule, and
/// updated weights flow back down at the start of the next step: each node
/// waits for its parent's signal, then writes its `data` into each child's
/// buffer before releasing it. Each edge is a bounded channel, so a child
/// also blocks if its parent has not drained the previous signal.
pub struct TreeSync<D: Device> {
    params: ParamsRef<D>,
    device: Arc<D>,
    staging: Option<D::BufferF32>,
    parent: Option<ParentLink>,
    children: Vec<ChildLink<D>>,
    initial_iter: usize,
}

impl<D: Device> TreeSync<D> {
    /// Builds one node per device, wired into the tree given by
    /// [`pair::compute`]. Channels have capacity one: a single handoff per
    /// step in each direction.
    pub fn prepare(
        devices: &[D::IdType],
        num_params: usize,
        initial_iter: usize,
    ) -> Result<Vec<Self>, SyncError<D>> {
        let pairs = pair::compute(devices)?;

        let mut nodes = Vec::with_capacity(devices.len());

        for &id in devices {
            let device = Arc::new(D::new(id).map_err(SyncError::Device)?);
            let params = DeviceParams::new(device.clone(), num_params).map_err(SyncError::Device)?;

            nodes.push(Self {
                params: ParamsRef::new(params),
                device,
                staging: None,
                parent: None,
                children: Vec::new(),
                initial_iter,
            });
        }

        let index_of = |id: D::IdType| devices.iter().position(|&x| x == id).unwrap();

        for pair in &pairs {
            let parent = index_of(pair.parent());
            let child = index_of(pair.device());

            let (reduce_tx, reduce_rx) = sync_channel(1);
            let (update_tx, update_rx) = sync_channel(1);

            nodes[child].parent = Some(ParentLink { reduce: reduce_tx, update: update_rx });

            let params = nodes[child].params.clone();
            nodes[parent].children.push(ChildLink { params, reduce: reduce_rx, update: update_tx });
        }

        for node in &mut nodes {
            if !node.children.is_empty() {
                let staging = D::BufferF32::new(node.device.clone(), num_params).map_err(SyncError::Device)?;
                node.staging = Some(staging);
            }
        }

        Ok(nodes)
    }

    pub fn device(&self) -> Arc<D> {
        self.device.clone()
    }

    pub fn params(&self) -> &ParamsRef<D> {
        &self.params
    }

    pub fn initial_iter(&self) -> usize {
        self.initial_iter
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

impl<D: Device, S: Solver<D>> Synchronizer<D, S> for TreeSync<D> {
    /// A non-root node blocks here until its parent has written the updated
    /// weights into this node's `data`. Every node then pushes its weights to
    /// its children, so the broadcast cascades down one level per wake-up and
    /// also distributes the root's initial weights before the first step.
    fn on_start(&mut self, _solver: &mut S) -> Result<(), SyncError<D>> {
        if let Some(parent) = &self.parent {
            parent.update.recv().map_err(|_| SyncError::PeerDisconnected)?;
        }

        for child in &self.children {
            let src = self.params.borrow();
            child.params.borrow_mut().load_data_from(&src).map_err(SyncError::Device)?;
            drop(src);

            child.update.send(()).map_err(|_| SyncError::PeerDisconnected)?;
        }

        Ok(())
    }

    /// Consumes each child's handoff signal in child order and folds that
    /// child's gradients into this node's `diff`, strictly after this node's
    /// own gradients are complete. The sole writer of any destination buffer
    /// is the thread running here. The root then applies the combined
    /// gradient; everyone else signals up and waits for the next broadcast.
    fn on_gradients_ready(&mut self, solver: &mut S) -> Result<(), SyncError<D>> {
        let Self { params, staging, children, .. } = self;

        if let Some(staging) = staging.as_mut() {
            for child in children.iter() {
                child.reduce.recv().map_err(|_| SyncError::PeerDisconnected)?;

                let src = child.params.borrow();
                params.borrow_mut().accumulate_diff_from(staging, &src).map_err(SyncError::Device)?;
            }
        }

        match &self.parent {
            Some(parent) => parent.reduce.send(()).map_err(|_| SyncError::PeerDisconnected)?,
            None => solver.apply_update().map_err(SyncError::Device)?,
        }

        Ok(())
    }
}

fn worker<D: Device, S: Solver<D>>(
    mut node: TreeSync<D>,
    mut solver: S,
    steps: usize,
    report: bool,
) -> Result<S, SyncError<D>> {
    let timer = Instant::now();

    for step in 1..=steps {
        solver::step(&mut solver, &mut node)?;

        if report && (step % 16 == 0 || step == steps) {
            logger::report_step_progress(step, steps, &timer);
        }
    }

    node.device.synchronise().map_err(SyncError::Device)?;

    Ok(solver)
}

/// Runs `config.steps` synchronous steps across `config.devices`, driving the
/// reference solver on the first device and one factory-built solver per
/// remaining device. The root runs on the calling thread; every other node
/// gets a worker thread. Returns the solvers in device order so callers can
/// inspect or checkpoint them.
///
/// A node that dies mid-step takes the whole tree down with it: its channel
/// endpoints drop, every blocked peer sees `PeerDisconnected`, and the first
/// error wins. There are no internal timeouts; a stalled participant stalls
/// the run indefinitely.
pub fn run<D, S, F>(root_solver: S, config: &RunConfig<D::IdType>, mut make_solver: F) -> Result<Vec<S>, SyncError<D>>
where
    D: Device,
    S: Solver<D>,
    F: FnMut(Arc<D>) -> Result<S, D::DeviceError>,
{
    let num_params = root_solver.num_params();
    let initial_iter = root_solver.iter();
    let steps = config.steps;

    let mut nodes = TreeSync::<D>::prepare(&config.devices, num_params, initial_iter)?.into_iter();

    let root_node = nodes.next().expect("device list is non-empty");
    let mut root_solver = root_solver;
    root_node.params().configure(&mut root_solver);

    let mut rest = Vec::new();
    for node in nodes {
        let mut solver = make_solver(node.device()).map_err(SyncError::Device)?;
        solver.set_iter(initial_iter);
        node.params().configure(&mut solver);
        rest.push((node, solver));
    }

    logger::report_run_started(config.devices.len(), steps);
    logger::report_tree_depth(pair::depth(config.devices.len()));
    let timer = Instant::now();

    let (root_result, child_results) = thread::scope(|scope| {
        let handles: Vec<_> = rest
            .into_iter()
            .map(|(node, solver)| scope.spawn(move || worker(node, solver, steps, false)))
            .collect();

        let root_result = worker(root_node, root_solver, steps, true);

        let child_results: Vec<_> = handles.into_iter().map(|handle| handle.join().unwrap()).collect();

        (root_result, child_results)
    });

    let mut solvers = vec![root_result?];
    for result in child_results {
        solvers.push(result?);
    }

    logger::report_run_finished(steps, timer.elapsed().as_secs_f32());

    Ok(solvers)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{device::cpu::CpuDevice, solver::testing::TestSolver, sync::TopologyError};

    fn read(params: &ParamsRef<CpuDevice>, diff: bool) -> Vec<f32> {
        let params = params.borrow();
        let buf = if diff { params.diff() } else { params.data() };

        let n = params.size();
        let mut out = vec![0.0; n];
        buf.write_into_slice(&mut out, n).unwrap();
        out
    }

    fn run_fixed_grads(
        devices: usize,
        steps: usize,
        grads: &[Vec<f32>],
        delays: &[u64],
    ) -> Vec<TestSolver> {
        let config = RunConfig { devices: (0..devices).collect(), steps };

        let root = TestSolver::new(grads[0].clone(), 1.0).with_delay(Duration::from_millis(delays[0]));

        run(root, &config, |device| {
            let id = device.id();
            Ok(TestSolver::new(grads[id].clone(), 1.0).with_delay(Duration::from_millis(delays[id])))
        })
        .unwrap()
    }

    #[test]
    fn single_device_is_passthrough() {
        let config = RunConfig { devices: vec![0usize], steps: 1 };

        let solvers = run(TestSolver::new(vec![1.0, 2.0], 0.5), &config, |_| {
            panic!("no extra solvers for a single device")
        })
        .unwrap();

        // local update only: data = 0 - 0.5 * grad
        assert_eq!(read(solvers[0].params(), false), vec![-0.5, -1.0]);
        assert_eq!(read(solvers[0].params(), true), vec![1.0, 2.0]);
    }

    #[test]
    fn root_accumulates_exact_sum() {
        let grads = vec![
            vec![1.0, 10.0],
            vec![2.0, 20.0],
            vec![4.0, 40.0],
            vec![8.0, 80.0],
        ];

        let solvers = run_fixed_grads(4, 1, &grads, &[0, 0, 0, 0]);

        // root diff holds the combined gradient of every device
        assert_eq!(read(solvers[0].params(), true), vec![15.0, 150.0]);
        // and applied it with lr = 1
        assert_eq!(read(solvers[0].params(), false), vec![-15.0, -150.0]);
    }

    #[test]
    fn reduction_ignores_sibling_timing() {
        let grads = vec![
            vec![1.0, 10.0],
            vec![2.0, 20.0],
            vec![4.0, 40.0],
            vec![8.0, 80.0],
        ];

        for delays in [[0, 30, 5, 0], [25, 0, 0, 40], [5, 10, 20, 1]] {
            let solvers = run_fixed_grads(4, 1, &grads, &delays);
            assert_eq!(read(solvers[0].params(), true), vec![15.0, 150.0]);
        }
    }

    #[test]
    fn broadcast_makes_devices_identical() {
        let grads: Vec<Vec<f32>> = (1..=4).map(|d| vec![d as f32; 3]).collect();

        // after step 2's broadcast, every device saw the step 1 update
        let solvers = run_fixed_grads(4, 2, &grads, &[0, 0, 0, 0]);

        let after_one_update = vec![-10.0; 3];
        for solver in &solvers[1..] {
            assert_eq!(read(solver.params(), false), after_one_update);
        }

        // the root has already applied step 2 on top
        assert_eq!(read(solvers[0].params(), false), vec![-20.0; 3]);
    }

    #[test]
    fn initial_weights_cascade_from_root() {
        let config = RunConfig { devices: vec![0usize, 1, 2, 3], steps: 1 };

        // distinctive starting weights on the root only
        let nodes = TreeSync::<CpuDevice>::prepare(&config.devices, 2, 0).unwrap();
        nodes[0].params().borrow_mut().data_mut().load_from_slice(&[3.0, 7.0]).unwrap();

        assert!(nodes[0].is_root());
        assert!(nodes[1..].iter().all(|node| !node.is_root()));
        assert_eq!(nodes[0].initial_iter(), 0);

        let mut solvers: Vec<TestSolver> = (0..4).map(|_| TestSolver::new(vec![0.0; 2], 1.0)).collect();
        for (node, solver) in nodes.iter().zip(solvers.iter_mut()) {
            node.params().configure(solver);
        }

        thread::scope(|scope| {
            let mut handles = Vec::new();
            for (node, solver) in nodes.into_iter().zip(solvers.iter_mut()) {
                handles.push(scope.spawn(move || worker_once(node, solver)));
            }
            for handle in handles {
                handle.join().unwrap();
            }
        });

        for solver in &solvers {
            assert_eq!(read(solver.params(), false), vec![3.0, 7.0]);
        }

        fn worker_once(mut node: TreeSync<CpuDevice>, solver: &mut TestSolver) {
            solver::step(solver, &mut node).unwrap();
        }
    }

    #[test]
    fn initial_iter_propagates_to_children() {
        let config = RunConfig { devices: vec![0usize, 1], steps: 2 };

        let mut root = TestSolver::new(vec![0.0], 1.0);
        root.set_iter(40);

        let solvers = run(root, &config, |_| Ok(TestSolver::new(vec![0.0], 1.0))).unwrap();

        assert_eq!(solvers[0].iter(), 42);
        assert_eq!(solvers[1].iter(), 42);
    }

    #[test]
    fn empty_device_list_is_rejected() {
        let config = RunConfig { devices: Vec::new(), steps: 1 };

        let result = run(TestSolver::new(vec![0.0], 1.0), &config, |_| Ok(TestSolver::new(vec![0.0], 1.0)));

        assert!(matches!(result, Err(SyncError::Topology(TopologyError::EmptyDeviceList))));
    }
}
