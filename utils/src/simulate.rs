use std::time::Instant;

use anyhow::{bail, ensure};
use structopt::StructOpt;

use gradsync::{
    device::{cpu::CpuDevice, Device, DeviceBuffer},
    logger,
    params::ParamsRef,
    rng,
    solver::Solver,
    sync::{collective, collective::CpuComm, tree, RunConfig},
};

/// Trains a least-squares model data-parallel across simulated devices and
/// checks that every device ends the run with identical weights.
#[derive(StructOpt)]
pub struct SimulateOptions {
    #[structopt(short, long, default_value = "4")]
    devices: usize,
    #[structopt(short, long, default_value = "200")]
    steps: usize,
    #[structopt(short, long, default_value = "0.1")]
    lr: f32,
    #[structopt(short, long, default_value = "16")]
    weights: usize,
    #[structopt(short = "b", long, default_value = "64")]
    samples_per_device: usize,
    #[structopt(short, long, default_value = "tree")]
    engine: String,
    /// Colourblind-friendly colour scheme.
    #[structopt(long)]
    cbcs: bool,
}

impl SimulateOptions {
    pub fn run(&self) -> anyhow::Result<()> {
        ensure!(self.devices > 0, "need at least one device");

        logger::set_cbcs(self.cbcs);

        let truth = rng::vec_f32(self.weights, 0.0, 1.0, true);
        let shards: Vec<Shard> =
            (0..self.devices).map(|_| Shard::generate(&truth, self.samples_per_device)).collect();

        println!(
            "Simulating {} devices, {} weights, {} samples each",
            logger::ansi(self.devices, logger::num_cs()),
            logger::ansi(self.weights, logger::num_cs()),
            logger::ansi(self.samples_per_device, logger::num_cs()),
        );

        let reference = LsqSolver::new(shards[0].clone(), self.weights, self.devices, self.lr);
        let config = RunConfig { devices: (0..self.devices).collect(), steps: self.steps };

        let make_solver = |device: std::sync::Arc<CpuDevice>| {
            Ok(LsqSolver::new(shards[device.id()].clone(), self.weights, self.devices, self.lr))
        };

        let timer = Instant::now();

        let solvers = match self.engine.as_str() {
            "tree" => tree::run(reference, &config, make_solver),
            "collective" => collective::run::<_, _, CpuComm, _>(reference, &config, None, make_solver),
            _ => bail!("Unrecognised engine! Supported: 'tree', 'collective'."),
        };
        let solvers = solvers.map_err(|err| anyhow::anyhow!("synchronous run failed: {err:?}"))?;

        let weights: Vec<Vec<f32>> = solvers.iter().map(|solver| solver.weights()).collect();

        // the tree root is one update ahead of its children until the next
        // broadcast, so compare the non-root devices among themselves
        let replicas = if self.engine == "tree" && weights.len() > 1 { &weights[1..] } else { &weights[..] };
        for replica in replicas {
            ensure!(
                replica == &replicas[0],
                "devices diverged: synchronisation failed to keep weights identical"
            );
        }

        let loss = shards.iter().map(|shard| shard.loss(&weights[0])).sum::<f32>() / self.devices as f32;
        let (hours, minutes, seconds) = logger::seconds_to_hms(timer.elapsed().as_secs() as u32);

        println!(
            "Final loss {} after {}h {}m {}s",
            logger::ansi(format!("{loss:.6}"), logger::num_cs()),
            logger::ansi(hours, logger::num_cs()),
            logger::ansi(minutes, logger::num_cs()),
            logger::ansi(seconds, logger::num_cs()),
        );

        let zeros = vec![0.0; self.weights];
        let initial_loss =
            shards.iter().map(|shard| shard.loss(&zeros)).sum::<f32>() / self.devices as f32;
        ensure!(loss < initial_loss, "training did not reduce the loss");

        Ok(())
    }
}

/// One device's portion of the synthetic dataset.
#[derive(Clone)]
struct Shard {
    inputs: Vec<Vec<f32>>,
    targets: Vec<f32>,
}

impl Shard {
    fn generate(truth: &[f32], samples: usize) -> Self {
        let mut inputs = Vec::with_capacity(samples);
        let mut targets = Vec::with_capacity(samples);

        for _ in 0..samples {
            let x = rng::vec_f32(truth.len(), 0.0, 1.0, false);
            let y = dot(truth, &x);

            inputs.push(x);
            targets.push(y);
        }

        Self { inputs, targets }
    }

    fn loss(&self, weights: &[f32]) -> f32 {
        let total: f32 =
            self.inputs.iter().zip(&self.targets).map(|(x, y)| (dot(weights, x) - y).powi(2)).sum();

        total / (2.0 * self.inputs.len() as f32)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Plain SGD on the mean-squared error of this device's shard. Each device
/// contributes `1 / devices` of the global mean gradient, so the reduced sum
/// is exactly the full-dataset gradient.
struct LsqSolver {
    params: Option<ParamsRef<CpuDevice>>,
    shard: Shard,
    num_weights: usize,
    num_devices: usize,
    lr: f32,
    iter: usize,
}

impl LsqSolver {
    fn new(shard: Shard, num_weights: usize, num_devices: usize, lr: f32) -> Self {
        Self { params: None, shard, num_weights, num_devices, lr, iter: 0 }
    }

    fn params(&self) -> &ParamsRef<CpuDevice> {
        self.params.as_ref().expect("solver not configured")
    }

    fn weights(&self) -> Vec<f32> {
        let params = self.params().borrow();
        let mut out = vec![0.0; params.size()];
        params.data().write_into_slice(&mut out, self.num_weights).unwrap();
        out
    }
}

impl Solver<CpuDevice> for LsqSolver {
    fn num_params(&self) -> usize {
        self.num_weights
    }

    fn configure(&mut self, params: ParamsRef<CpuDevice>) {
        self.params = Some(params);
    }

    fn iter(&self) -> usize {
        self.iter
    }

    fn set_iter(&mut self, iter: usize) {
        self.iter = iter;
    }

    fn forward_backward(&mut self) -> Result<(), <CpuDevice as Device>::DeviceError> {
        let weights = self.weights();

        let mut grad = vec![0.0; self.num_weights];
        for (x, &y) in self.shard.inputs.iter().zip(&self.shard.targets) {
            let err = dot(&weights, x) - y;

            for (g, &xi) in grad.iter_mut().zip(x) {
                *g += err * xi;
            }
        }

        let scale = 1.0 / (self.shard.inputs.len() * self.num_devices) as f32;
        for g in &mut grad {
            *g *= scale;
        }

        self.params().borrow_mut().diff_mut().load_from_slice(&grad)
    }

    fn apply_update(&mut self) -> Result<(), <CpuDevice as Device>::DeviceError> {
        let params = self.params().clone();
        let mut params = params.borrow_mut();
        let (data, diff) = params.split_mut();

        data.add(-self.lr, diff)
    }
}
