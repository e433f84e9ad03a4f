use crate::{device::Device, params::ParamsRef, sync::SyncError};

/// The narrow slice of an optimiser that the synchronisation engines drive.
///
/// Implementations own the training-step logic (forward/backward, learning
/// rate schedule, checkpointing); the engines only size buffers from
/// `num_params`, re-alias storage through `configure`, and decide when
/// `forward_backward` and `apply_update` run.
pub trait Solver<D: Device>: Send {
    /// Total element count over every trainable parameter tensor.
    fn num_params(&self) -> usize;

    /// Re-aliases this solver's parameter/gradient storage onto the shared
    /// region. Called once per node before the run starts.
    fn configure(&mut self, params: ParamsRef<D>);

    fn iter(&self) -> usize;

    fn set_iter(&mut self, iter: usize);

    /// Restores solver state from a checkpoint path, passed through
    /// unmodified by the engines.
    fn restore(&mut self, _path: &str) -> Result<(), D::DeviceError> {
        Ok(())
    }

    /// Runs one step's gradient computation, accumulating into the shared
    /// `diff` buffer.
    fn forward_backward(&mut self) -> Result<(), D::DeviceError>;

    /// Applies the solver's own update rule to `data` using the gradients in
    /// `diff`. The engines invoke this at exactly one point per step.
    fn apply_update(&mut self) -> Result<(), D::DeviceError>;
}

/// The two hooks a synchronisation engine injects into each training step.
pub trait Synchronizer<D: Device, S: Solver<D>> {
    /// Invoked before a step begins. Blocks until the node may proceed.
    fn on_start(&mut self, solver: &mut S) -> Result<(), SyncError<D>>;

    /// Invoked once the step's local gradients are complete. Blocks until the
    /// node's contribution has been combined.
    fn on_gradients_ready(&mut self, solver: &mut S) -> Result<(), SyncError<D>>;
}

/// Drives one synchronous training step, invoking the hooks at the two
/// prescribed points.
pub fn step<D: Device, S: Solver<D>, C: Synchronizer<D, S>>(
    solver: &mut S,
    sync: &mut C,
) -> Result<(), SyncError<D>> {
    sync.on_start(solver)?;

    solver.forward_backward().map_err(SyncError::Device)?;

    sync.on_gradients_ready(solver)?;

    solver.set_iter(solver.iter() + 1);

    Ok(())
}
