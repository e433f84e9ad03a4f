use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    device::{Device, DeviceBuffer},
    solver::Solver,
};

/// All trainable parameter values (`data`) and gradient accumulators (`diff`)
/// for one model, each held in a single contiguous allocation on one device so
/// that bulk copy and reduce operations address the whole model in one
/// transfer.
///
/// The size is fixed at construction from the reference solver and never
/// changes. Deliberately not `Clone`: the buffer's identity is tied to its
/// physical allocation.
pub struct DeviceParams<D: Device> {
    size: usize,
    data: D::BufferF32,
    diff: D::BufferF32,
}

impl<D: Device> DeviceParams<D> {
    pub fn new(device: Arc<D>, size: usize) -> Result<Self, D::DeviceError> {
        let data = D::BufferF32::new(device.clone(), size)?;
        let diff = D::BufferF32::new(device, size)?;

        Ok(Self { size, data, diff })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn device(&self) -> Arc<D> {
        self.data.device()
    }

    pub fn data(&self) -> &D::BufferF32 {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut D::BufferF32 {
        &mut self.data
    }

    pub fn diff(&self) -> &D::BufferF32 {
        &self.diff
    }

    pub fn diff_mut(&mut self) -> &mut D::BufferF32 {
        &mut self.diff
    }

    /// Split borrow for update rules that read `diff` while writing `data`.
    pub fn split_mut(&mut self) -> (&mut D::BufferF32, &D::BufferF32) {
        (&mut self.data, &self.diff)
    }

    /// Bulk copy of another node's parameter values into ours (the broadcast
    /// edge operation).
    pub fn load_data_from(&mut self, other: &Self) -> Result<(), D::DeviceError> {
        self.data.load_from_device(&other.data, self.size)
    }

    /// Copy another node's gradients into `staging` (a buffer resident on our
    /// device) and accumulate them into our own `diff` (the reduce edge
    /// operation). The caller is the sole writer of both destinations.
    pub fn accumulate_diff_from(&mut self, staging: &mut D::BufferF32, other: &Self) -> Result<(), D::DeviceError> {
        staging.load_from_device(&other.diff, self.size)?;
        self.diff.add(1.0, staging)
    }
}

/// Shared handle to a node's `DeviceParams`.
///
/// Borrows assert rather than block: the synchronisation protocol guarantees
/// that no two threads ever access the same params concurrently, so contention
/// here is a protocol violation.
pub struct ParamsRef<D: Device> {
    inner: Arc<RwLock<DeviceParams<D>>>,
}

impl<D: Device> Clone for ParamsRef<D> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<D: Device> ParamsRef<D> {
    pub fn new(params: DeviceParams<D>) -> Self {
        Self { inner: Arc::new(RwLock::new(params)) }
    }

    /// Allocates params on `device` sized from the reference solver's total
    /// parameter element count.
    pub fn from_solver<S: Solver<D>>(device: Arc<D>, solver: &S) -> Result<Self, D::DeviceError> {
        DeviceParams::new(device, solver.num_params()).map(Self::new)
    }

    pub fn borrow(&self) -> RwLockReadGuard<'_, DeviceParams<D>> {
        self.inner.try_read().unwrap()
    }

    pub fn borrow_mut(&self) -> RwLockWriteGuard<'_, DeviceParams<D>> {
        self.inner.try_write().unwrap()
    }

    pub fn size(&self) -> usize {
        self.borrow().size()
    }

    /// Re-aliases `solver`'s parameter and gradient storage onto this shared
    /// region. After this the solver reads and writes values through the
    /// handle directly, so its step logic needs no copy in or out.
    pub fn configure<S: Solver<D>>(&self, solver: &mut S) {
        assert_eq!(solver.num_params(), self.size(), "solver does not match reference parameter count");
        solver.configure(self.clone());
    }
}
