pub mod cpu;

use std::{fmt::Debug, sync::Arc};

/// A contiguous allocation on a device, addressable as a whole for bulk
/// copy and accumulate operations.
pub trait DeviceBuffer<D, T>: Sized + Send + Sync {
    type BufferError;

    fn new(device: Arc<D>, size: usize) -> Result<Self, Self::BufferError>;

    fn size(&self) -> usize;

    fn device(&self) -> Arc<D>;

    fn set_zero(&mut self) -> Result<(), Self::BufferError>;

    fn load_from_device(&mut self, buf: &Self, num: usize) -> Result<(), Self::BufferError>;

    fn load_from_slice(&mut self, buf: &[T]) -> Result<(), Self::BufferError>;

    fn write_into_slice(&self, buf: &mut [T], num: usize) -> Result<(), Self::BufferError>;

    /// `self[i] += alpha * buf[i]` over the whole buffer.
    fn add(&mut self, alpha: T, buf: &Self) -> Result<(), Self::BufferError>;
}

pub trait Device: Sized + Send + Sync + 'static {
    type IdType: Copy + PartialEq + Debug + Send + Sync;
    type DeviceError: Debug + Send;
    type BufferF32: DeviceBuffer<Self, f32, BufferError = Self::DeviceError>;

    fn new(id: Self::IdType) -> Result<Self, Self::DeviceError>;

    fn id(&self) -> Self::IdType;

    fn synchronise(&self) -> Result<(), Self::DeviceError>;
}
