use std::sync::Arc;

use super::{Device, DeviceBuffer};

#[derive(Debug)]
pub struct CpuError;

/// A host-memory device, identified by an integer id so that arbitrary
/// device counts can be simulated on one machine.
#[derive(Debug)]
pub struct CpuDevice {
    id: usize,
}

pub struct CpuBuffer<T> {
    buf: Vec<T>,
    device: Arc<CpuDevice>,
}

impl<T: Copy + Default + Send + Sync + std::ops::AddAssign<T> + std::ops::Mul<Output = T>> DeviceBuffer<CpuDevice, T>
    for CpuBuffer<T>
{
    type BufferError = CpuError;

    fn new(device: Arc<CpuDevice>, size: usize) -> Result<Self, CpuError> {
        Ok(Self { buf: vec![T::default(); size], device })
    }

    fn size(&self) -> usize {
        self.buf.len()
    }

    fn device(&self) -> Arc<CpuDevice> {
        self.device.clone()
    }

    fn set_zero(&mut self) -> Result<(), CpuError> {
        for elem in &mut self.buf {
            *elem = T::default();
        }

        Ok(())
    }

    fn load_from_device(&mut self, buf: &Self, num: usize) -> Result<(), CpuError> {
        if num > self.buf.len() || num > buf.buf.len() {
            return Err(CpuError);
        }

        self.buf[..num].copy_from_slice(&buf.buf[..num]);
        Ok(())
    }

    fn load_from_slice(&mut self, buf: &[T]) -> Result<(), CpuError> {
        if buf.len() > self.buf.len() {
            return Err(CpuError);
        }

        self.buf[..buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn write_into_slice(&self, buf: &mut [T], num: usize) -> Result<(), CpuError> {
        if num > self.buf.len() || num > buf.len() {
            return Err(CpuError);
        }

        buf[..num].copy_from_slice(&self.buf[..num]);
        Ok(())
    }

    fn add(&mut self, alpha: T, buf: &Self) -> Result<(), CpuError> {
        if buf.buf.len() != self.buf.len() {
            return Err(CpuError);
        }

        for (elem, &rhs) in self.buf.iter_mut().zip(buf.buf.iter()) {
            *elem += alpha * rhs;
        }

        Ok(())
    }
}

impl Device for CpuDevice {
    type IdType = usize;
    type DeviceError = CpuError;
    type BufferF32 = CpuBuffer<f32>;

    fn new(id: usize) -> Result<Self, CpuError> {
        Ok(Self { id })
    }

    fn id(&self) -> usize {
        self.id
    }

    fn synchronise(&self) -> Result<(), CpuError> {
        Ok(())
    }
}
