use super::TopologyError;

/// A parent/device edge in the reduction tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DevicePair<I> {
    parent: I,
    device: I,
}

impl<I: Copy> DevicePair<I> {
    pub fn new(parent: I, device: I) -> Self {
        Self { parent, device }
    }

    pub fn parent(&self) -> I {
        self.parent
    }

    pub fn device(&self) -> I {
        self.device
    }
}

/// Groups devices into a spanning binary tree by repeatedly halving the list,
/// pairing device `i` with device `i + half`. Index adjacency approximates
/// physical proximity (same socket or switch), and halving keeps the tree at
/// logarithmic depth. An odd leftover is carried forward unpaired; the sole
/// survivor, `devices[0]`, is the root.
pub fn compute<I: Copy + PartialEq>(devices: &[I]) -> Result<Vec<DevicePair<I>>, TopologyError> {
    if devices.is_empty() {
        return Err(TopologyError::EmptyDeviceList);
    }

    for (i, device) in devices.iter().enumerate() {
        if devices[..i].contains(device) {
            return Err(TopologyError::DuplicateDevice);
        }
    }

    let mut pairs = Vec::with_capacity(devices.len() - 1);
    let mut remaining = devices.to_vec();

    while remaining.len() > 1 {
        let half = remaining.len().div_ceil(2);

        for i in 0..remaining.len() - half {
            pairs.push(DevicePair::new(remaining[i], remaining[i + half]));
        }

        remaining.truncate(half);
    }

    Ok(pairs)
}

/// Number of reduction levels for `num_devices` participants.
pub fn depth(num_devices: usize) -> u32 {
    if num_devices <= 1 {
        return 0;
    }

    usize::BITS - (num_devices - 1).leading_zeros()
}
