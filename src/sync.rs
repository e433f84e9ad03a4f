pub mod collective;
pub mod pair;
pub mod tree;

use crate::device::Device;

/// Iteration schedule and device list for a synchronous run.
#[derive(Clone, Debug)]
pub struct RunConfig<I> {
    pub devices: Vec<I>,
    pub steps: usize,
}

#[derive(Debug)]
pub enum TopologyError {
    EmptyDeviceList,
    DuplicateDevice,
}

#[derive(Debug)]
pub enum GroupFormationError {
    EmptyGroup,
    RankOutOfRange,
    WorldSizeMismatch,
}

/// Every condition here is fatal to the run: a synchronous step either fully
/// completes across all participants or the run terminates. Nothing is
/// retried.
pub enum SyncError<D: Device> {
    Device(D::DeviceError),
    Topology(TopologyError),
    Group(GroupFormationError),
    /// Participants presented differently sized buffers to one collective op.
    MismatchedBufferSizes,
    /// A peer worker terminated before completing the step rendezvous.
    PeerDisconnected,
}

// manual impl so that `D` itself need not be `Debug`, only its error type
impl<D: Device> std::fmt::Debug for SyncError<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device(err) => f.debug_tuple("Device").field(err).finish(),
            Self::Topology(err) => f.debug_tuple("Topology").field(err).finish(),
            Self::Group(err) => f.debug_tuple("Group").field(err).finish(),
            Self::MismatchedBufferSizes => write!(f, "MismatchedBufferSizes"),
            Self::PeerDisconnected => write!(f, "PeerDisconnected"),
        }
    }
}

impl<D: Device> From<TopologyError> for SyncError<D> {
    fn from(value: TopologyError) -> Self {
        Self::Topology(value)
    }
}

impl<D: Device> From<GroupFormationError> for SyncError<D> {
    fn from(value: GroupFormationError) -> Self {
        Self::Group(value)
    }
}
