/// Contains the `Device` and `DeviceBuffer` APIs, plus the simulated CPU backend.
pub mod device;
/// ANSI colour logging utilities for reporting run progress.
pub mod logger;
/// Contains the contiguous parameter/gradient buffers shared between devices.
pub mod params;
/// Random vector generation for weight initialisation and group identifiers.
pub mod rng;
/// Contains the `Solver` and `Synchronizer` capability traits and the step driver.
pub mod solver;
/// Contains the tree and collective synchronisation engines.
pub mod sync;
