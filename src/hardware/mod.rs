//! Hardware probing for backend selection
//!
//! Classifies the GPU vendor from platform identifiers, decides the backend
//! preference through a policy table, and recommends context sizes per device.

mod opencl;
mod policy;
mod probe;
pub mod properties;
mod tuning;

pub use opencl::is_opencl_library_present;
pub use policy::{BackendPolicy, DeviceRule, PolicyError};
pub use probe::{classify_vendor, GpuVendor, HardwareProbe, HardwareProfile};
pub use properties::{PlatformProperties, StaticProperties, SystemProperties};
pub use tuning::DeviceTuning;
