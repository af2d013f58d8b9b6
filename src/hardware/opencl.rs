//! OpenCL driver presence detection

use libloading::Library;
use std::path::Path;
use tracing::debug;

/// Vendor partitions where Android ships the OpenCL ICD
const ANDROID_OPENCL_PATHS: &[&str] = &[
    "/vendor/lib64/libOpenCL.so",
    "/system/vendor/lib64/libOpenCL.so",
    "/system/lib64/libOpenCL.so",
    "/vendor/lib/libOpenCL.so",
];

#[cfg(target_os = "windows")]
const LOADER_NAMES: &[&str] = &["OpenCL.dll"];
#[cfg(target_os = "macos")]
const LOADER_NAMES: &[&str] = &["/System/Library/Frameworks/OpenCL.framework/OpenCL"];
#[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
const LOADER_NAMES: &[&str] = &["libOpenCL.so.1", "libOpenCL.so"];

/// Whether an OpenCL driver can be found, without loading any model.
///
/// Checks the well-known vendor paths first, then asks the dynamic loader.
pub fn is_opencl_library_present() -> bool {
    if let Some(path) = ANDROID_OPENCL_PATHS.iter().find(|p| Path::new(p).exists()) {
        debug!("OpenCL driver found at {}", path);
        return true;
    }

    let found = LOADER_NAMES
        .iter()
        .any(|name| unsafe { Library::new(name) }.is_ok());
    debug!("OpenCL driver on loader search path: {}", found);
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_does_not_panic() {
        let _ = is_opencl_library_present();
    }
}
