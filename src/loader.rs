//! Resolves a kernel library from a spec URI, binds the ABI symbol set, and enforces version
//! negotiation (§4.1).
//!
//! The loader owns the [`libloading::Library`] handle and must outlive any use of its symbols;
//! the orchestrator's contract (§4.1, "Lifetime") is that the scheduler (which calls `teardown`
//! through [`PluginHandle`]'s `Drop`) is destroyed *before* the library is unloaded. We encode
//! that ordering by having [`PluginHandle`] hold a strong reference to the loaded [`Library`]
//! directly, the same pattern used by the pack's native-plugin loaders (e.g. the `OpenRacing`
//! plugin host) for binding C ABI symbols out of a `cdylib`.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::{Library, Symbol};

use crate::abi::{
    CalibrateFn, InitFn, PluginApi, PluginConfig, PluginInitResult, ProcessFn, TeardownFn,
    ABI_VERSION,
};
use crate::error::{CortexError, CortexResult};
use crate::{cortex_error, cortex_log};

/// Resolve a library path from a spec URI of the form `<dir>/<name>@<dtype>` (§4.1), appending
/// the platform dynamic-library prefix/suffix. Rejects URIs with `..` components so a config
/// file cannot escape the primitives root.
pub fn resolve_library_path(root: &Path, spec_uri: &str) -> CortexResult<PathBuf> {
    if spec_uri.split('/').any(|component| component == "..") {
        return Err(CortexError::Configuration(format!(
            "spec URI '{spec_uri}' escapes the primitives root"
        )));
    }

    let (dir_part, name_dtype) = spec_uri
        .rsplit_once('/')
        .map(|(dir, rest)| (Some(dir), rest))
        .unwrap_or((None, spec_uri));
    let name = name_dtype
        .split_once('@')
        .map(|(name, _dtype)| name)
        .unwrap_or(name_dtype);

    let file_name = platform_library_name(name);

    let mut path = root.to_path_buf();
    if let Some(dir_part) = dir_part {
        path.push(dir_part);
    }
    path.push(file_name);
    Ok(path)
}

#[cfg(target_os = "macos")]
fn platform_library_name(name: &str) -> String {
    format!("lib{name}.dylib")
}

#[cfg(not(target_os = "macos"))]
fn platform_library_name(name: &str) -> String {
    format!("lib{name}.so")
}

/// A loaded kernel library and its bound ABI symbol table. The library handle is kept alive for
/// as long as any [`PluginHandle`] created from it exists.
pub struct LoadedPlugin {
    library: Arc<Library>,
    api: PluginApi,
}

impl LoadedPlugin {
    /// Open the library at `path`, bind the mandatory symbols, and bind `calibrate` if present.
    /// Does not call `init`; that happens in [`Self::initialize`] so the caller can decide when
    /// to commit to running the plugin.
    pub fn load(plugin_name: &str, path: &Path) -> CortexResult<Self> {
        let library = unsafe { Library::new(path) }.map_err(|err| CortexError::LoadFailure {
            plugin: plugin_name.to_string(),
            reason: format!("could not open library {path:?}: {err}"),
        })?;

        let init: Symbol<InitFn> = unsafe { library.get(b"init\0") }.map_err(|err| {
            CortexError::LoadFailure {
                plugin: plugin_name.to_string(),
                reason: format!("missing symbol 'init': {err}"),
            }
        })?;
        let process: Symbol<ProcessFn> = unsafe { library.get(b"process\0") }.map_err(|err| {
            CortexError::LoadFailure {
                plugin: plugin_name.to_string(),
                reason: format!("missing symbol 'process': {err}"),
            }
        })?;
        let teardown: Symbol<TeardownFn> =
            unsafe { library.get(b"teardown\0") }.map_err(|err| CortexError::LoadFailure {
                plugin: plugin_name.to_string(),
                reason: format!("missing symbol 'teardown': {err}"),
            })?;
        let calibrate: Option<Symbol<CalibrateFn>> = unsafe { library.get(b"calibrate\0") }.ok();

        if calibrate.is_some() {
            cortex_log!("plugin '{plugin_name}' advertises offline-calibration support");
        }

        let api = PluginApi {
            init: *init,
            process: *process,
            teardown: *teardown,
            calibrate: calibrate.map(|sym| *sym),
        };

        Ok(Self {
            library: Arc::new(library),
            api,
        })
    }

    /// Call `init` and enforce ABI version negotiation (§4.2). Returns a [`PluginHandle`] that
    /// owns the plugin's opaque state and a reference to the library keeping it alive.
    pub fn initialize(&self, plugin_name: &str, config: &PluginConfig) -> CortexResult<PluginHandle> {
        if config.abi_version != ABI_VERSION {
            return Err(CortexError::LoadFailure {
                plugin: plugin_name.to_string(),
                reason: format!(
                    "ABI version mismatch: host={ABI_VERSION}, config={}",
                    config.abi_version
                ),
            });
        }

        let result: PluginInitResult = unsafe { (self.api.init)(config as *const PluginConfig) };
        if result.handle.is_null() {
            return Err(CortexError::LoadFailure {
                plugin: plugin_name.to_string(),
                reason: "init returned a null handle".into(),
            });
        }

        Ok(PluginHandle {
            name: plugin_name.to_string(),
            library: self.library.clone(),
            handle: result.handle,
            process: self.api.process,
            teardown: self.api.teardown,
            output_window_length_samples: result.output_window_length_samples,
            output_channels: result.output_channels,
            capabilities: result.capabilities,
            torn_down: false,
        })
    }

    pub fn calibrate(
        &self,
        config: &PluginConfig,
        training_data: &[f32],
        num_windows: u32,
    ) -> Option<Vec<u8>> {
        let calibrate = self.api.calibrate?;
        let mut out_len: usize = 0;
        let ptr = unsafe {
            calibrate(
                config as *const PluginConfig,
                training_data.as_ptr(),
                num_windows,
                &mut out_len as *mut usize,
            )
        };
        if ptr.is_null() || out_len == 0 {
            None
        } else {
            // SAFETY: the plugin promises `ptr` is valid for `out_len` bytes and that ownership
            // transfers to the host, which is why `calibrate` is the one place in the ABI where
            // allocation on the plugin side is permitted (§4.2).
            Some(unsafe { std::slice::from_raw_parts(ptr, out_len) }.to_vec())
        }
    }
}

/// An initialized plugin instance. Calls `teardown` on drop and keeps the owning library alive
/// until that happens, which is what makes the loader-before-unload ordering contract (§4.1)
/// hold even if callers don't sequence things perfectly themselves.
pub struct PluginHandle {
    name: String,
    library: Arc<Library>,
    handle: *mut c_void,
    process: ProcessFn,
    teardown: TeardownFn,
    output_window_length_samples: u32,
    output_channels: u32,
    capabilities: crate::abi::PluginCapabilities,
    torn_down: bool,
}

// The host serializes all access to a single scheduler's plugins on one thread (§5); the raw
// pointer itself is only ever touched from there.
unsafe impl Send for PluginHandle {}

impl PluginHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_window_length_samples(&self) -> u32 {
        self.output_window_length_samples
    }

    pub fn output_channels(&self) -> u32 {
        self.output_channels
    }

    pub fn capabilities(&self) -> crate::abi::PluginCapabilities {
        self.capabilities
    }

    /// Call into the plugin's `process` function. `process` is void-returning by ABI contract
    /// (§4.2, §9): misbehaviour cannot be observed here, only its effect on timing.
    ///
    /// # Safety
    ///
    /// `input` and `output` must each have the lengths the plugin was initialized with.
    #[inline]
    pub unsafe fn process(&mut self, input: &[f32], output: &mut [f32]) {
        (self.process)(self.handle, input.as_ptr(), output.as_mut_ptr());
    }

    /// Explicitly tear down the plugin. Idempotent; also called from `Drop`.
    pub fn teardown(&mut self) {
        if !self.torn_down {
            unsafe { (self.teardown)(self.handle) };
            self.torn_down = true;
        }
    }
}

impl Drop for PluginHandle {
    fn drop(&mut self) {
        self.teardown();
        if Arc::strong_count(&self.library) == 1 {
            cortex_error!("dropping the last handle referencing '{}'s library", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_escape() {
        let err = resolve_library_path(Path::new("/opt/cortex/kernels"), "../evil/lib@float32");
        assert!(err.is_err());
    }

    #[test]
    fn composes_platform_library_name() {
        let path =
            resolve_library_path(Path::new("/opt/cortex/kernels"), "noop/noop@float32").unwrap();
        let file_name = path.file_name().unwrap().to_str().unwrap();
        assert!(file_name.starts_with("libnoop"));
    }

    #[test]
    fn strips_dtype_suffix_without_directory() {
        let path = resolve_library_path(Path::new("/opt/cortex/kernels"), "noop@q15").unwrap();
        assert_eq!(path, Path::new("/opt/cortex/kernels").join(platform_library_name("noop")));
    }
}
