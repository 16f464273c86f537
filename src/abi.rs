//! The frozen binary interface between the host and a hermetic kernel (§4.2).
//!
//! Three invariants bind host and plugin, and this module is where they're encoded as types
//! rather than left as prose:
//!
//! 1. Hermeticity: `process` never allocates, performs I/O, or blocks. State lives between
//!    `init` and `teardown` only.
//! 2. Buffer layout: row-major, tightly packed `f32` samples; input/output do not alias unless
//!    `allow_in_place` is set.
//! 3. ABI version negotiation: the host's compile-time [`ABI_VERSION`] is authoritative. Plugins
//!    may tolerate a larger `struct_size` than their own (additive evolution, §9) but must refuse
//!    a version mismatch.
//!
//! The open question in §9 about the ABI version constant is resolved here: it is a single
//! `u32`, fixed at `1` for this host.

use std::os::raw::c_void;

/// The host's compile-time ABI version. A plugin's `init` must refuse to run if the
/// [`PluginConfig`] it receives carries a different value than the one it was built against.
pub const ABI_VERSION: u32 = 1;

/// Sample representation a plugin may advertise or require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SampleDtype {
    Float32 = 0,
    Q15 = 1,
    Q7 = 2,
}

impl SampleDtype {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "float32" => Some(Self::Float32),
            "q15" => Some(Self::Q15),
            "q7" => Some(Self::Q7),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Q15 => "q15",
            Self::Q7 => "q7",
        }
    }
}

bitflags::bitflags! {
    /// Capability bits reported by a plugin's [`PluginInitResult`]. Bit 0 is reserved for
    /// offline-calibration support, matching the presence of the optional `calibrate` symbol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PluginCapabilities: u32 {
        const OFFLINE_CALIBRATION = 1 << 0;
    }
}

/// Host-to-plugin configuration, passed by reference to `init`. The plugin must copy anything
/// it needs to retain past the call returning (§3, "Lifetime").
#[repr(C)]
pub struct PluginConfig {
    /// The host's ABI version. Must equal [`ABI_VERSION`] or the plugin must refuse to init.
    pub abi_version: u32,
    /// `size_of::<PluginConfig>()` on the host. Plugins built against an older, smaller layout
    /// may still load as long as the prefix fields they know about are unchanged (§4.2).
    pub struct_size: u32,
    pub sample_rate_hz: f64,
    /// Window length in samples (`W`).
    pub window_length_samples: u32,
    /// Hop length in samples (`H`).
    pub hop_samples: u32,
    /// Channel count (`C`).
    pub channels: u32,
    pub dtype: SampleDtype,
    pub allow_in_place: bool,
    /// Caller-owned parameter blob, typically `key=value` text (§4.8). Borrowed for the
    /// duration of the call only.
    pub kernel_params_ptr: *const u8,
    pub kernel_params_len: usize,
    /// Caller-owned calibration-state blob, if any. Borrowed for the duration of the call only.
    pub calibration_state_ptr: *const u8,
    pub calibration_state_len: usize,
}

impl PluginConfig {
    /// View the kernel parameter blob as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure the pointer/length pair still describes live memory; this holds
    /// for the duration of an `init` call made by the host.
    pub unsafe fn kernel_params(&self) -> &[u8] {
        if self.kernel_params_ptr.is_null() || self.kernel_params_len == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(self.kernel_params_ptr, self.kernel_params_len)
        }
    }

    /// View the calibration-state blob as a byte slice, if one was provided.
    ///
    /// # Safety
    ///
    /// Same caveat as [`Self::kernel_params`].
    pub unsafe fn calibration_state(&self) -> Option<&[u8]> {
        if self.calibration_state_ptr.is_null() || self.calibration_state_len == 0 {
            None
        } else {
            Some(std::slice::from_raw_parts(
                self.calibration_state_ptr,
                self.calibration_state_len,
            ))
        }
    }
}

/// Plugin-to-host result of `init`.
#[repr(C)]
pub struct PluginInitResult {
    /// Opaque handle owned by the plugin. Passed back unchanged on every subsequent call.
    pub handle: *mut c_void,
    /// Output window length in samples. Zero means "inherit the scheduler's `W`" (§4.4).
    pub output_window_length_samples: u32,
    /// Output channel count. Zero means "inherit the scheduler's `C`".
    pub output_channels: u32,
    pub capabilities: PluginCapabilities,
}

/// Function pointer types resolved from the dynamic library (§4.1).
pub type InitFn =
    unsafe extern "C" fn(config: *const PluginConfig) -> PluginInitResult;
pub type ProcessFn =
    unsafe extern "C" fn(handle: *mut c_void, input: *const f32, output: *mut f32);
pub type TeardownFn = unsafe extern "C" fn(handle: *mut c_void);
/// Optional. Presence implies [`PluginCapabilities::OFFLINE_CALIBRATION`] (§4.1).
pub type CalibrateFn = unsafe extern "C" fn(
    config: *const PluginConfig,
    training_data: *const f32,
    num_windows: u32,
    out_state_len: *mut usize,
) -> *mut u8;

/// The three-or-four function bundle resolved from a kernel library.
pub struct PluginApi {
    pub init: InitFn,
    pub process: ProcessFn,
    pub teardown: TeardownFn,
    pub calibrate: Option<CalibrateFn>,
}

/// 4-byte little-endian magic identifying a calibration-state file: `CORT` (§6).
pub const CALIBRATION_MAGIC: [u8; 4] = *b"CORT";

/// Calibration-state payloads above this size are rejected outright (§6).
pub const CALIBRATION_MAX_PAYLOAD_BYTES: u32 = 256 * 1024 * 1024;

/// Parsed on-disk calibration-state file (§6): magic, ABI version, plugin-specific
/// state-version, and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationState {
    pub state_version: u32,
    pub payload: Vec<u8>,
}

impl CalibrationState {
    /// Serialize to the on-disk format described in §6: magic, ABI version, state version,
    /// payload length, then the payload bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.payload.len());
        out.extend_from_slice(&CALIBRATION_MAGIC);
        out.extend_from_slice(&ABI_VERSION.to_le_bytes());
        out.extend_from_slice(&self.state_version.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse and validate the on-disk format, rejecting wrong magic, wrong ABI version,
    /// truncated header/payload, and oversized payloads (§6).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, crate::error::CortexError> {
        use crate::error::CortexError;

        if bytes.len() < 16 {
            return Err(CortexError::InvalidCalibrationState {
                path: Default::default(),
                reason: "truncated header".into(),
            });
        }

        let magic = &bytes[0..4];
        if magic != CALIBRATION_MAGIC {
            return Err(CortexError::InvalidCalibrationState {
                path: Default::default(),
                reason: format!("bad magic {magic:02x?}"),
            });
        }

        let abi_version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if abi_version != ABI_VERSION {
            return Err(CortexError::InvalidCalibrationState {
                path: Default::default(),
                reason: format!("ABI version mismatch: host={ABI_VERSION}, file={abi_version}"),
            });
        }

        let state_version = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let payload_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap());

        if payload_len > CALIBRATION_MAX_PAYLOAD_BYTES {
            return Err(CortexError::InvalidCalibrationState {
                path: Default::default(),
                reason: format!(
                    "payload size {payload_len} exceeds cap {CALIBRATION_MAX_PAYLOAD_BYTES}"
                ),
            });
        }

        let payload_start = 16usize;
        let payload_end = payload_start
            .checked_add(payload_len as usize)
            .ok_or_else(|| CortexError::InvalidCalibrationState {
                path: Default::default(),
                reason: "payload length overflow".into(),
            })?;
        if bytes.len() < payload_end {
            return Err(CortexError::InvalidCalibrationState {
                path: Default::default(),
                reason: "truncated payload".into(),
            });
        }

        Ok(Self {
            state_version,
            payload: bytes[payload_start..payload_end].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_save_and_load() {
        let state = CalibrationState {
            state_version: 7,
            payload: vec![1, 2, 3, 4, 5],
        };
        let bytes = state.to_bytes();
        let loaded = CalibrationState::from_bytes(&bytes).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = CalibrationState {
            state_version: 1,
            payload: vec![],
        }
        .to_bytes();
        bytes[0..4].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(CalibrationState::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_truncated_payload() {
        let bytes = CalibrationState {
            state_version: 1,
            payload: vec![1, 2, 3],
        }
        .to_bytes();
        let truncated = &bytes[..bytes.len() - 1];
        assert!(CalibrationState::from_bytes(truncated).is_err());
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(CalibrationState::from_bytes(&[0, 1, 2]).is_err());
    }

    #[test]
    fn rejects_oversized_payload_claim() {
        let mut bytes = vec![0u8; 16];
        bytes[0..4].copy_from_slice(&CALIBRATION_MAGIC);
        bytes[4..8].copy_from_slice(&ABI_VERSION.to_le_bytes());
        bytes[12..16].copy_from_slice(&(CALIBRATION_MAX_PAYLOAD_BYTES + 1).to_le_bytes());
        assert!(CalibrationState::from_bytes(&bytes).is_err());
    }

    #[test]
    fn dtype_round_trips_from_str() {
        assert_eq!(SampleDtype::parse("float32"), Some(SampleDtype::Float32));
        assert_eq!(SampleDtype::parse("q15"), Some(SampleDtype::Q15));
        assert_eq!(SampleDtype::parse("bogus"), None);
    }
}
