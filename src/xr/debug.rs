// OpenXR debug-utils messenger
//
// Routes runtime and layer messages into `log` at the level of the highest
// severity bit set on the message.

use anyhow::{Context, Result};
use openxr as xr;
use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::ptr;

use xr::sys::{DebugUtilsMessageSeverityFlagsEXT as Severity, DebugUtilsMessageTypeFlagsEXT as MessageType};

/// Comma-joined severity names, lowest first
pub fn severity_string(severity: Severity) -> String {
    join_flags(&[
        (severity.contains(Severity::VERBOSE), "VERBOSE"),
        (severity.contains(Severity::INFO), "INFO"),
        (severity.contains(Severity::WARNING), "WARN"),
        (severity.contains(Severity::ERROR), "ERROR"),
    ])
}

pub fn type_string(types: MessageType) -> String {
    join_flags(&[
        (types.contains(MessageType::GENERAL), "GEN"),
        (types.contains(MessageType::VALIDATION), "SPEC"),
        (types.contains(MessageType::PERFORMANCE), "PERF"),
    ])
}

fn join_flags(flags: &[(bool, &str)]) -> String {
    flags
        .iter()
        .filter(|(set, _)| *set)
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join(",")
}

pub fn format_message(
    function: &str,
    severity: Severity,
    types: MessageType,
    message_id: &str,
    message: &str,
) -> String {
    format!(
        "{}({} / {}): msgNum: {} - {}",
        function,
        severity_string(severity),
        type_string(types),
        message_id,
        message
    )
}

pub fn log_level(severity: Severity) -> log::Level {
    if severity.contains(Severity::ERROR) {
        log::Level::Error
    } else if severity.contains(Severity::WARNING) {
        log::Level::Warn
    } else if severity.contains(Severity::INFO) {
        log::Level::Info
    } else {
        log::Level::Debug
    }
}

unsafe fn lossy(s: *const c_char) -> String {
    if s.is_null() {
        String::new()
    } else {
        CStr::from_ptr(s).to_string_lossy().into_owned()
    }
}

unsafe extern "system" fn debug_callback(
    severity: Severity,
    types: MessageType,
    callback_data: *const xr::sys::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> xr::sys::Bool32 {
    if let Some(data) = callback_data.as_ref() {
        let text = format_message(
            &lossy(data.function_name),
            severity,
            types,
            &lossy(data.message_id),
            &lossy(data.message),
        );
        log::log!(target: "openxr", log_level(severity), "{}", text);
    }
    xr::sys::FALSE
}

pub struct DebugMessenger {
    instance: xr::Instance,
    messenger: xr::sys::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    /// Create a messenger for every severity and type; the instance must have
    /// been created with XR_EXT_debug_utils
    pub fn new(instance: &xr::Instance) -> Result<Self> {
        let ext = instance
            .exts()
            .ext_debug_utils
            .as_ref()
            .context("XR_EXT_debug_utils is not enabled on this instance")?;

        let create_info = xr::sys::DebugUtilsMessengerCreateInfoEXT {
            ty: xr::sys::DebugUtilsMessengerCreateInfoEXT::TYPE,
            next: ptr::null(),
            message_severities: Severity::VERBOSE
                | Severity::INFO
                | Severity::WARNING
                | Severity::ERROR,
            message_types: MessageType::GENERAL
                | MessageType::VALIDATION
                | MessageType::PERFORMANCE
                | MessageType::CONFORMANCE,
            user_callback: Some(debug_callback),
            user_data: ptr::null_mut(),
        };

        let mut messenger = xr::sys::DebugUtilsMessengerEXT::NULL;
        let result = unsafe {
            (ext.create_debug_utils_messenger)(instance.as_raw(), &create_info, &mut messenger)
        };
        if result.into_raw() < 0 {
            anyhow::bail!("Failed to create OpenXR debug messenger: {}", result);
        }
        log::debug!("OpenXR debug messenger created");

        Ok(Self {
            instance: instance.clone(),
            messenger,
        })
    }
}

impl Drop for DebugMessenger {
    fn drop(&mut self) {
        if let Some(ext) = self.instance.exts().ext_debug_utils.as_ref() {
            let result = unsafe { (ext.destroy_debug_utils_messenger)(self.messenger) };
            if result.into_raw() < 0 {
                log::warn!("Failed to destroy OpenXR debug messenger: {}", result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severities_are_joined_lowest_first() {
        assert_eq!(severity_string(Severity::WARNING | Severity::INFO), "INFO,WARN");
        assert_eq!(severity_string(Severity::ERROR), "ERROR");
        assert_eq!(severity_string(Severity::EMPTY), "");
    }

    #[test]
    fn validation_type_reads_as_spec() {
        assert_eq!(
            type_string(MessageType::GENERAL | MessageType::VALIDATION | MessageType::PERFORMANCE),
            "GEN,SPEC,PERF"
        );
        assert_eq!(type_string(MessageType::CONFORMANCE), "");
    }

    #[test]
    fn message_layout() {
        let text = format_message(
            "xrCreateSession",
            Severity::ERROR,
            MessageType::VALIDATION,
            "VUID-xrCreateSession-next",
            "bad chain",
        );
        assert_eq!(
            text,
            "xrCreateSession(ERROR / SPEC): msgNum: VUID-xrCreateSession-next - bad chain"
        );
    }

    #[test]
    fn highest_severity_picks_the_level() {
        assert_eq!(log_level(Severity::VERBOSE), log::Level::Debug);
        assert_eq!(log_level(Severity::INFO | Severity::WARNING), log::Level::Warn);
        assert_eq!(log_level(Severity::VERBOSE | Severity::ERROR), log::Level::Error);
    }
}
