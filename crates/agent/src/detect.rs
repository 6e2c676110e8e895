use framehook_core::{log_debug, log_info, AgentSettings, CaptureError, Direct3DVersion};
use std::time::{Duration, Instant};

/// Runtime modules that identify a Direct3D version, newest first.
pub const KNOWN_MODULES: [(&str, Direct3DVersion); 4] = [
    ("d3d11.dll", Direct3DVersion::Direct3D11),
    ("d3d10_1.dll", Direct3DVersion::Direct3D10_1),
    ("d3d10.dll", Direct3DVersion::Direct3D10),
    ("d3d9.dll", Direct3DVersion::Direct3D9),
];

pub trait ModuleProbe: Send + Sync {
    fn is_loaded(&self, module: &str) -> bool;
}

/// Polls for known modules every `poll` until one appears or `timeout` passes.
pub fn detect_version(probe: &dyn ModuleProbe, poll: Duration, timeout: Duration) -> Option<Direct3DVersion> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some((module, version)) = KNOWN_MODULES.iter().find(|(module, _)| probe.is_loaded(module)) {
            log_debug!("Found {} in target process", module);
            return Some(*version);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(poll);
    }
}

/// Trusts an explicit version, otherwise auto-detects.
pub fn resolve_version(
    configured: Direct3DVersion,
    probe: &dyn ModuleProbe,
    settings: &AgentSettings,
) -> Result<Direct3DVersion, CaptureError> {
    if !configured.needs_detection() {
        return Ok(configured);
    }

    match detect_version(probe, settings.detect_poll, settings.detect_timeout) {
        Some(version) => {
            log_info!("Auto-detected {}", version);
            Ok(version)
        }
        None => Err(CaptureError::Configuration(
            "no Direct3D runtime found in target process".into(),
        )),
    }
}

#[cfg(windows)]
pub struct LoadedModules;

#[cfg(windows)]
impl ModuleProbe for LoadedModules {
    fn is_loaded(&self, module: &str) -> bool {
        use windows::core::PCWSTR;
        use windows::Win32::System::LibraryLoader::GetModuleHandleW;

        let wide: Vec<u16> = module.encode_utf16().chain(std::iter::once(0)).collect();
        unsafe { GetModuleHandleW(PCWSTR(wide.as_ptr())) }.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    struct FakeModules {
        loaded: Mutex<HashSet<&'static str>>,
        checks: Mutex<usize>,
        load_after: Option<(usize, &'static str)>,
    }

    impl FakeModules {
        fn with(modules: &[&'static str]) -> Self {
            Self {
                loaded: Mutex::new(modules.iter().copied().collect()),
                checks: Mutex::new(0),
                load_after: None,
            }
        }
    }

    impl ModuleProbe for FakeModules {
        fn is_loaded(&self, module: &str) -> bool {
            let mut checks = self.checks.lock();
            *checks += 1;
            if let Some((after, name)) = self.load_after {
                if *checks > after {
                    self.loaded.lock().insert(name);
                }
            }
            self.loaded.lock().contains(module)
        }
    }

    fn fast_settings() -> AgentSettings {
        AgentSettings {
            detect_poll: Duration::from_millis(1),
            detect_timeout: Duration::from_millis(50),
            ..AgentSettings::default()
        }
    }

    #[test]
    fn newest_runtime_wins() {
        let probe = FakeModules::with(&["d3d9.dll", "d3d11.dll"]);
        assert_eq!(
            resolve_version(Direct3DVersion::AutoDetect, &probe, &fast_settings()).unwrap(),
            Direct3DVersion::Direct3D11
        );
    }

    #[test]
    fn explicit_version_is_trusted() {
        let probe = FakeModules::with(&[]);
        assert_eq!(
            resolve_version(Direct3DVersion::Direct3D9, &probe, &fast_settings()).unwrap(),
            Direct3DVersion::Direct3D9
        );
        assert_eq!(*probe.checks.lock(), 0);
    }

    #[test]
    fn late_loading_module_is_found() {
        let probe = FakeModules {
            load_after: Some((12, "d3d10.dll")),
            ..FakeModules::with(&[])
        };
        assert_eq!(
            detect_version(&probe, Duration::from_millis(1), Duration::from_secs(1)),
            Some(Direct3DVersion::Direct3D10)
        );
    }

    #[test]
    fn nothing_loaded_is_a_configuration_error() {
        let probe = FakeModules::with(&[]);
        let err = resolve_version(Direct3DVersion::Unknown, &probe, &fast_settings()).unwrap_err();
        assert!(matches!(err, CaptureError::Configuration(_)));
    }
}
