use std::collections::HashMap;

use chrono::Local;

/// One environment signal the fingerprint can draw on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Renderer,
    RenderingQuirks,
    ScreenGeometry,
    ColorDepth,
    PixelRatio,
    Viewport,
    Locale,
    Timezone,
    TimezoneOffset,
    Platform,
    HardwareConcurrency,
    DeviceMemory,
}

impl Signal {
    pub const ALL: [Signal; 12] = [
        Signal::Renderer,
        Signal::RenderingQuirks,
        Signal::ScreenGeometry,
        Signal::ColorDepth,
        Signal::PixelRatio,
        Signal::Viewport,
        Signal::Locale,
        Signal::Timezone,
        Signal::TimezoneOffset,
        Signal::Platform,
        Signal::HardwareConcurrency,
        Signal::DeviceMemory,
    ];

    /// Signals that survive browser updates, zoom, window resizes and DST.
    pub const STABLE: [Signal; 6] = [
        Signal::ScreenGeometry,
        Signal::ColorDepth,
        Signal::Locale,
        Signal::Timezone,
        Signal::Platform,
        Signal::HardwareConcurrency,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Signal::Renderer => "renderer",
            Signal::RenderingQuirks => "rendering_quirks",
            Signal::ScreenGeometry => "screen_geometry",
            Signal::ColorDepth => "color_depth",
            Signal::PixelRatio => "pixel_ratio",
            Signal::Viewport => "viewport",
            Signal::Locale => "locale",
            Signal::Timezone => "timezone",
            Signal::TimezoneOffset => "timezone_offset",
            Signal::Platform => "platform",
            Signal::HardwareConcurrency => "hardware_concurrency",
            Signal::DeviceMemory => "device_memory",
        }
    }

    pub fn is_stable(&self) -> bool {
        Self::STABLE.contains(self)
    }
}

/// Read-only access to environment signals. `None` means the source is
/// unavailable; the fingerprint hashes it as an empty string.
pub trait SignalSource: Send + Sync {
    fn read(&self, signal: Signal) -> Option<String>;
}

/// Signals read from the native process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSignals;

impl SignalSource for SystemSignals {
    fn read(&self, signal: Signal) -> Option<String> {
        match signal {
            Signal::Renderer => env_nonempty("TERM"),
            Signal::RenderingQuirks => env_nonempty("COLORTERM"),
            Signal::ColorDepth => env_nonempty("COLORTERM").map(|value| {
                if value == "truecolor" || value == "24bit" {
                    "24".to_string()
                } else {
                    value
                }
            }),
            Signal::Viewport => match (env_nonempty("COLUMNS"), env_nonempty("LINES")) {
                (Some(cols), Some(lines)) => Some(format!("{cols}x{lines}")),
                _ => None,
            },
            Signal::Locale => env_nonempty("LC_ALL")
                .or_else(|| env_nonempty("LC_MESSAGES"))
                .or_else(|| env_nonempty("LANG")),
            Signal::Timezone => env_nonempty("TZ"),
            Signal::TimezoneOffset => {
                Some(Local::now().offset().local_minus_utc().to_string())
            }
            Signal::Platform => Some(format!(
                "{}/{}/{}",
                std::env::consts::OS,
                std::env::consts::ARCH,
                std::env::consts::FAMILY
            )),
            Signal::HardwareConcurrency => std::thread::available_parallelism()
                .ok()
                .map(|n| n.get().to_string()),
            Signal::ScreenGeometry | Signal::PixelRatio | Signal::DeviceMemory => None,
        }
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Host-supplied signal values, for embedders that can see the real display
/// (a webview shell, a game client) and for tests.
#[derive(Debug, Default, Clone)]
pub struct StaticSignals {
    values: HashMap<Signal, String>,
}

impl StaticSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, signal: Signal, value: impl Into<String>) -> Self {
        self.values.insert(signal, value.into());
        self
    }

    pub fn set(&mut self, signal: Signal, value: impl Into<String>) {
        self.values.insert(signal, value.into());
    }

    pub fn unset(&mut self, signal: Signal) {
        self.values.remove(&signal);
    }
}

impl SignalSource for StaticSignals {
    fn read(&self, signal: Signal) -> Option<String> {
        self.values.get(&signal).cloned()
    }
}
