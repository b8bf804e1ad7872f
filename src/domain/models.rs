/// Connection lifecycle state, broadcast to all subscribers.
///
/// Exactly one value is current at any time; the initial value is
/// `Disconnected`. `Searching` is only entered by the advertisement-driven
/// reconnect loop.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Searching,
    Connected {
        device_name: Option<String>,
    },
}

/// Normalized rowing metrics shared by all three measurement wire formats.
///
/// All counters are cumulative over the connected session. A decrease on the
/// wire means the device reset its counters and is a new baseline, not an
/// error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BaseMetrics {
    /// Cumulative stroke time in microseconds.
    pub stroke_time_us: u64,
    /// Cumulative flywheel revolution time in microseconds.
    pub rev_time_us: u64,
    /// Cumulative distance in centimeters.
    pub distance_cm: u64,
    /// Cumulative stroke count.
    pub stroke_count: u32,
}

/// Per-stroke metrics from the vendor extended-metrics characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedMetrics {
    pub avg_stroke_power_w: u16,
    pub drive_duration_us: u32,
    pub recovery_duration_us: u32,
    pub drag_factor: u16,
}

/// One notification's worth of inter-impulse intervals, in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaTimesFrame {
    pub intervals_us: Vec<u32>,
}

/// Handle force curve for one stroke, in newtons, reassembled from one or
/// more notification fragments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandleForceFrame {
    pub forces_n: Vec<f32>,
}

/// Best-effort device-information service read, surfaced once per connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub manufacturer: Option<String>,
    pub firmware_revision: Option<String>,
}

/// A short human-readable notice for the hosting application.
#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// Everything the link engine publishes to its host.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Metrics(BaseMetrics),
    ExtendedMetrics(ExtendedMetrics),
    DeltaTimes(DeltaTimesFrame),
    HandleForces(HandleForceFrame),
    Settings(crate::domain::settings::RowerSettings),
    BatteryLevel(u8),
    DeviceInfo(DeviceInfo),
    ConnectionStatus(ConnectionStatus),
    Notice(StatusMessage),
}

impl StatusMessage {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: MessageSeverity::Info,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: MessageSeverity::Success,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: MessageSeverity::Warning,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: MessageSeverity::Error,
        }
    }
}
