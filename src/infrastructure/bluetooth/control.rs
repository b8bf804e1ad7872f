//! The settings control-point protocol.
//!
//! Every settings mutation is one command/response exchange against the
//! write-with-notify control characteristic: start notifications, write the
//! opcode and payload without a write acknowledgment, await exactly one
//! response frame (response marker, echoed opcode, result code), and always
//! stop notifications before returning — except on a timeout, where the
//! characteristic may be unreachable and the stop is skipped.

use crate::domain::settings::BleServiceFlag;
use crate::infrastructure::bluetooth::settings_codec::{
    self, build_stroke_settings_frame, StrokeSettingsFrame,
};
use crate::infrastructure::bluetooth::transport::{CharacteristicHandle, GattLink};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

pub const RESPONSE_MARKER: u8 = 0x80;

const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);
/// SD-card toggling flushes the card before responding, which is observed to
/// take far longer than any other command. Kept per-command rather than
/// widening the global window.
const SD_CARD_RESPONSE_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Result code of a control-point response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    OpCodeNotSupported,
    InvalidParameter,
    OperationFailed,
    ControlNotPermitted,
    Unknown(u8),
}

impl ResultCode {
    pub fn from_wire(raw: u8) -> Self {
        match raw {
            0x01 => Self::Success,
            0x02 => Self::OpCodeNotSupported,
            0x03 => Self::InvalidParameter,
            0x04 => Self::OperationFailed,
            0x05 => Self::ControlNotPermitted,
            other => Self::Unknown(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Success => "successful",
            Self::OpCodeNotSupported => "op code not supported",
            Self::InvalidParameter => "invalid parameter",
            Self::OperationFailed => "operation failed",
            Self::ControlNotPermitted => "control not permitted",
            Self::Unknown(_) => "unknown result code",
        }
    }
}

/// One settings-mutation command and its payload.
#[derive(Debug, Clone)]
pub enum Command {
    ChangeBleService(BleServiceFlag),
    ChangeDeltaTimeLogging(bool),
    ChangeSdCardLogging(bool),
    ChangeLogLevel(u8),
    ChangeMachineSettings {
        flywheel_inertia: f32,
        magic_constant: f32,
        sprocket_radius: f32,
        impulses_per_revolution: u8,
    },
    ChangeSensorSettings {
        sensor_debounce: u8,
        sensor_stop_threshold: u8,
    },
    ChangeDragFactorSettings {
        drag_fit_goodness: f32,
        drag_fit_recovery_period: u8,
        drag_factor_lower: u16,
        drag_factor_upper: u16,
        drag_fit_curve_length: u8,
    },
    ChangeStrokeSettings(StrokeSettingsFrame),
    RestartDevice,
}

impl Command {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::ChangeBleService(_) => 0x10,
            Self::ChangeDeltaTimeLogging(_) => 0x11,
            Self::ChangeSdCardLogging(_) => 0x12,
            Self::ChangeLogLevel(_) => 0x13,
            Self::ChangeMachineSettings { .. } => 0x14,
            Self::ChangeSensorSettings { .. } => 0x15,
            Self::ChangeDragFactorSettings { .. } => 0x16,
            Self::ChangeStrokeSettings(_) => 0x17,
            Self::RestartDevice => 0x1F,
        }
    }

    /// Write payload, opcode byte first. Field order, widths and scale
    /// factors mirror the read-side settings codec exactly.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut frame = vec![self.opcode()];
        match self {
            Self::ChangeBleService(flag) => frame.push(match flag {
                BleServiceFlag::Cps => 0,
                BleServiceFlag::Csc => 1,
                BleServiceFlag::Ftms => 2,
            }),
            Self::ChangeDeltaTimeLogging(enabled) | Self::ChangeSdCardLogging(enabled) => {
                frame.push(u8::from(*enabled));
            }
            Self::ChangeLogLevel(level) => frame.push(level & 0x07),
            Self::ChangeMachineSettings {
                flywheel_inertia,
                magic_constant,
                sprocket_radius,
                impulses_per_revolution,
            } => {
                frame.extend_from_slice(&flywheel_inertia.to_le_bytes());
                frame.push(
                    (magic_constant * settings_codec::MAGIC_CONSTANT_SCALE).round() as u8,
                );
                frame.extend_from_slice(
                    &((sprocket_radius * settings_codec::SPROCKET_RADIUS_SCALE).round() as u16)
                        .to_le_bytes(),
                );
                frame.push(*impulses_per_revolution);
            }
            Self::ChangeSensorSettings {
                sensor_debounce,
                sensor_stop_threshold,
            } => {
                frame.push(*sensor_debounce);
                frame.push(*sensor_stop_threshold);
            }
            Self::ChangeDragFactorSettings {
                drag_fit_goodness,
                drag_fit_recovery_period,
                drag_factor_lower,
                drag_factor_upper,
                drag_fit_curve_length,
            } => {
                frame.push(
                    (drag_fit_goodness * settings_codec::GOODNESS_OF_FIT_SCALE).round() as u8,
                );
                frame.push(*drag_fit_recovery_period);
                frame.extend_from_slice(&drag_factor_lower.to_le_bytes());
                frame.extend_from_slice(&drag_factor_upper.to_le_bytes());
                frame.push(*drag_fit_curve_length);
            }
            Self::ChangeStrokeSettings(settings) => {
                frame.extend_from_slice(&build_stroke_settings_frame(settings));
            }
            Self::RestartDevice => {}
        }
        frame
    }

    /// Response window for this command. A per-command value, not a global
    /// constant: the observed firmware answers SD-card toggles an order of
    /// magnitude slower than everything else.
    pub fn response_timeout(&self) -> Duration {
        match self {
            Self::ChangeSdCardLogging(_) => SD_CARD_RESPONSE_TIMEOUT,
            _ => DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Short description used in user notices.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ChangeBleService(_) => "BLE service change",
            Self::ChangeDeltaTimeLogging(_) => "delta time logging change",
            Self::ChangeSdCardLogging(_) => "SD card logging change",
            Self::ChangeLogLevel(_) => "log level change",
            Self::ChangeMachineSettings { .. } => "machine settings change",
            Self::ChangeSensorSettings { .. } => "sensor settings change",
            Self::ChangeDragFactorSettings { .. } => "drag factor settings change",
            Self::ChangeStrokeSettings(_) => "stroke settings change",
            Self::RestartDevice => "device restart",
        }
    }
}

/// Outcome of one control-point exchange, mapped to exactly one user notice
/// by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Success,
    Rejected(ResultCode),
    TimedOut,
    Failed,
    NotConnected,
}

/// Runs one command/response exchange. The caller has already resolved the
/// control characteristic and verified the link precondition.
pub async fn execute(
    link: &Arc<dyn GattLink>,
    control: &CharacteristicHandle,
    command: &Command,
) -> CommandOutcome {
    let mut notifications = match link.subscribe(control).await {
        Ok(stream) => stream,
        Err(error) => {
            warn!("{}: could not listen on control point: {error}", command.label());
            return CommandOutcome::Failed;
        }
    };

    if let Err(error) = link.write_without_response(control, &command.to_wire()).await {
        warn!("{}: write failed: {error}", command.label());
        let _ = link.unsubscribe(control).await;
        return CommandOutcome::Failed;
    }

    let outcome = match timeout(command.response_timeout(), notifications.recv()).await {
        Ok(Some(Ok(frame))) => parse_response(command, &frame),
        Ok(Some(Err(error))) => {
            warn!("{}: control point fault: {error}", command.label());
            CommandOutcome::Failed
        }
        Ok(None) => {
            warn!("{}: control point channel closed", command.label());
            CommandOutcome::Failed
        }
        // the characteristic may be unreachable: skip straight to the error
        // handler without attempting to stop notifications
        Err(_elapsed) => return CommandOutcome::TimedOut,
    };

    let _ = link.unsubscribe(control).await;
    outcome
}

fn parse_response(command: &Command, frame: &[u8]) -> CommandOutcome {
    if frame.len() < 3 || frame[0] != RESPONSE_MARKER || frame[1] != command.opcode() {
        warn!("{}: malformed control point response {frame:02X?}", command.label());
        return CommandOutcome::Failed;
    }
    let code = ResultCode::from_wire(frame[2]);
    debug!("{}: device answered {}", command.label(), code.name());
    match code {
        ResultCode::Success => CommandOutcome::Success,
        other => CommandOutcome::Rejected(other),
    }
}
