//! Wire codec for the two settings characteristics.
//!
//! The general settings characteristic speaks two formats distinguished by
//! payload length: a 1-byte backward-compatible flag byte, and an 18-byte
//! full payload that additionally carries the machine geometry, sensor
//! thresholds and drag-factor fit parameters. The stroke-detection settings
//! characteristic has an 11-byte format and a legacy 15-byte variant that
//! still transmits the deprecated recovery-slope margin.
//!
//! The control-point write path reuses the exact same scale factors, so a
//! value round-trips through write → device → read unchanged within integer
//! rounding.

use crate::domain::settings::{StrokeDetectionType, TriState};
use crate::infrastructure::bluetooth::codec::CodecError;

pub const MAGIC_CONSTANT_SCALE: f32 = 35.0;
pub const SPROCKET_RADIUS_SCALE: f32 = 1000.0;
pub const GOODNESS_OF_FIT_SCALE: f32 = 255.0;
pub const TORQUE_SCALE: f32 = 10_000.0;
pub const SLOPE_SCALE: f32 = 1000.0;

const GENERAL_FLAGS_LEN: usize = 1;
const GENERAL_FULL_LEN: usize = 18;
const STROKE_LEN: usize = 11;
const STROKE_LEGACY_LEN: usize = 15;

/// Decoded general settings payload. `machine` is present only for the
/// 18-byte format; with the 1-byte format all geometry stays unreported.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneralSettingsFrame {
    pub log_delta_times: TriState,
    pub log_to_sd_card: TriState,
    pub log_level: u8,
    pub runtime_settings_enabled: bool,
    pub machine: Option<MachineSettingsFrame>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MachineSettingsFrame {
    pub flywheel_inertia: f32,
    pub magic_constant: f32,
    pub sprocket_radius: f32,
    pub impulses_per_revolution: u8,
    pub sensor_debounce: u8,
    pub sensor_stop_threshold: u8,
    pub drag_fit_goodness: f32,
    pub drag_fit_recovery_period: u8,
    pub drag_factor_lower: u16,
    pub drag_factor_upper: u16,
    pub drag_fit_curve_length: u8,
}

/// Decoded stroke-detection settings payload. `recovery_slope_margin` is only
/// transmitted by the legacy 15-byte variant.
#[derive(Debug, Clone, PartialEq)]
pub struct StrokeSettingsFrame {
    pub stroke_detection: StrokeDetectionType,
    pub impulse_data_array_length: u8,
    pub double_precision: bool,
    pub minimum_drive_torque: f32,
    pub minimum_recovery_torque: f32,
    pub recovery_slope_margin: Option<f32>,
    pub recovery_slope: f32,
    pub minimum_recovery_time_ms: u16,
    pub minimum_drive_time_ms: u16,
    pub max_handle_force_capacity: u8,
}

fn read_u16(payload: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([payload[at], payload[at + 1]])
}

fn read_f32(payload: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([
        payload[at],
        payload[at + 1],
        payload[at + 2],
        payload[at + 3],
    ])
}

pub fn decode_general_settings(payload: &[u8]) -> Result<GeneralSettingsFrame, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::TooShort {
            expected: GENERAL_FLAGS_LEN,
            actual: 0,
        });
    }
    if payload.len() != GENERAL_FLAGS_LEN && payload.len() != GENERAL_FULL_LEN {
        return Err(CodecError::Length(payload.len()));
    }

    let flags = payload[0];
    let log_delta_times =
        TriState::from_bits(flags & 0x03).ok_or(CodecError::InvalidField("delta-time logging"))?;
    let log_to_sd_card = TriState::from_bits((flags >> 2) & 0x03)
        .ok_or(CodecError::InvalidField("sd-card logging"))?;
    let log_level = (flags >> 4) & 0x07;
    let runtime_settings_enabled = flags & 0x80 != 0;

    let machine = if payload.len() == GENERAL_FULL_LEN {
        Some(MachineSettingsFrame {
            flywheel_inertia: read_f32(payload, 1),
            magic_constant: f32::from(payload[5]) / MAGIC_CONSTANT_SCALE,
            sprocket_radius: f32::from(read_u16(payload, 6)) / SPROCKET_RADIUS_SCALE,
            impulses_per_revolution: payload[8],
            sensor_debounce: payload[9],
            sensor_stop_threshold: payload[10],
            drag_fit_goodness: f32::from(payload[11]) / GOODNESS_OF_FIT_SCALE,
            drag_fit_recovery_period: payload[12],
            drag_factor_lower: read_u16(payload, 13),
            drag_factor_upper: read_u16(payload, 15),
            drag_fit_curve_length: payload[17],
        })
    } else {
        None
    };

    Ok(GeneralSettingsFrame {
        log_delta_times,
        log_to_sd_card,
        log_level,
        runtime_settings_enabled,
        machine,
    })
}

pub fn decode_stroke_settings(payload: &[u8]) -> Result<StrokeSettingsFrame, CodecError> {
    if payload.len() != STROKE_LEN && payload.len() != STROKE_LEGACY_LEN {
        if payload.len() < STROKE_LEN {
            return Err(CodecError::TooShort {
                expected: STROKE_LEN,
                actual: payload.len(),
            });
        }
        return Err(CodecError::Length(payload.len()));
    }

    let stroke_detection = StrokeDetectionType::from_bits(payload[0] & 0x03)
        .ok_or(CodecError::InvalidField("stroke detection type"))?;
    let impulse_data_array_length = (payload[0] >> 2) & 0x1F;
    let double_precision = payload[0] & 0x80 != 0;
    let minimum_drive_torque = f32::from(read_u16(payload, 1)) / TORQUE_SCALE;
    let minimum_recovery_torque = f32::from(read_u16(payload, 3)) / TORQUE_SCALE;

    let legacy = payload.len() == STROKE_LEGACY_LEN;
    let (recovery_slope_margin, rest) = if legacy {
        (Some(read_f32(payload, 5)), 9)
    } else {
        (None, 5)
    };

    let recovery_slope =
        f32::from(i16::from_le_bytes([payload[rest], payload[rest + 1]])) / SLOPE_SCALE;
    let (minimum_recovery_time_ms, minimum_drive_time_ms) =
        unpack_time_pair(&payload[rest + 2..rest + 5]);
    let max_handle_force_capacity = payload[rest + 5];

    Ok(StrokeSettingsFrame {
        stroke_detection,
        impulse_data_array_length,
        double_precision,
        minimum_drive_torque,
        minimum_recovery_torque,
        recovery_slope_margin,
        recovery_slope,
        minimum_recovery_time_ms,
        minimum_drive_time_ms,
        max_handle_force_capacity,
    })
}

/// Two 12-bit millisecond values packed into three bytes, recovery time
/// first.
fn unpack_time_pair(bytes: &[u8]) -> (u16, u16) {
    let recovery = u16::from(bytes[0]) | (u16::from(bytes[1] & 0x0F) << 8);
    let drive = (u16::from(bytes[1]) >> 4) | (u16::from(bytes[2]) << 4);
    (recovery, drive)
}

fn pack_time_pair(recovery_ms: u16, drive_ms: u16) -> [u8; 3] {
    [
        (recovery_ms & 0xFF) as u8,
        (((recovery_ms >> 8) & 0x0F) as u8) | (((drive_ms & 0x0F) as u8) << 4),
        ((drive_ms >> 4) & 0xFF) as u8,
    ]
}

// -- frame builders ---------------------------------------------------------
//
// The write path of the control-point protocol and the round-trip tests both
// go through these, so read and write share one set of scale factors.

pub fn build_general_flags_byte(
    log_delta_times: TriState,
    log_to_sd_card: TriState,
    log_level: u8,
    runtime_settings_enabled: bool,
) -> u8 {
    log_delta_times.to_bits()
        | (log_to_sd_card.to_bits() << 2)
        | ((log_level & 0x07) << 4)
        | if runtime_settings_enabled { 0x80 } else { 0 }
}

pub fn build_general_settings_frame(frame: &GeneralSettingsFrame) -> Vec<u8> {
    let flags = build_general_flags_byte(
        frame.log_delta_times,
        frame.log_to_sd_card,
        frame.log_level,
        frame.runtime_settings_enabled,
    );
    let Some(machine) = &frame.machine else {
        return vec![flags];
    };

    let mut payload = Vec::with_capacity(GENERAL_FULL_LEN);
    payload.push(flags);
    payload.extend_from_slice(&machine.flywheel_inertia.to_le_bytes());
    payload.push((machine.magic_constant * MAGIC_CONSTANT_SCALE).round() as u8);
    payload.extend_from_slice(
        &((machine.sprocket_radius * SPROCKET_RADIUS_SCALE).round() as u16).to_le_bytes(),
    );
    payload.push(machine.impulses_per_revolution);
    payload.push(machine.sensor_debounce);
    payload.push(machine.sensor_stop_threshold);
    payload.push((machine.drag_fit_goodness * GOODNESS_OF_FIT_SCALE).round() as u8);
    payload.push(machine.drag_fit_recovery_period);
    payload.extend_from_slice(&machine.drag_factor_lower.to_le_bytes());
    payload.extend_from_slice(&machine.drag_factor_upper.to_le_bytes());
    payload.push(machine.drag_fit_curve_length);
    payload
}

pub fn build_stroke_settings_frame(frame: &StrokeSettingsFrame) -> Vec<u8> {
    let mut payload = Vec::with_capacity(if frame.recovery_slope_margin.is_some() {
        STROKE_LEGACY_LEN
    } else {
        STROKE_LEN
    });
    payload.push(
        frame.stroke_detection.to_bits()
            | ((frame.impulse_data_array_length & 0x1F) << 2)
            | if frame.double_precision { 0x80 } else { 0 },
    );
    payload
        .extend_from_slice(&((frame.minimum_drive_torque * TORQUE_SCALE).round() as u16).to_le_bytes());
    payload.extend_from_slice(
        &((frame.minimum_recovery_torque * TORQUE_SCALE).round() as u16).to_le_bytes(),
    );
    if let Some(margin) = frame.recovery_slope_margin {
        payload.extend_from_slice(&margin.to_le_bytes());
    }
    payload.extend_from_slice(&((frame.recovery_slope * SLOPE_SCALE).round() as i16).to_le_bytes());
    payload.extend_from_slice(&pack_time_pair(
        frame.minimum_recovery_time_ms,
        frame.minimum_drive_time_ms,
    ));
    payload.push(frame.max_handle_force_capacity);
    payload
}
