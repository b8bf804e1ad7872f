//! Device-side settings model.
//!
//! The monitor reports its configuration through two independent
//! characteristics: the general/rowing settings blob and the stroke-detection
//! settings blob. Each contributes a partial view; [`SettingsStore`] keeps the
//! latest of each and recomputes the merged [`RowerSettings`] whenever either
//! side updates (last-write-wins per view, not per field).

use crate::infrastructure::bluetooth::settings_codec::{GeneralSettingsFrame, StrokeSettingsFrame};

/// Which standard BLE profile the monitor currently advertises its metrics
/// under. Derived from the measurement characteristic the client resolved,
/// not from any settings payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BleServiceFlag {
    #[default]
    Cps,
    Csc,
    Ftms,
}

/// A three-valued on-device toggle: the firmware distinguishes "never set"
/// from an explicit off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriState {
    #[default]
    Unset,
    Off,
    On,
}

impl TriState {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Unset),
            1 => Some(Self::Off),
            2 => Some(Self::On),
            _ => None,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            Self::Unset => 0,
            Self::Off => 1,
            Self::On => 2,
        }
    }
}

/// Stroke detection strategy, two bits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrokeDetectionType {
    #[default]
    Torque,
    Slope,
    Both,
}

impl StrokeDetectionType {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Torque),
            1 => Some(Self::Slope),
            2 => Some(Self::Both),
            _ => None,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            Self::Torque => 0,
            Self::Slope => 1,
            Self::Both => 2,
        }
    }
}

/// Logging and runtime flags of the monitor firmware.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GeneralSettings {
    pub log_delta_times: TriState,
    pub log_to_sd_card: TriState,
    pub log_level: u8,
    pub runtime_settings_enabled: bool,
    pub ble_service: BleServiceFlag,
    pub compiled_with_double_precision: bool,
}

/// Machine geometry, sensor thresholds, drag-factor fit parameters and
/// stroke-detection thresholds. Fields the monitor has not reported yet stay
/// at their zero defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowingSettings {
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
    pub stroke_detection: StrokeDetectionType,
    pub impulse_data_array_length: u8,
    pub minimum_drive_torque: f32,
    pub minimum_recovery_torque: f32,
    pub recovery_slope_margin: Option<f32>,
    pub recovery_slope: f32,
    pub minimum_recovery_time_ms: u16,
    pub minimum_drive_time_ms: u16,
    pub max_handle_force_capacity: u8,
}

/// The merged settings view exposed to the host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowerSettings {
    pub general: GeneralSettings,
    pub rowing: RowingSettings,
}

/// Holds the latest partial view from each settings characteristic and
/// produces the merged view. A malformed payload never reaches this store, so
/// a bad notification cannot clobber the previous good view.
#[derive(Debug, Default)]
pub struct SettingsStore {
    general: Option<GeneralSettingsFrame>,
    stroke: Option<StrokeSettingsFrame>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_general(&mut self, frame: GeneralSettingsFrame) {
        self.general = Some(frame);
    }

    pub fn update_stroke(&mut self, frame: StrokeSettingsFrame) {
        self.stroke = Some(frame);
    }

    /// Recompute the merged view. `ble_service` comes from whichever
    /// measurement characteristic is currently registered, not from the
    /// settings payload.
    pub fn merged(&self, ble_service: BleServiceFlag) -> RowerSettings {
        let mut settings = RowerSettings::default();
        settings.general.ble_service = ble_service;

        if let Some(general) = &self.general {
            settings.general.log_delta_times = general.log_delta_times;
            settings.general.log_to_sd_card = general.log_to_sd_card;
            settings.general.log_level = general.log_level;
            settings.general.runtime_settings_enabled = general.runtime_settings_enabled;

            if let Some(machine) = &general.machine {
                settings.rowing.flywheel_inertia = machine.flywheel_inertia;
                settings.rowing.magic_constant = machine.magic_constant;
                settings.rowing.sprocket_radius = machine.sprocket_radius;
                settings.rowing.impulses_per_revolution = machine.impulses_per_revolution;
                settings.rowing.sensor_debounce = machine.sensor_debounce;
                settings.rowing.sensor_stop_threshold = machine.sensor_stop_threshold;
                settings.rowing.drag_fit_goodness = machine.drag_fit_goodness;
                settings.rowing.drag_fit_recovery_period = machine.drag_fit_recovery_period;
                settings.rowing.drag_factor_lower = machine.drag_factor_lower;
                settings.rowing.drag_factor_upper = machine.drag_factor_upper;
                settings.rowing.drag_fit_curve_length = machine.drag_fit_curve_length;
            }
        }

        if let Some(stroke) = &self.stroke {
            settings.general.compiled_with_double_precision = stroke.double_precision;
            settings.rowing.stroke_detection = stroke.stroke_detection;
            settings.rowing.impulse_data_array_length = stroke.impulse_data_array_length;
            settings.rowing.minimum_drive_torque = stroke.minimum_drive_torque;
            settings.rowing.minimum_recovery_torque = stroke.minimum_recovery_torque;
            settings.rowing.recovery_slope_margin = stroke.recovery_slope_margin;
            settings.rowing.recovery_slope = stroke.recovery_slope;
            settings.rowing.minimum_recovery_time_ms = stroke.minimum_recovery_time_ms;
            settings.rowing.minimum_drive_time_ms = stroke.minimum_drive_time_ms;
            settings.rowing.max_handle_force_capacity = stroke.max_handle_force_capacity;
        }

        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::settings_codec::MachineSettingsFrame;

    #[test]
    fn merge_preserves_other_view_on_update() {
        let mut store = SettingsStore::new();

        store.update_stroke(StrokeSettingsFrame {
            stroke_detection: StrokeDetectionType::Both,
            impulse_data_array_length: 12,
            double_precision: true,
            minimum_drive_torque: 0.3,
            minimum_recovery_torque: 0.2,
            recovery_slope_margin: None,
            recovery_slope: -0.05,
            minimum_recovery_time_ms: 900,
            minimum_drive_time_ms: 400,
            max_handle_force_capacity: 200,
        });

        store.update_general(GeneralSettingsFrame {
            log_delta_times: TriState::On,
            log_to_sd_card: TriState::Off,
            log_level: 4,
            runtime_settings_enabled: true,
            machine: Some(MachineSettingsFrame {
                flywheel_inertia: 0.1,
                magic_constant: 2.8,
                sprocket_radius: 0.014,
                impulses_per_revolution: 3,
                sensor_debounce: 15,
                sensor_stop_threshold: 60,
                drag_fit_goodness: 0.9,
                drag_fit_recovery_period: 6,
                drag_factor_lower: 75,
                drag_factor_upper: 250,
                drag_fit_curve_length: 9,
            }),
        });

        let merged = store.merged(BleServiceFlag::Ftms);
        assert_eq!(merged.general.ble_service, BleServiceFlag::Ftms);
        assert_eq!(merged.general.log_level, 4);
        // the earlier stroke view survives the general update
        assert!(merged.general.compiled_with_double_precision);
        assert_eq!(merged.rowing.minimum_recovery_time_ms, 900);
        assert_eq!(merged.rowing.impulses_per_revolution, 3);
    }

    #[test]
    fn one_byte_general_view_leaves_geometry_at_defaults() {
        let mut store = SettingsStore::new();
        store.update_general(GeneralSettingsFrame {
            log_delta_times: TriState::Off,
            log_to_sd_card: TriState::Unset,
            log_level: 2,
            runtime_settings_enabled: false,
            machine: None,
        });

        let merged = store.merged(BleServiceFlag::Cps);
        assert_eq!(merged.rowing.flywheel_inertia, 0.0);
        assert_eq!(merged.rowing.impulses_per_revolution, 0);
        assert_eq!(merged.general.log_level, 2);
    }
}
