//! GATT service and characteristic identifiers.
//!
//! The monitor exposes its metrics under one of three standard fitness
//! profiles (cycling power, cycling speed/cadence, fitness machine) and its
//! own settings, extended-metrics and OTA services under a vendor base UUID.

use uuid::Uuid;

/// Expand a 16-bit SIG-assigned identifier to its full 128-bit form.
const fn sig(short: u32) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb | ((short as u128) << 96))
}

const fn vendor(short: u32) -> Uuid {
    Uuid::from_u128(0x0000_0000_dd4c_4f14_9249_345b_3f2f_32f5 | ((short as u128) << 96))
}

// Standard metric profiles
pub const CYCLING_POWER_SERVICE: Uuid = sig(0x1818);
pub const CYCLING_POWER_MEASUREMENT: Uuid = sig(0x2A63);

pub const CYCLING_SPEED_CADENCE_SERVICE: Uuid = sig(0x1816);
pub const CSC_MEASUREMENT: Uuid = sig(0x2A5B);

pub const FITNESS_MACHINE_SERVICE: Uuid = sig(0x1826);
pub const ROWER_DATA: Uuid = sig(0x2AD1);

// Standard auxiliary services
pub const BATTERY_SERVICE: Uuid = sig(0x180F);
pub const BATTERY_LEVEL: Uuid = sig(0x2A19);

pub const DEVICE_INFORMATION_SERVICE: Uuid = sig(0x180A);
pub const MANUFACTURER_NAME: Uuid = sig(0x2A29);
pub const FIRMWARE_REVISION: Uuid = sig(0x2A26);

// Vendor settings service
pub const SETTINGS_SERVICE: Uuid = vendor(0x56BC_0010);
pub const GENERAL_SETTINGS: Uuid = vendor(0x56BC_0011);
pub const STROKE_SETTINGS: Uuid = vendor(0x56BC_0012);
pub const SETTINGS_CONTROL_POINT: Uuid = vendor(0x56BC_0013);

// Vendor extended-metrics service
pub const EXTENDED_METRICS_SERVICE: Uuid = vendor(0x56BC_0020);
pub const EXTENDED_METRICS: Uuid = vendor(0x56BC_0021);
pub const HANDLE_FORCES: Uuid = vendor(0x56BC_0022);
pub const DELTA_TIMES: Uuid = vendor(0x56BC_0023);

// OTA pass-through (consumed by an external updater, not by this crate)
pub const OTA_SERVICE: Uuid = vendor(0x56BC_0030);
pub const OTA_RX: Uuid = vendor(0x56BC_0031);
pub const OTA_TX: Uuid = vendor(0x56BC_0032);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sig_expansion_matches_base_uuid() {
        assert_eq!(
            BATTERY_SERVICE.to_string(),
            "0000180f-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            CYCLING_POWER_MEASUREMENT.to_string(),
            "00002a63-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn vendor_uuids_are_distinct() {
        let all = [
            SETTINGS_SERVICE,
            GENERAL_SETTINGS,
            STROKE_SETTINGS,
            SETTINGS_CONTROL_POINT,
            EXTENDED_METRICS_SERVICE,
            EXTENDED_METRICS,
            HANDLE_FORCES,
            DELTA_TIMES,
            OTA_SERVICE,
            OTA_RX,
            OTA_TX,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
