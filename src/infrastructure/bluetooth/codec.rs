//! Wire codecs for the three measurement formats and the vendor metric
//! characteristics.
//!
//! All decoders are pure byte-level transforms: no characteristic access, no
//! I/O. The stateful pieces (16-bit event-time unwrapping, FTMS time
//! reconstruction, handle-force reassembly) carry their state in small
//! decoder structs fed nothing but payloads.
//!
//! Decode tolerance: event times are transmitted as tick counts (1/2048 s for
//! the CPS wheel, 1/1024 s for everything else), so a decoded cumulative time
//! is accurate to one tick converted to microseconds (488 µs and 977 µs
//! respectively). Distance and stroke count are exact.

use crate::domain::models::{BaseMetrics, DeltaTimesFrame, ExtendedMetrics, HandleForceFrame};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload too short: {actual} bytes, expected at least {expected}")]
    TooShort { expected: usize, actual: usize },
    #[error("unexpected payload length {0}")]
    Length(usize),
    #[error("invalid {0} field")]
    InvalidField(&'static str),
}

const CPS_FRAME_LEN: usize = 14;
const CSC_FRAME_LEN: usize = 11;
const FTMS_FRAME_LEN: usize = 16;
const EXTENDED_FRAME_LEN: usize = 8;

/// Extended-metrics durations are tick counts at this reference clock.
const EXTENDED_TICK_HZ: u64 = 4096;

fn read_u16(payload: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([payload[at], payload[at + 1]])
}

fn read_u24(payload: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], 0])
}

fn read_u32(payload: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([
        payload[at],
        payload[at + 1],
        payload[at + 2],
        payload[at + 3],
    ])
}

fn ensure_len(payload: &[u8], expected: usize) -> Result<(), CodecError> {
    if payload.len() < expected {
        return Err(CodecError::TooShort {
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

/// Unwraps a 16-bit wrapping tick counter into a cumulative microsecond
/// value. The first observed value becomes the baseline.
#[derive(Debug, Clone)]
struct TickTracker {
    hz: u64,
    total_ticks: u64,
    last_raw: Option<u16>,
}

impl TickTracker {
    fn new(hz: u64) -> Self {
        Self {
            hz,
            total_ticks: 0,
            last_raw: None,
        }
    }

    fn advance(&mut self, raw: u16) -> u64 {
        match self.last_raw {
            Some(previous) => self.total_ticks += u64::from(raw.wrapping_sub(previous)),
            None => self.total_ticks = u64::from(raw),
        }
        self.last_raw = Some(raw);
        self.total_ticks * 1_000_000 / self.hz
    }

    fn reset(&mut self) {
        self.total_ticks = 0;
        self.last_raw = None;
    }
}

/// Cycling-Power measurement decoder (14-byte frame).
///
/// Frame layout: flags u16, instantaneous power i16 (unused for base
/// metrics), cumulative wheel revolutions u32, last wheel event time u16 at
/// 1/2048 s, cumulative crank revolutions u16, last crank event time u16 at
/// 1/1024 s. Wheel revolutions carry the distance in centimeters, crank
/// revolutions the stroke count.
#[derive(Debug)]
pub struct CpsDecoder {
    wheel: TickTracker,
    crank: TickTracker,
    last_wheel_revs: Option<u32>,
    last_crank_revs: Option<u16>,
}

impl CpsDecoder {
    pub fn new() -> Self {
        Self {
            wheel: TickTracker::new(2048),
            crank: TickTracker::new(1024),
            last_wheel_revs: None,
            last_crank_revs: None,
        }
    }

    pub fn decode(&mut self, payload: &[u8]) -> Result<BaseMetrics, CodecError> {
        ensure_len(payload, CPS_FRAME_LEN)?;
        let wheel_revs = read_u32(payload, 4);
        let wheel_time = read_u16(payload, 8);
        let crank_revs = read_u16(payload, 10);
        let crank_time = read_u16(payload, 12);

        // a shrinking cumulative counter is a device reset: new baseline
        if self.last_wheel_revs.is_some_and(|prev| wheel_revs < prev)
            || self.last_crank_revs.is_some_and(|prev| crank_revs < prev)
        {
            self.wheel.reset();
            self.crank.reset();
        }
        self.last_wheel_revs = Some(wheel_revs);
        self.last_crank_revs = Some(crank_revs);

        Ok(BaseMetrics {
            rev_time_us: self.wheel.advance(wheel_time),
            stroke_time_us: self.crank.advance(crank_time),
            distance_cm: u64::from(wheel_revs),
            stroke_count: u32::from(crank_revs),
        })
    }
}

impl Default for CpsDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Cycling-Speed-and-Cadence measurement decoder (11-byte frame).
///
/// Same field semantics as [`CpsDecoder`] but flags are one byte, there is no
/// power field, and both event times tick at 1/1024 s.
#[derive(Debug)]
pub struct CscDecoder {
    wheel: TickTracker,
    crank: TickTracker,
    last_wheel_revs: Option<u32>,
    last_crank_revs: Option<u16>,
}

impl CscDecoder {
    pub fn new() -> Self {
        Self {
            wheel: TickTracker::new(1024),
            crank: TickTracker::new(1024),
            last_wheel_revs: None,
            last_crank_revs: None,
        }
    }

    pub fn decode(&mut self, payload: &[u8]) -> Result<BaseMetrics, CodecError> {
        ensure_len(payload, CSC_FRAME_LEN)?;
        let wheel_revs = read_u32(payload, 1);
        let wheel_time = read_u16(payload, 5);
        let crank_revs = read_u16(payload, 7);
        let crank_time = read_u16(payload, 9);

        if self.last_wheel_revs.is_some_and(|prev| wheel_revs < prev)
            || self.last_crank_revs.is_some_and(|prev| crank_revs < prev)
        {
            self.wheel.reset();
            self.crank.reset();
        }
        self.last_wheel_revs = Some(wheel_revs);
        self.last_crank_revs = Some(crank_revs);

        Ok(BaseMetrics {
            rev_time_us: self.wheel.advance(wheel_time),
            stroke_time_us: self.crank.advance(crank_time),
            distance_cm: u64::from(wheel_revs),
            stroke_count: u32::from(crank_revs),
        })
    }
}

impl Default for CscDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Fitness-Machine rower-data decoder (16-byte frame).
///
/// Frame layout: flags u16, stroke rate u8 at 0.5 strokes/minute, stroke
/// count u16, total distance u24 in meters, instantaneous pace u16 in seconds
/// per 500 m, instantaneous power i16, average power i16, energy u16.
///
/// The frame does not carry cumulative event times, so `stroke_time_us` and
/// `rev_time_us` are reconstructed: each frame's stroke-count delta is
/// multiplied by the stroke period implied by the transmitted rate, and the
/// distance delta by the per-centimeter time implied by the pace. The first
/// frame has no baseline and counts from zero.
#[derive(Debug, Default)]
pub struct FtmsDecoder {
    previous: Option<(u64, u32)>,
    stroke_time_us: u64,
    rev_time_us: u64,
}

impl FtmsDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, payload: &[u8]) -> Result<BaseMetrics, CodecError> {
        ensure_len(payload, FTMS_FRAME_LEN)?;
        let stroke_rate_raw = payload[2];
        let stroke_count = u32::from(read_u16(payload, 3));
        let distance_cm = u64::from(read_u24(payload, 5)) * 100;
        let pace_s = read_u16(payload, 8);

        if self
            .previous
            .is_some_and(|(cm, count)| distance_cm < cm || stroke_count < count)
        {
            self.previous = None;
            self.stroke_time_us = 0;
            self.rev_time_us = 0;
        }
        let (previous_cm, previous_count) = self.previous.unwrap_or((0, 0));

        // stroke rate has 0.5 spm resolution: one stroke lasts
        // 60e6 / (raw / 2) µs
        let stroke_delta = u64::from(stroke_count - previous_count);
        if stroke_rate_raw > 0 {
            self.stroke_time_us += stroke_delta * 120_000_000 / u64::from(stroke_rate_raw);
        }

        // pace is s/500m, so one centimeter takes pace * 20 µs
        let distance_delta = distance_cm - previous_cm;
        if pace_s > 0 {
            self.rev_time_us += distance_delta * u64::from(pace_s) * 20;
        }

        self.previous = Some((distance_cm, stroke_count));

        Ok(BaseMetrics {
            stroke_time_us: self.stroke_time_us,
            rev_time_us: self.rev_time_us,
            distance_cm,
            stroke_count,
        })
    }
}

/// One notification's worth of inter-impulse intervals: 32-bit little-endian
/// microsecond values, four bytes each, no cross-notification aggregation.
pub fn decode_delta_times(payload: &[u8]) -> Result<DeltaTimesFrame, CodecError> {
    if payload.len() % 4 != 0 {
        return Err(CodecError::Length(payload.len()));
    }
    Ok(DeltaTimesFrame {
        intervals_us: payload.chunks_exact(4).map(|c| read_u32(c, 0)).collect(),
    })
}

/// Vendor extended-metrics frame: power u16, drive duration u16, recovery
/// duration u16 (both tick counts at 4096 Hz), drag factor u16.
pub fn decode_extended_metrics(payload: &[u8]) -> Result<ExtendedMetrics, CodecError> {
    ensure_len(payload, EXTENDED_FRAME_LEN)?;
    let ticks_to_us =
        |ticks: u16| (u64::from(ticks) * 1_000_000 / EXTENDED_TICK_HZ) as u32;
    Ok(ExtendedMetrics {
        avg_stroke_power_w: read_u16(payload, 0),
        drive_duration_us: ticks_to_us(read_u16(payload, 2)),
        recovery_duration_us: ticks_to_us(read_u16(payload, 4)),
        drag_factor: read_u16(payload, 6),
    })
}

pub fn decode_battery_level(payload: &[u8]) -> Result<u8, CodecError> {
    payload
        .first()
        .copied()
        .ok_or(CodecError::TooShort {
            expected: 1,
            actual: 0,
        })
}

/// Reassembles handle-force curves from fragmented notifications.
///
/// Each fragment is: current index (byte 0), total fragment count for this
/// stroke (byte 1), then packed 32-bit little-endian floats in newtons. The
/// series is complete when the index equals the total. A fragment that does
/// not continue the running series flushes what was accumulated first, so
/// out-of-order data is surfaced rather than silently lost.
#[derive(Debug, Default)]
pub struct HandleForceAssembler {
    forces: Vec<f32>,
    last_index: u8,
    total: u8,
}

impl HandleForceAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, payload: &[u8]) -> Result<Vec<HandleForceFrame>, CodecError> {
        ensure_len(payload, 2)?;
        if (payload.len() - 2) % 4 != 0 {
            return Err(CodecError::Length(payload.len()));
        }
        let index = payload[0];
        let total = payload[1];
        if index == 0 || total == 0 || index > total {
            return Err(CodecError::InvalidField("fragment index"));
        }

        let mut flushed = Vec::new();
        let continues =
            !self.forces.is_empty() && index == self.last_index + 1 && total == self.total;
        if !self.forces.is_empty() && !continues {
            flushed.push(HandleForceFrame {
                forces_n: std::mem::take(&mut self.forces),
            });
        }

        self.forces.extend(
            payload[2..]
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        );
        self.last_index = index;
        self.total = total;

        if index == total {
            flushed.push(HandleForceFrame {
                forces_n: std::mem::take(&mut self.forces),
            });
            self.last_index = 0;
            self.total = 0;
        }
        Ok(flushed)
    }
}

// -- frame builders ---------------------------------------------------------
//
// Used by the round-trip tests and by anything that needs to simulate a
// monitor (the mock transport scripts these into notifications).

pub fn build_cps_frame(
    power: i16,
    wheel_revs: u32,
    wheel_event_ticks: u16,
    crank_revs: u16,
    crank_event_ticks: u16,
) -> [u8; CPS_FRAME_LEN] {
    // flags: wheel + crank revolution data present
    let flags: u16 = 0x0030;
    let mut frame = [0u8; CPS_FRAME_LEN];
    frame[0..2].copy_from_slice(&flags.to_le_bytes());
    frame[2..4].copy_from_slice(&power.to_le_bytes());
    frame[4..8].copy_from_slice(&wheel_revs.to_le_bytes());
    frame[8..10].copy_from_slice(&wheel_event_ticks.to_le_bytes());
    frame[10..12].copy_from_slice(&crank_revs.to_le_bytes());
    frame[12..14].copy_from_slice(&crank_event_ticks.to_le_bytes());
    frame
}

pub fn build_csc_frame(
    wheel_revs: u32,
    wheel_event_ticks: u16,
    crank_revs: u16,
    crank_event_ticks: u16,
) -> [u8; CSC_FRAME_LEN] {
    // flags: wheel + crank revolution data present
    let mut frame = [0u8; CSC_FRAME_LEN];
    frame[0] = 0x03;
    frame[1..5].copy_from_slice(&wheel_revs.to_le_bytes());
    frame[5..7].copy_from_slice(&wheel_event_ticks.to_le_bytes());
    frame[7..9].copy_from_slice(&crank_revs.to_le_bytes());
    frame[9..11].copy_from_slice(&crank_event_ticks.to_le_bytes());
    frame
}

#[allow(clippy::too_many_arguments)]
pub fn build_ftms_frame(
    stroke_rate_half_spm: u8,
    stroke_count: u16,
    distance_m: u32,
    pace_s_per_500m: u16,
    power: i16,
    avg_power: i16,
    energy: u16,
) -> [u8; FTMS_FRAME_LEN] {
    // flags: stroke data, distance, pace, power, energy fields present
    let flags: u16 = 0x002C;
    let mut frame = [0u8; FTMS_FRAME_LEN];
    frame[0..2].copy_from_slice(&flags.to_le_bytes());
    frame[2] = stroke_rate_half_spm;
    frame[3..5].copy_from_slice(&stroke_count.to_le_bytes());
    frame[5..8].copy_from_slice(&distance_m.to_le_bytes()[0..3]);
    frame[8..10].copy_from_slice(&pace_s_per_500m.to_le_bytes());
    frame[10..12].copy_from_slice(&power.to_le_bytes());
    frame[12..14].copy_from_slice(&avg_power.to_le_bytes());
    frame[14..16].copy_from_slice(&energy.to_le_bytes());
    frame
}

pub fn build_extended_metrics_frame(
    avg_stroke_power_w: u16,
    drive_ticks: u16,
    recovery_ticks: u16,
    drag_factor: u16,
) -> [u8; EXTENDED_FRAME_LEN] {
    let mut frame = [0u8; EXTENDED_FRAME_LEN];
    frame[0..2].copy_from_slice(&avg_stroke_power_w.to_le_bytes());
    frame[2..4].copy_from_slice(&drive_ticks.to_le_bytes());
    frame[4..6].copy_from_slice(&recovery_ticks.to_le_bytes());
    frame[6..8].copy_from_slice(&drag_factor.to_le_bytes());
    frame
}

pub fn build_delta_times_frame(intervals_us: &[u32]) -> Vec<u8> {
    intervals_us
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

pub fn build_handle_force_fragment(index: u8, total: u8, forces_n: &[f32]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + forces_n.len() * 4);
    payload.push(index);
    payload.push(total);
    for force in forces_n {
        payload.extend_from_slice(&force.to_le_bytes());
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPS_WHEEL_TICK_US: u64 = 1_000_000 / 2048 + 1;
    const CRANK_TICK_US: u64 = 1_000_000 / 1024 + 1;

    #[test]
    fn cps_round_trip_within_tick_tolerance() {
        let target = BaseMetrics {
            stroke_time_us: 5_120_000,
            rev_time_us: 3_250_000,
            distance_cm: 123_456,
            stroke_count: 42,
        };
        let wheel_ticks = (target.rev_time_us * 2048 / 1_000_000) as u16;
        let crank_ticks = (target.stroke_time_us * 1024 / 1_000_000) as u16;
        let frame = build_cps_frame(
            185,
            target.distance_cm as u32,
            wheel_ticks,
            target.stroke_count as u16,
            crank_ticks,
        );

        let mut decoder = CpsDecoder::new();
        let decoded = decoder.decode(&frame).unwrap();

        assert_eq!(decoded.distance_cm, target.distance_cm);
        assert_eq!(decoded.stroke_count, target.stroke_count);
        assert!(decoded.rev_time_us.abs_diff(target.rev_time_us) <= CPS_WHEEL_TICK_US);
        assert!(decoded.stroke_time_us.abs_diff(target.stroke_time_us) <= CRANK_TICK_US);
    }

    #[test]
    fn cps_unwraps_sixteen_bit_event_times() {
        let mut decoder = CpsDecoder::new();
        // near the top of the 16-bit range
        let first = decoder
            .decode(&build_cps_frame(0, 10, 65_000, 5, 65_200))
            .unwrap();
        // wrapped around
        let second = decoder
            .decode(&build_cps_frame(0, 11, 500, 6, 300))
            .unwrap();

        let wheel_delta_ticks = 500u16.wrapping_sub(65_000) as u64;
        let expected_rev = (65_000 + wheel_delta_ticks) * 1_000_000 / 2048;
        assert_eq!(second.rev_time_us, expected_rev);
        assert!(second.rev_time_us > first.rev_time_us);
        assert!(second.stroke_time_us > first.stroke_time_us);
    }

    #[test]
    fn cps_counter_decrease_rebaselines() {
        let mut decoder = CpsDecoder::new();
        decoder
            .decode(&build_cps_frame(0, 5_000, 40_000, 900, 41_000))
            .unwrap();
        // the device rebooted: everything is small again
        let after_reset = decoder.decode(&build_cps_frame(0, 3, 80, 1, 90)).unwrap();

        assert_eq!(after_reset.distance_cm, 3);
        assert_eq!(after_reset.stroke_count, 1);
        assert_eq!(after_reset.rev_time_us, 80 * 1_000_000 / 2048);
        assert_eq!(after_reset.stroke_time_us, 90 * 1_000_000 / 1024);
    }

    #[test]
    fn csc_round_trip_within_tick_tolerance() {
        let target = BaseMetrics {
            stroke_time_us: 7_000_000,
            rev_time_us: 6_500_000,
            distance_cm: 88_000,
            stroke_count: 77,
        };
        let wheel_ticks = (target.rev_time_us * 1024 / 1_000_000) as u16;
        let crank_ticks = (target.stroke_time_us * 1024 / 1_000_000) as u16;
        let frame = build_csc_frame(
            target.distance_cm as u32,
            wheel_ticks,
            target.stroke_count as u16,
            crank_ticks,
        );

        let mut decoder = CscDecoder::new();
        let decoded = decoder.decode(&frame).unwrap();

        assert_eq!(decoded.distance_cm, target.distance_cm);
        assert_eq!(decoded.stroke_count, target.stroke_count);
        assert!(decoded.rev_time_us.abs_diff(target.rev_time_us) <= CRANK_TICK_US);
        assert!(decoded.stroke_time_us.abs_diff(target.stroke_time_us) <= CRANK_TICK_US);
    }

    #[test]
    fn ftms_reconstructs_times_from_rate_and_pace() {
        let mut decoder = FtmsDecoder::new();
        // 24 spm (raw 48), 150 m at 120 s/500m pace, 10 strokes
        let first = decoder
            .decode(&build_ftms_frame(48, 10, 150, 120, 180, 175, 12))
            .unwrap();
        assert_eq!(first.distance_cm, 15_000);
        assert_eq!(first.stroke_count, 10);
        // 10 strokes at 2.5 s each
        assert_eq!(first.stroke_time_us, 10 * 120_000_000 / 48);
        // 15 000 cm at 120 s/500m: cm * pace * 20 µs
        assert_eq!(first.rev_time_us, 15_000 * 120 * 20);

        // next frame: 2 more strokes, 30 more meters, slightly faster pace
        let second = decoder
            .decode(&build_ftms_frame(52, 12, 180, 115, 190, 178, 13))
            .unwrap();
        assert_eq!(second.stroke_count, 12);
        assert_eq!(
            second.stroke_time_us,
            first.stroke_time_us + 2 * 120_000_000 / 52
        );
        assert_eq!(second.rev_time_us, first.rev_time_us + 3_000 * 115 * 20);
    }

    #[test]
    fn ftms_first_frame_has_zero_baseline() {
        let mut decoder = FtmsDecoder::new();
        let metrics = decoder
            .decode(&build_ftms_frame(0, 0, 0, 0, 0, 0, 0))
            .unwrap();
        assert_eq!(metrics, BaseMetrics::default());
    }

    #[test]
    fn ftms_counter_decrease_rebaselines() {
        let mut decoder = FtmsDecoder::new();
        decoder
            .decode(&build_ftms_frame(48, 100, 1_500, 120, 180, 175, 80))
            .unwrap();
        let after_reset = decoder
            .decode(&build_ftms_frame(40, 2, 20, 130, 150, 150, 1))
            .unwrap();
        assert_eq!(after_reset.stroke_count, 2);
        assert_eq!(after_reset.distance_cm, 2_000);
        assert_eq!(after_reset.stroke_time_us, 2 * 120_000_000 / 40);
        assert_eq!(after_reset.rev_time_us, 2_000 * 130 * 20);
    }

    #[test]
    fn short_frames_are_rejected() {
        assert!(matches!(
            CpsDecoder::new().decode(&[0u8; 13]),
            Err(CodecError::TooShort { expected: 14, .. })
        ));
        assert!(matches!(
            CscDecoder::new().decode(&[0u8; 10]),
            Err(CodecError::TooShort { expected: 11, .. })
        ));
        assert!(matches!(
            FtmsDecoder::new().decode(&[0u8; 15]),
            Err(CodecError::TooShort { expected: 16, .. })
        ));
        assert!(matches!(
            decode_extended_metrics(&[0u8; 7]),
            Err(CodecError::TooShort { expected: 8, .. })
        ));
    }

    #[test]
    fn delta_times_decode_one_list_per_notification() {
        let intervals = [11_042u32, 10_980, 11_107];
        let payload = build_delta_times_frame(&intervals);
        let frame = decode_delta_times(&payload).unwrap();
        assert_eq!(frame.intervals_us, intervals);

        assert!(matches!(
            decode_delta_times(&payload[..7]),
            Err(CodecError::Length(7))
        ));
    }

    #[test]
    fn extended_metrics_scale_ticks_to_microseconds() {
        let frame = build_extended_metrics_frame(215, 4096, 8192, 112);
        let decoded = decode_extended_metrics(&frame).unwrap();
        assert_eq!(decoded.avg_stroke_power_w, 215);
        assert_eq!(decoded.drive_duration_us, 1_000_000);
        assert_eq!(decoded.recovery_duration_us, 2_000_000);
        assert_eq!(decoded.drag_factor, 112);
    }

    #[test]
    fn handle_force_series_flushes_on_completion() {
        let mut assembler = HandleForceAssembler::new();
        let a = [1.0f32, 2.0];
        let b = [3.0f32, 4.0];
        let c = [5.0f32];

        assert!(assembler
            .push(&build_handle_force_fragment(1, 3, &a))
            .unwrap()
            .is_empty());
        assert!(assembler
            .push(&build_handle_force_fragment(2, 3, &b))
            .unwrap()
            .is_empty());
        let frames = assembler
            .push(&build_handle_force_fragment(3, 3, &c))
            .unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].forces_n, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn incomplete_handle_force_series_emits_nothing() {
        let mut assembler = HandleForceAssembler::new();
        assembler
            .push(&build_handle_force_fragment(1, 3, &[1.0]))
            .unwrap();
        let frames = assembler
            .push(&build_handle_force_fragment(2, 3, &[2.0]))
            .unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn out_of_order_fragment_flushes_accumulated_series() {
        let mut assembler = HandleForceAssembler::new();
        assembler
            .push(&build_handle_force_fragment(1, 3, &[1.0, 2.0]))
            .unwrap();
        // a fresh series starts before the old one completed
        let frames = assembler
            .push(&build_handle_force_fragment(1, 1, &[9.0]))
            .unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].forces_n, vec![1.0, 2.0]);
        assert_eq!(frames[1].forces_n, vec![9.0]);
    }

    #[test]
    fn malformed_handle_force_fragment_is_rejected() {
        let mut assembler = HandleForceAssembler::new();
        assert!(assembler.push(&[1]).is_err());
        assert!(assembler.push(&[0, 3, 0, 0, 0x80, 0x3f]).is_err());
        assert!(assembler.push(&[4, 3, 0, 0, 0x80, 0x3f]).is_err());
        // a parse error must not disturb a running series
        assembler
            .push(&build_handle_force_fragment(1, 2, &[1.0]))
            .unwrap();
        assert!(assembler.push(&[1]).is_err());
        let frames = assembler
            .push(&build_handle_force_fragment(2, 2, &[2.0]))
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].forces_n, vec![1.0, 2.0]);
    }

    #[test]
    fn battery_level_reads_first_byte() {
        assert_eq!(decode_battery_level(&[87]).unwrap(), 87);
        assert!(decode_battery_level(&[]).is_err());
    }
}
