//! Streaming decoder for the device's on-board flash log.
//!
//! The log region is paged at 256 bytes and scanned bytewise: erased
//! flash reads as EMPTY tags, so a run of 32 of them is the
//! end-of-data sentinel. Entry timestamps are reconstructed from the
//! 30-bit MCU tick counter (4 ms per tick) against a fixed scan epoch,
//! rebased by SYSTEM_TIME markers and bumped a day per power-on.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::debug;

use crate::codec::{LogEntry, LogTag, Wire};
use crate::config::{
    DEVICE_TIME_EPOCH_SECS, LOG_BASE_EPOCH_SECS, LOG_EMPTY_SENTINEL_RUN, LOG_PAGE_SIZE,
    MCU_TICK_MS,
};

/// One telemetry record recovered from the flash log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Reconstructed UTC sample time.
    pub timestamp: DateTime<Utc>,
    /// The decoded entry.
    pub entry: LogEntry,
}

impl LogRecord {
    /// Temperature channel in degrees Celsius.
    pub fn temperature_c(&self, channel: usize) -> f64 {
        self.entry.temperatures[channel] as f64
    }

    /// Pin voltage in volts (log entries store tenths of a volt).
    pub fn pin_voltage_v(&self, pin: usize) -> f64 {
        self.entry.pins[pin].0 as f64 / 10.0
    }

    /// Pin current in amps (log entries store tenths of an ampere).
    pub fn pin_current_a(&self, pin: usize) -> f64 {
        self.entry.pins[pin].1 as f64 / 10.0
    }
}

/// The fixed scan epoch, 2026-01-01 00:00:00 UTC.
fn base_epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(LOG_BASE_EPOCH_SECS, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

/// The device time epoch SYSTEM_TIME offsets count from.
fn device_epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(DEVICE_TIME_EPOCH_SECS, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Decode a flash dump into timestamped records.
///
/// The scan walks every byte offset: full entries consume their slot,
/// marker tags (EMPTY, SYSTEM_TIME, POWER_ON) advance a single byte.
/// Once at least one entry has been emitted, a slot that would
/// straddle a page boundary jumps to the next page, and a run of
/// [`LOG_EMPTY_SENTINEL_RUN`] EMPTY tags terminates the scan.
pub fn parse_log(bytes: &[u8]) -> Vec<LogRecord> {
    let mut records = Vec::new();
    let mut base = base_epoch();
    let mut last_tick: u32 = 0;
    let mut empty_run = 0usize;
    let mut offset = 0usize;

    while offset + LogEntry::SIZE <= bytes.len() {
        if !records.is_empty() && offset % LOG_PAGE_SIZE > LOG_PAGE_SIZE - LogEntry::SIZE {
            // Entry would span a page boundary; its slot is invalid.
            offset = (offset / LOG_PAGE_SIZE + 1) * LOG_PAGE_SIZE;
            continue;
        }

        let header = u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]);
        let ticks = header >> 2;

        match LogTag::from_header(header) {
            LogTag::Empty => {
                offset += 1;
                if !records.is_empty() {
                    empty_run += 1;
                    if empty_run >= LOG_EMPTY_SENTINEL_RUN {
                        debug!("empty sentinel run at offset {}", offset);
                        break;
                    }
                }
            }
            LogTag::SystemTime => {
                // Wall time transmitted by the firmware: seconds since
                // the device time epoch, rebasing the running clock.
                base = device_epoch() + ChronoDuration::seconds(ticks as i64);
                offset += 1;
            }
            LogTag::PowerOn => {
                base = base + ChronoDuration::days(1);
                offset += 1;
            }
            LogTag::McuTick => {
                if ticks == 0 {
                    offset += LogEntry::SIZE;
                    continue;
                }
                if ticks < last_tick {
                    // Tick counter restarted: the device power-cycled.
                    base = base + ChronoDuration::days(1);
                }
                let delta = ticks.wrapping_sub(last_tick) & 0x3FFF_FFFF;
                last_tick = ticks;
                base = base + ChronoDuration::milliseconds(delta as i64 * MCU_TICK_MS);

                match LogEntry::decode(&bytes[offset..offset + LogEntry::SIZE]) {
                    Ok(entry) if entry.sense_valid() => {
                        records.push(LogRecord {
                            timestamp: base,
                            entry,
                        });
                        empty_run = 0;
                    }
                    Ok(entry) => {
                        debug!(
                            "corrupt entry at offset {}: sense {}",
                            offset, entry.hpwr_sense
                        );
                    }
                    Err(e) => debug!("undecodable entry at offset {}: {}", offset, e),
                }
                offset += LogEntry::SIZE;
            }
        }
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick_entry(ticks: u32, sense: u8) -> Vec<u8> {
        LogEntry {
            header: LogEntry::pack_header(LogTag::McuTick, ticks),
            temperatures: [30, 45, 0, 0],
            pins: [(120, 5); 6],
            hpwr_sense: sense,
        }
        .encode()
    }

    /// SYSTEM_TIME marker whose three trailing header bytes read as
    /// EMPTY tags under the bytewise scan.
    fn system_time_marker(seconds: u32) -> Vec<u8> {
        let header = (seconds << 2) | LogTag::SystemTime as u32;
        header.to_le_bytes().to_vec()
    }

    #[test]
    fn test_single_entry_then_sentinel() {
        // One entry 250 ticks (1000 ms) after base, then erased flash.
        let mut bytes = tick_entry(250, 1);
        bytes.extend_from_slice(&[0xFF; 32]);
        // Pad so the trailing empties satisfy the o + 21 <= len scan
        // condition for all 32 increments.
        bytes.extend_from_slice(&[0xFF; 32]);

        let records = parse_log(&bytes);
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].timestamp,
            base_epoch() + ChronoDuration::milliseconds(1000)
        );
        assert_eq!(records[0].entry.hpwr_sense, 1);
    }

    #[test]
    fn test_sentinel_terminates_before_later_entries() {
        // A valid prefix, 40 empty bytes, then another entry. The
        // sentinel fires at 32 empties so the trailing entry is never
        // reached.
        let mut bytes = tick_entry(100, 0);
        bytes.extend_from_slice(&[0xFF; 40]);
        bytes.extend_from_slice(&tick_entry(200, 0));

        let records = parse_log(&bytes);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_leading_empties_do_not_count() {
        // Before any entry is emitted, erased bytes are not sentinel
        // material; the scan keeps walking.
        let mut bytes = vec![0xFF; 64];
        bytes.extend_from_slice(&tick_entry(100, 2));
        bytes.extend_from_slice(&[0xFF; 64]);

        let records = parse_log(&bytes);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entry.hpwr_sense, 2);
    }

    #[test]
    fn test_timestamps_non_decreasing() {
        let mut bytes = Vec::new();
        for ticks in [10u32, 260, 510, 510, 760] {
            bytes.extend_from_slice(&tick_entry(ticks, 1));
        }
        bytes.extend_from_slice(&[0xFF; 64]);

        let records = parse_log(&bytes);
        assert_eq!(records.len(), 5);
        for pair in records.windows(2) {
            assert!(pair[1].timestamp >= pair[0].timestamp);
        }
        // 10 ticks = 40 ms after base; each 250-tick step adds 1 s.
        assert_eq!(
            records[0].timestamp,
            base_epoch() + ChronoDuration::milliseconds(40)
        );
        assert_eq!(
            records[2].timestamp,
            base_epoch() + ChronoDuration::milliseconds(2040)
        );
        // Equal ticks advance the clock by zero.
        assert_eq!(records[3].timestamp, records[2].timestamp);
    }

    #[test]
    fn test_tick_regression_reads_as_power_cycle() {
        let mut bytes = tick_entry(1000, 0);
        bytes.extend_from_slice(&tick_entry(500, 0));
        bytes.extend_from_slice(&[0xFF; 64]);

        let records = parse_log(&bytes);
        assert_eq!(records.len(), 2);
        // A day was added on the regression; the wrapped delta also
        // advances the clock, so strictly later is all we can pin.
        assert!(records[1].timestamp > records[0].timestamp + ChronoDuration::days(1));
    }

    #[test]
    fn test_zero_tick_entry_skipped() {
        let mut bytes = tick_entry(0, 1);
        bytes.extend_from_slice(&tick_entry(250, 1));
        bytes.extend_from_slice(&[0xFF; 64]);

        let records = parse_log(&bytes);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entry.ticks(), 250);
    }

    #[test]
    fn test_corrupt_sense_skipped() {
        let mut bytes = tick_entry(250, 7);
        bytes.extend_from_slice(&tick_entry(500, 1));
        bytes.extend_from_slice(&[0xFF; 64]);

        let records = parse_log(&bytes);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entry.ticks(), 500);
        // The corrupt entry still advanced the tick clock.
        assert_eq!(
            records[0].timestamp,
            base_epoch() + ChronoDuration::milliseconds(2000)
        );
    }

    #[test]
    fn test_system_time_rebases_clock() {
        // Marker bytes [0x01, 0x03, 0x03, 0x03]: SYSTEM_TIME with the
        // three trailing bytes scanning as harmless EMPTY tags.
        let seconds = 0x00C0_C0C0u32;
        let marker = system_time_marker(seconds);
        assert_eq!(marker[0] & 0x3, LogTag::SystemTime as u8);
        assert_eq!(marker[1] & 0x3, LogTag::Empty as u8);
        assert_eq!(marker[2] & 0x3, LogTag::Empty as u8);
        assert_eq!(marker[3] & 0x3, LogTag::Empty as u8);

        let mut bytes = tick_entry(250, 1);
        bytes.extend_from_slice(&marker);
        bytes.extend_from_slice(&tick_entry(500, 1));
        bytes.extend_from_slice(&[0xFF; 64]);

        let records = parse_log(&bytes);
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[1].timestamp,
            device_epoch()
                + ChronoDuration::seconds(seconds as i64)
                + ChronoDuration::milliseconds(1000)
        );
    }

    #[test]
    fn test_power_on_marker_advances_a_day() {
        // Marker bytes [0x02, 0x03, 0x03, 0x03]: POWER_ON, trailing
        // bytes scanning as EMPTY.
        let header = (0x00C0_C0C0u32 << 2) | LogTag::PowerOn as u32;
        let marker = header.to_le_bytes();

        let mut bytes = tick_entry(250, 1);
        bytes.extend_from_slice(&marker);
        bytes.extend_from_slice(&tick_entry(500, 1));
        bytes.extend_from_slice(&[0xFF; 64]);

        let records = parse_log(&bytes);
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[1].timestamp,
            records[0].timestamp + ChronoDuration::days(1) + ChronoDuration::milliseconds(1000)
        );
    }

    #[test]
    fn test_page_straddling_slot_skipped() {
        // An entry whose slot begins in the last 20 bytes of a page is
        // invalid. Walk the scan to offset 236 with SYSTEM_TIME filler
        // (single-byte advance, does not feed the empty sentinel),
        // then plant an entry there: it must not be parsed.
        let mut bytes = tick_entry(250, 1);
        while bytes.len() < 236 {
            bytes.push(0x01);
        }
        bytes.extend_from_slice(&tick_entry(500, 1)); // offsets 236..257
        bytes.resize(261, 0x00);

        let records = parse_log(&bytes);
        // Offset 236 straddles the page boundary: the scan jumps to
        // 256, where no complete entry fits, so only the first entry
        // is recovered.
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_entry_at_page_start_after_skip() {
        let mut bytes = tick_entry(250, 1);
        while bytes.len() < 240 {
            bytes.push(0x01); // SYSTEM_TIME filler
        }
        bytes.resize(256, 0x01);
        bytes.extend_from_slice(&tick_entry(500_000, 1)); // offsets 256..277

        let records = parse_log(&bytes);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].entry.ticks(), 500_000);
    }

    #[test]
    fn test_empty_input() {
        assert!(parse_log(&[]).is_empty());
        assert!(parse_log(&[0xFF; 16]).is_empty());
    }
}
