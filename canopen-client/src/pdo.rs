// pdo.rs - periodic PDO transmission
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::transport::{CanChannel, CanMessage, CAN_MAX_DLEN};

/// Number of PDO slots
pub const PDO_MAX: usize = 0x1F8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PdoError {
    #[error("Invalid TPDO CAN-ID 0x{0:03X}")]
    InvalidCanId(u16),
    #[error("PDO period must be non-zero")]
    InvalidPeriod,
    #[error("Could not add PDO 0x{0:03X}: no empty slot available")]
    TableFull(u16),
}

/// Node-ID range `0x000-0x07F` or TPDO1-4 (`0x181-0x1FF` .. `0x481-0x4FF`)
pub fn is_valid_pdo_id(can_id: u16) -> bool {
    match can_id {
        0x000..=0x07F => true,
        0x181..=0x1FF | 0x281..=0x2FF | 0x381..=0x3FF | 0x481..=0x4FF => true,
        _ => false,
    }
}

/// Frame for a PDO: `data` packed most significant byte first, trimmed to `length`
pub fn pdo_frame(can_id: u16, length: u8, data: u64) -> CanMessage {
    let length = usize::from(length).min(CAN_MAX_DLEN);
    let bytes = data.to_be_bytes();
    let mut payload = [0u8; CAN_MAX_DLEN];
    payload[..length].copy_from_slice(&bytes[CAN_MAX_DLEN - length..]);

    CanMessage {
        id: u32::from(can_id),
        extended: false,
        len: length as u8,
        data: payload,
        timestamp_us: 0,
    }
}

/// Snapshot of an active PDO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdoRegistration {
    pub slot: usize,
    pub can_id: u16,
    pub period: Duration,
    pub length: u8,
    pub data: u64,
}

struct PdoSlot {
    can_id: u16,
    period: Duration,
    length: u8,
    data: u64,
    worker: JoinHandle<()>,
}

/// Fixed table of periodic transmissions.
///
/// Workers never touch the bus: they push frames into the channel's
/// outbound queue, which the channel monitor writes. A worker stops when
/// that queue closes, and its slot is released on the next table access.
pub struct PdoScheduler {
    outbound: mpsc::UnboundedSender<CanMessage>,
    slots: Mutex<Vec<Option<PdoSlot>>>,
}

impl PdoScheduler {
    pub fn new(channel: &CanChannel) -> Self {
        Self {
            outbound: channel.outbound(),
            slots: Mutex::new((0..PDO_MAX).map(|_| None).collect()),
        }
    }

    /// Start sending `data` on `can_id` every `period`. Replaces any
    /// registration already using `can_id`. Returns the slot used.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn add(&self, can_id: u16, period: Duration, length: u8, data: u64) -> Result<usize, PdoError> {
        if !is_valid_pdo_id(can_id) {
            return Err(PdoError::InvalidCanId(can_id));
        }
        if period.is_zero() {
            return Err(PdoError::InvalidPeriod);
        }
        let length = length.min(CAN_MAX_DLEN as u8);

        let mut slots = self.lock_slots();
        remove_id(&mut slots, can_id);

        let slot = slots
            .iter()
            .position(Option::is_none)
            .ok_or(PdoError::TableFull(can_id))?;

        let worker = tokio::spawn(pdo_worker(
            pdo_frame(can_id, length, data),
            period,
            self.outbound.clone(),
        ));
        slots[slot] = Some(PdoSlot {
            can_id,
            period,
            length,
            data,
            worker,
        });

        debug!("PDO 0x{:03X} added in slot {}: 0x{:X} every {:?}", can_id, slot, data, period);
        Ok(slot)
    }

    /// Stop sending on `can_id`. Returns whether a registration existed.
    pub fn del(&self, can_id: u16) -> Result<bool, PdoError> {
        if !is_valid_pdo_id(can_id) {
            return Err(PdoError::InvalidCanId(can_id));
        }

        let mut slots = self.lock_slots();
        let removed = remove_id(&mut slots, can_id);
        if removed {
            debug!("PDO 0x{:03X} deleted", can_id);
        }
        Ok(removed)
    }

    pub fn active_count(&self) -> usize {
        self.lock_slots().iter().filter(|slot| slot.is_some()).count()
    }

    pub fn registration(&self, can_id: u16) -> Option<PdoRegistration> {
        let slots = self.lock_slots();
        slots.iter().enumerate().find_map(|(slot, entry)| match entry {
            Some(pdo) if pdo.can_id == can_id => Some(PdoRegistration {
                slot,
                can_id: pdo.can_id,
                period: pdo.period,
                length: pdo.length,
                data: pdo.data,
            }),
            _ => None,
        })
    }

    /// The slot table with stopped workers already released
    fn lock_slots(&self) -> MutexGuard<'_, Vec<Option<PdoSlot>>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        for entry in slots.iter_mut() {
            if entry.as_ref().is_some_and(|pdo| pdo.worker.is_finished()) {
                if let Some(pdo) = entry.take() {
                    debug!("PDO 0x{:03X} stopped with its channel", pdo.can_id);
                }
            }
        }
        slots
    }

    /// Cancel every registration
    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        for pdo in slots.iter_mut().filter_map(Option::take) {
            pdo.worker.abort();
        }
    }
}

impl Drop for PdoScheduler {
    fn drop(&mut self) {
        self.clear();
    }
}

fn remove_id(slots: &mut [Option<PdoSlot>], can_id: u16) -> bool {
    let Some(entry) = slots
        .iter_mut()
        .find(|entry| entry.as_ref().is_some_and(|pdo| pdo.can_id == can_id))
    else {
        return false;
    };

    if let Some(pdo) = entry.take() {
        pdo.worker.abort();
    }
    true
}

async fn pdo_worker(frame: CanMessage, period: Duration, outbound: mpsc::UnboundedSender<CanMessage>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if outbound.send(frame).is_err() {
                    break;
                }
            }
            _ = outbound.closed() => break,
        }
    }
    trace!("PDO 0x{:03X}: channel gone, stopping", frame.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::ready_channel;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn valid_id_ranges() {
        assert!(is_valid_pdo_id(0x000));
        assert!(is_valid_pdo_id(0x07F));
        assert!(!is_valid_pdo_id(0x080));
        for base in [0x180, 0x280, 0x380, 0x480] {
            assert!(!is_valid_pdo_id(base));
            assert!(is_valid_pdo_id(base + 1));
            assert!(is_valid_pdo_id(base + 0x7F));
            assert!(!is_valid_pdo_id(base + 0x80));
        }
        assert!(!is_valid_pdo_id(0x500));
        assert!(!is_valid_pdo_id(0x7FF));
    }

    #[test]
    fn frame_packs_msb_first() {
        let frame = pdo_frame(0x181, 4, 0x1122_3344);
        assert_eq!(frame.payload(), &[0x11, 0x22, 0x33, 0x44]);

        let frame = pdo_frame(0x181, 2, 0x1122_3344);
        assert_eq!(frame.payload(), &[0x33, 0x44]);

        let frame = pdo_frame(0x201, 12, 0x0102_0304_0506_0708);
        assert_eq!(frame.len, 8);
        assert_eq!(frame.payload(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn add_then_del_leaves_no_timers() {
        let (channel, _device) = ready_channel().await;
        let pdo = PdoScheduler::new(&channel);

        pdo.add(0x181, Duration::from_millis(100), 4, 0x1122_3344).unwrap();
        assert_eq!(pdo.active_count(), 1);

        assert_eq!(pdo.del(0x181), Ok(true));
        assert_eq!(pdo.active_count(), 0);
        assert_eq!(pdo.registration(0x181), None);
    }

    #[tokio::test]
    async fn re_adding_replaces_the_registration() {
        let (channel, device) = ready_channel().await;
        let pdo = PdoScheduler::new(&channel);

        pdo.add(0x181, Duration::from_millis(10), 4, 0xAAAA_AAAA).unwrap();
        pdo.add(0x181, Duration::from_millis(10), 4, 0x1122_3344).unwrap();
        assert_eq!(pdo.active_count(), 1);
        assert_eq!(pdo.registration(0x181).map(|r| r.data), Some(0x1122_3344));

        tokio::time::sleep(Duration::from_millis(80)).await;
        let frames = device.drain();
        assert!(!frames.is_empty());
        for frame in &frames {
            assert_eq!(frame.id, 0x181);
            assert_eq!(frame.payload(), &[0x11, 0x22, 0x33, 0x44]);
        }
    }

    #[tokio::test]
    async fn closing_the_channel_releases_every_slot() {
        let (channel, _device) = ready_channel().await;
        let pdo = PdoScheduler::new(&channel);
        pdo.add(0x181, HOUR, 1, 1).unwrap();
        pdo.add(0x182, Duration::from_millis(5), 1, 1).unwrap();
        assert_eq!(pdo.active_count(), 2);

        channel.deinitialize();

        let start = Instant::now();
        while pdo.active_count() > 0 && start.elapsed() < Duration::from_secs(1) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(pdo.active_count(), 0);
        assert_eq!(pdo.registration(0x181), None);
    }

    #[tokio::test]
    async fn deleting_unknown_ids() {
        let (channel, _device) = ready_channel().await;
        let pdo = PdoScheduler::new(&channel);
        pdo.add(0x182, HOUR, 1, 1).unwrap();

        assert_eq!(pdo.del(0x281), Ok(false));
        assert_eq!(pdo.active_count(), 1);
        assert_eq!(pdo.del(0x180), Err(PdoError::InvalidCanId(0x180)));
    }

    #[tokio::test]
    async fn validation_errors() {
        let (channel, _device) = ready_channel().await;
        let pdo = PdoScheduler::new(&channel);

        assert_eq!(pdo.add(0x280, HOUR, 4, 0), Err(PdoError::InvalidCanId(0x280)));
        assert_eq!(pdo.add(0x600, HOUR, 4, 0), Err(PdoError::InvalidCanId(0x600)));
        assert_eq!(pdo.add(0x181, Duration::ZERO, 4, 0), Err(PdoError::InvalidPeriod));
        assert_eq!(pdo.active_count(), 0);
    }

    #[tokio::test]
    async fn table_exhaustion_is_reported() {
        let (channel, _device) = ready_channel().await;
        let pdo = PdoScheduler::new(&channel);

        let mut ids = (0u16..=0x4FF).filter(|id| is_valid_pdo_id(*id));
        for expected_slot in 0..PDO_MAX {
            let id = ids.next().unwrap();
            assert_eq!(pdo.add(id, HOUR, 8, 0), Ok(expected_slot));
        }

        let overflow = ids.next().unwrap();
        assert_eq!(pdo.add(overflow, HOUR, 8, 0), Err(PdoError::TableFull(overflow)));

        // Freed slots are reused
        pdo.del(0x005).unwrap();
        assert_eq!(pdo.add(overflow, HOUR, 8, 0), Ok(5));

        pdo.clear();
        assert_eq!(pdo.active_count(), 0);
    }
}
