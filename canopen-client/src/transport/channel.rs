// channel.rs - channel handle, bring-up and fault recovery
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::bus::{is_fatal_io_error, BusOpener, CanBus};
use super::frame::CanMessage;

/// Lifecycle of the channel handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unconfigured,
    Probing,
    Ready,
    Faulted,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("CAN channel not ready")]
    NotReady,
    #[error("CAN write error: {0}")]
    Write(#[source] io::Error),
    #[error("CAN read error: {0}")]
    Read(#[source] io::Error),
}

struct Shared {
    state: Mutex<ChannelState>,
    bus: RwLock<Option<Arc<dyn CanBus>>>,
    running: AtomicBool,
    ready: Notify,
    monitor: Mutex<Option<JoinHandle<()>>>,
    exchange: AsyncMutex<()>,
}

impl Shared {
    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ChannelState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            trace!("CAN channel {:?} -> {:?}", *current, state);
            *current = state;
        }
        drop(current);

        if state == ChannelState::Ready {
            self.ready.notify_waiters();
        }
    }

    fn install(&self, bus: Arc<dyn CanBus>) {
        *self.bus.write().unwrap_or_else(PoisonError::into_inner) = Some(bus);
        self.set_state(ChannelState::Ready);
    }

    fn release(&self) {
        self.bus.write().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn ready_bus(&self) -> Result<Arc<dyn CanBus>, TransportError> {
        if self.state() != ChannelState::Ready {
            return Err(TransportError::NotReady);
        }
        self.bus
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::NotReady)
    }

    /// Flag the channel for re-opening if the error killed the handle
    fn note_io_error(&self, err: &io::Error) {
        if is_fatal_io_error(err) && self.state() == ChannelState::Ready {
            warn!("CAN channel fault: {}", err);
            self.set_state(ChannelState::Faulted);
        }
    }

    fn write(&self, frame: &CanMessage) -> Result<(), TransportError> {
        let bus = self.ready_bus()?;
        trace!("TX {}", frame);
        bus.write_frame(frame).map_err(|err| {
            self.note_io_error(&err);
            TransportError::Write(err)
        })
    }

    fn read(&self) -> Result<Option<CanMessage>, TransportError> {
        let bus = self.ready_bus()?;
        match bus.read_frame() {
            Ok(Some(frame)) => {
                trace!("RX {}", frame);
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.note_io_error(&err);
                Err(TransportError::Read(err))
            }
        }
    }
}

/// Handle to the CAN channel.
///
/// Cheap to clone; every clone talks to the same bus. The monitor task
/// spawned by [`CanChannel::initialize`] owns bring-up and fault recovery
/// and drains the outbound queue fed by PDO workers.
#[derive(Clone)]
pub struct CanChannel {
    shared: Arc<Shared>,
    outbound_tx: mpsc::UnboundedSender<CanMessage>,
}

impl CanChannel {
    /// Spawn the monitor task and return immediately.
    ///
    /// Must be called from within a Tokio runtime. The monitor retries
    /// `opener` every `poll_interval` until it succeeds, forever.
    pub fn initialize(opener: impl BusOpener, poll_interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(ChannelState::Unconfigured),
            bus: RwLock::new(None),
            running: AtomicBool::new(true),
            ready: Notify::new(),
            monitor: Mutex::new(None),
            exchange: AsyncMutex::new(()),
        });
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let monitor = tokio::spawn(channel_monitor_task(
            shared.clone(),
            Box::new(opener),
            outbound_rx,
            poll_interval,
        ));
        *shared.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(monitor);

        Self { shared, outbound_tx }
    }

    /// Send one frame. Failures are returned, never retried here.
    pub fn write(&self, frame: &CanMessage) -> Result<(), TransportError> {
        self.shared.write(frame)
    }

    /// One non-blocking poll of the receive queue
    pub fn read(&self) -> Result<Option<CanMessage>, TransportError> {
        self.shared.read()
    }

    /// Discard every frame currently waiting. Returns how many were dropped.
    pub fn flush(&self) -> usize {
        let mut dropped = 0;
        while let Ok(Some(_)) = self.shared.read() {
            dropped += 1;
        }
        dropped
    }

    /// Exclusive use of the receive queue for a request/response exchange.
    ///
    /// Held for a whole SDO transfer, so a transfer never flushes or
    /// drops replies meant for another one in flight on the same channel.
    pub async fn lock_exchange(&self) -> AsyncMutexGuard<'_, ()> {
        self.shared.exchange.lock().await
    }

    pub fn is_ready(&self) -> bool {
        self.shared.state() == ChannelState::Ready
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Resolve once the monitor reports the channel ready
    pub async fn wait_until_ready(&self) {
        loop {
            let notified = self.shared.ready.notified();
            if self.is_ready() {
                return;
            }
            notified.await;
        }
    }

    /// Stop the monitor and close the bus handle
    pub fn deinitialize(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(monitor) = self
            .shared
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            monitor.abort();
        }
        self.shared.release();
        self.shared.set_state(ChannelState::Unconfigured);
        info!("CAN channel de-initialised");
    }

    /// Queue feeding frames to the monitor, which writes them in order
    pub(crate) fn outbound(&self) -> mpsc::UnboundedSender<CanMessage> {
        self.outbound_tx.clone()
    }
}

/// Background task that owns channel bring-up and fault recovery
async fn channel_monitor_task(
    shared: Arc<Shared>,
    opener: Box<dyn BusOpener>,
    mut outbound_rx: mpsc::UnboundedReceiver<CanMessage>,
    poll_interval: Duration,
) {
    let name = opener.describe();
    let mut attempts: u64 = 0;

    while shared.running.load(Ordering::Acquire) {
        match shared.state() {
            ChannelState::Ready => {
                let alive = shared
                    .ready_bus()
                    .map(|bus| bus.check())
                    .unwrap_or_else(|_| Ok(()));
                if let Err(err) = alive {
                    warn!("CAN channel {} de-initialised: {}", name, err);
                    shared.set_state(ChannelState::Faulted);
                    continue;
                }

                tokio::select! {
                    frame = outbound_rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(err) = shared.write(&frame) {
                                debug!("Dropped outbound frame {}: {}", frame, err);
                            }
                        }
                        None => break, // every channel handle is gone
                    },
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }

            ChannelState::Faulted => {
                shared.release();
                shared.set_state(ChannelState::Probing);
                attempts = 0;
            }

            ChannelState::Unconfigured | ChannelState::Probing => {
                shared.set_state(ChannelState::Probing);

                // Nothing can be sent while probing
                while outbound_rx.try_recv().is_ok() {}

                attempts += 1;
                match opener.open() {
                    Ok(bus) => {
                        shared.install(bus);
                        info!("CAN channel {} successfully initialised", name);
                    }
                    Err(err) => {
                        if attempts == 1 {
                            warn!("Could not open CAN channel {}: {} (retrying)", name, err);
                        } else {
                            trace!("CAN channel {} still unavailable: {}", name, err);
                        }
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            }
        }
    }

    shared.release();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::VirtualBus;
    use std::time::Instant;

    const POLL: Duration = Duration::from_millis(5);

    async fn ready(channel: &CanChannel) {
        tokio::time::timeout(Duration::from_secs(1), channel.wait_until_ready())
            .await
            .expect("channel did not become ready");
    }

    #[tokio::test]
    async fn initialize_returns_before_bring_up() {
        let (host, _device) = VirtualBus::pair();
        let channel = CanChannel::initialize(host.opener(), POLL);

        assert!(matches!(
            channel.state(),
            ChannelState::Unconfigured | ChannelState::Probing
        ));
        assert!(matches!(
            channel.write(&CanMessage::standard(0x1, [0; 8])),
            Err(TransportError::NotReady)
        ));

        ready(&channel).await;
        assert!(channel.is_ready());
    }

    #[tokio::test]
    async fn write_and_read_go_through_the_bus() {
        let (host, device) = VirtualBus::pair();
        let channel = CanChannel::initialize(host.opener(), POLL);
        ready(&channel).await;

        channel.write(&CanMessage::new(0x123, false, &[9]).unwrap()).unwrap();
        assert_eq!(device.drain().len(), 1);

        assert_eq!(channel.read().unwrap(), None);
        device.write_frame(&CanMessage::new(0x321, false, &[1]).unwrap()).unwrap();
        device.write_frame(&CanMessage::new(0x322, false, &[2]).unwrap()).unwrap();
        assert_eq!(channel.read().unwrap().map(|f| f.id), Some(0x321));
        assert_eq!(channel.flush(), 1);
        assert_eq!(channel.read().unwrap(), None);
    }

    #[tokio::test]
    async fn keeps_probing_until_the_device_appears() {
        let (host, device) = VirtualBus::pair();
        device.set_link(false);
        let channel = CanChannel::initialize(host.opener(), POLL);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(channel.state(), ChannelState::Probing);

        device.set_link(true);
        ready(&channel).await;
    }

    #[tokio::test]
    async fn recovers_after_fatal_fault() {
        let (host, device) = VirtualBus::pair();
        let channel = CanChannel::initialize(host.opener(), POLL);
        ready(&channel).await;

        device.set_link(false);
        let err = channel.write(&CanMessage::standard(0x1, [0; 8])).unwrap_err();
        assert!(matches!(err, TransportError::Write(_)));
        assert_ne!(channel.state(), ChannelState::Ready);

        let start = Instant::now();
        while channel.state() != ChannelState::Probing && start.elapsed() < Duration::from_secs(1) {
            tokio::time::sleep(POLL).await;
        }
        assert_eq!(channel.state(), ChannelState::Probing);

        device.set_link(true);
        ready(&channel).await;
        assert!(channel.write(&CanMessage::standard(0x1, [0; 8])).is_ok());
    }

    #[tokio::test]
    async fn outbound_queue_is_written_by_the_monitor() {
        let (host, device) = VirtualBus::pair();
        let channel = CanChannel::initialize(host.opener(), POLL);
        ready(&channel).await;

        channel
            .outbound()
            .send(CanMessage::new(0x181, false, &[0xAB]).unwrap())
            .unwrap();

        let start = Instant::now();
        while device.pending() == 0 && start.elapsed() < Duration::from_secs(1) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let frames = device.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &[0xAB]);
    }

    #[tokio::test]
    async fn deinitialize_closes_the_channel() {
        let (host, _device) = VirtualBus::pair();
        let channel = CanChannel::initialize(host.opener(), POLL);
        ready(&channel).await;

        channel.deinitialize();
        assert_eq!(channel.state(), ChannelState::Unconfigured);
        assert!(matches!(channel.read(), Err(TransportError::NotReady)));
    }
}
