//! Persistent device connections.
//!
//! A session pushes frames to one device and paces itself on the device's
//! acknowledgments:
//!
//! ```text
//! CONNECTING -> ACTIVE { SENDING -> AWAITING_ACK -> SENDING ... } -> CLOSED
//! ```
//!
//! A reader task consumes inbound messages and forwards display
//! confirmations to the writer over a small drop-oldest queue. The writer
//! owns the outbound half and is the only one that sends.
//!
//! The session is written against [`Sink`]/[`Stream`] of [`WireMessage`],
//! so it runs the same over an axum websocket or an in-memory channel.

use std::fmt::Display;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::engine::{Engine, Frame};
use crate::error::{Error, Result};
use crate::model::Transport;
use crate::notify::{Notification, Subscription};
use crate::protocol::{ack_timeout, brightness_to_wire, Ack, Outbound, WireMessage};
use crate::store::DeviceUpdate;

/// Pending display confirmations kept for the writer; older ones are dropped.
pub const ACK_QUEUE_CAPACITY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Sending,
    AwaitingAck,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    Acked,
    TimedOut,
    Interrupted,
    Closed,
}

/// Run a device session until the connection drops or the server shuts down.
///
/// Fails with [`Error::DeviceNotFound`] before sending anything if the
/// device is unknown. A lost connection ends the session with `Ok`.
pub async fn run_session<S, R, E>(
    engine: Arc<Engine>,
    device_id: &str,
    sink: S,
    stream: R,
) -> Result<()>
where
    S: Sink<WireMessage> + Unpin + Send,
    S::Error: Display,
    R: Stream<Item = std::result::Result<WireMessage, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let device = engine.device(device_id).await?;
    if let Err(e) = engine
        .store()
        .update_device(device_id, DeviceUpdate::Transport(Transport::WebSocket))
        .await
    {
        tracing::warn!("Failed to record transport for {}: {}", device_id, e);
    }

    let cancel = engine.shutdown_token().child_token();
    let (ack_tx, ack_rx) = broadcast::channel(ACK_QUEUE_CAPACITY);
    let reader = tokio::spawn(read_loop(
        engine.clone(),
        device.id.clone(),
        stream,
        ack_tx,
        cancel.clone(),
    ));
    let subscription = engine.notifier().subscribe(device_id);
    tracing::info!("Device {} connected", device_id);

    let mut writer = Writer {
        engine: engine.clone(),
        device_id: device.id.clone(),
        sink,
        acks: ack_rx,
        subscription,
        cancel: cancel.clone(),
        phase: Phase::Sending,
        sent_brightness: None,
        pending: None,
        immediate: false,
    };
    let result = writer.run().await;

    cancel.cancel();
    let Writer {
        mut sink,
        subscription,
        ..
    } = writer;
    engine.notifier().unsubscribe(subscription);
    let _ = sink.send(WireMessage::Close).await;
    let _ = sink.close().await;
    if let Err(e) = reader.await {
        tracing::warn!("Reader task for {} panicked: {}", device_id, e);
    }

    match &result {
        Ok(()) => tracing::info!("Device {} disconnected", device_id),
        Err(e) if e.is_fatal_to_session() => {
            tracing::info!("Device {} session ended: {}", device_id, e)
        }
        Err(e) => tracing::warn!("Device {} session failed: {}", device_id, e),
    }
    result
}

async fn read_loop<R, E>(
    engine: Arc<Engine>,
    device_id: String,
    mut stream: R,
    acks: broadcast::Sender<i64>,
    cancel: CancellationToken,
) where
    R: Stream<Item = std::result::Result<WireMessage, E>> + Unpin,
    E: Display,
{
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.next() => message,
        };

        let text = match message {
            Some(Ok(WireMessage::Text(text))) => text,
            Some(Ok(WireMessage::Binary(_))) => {
                touch(&engine, &device_id).await;
                continue;
            }
            Some(Ok(WireMessage::Close)) | None => break,
            Some(Err(e)) => {
                tracing::debug!("Read from {} failed: {}", device_id, e);
                break;
            }
        };
        touch(&engine, &device_id).await;

        let ack = match Ack::parse(&text) {
            Ok(ack) => ack,
            Err(e) => {
                tracing::debug!("Ignoring message from {}: {}", device_id, e);
                continue;
            }
        };
        if let Some(info) = ack.client_info.clone() {
            if let Err(e) = engine
                .store()
                .update_device(&device_id, info.into_update())
                .await
            {
                tracing::warn!("Failed to save client info for {}: {}", device_id, e);
            }
        }
        if let Some(queued) = ack.queued {
            tracing::trace!("{} has {} frames queued", device_id, queued);
        }
        if ack.confirms_display() {
            let counter = ack.displaying.or(ack.counter).unwrap_or_default();
            // No receiver means the writer is already gone
            let _ = acks.send(counter);
        }
    }
    cancel.cancel();
}

async fn touch(engine: &Engine, device_id: &str) {
    if let Err(e) = engine
        .store()
        .update_device(device_id, DeviceUpdate::LastSeen(Utc::now()))
        .await
    {
        tracing::warn!("Failed to update last seen for {}: {}", device_id, e);
    }
}

struct Writer<S> {
    engine: Arc<Engine>,
    device_id: String,
    sink: S,
    acks: broadcast::Receiver<i64>,
    subscription: Subscription,
    cancel: CancellationToken,
    phase: Phase,
    /// Last brightness sent on the wire, `None` before the first send
    sent_brightness: Option<u8>,
    /// Pushed image waiting to go out ahead of rotation
    pending: Option<Bytes>,
    /// Next frame should replace whatever the device has queued
    immediate: bool,
}

impl<S> Writer<S>
where
    S: Sink<WireMessage> + Unpin,
    S::Error: Display,
{
    async fn run(&mut self) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let device = self.engine.device(&self.device_id).await?;
            let now = Utc::now();
            let brightness = brightness_to_wire(device.effective_brightness(now));

            let frame = match self.pending.take() {
                Some(image) => Frame {
                    image,
                    dwell_secs: device.dwell_secs_for(None),
                    installation: None,
                },
                None => match self.engine.next_frame(&device, now).await {
                    Some(frame) => frame,
                    None => {
                        if self.idle(brightness).await? == Wait::Closed {
                            return Ok(());
                        }
                        continue;
                    }
                },
            };

            self.set_phase(Phase::Sending);
            self.drain_acks();
            self.send(Outbound::Dwell(frame.dwell_secs)).await?;
            self.send_brightness(brightness).await?;
            self.send_message(WireMessage::Binary(frame.image.clone()))
                .await?;
            if std::mem::take(&mut self.immediate) {
                self.send(Outbound::Immediate).await?;
            }

            let timeout = ack_timeout(frame.dwell_secs, device.has_protocol_version());
            match self.await_ack(&frame, timeout).await? {
                Wait::Closed => return Ok(()),
                Wait::Interrupted => self.immediate = true,
                Wait::Acked | Wait::TimedOut => {}
            }
        }
    }

    /// Nothing to show: keep brightness current and wait for a reason to retry.
    async fn idle(&mut self, brightness: u8) -> Result<Wait> {
        self.set_phase(Phase::Idle);
        self.send_brightness(brightness).await?;

        let wait = self.engine.config().idle_wait();
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(Wait::Closed),
            note = self.subscription.recv() => match note {
                Some(Notification::Image(image)) => {
                    self.pending = Some(image);
                    self.immediate = true;
                    Ok(Wait::Interrupted)
                }
                Some(Notification::Command(command)) => {
                    self.send(Outbound::Command(command)).await?;
                    Ok(Wait::TimedOut)
                }
                Some(Notification::Refresh) => Ok(Wait::TimedOut),
                None => Ok(Wait::Closed),
            },
            _ = tokio::time::sleep(wait) => Ok(Wait::TimedOut),
        }
    }

    async fn await_ack(&mut self, frame: &Frame, timeout: std::time::Duration) -> Result<Wait> {
        self.set_phase(Phase::AwaitingAck);
        let deadline = Instant::now() + timeout;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(Wait::Closed),
                ack = self.acks.recv() => match ack {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        self.confirm(frame).await;
                        return Ok(Wait::Acked);
                    }
                    Err(RecvError::Closed) => return Ok(Wait::Closed),
                },
                note = self.subscription.recv() => match note {
                    Some(Notification::Image(image)) => {
                        tracing::debug!("Push for {} interrupts current frame", self.device_id);
                        self.pending = Some(image);
                        return Ok(Wait::Interrupted);
                    }
                    Some(Notification::Refresh) => {
                        let device = self.engine.device(&self.device_id).await?;
                        let brightness = brightness_to_wire(device.effective_brightness(Utc::now()));
                        self.send_brightness(brightness).await?;
                    }
                    Some(Notification::Command(command)) => {
                        self.send(Outbound::Command(command)).await?;
                    }
                    None => return Ok(Wait::Closed),
                },
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::trace!("No ack from {} within {:?}", self.device_id, timeout);
                    return Ok(Wait::TimedOut);
                }
            }
        }
    }

    /// The device has the frame on screen; only now is it "displaying".
    async fn confirm(&mut self, frame: &Frame) {
        let Some(iname) = &frame.installation else {
            return;
        };
        let store = self.engine.store();
        match store
            .update_device(&self.device_id, DeviceUpdate::Displaying(Some(iname.clone())))
            .await
        {
            Ok(_) => {
                if let Ok(Some(device)) = store.device(&self.device_id).await {
                    self.engine.notify_dashboard(&device);
                }
            }
            Err(e) => tracing::warn!("Failed to record display for {}: {}", self.device_id, e),
        }
    }

    /// Throw away confirmations that arrived for earlier frames.
    fn drain_acks(&mut self) {
        loop {
            match self.acks.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    async fn send_brightness(&mut self, brightness: u8) -> Result<()> {
        if self.sent_brightness == Some(brightness) {
            return Ok(());
        }
        self.send(Outbound::Brightness(brightness)).await?;
        self.sent_brightness = Some(brightness);
        Ok(())
    }

    async fn send(&mut self, message: Outbound) -> Result<()> {
        let message = message.to_message()?;
        self.send_message(message).await
    }

    async fn send_message(&mut self, message: WireMessage) -> Result<()> {
        self.sink
            .send(message)
            .await
            .map_err(|e| Error::Transport(format!("send to {} failed: {}", self.device_id, e)))
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            tracing::trace!("{} {:?} -> {:?}", self.device_id, self.phase, phase);
            self.phase = phase;
        }
    }
}
