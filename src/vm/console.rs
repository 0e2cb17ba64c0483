//! Guest serial console fan-out.
//!
//! The hypervisor backend publishes raw console bytes into a [`ConsoleHub`].
//! Any number of viewers attach with [`ConsoleHub::attach`] and receive the
//! retained scrollback followed by live output. Input from every viewer is
//! merged into one channel that the backend writes to the guest.
//!
//! ```text
//! guest hvc0 ─► backend pump ─► ConsoleHub::publish ─┬─► ConsoleHandle (CLI)
//!                                                     └─► ConsoleHandle (HTTP)
//! ConsoleHandle::send ─► input channel ─► backend pump ─► guest hvc0
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use futures_util::Stream;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// Bytes of output retained for late viewers.
pub const DEFAULT_SCROLLBACK_BYTES: usize = 64 * 1024;

const LIVE_CHANNEL_CAPACITY: usize = 256;

struct HubInner {
    scrollback: VecDeque<u8>,
    live: Option<broadcast::Sender<Vec<u8>>>,
}

/// Shared console endpoint for one VM run.
pub struct ConsoleHub {
    inner: Mutex<HubInner>,
    limit: usize,
    input: mpsc::UnboundedSender<Vec<u8>>,
}

impl ConsoleHub {
    /// Create a hub and the receiver the backend drains guest input from.
    pub fn new(scrollback_limit: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (input, input_rx) = mpsc::unbounded_channel();
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        let hub = Arc::new(Self {
            inner: Mutex::new(HubInner {
                scrollback: VecDeque::new(),
                live: Some(live),
            }),
            limit: scrollback_limit,
            input,
        });
        (hub, input_rx)
    }

    /// Append guest output to the scrollback and forward it to live viewers.
    pub fn publish(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut inner = self.lock();
        inner.scrollback.extend(bytes.iter().copied());
        let overflow = inner.scrollback.len().saturating_sub(self.limit);
        if overflow > 0 {
            inner.scrollback.drain(..overflow);
        }
        if let Some(live) = &inner.live {
            // No receivers is fine: nobody is watching right now.
            let _ = live.send(bytes.to_vec());
        }
    }

    /// Mark the console as finished. Attached viewers drain and then end.
    pub fn close(&self) {
        self.lock().live = None;
    }

    /// Attach a viewer. Scrollback and subscription are taken under one lock
    /// so no output is duplicated or lost between them.
    pub fn attach(&self) -> ConsoleHandle {
        let inner = self.lock();
        let scrollback: Vec<u8> = inner.scrollback.iter().copied().collect();
        let output = match &inner.live {
            Some(live) => live.subscribe(),
            None => {
                let (closed, rx) = broadcast::channel(1);
                drop(closed);
                rx
            }
        };
        ConsoleHandle {
            scrollback,
            output,
            input: self.input.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One viewer's connection to a VM console.
pub struct ConsoleHandle {
    scrollback: Vec<u8>,
    output: broadcast::Receiver<Vec<u8>>,
    input: mpsc::UnboundedSender<Vec<u8>>,
}

impl ConsoleHandle {
    /// Output produced before this handle attached.
    pub fn scrollback(&self) -> &[u8] {
        &self.scrollback
    }

    /// Next chunk of live output, or `None` once the console has closed.
    ///
    /// A viewer that falls behind skips the chunks it missed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.output.recv().await {
                Ok(bytes) => return Some(bytes),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "console", skipped, "console viewer lagged, dropping output");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Send raw bytes to the guest.
    pub fn send(&self, bytes: impl Into<Vec<u8>>) -> anyhow::Result<()> {
        self.input
            .send(bytes.into())
            .map_err(|_| anyhow!("console input is closed"))
    }

    /// Guest input sender that outlives a moved handle.
    pub fn input(&self) -> mpsc::UnboundedSender<Vec<u8>> {
        self.input.clone()
    }

    /// Scrollback first, then live output until the console closes.
    pub fn into_stream(mut self) -> impl Stream<Item = Vec<u8>> + Send + 'static {
        let scrollback = std::mem::take(&mut self.scrollback);
        let first = (!scrollback.is_empty()).then_some(scrollback);
        futures_util::stream::unfold((first, self), |(first, mut handle)| async move {
            if let Some(bytes) = first {
                return Some((bytes, (None, handle)));
            }
            let bytes = handle.recv().await?;
            Some((bytes, (None, handle)))
        })
    }
}
