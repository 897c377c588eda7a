//! In-process recording transport for testing.
//!
//! [`LoopbackTransport`] never touches the network. It records every frame
//! handed to [`Transport::send`], reports whatever [`ChannelState`] the
//! test sets, and can be told to fail sends. Clones share state, so a test
//! can keep one handle while the controller owns another.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use deskline_proto::frame::OutboundFrame;
use parking_lot::Mutex;

use super::{ChannelState, Transport, TransportError};

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<ChannelState>,
    sent: Mutex<Vec<OutboundFrame>>,
    fail_sends: AtomicBool,
    connect_requests: AtomicUsize,
}

/// Recording transport with a settable channel state.
#[derive(Debug, Clone, Default)]
pub struct LoopbackTransport {
    inner: Arc<Inner>,
}

impl LoopbackTransport {
    /// Creates a transport in the given state.
    #[must_use]
    pub fn new(state: ChannelState) -> Self {
        let transport = Self::default();
        transport.set_state(state);
        transport
    }

    /// Changes the reported channel state.
    pub fn set_state(&self, state: ChannelState) {
        *self.inner.state.lock() = state;
    }

    /// Makes subsequent sends fail with [`TransportError::ConnectionClosed`].
    pub fn fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Frames accepted so far, in send order.
    #[must_use]
    pub fn sent(&self) -> Vec<OutboundFrame> {
        self.inner.sent.lock().clone()
    }

    /// Number of [`Transport::request_connect`] calls.
    #[must_use]
    pub fn connect_requests(&self) -> usize {
        self.inner.connect_requests.load(Ordering::SeqCst)
    }
}

impl Transport for LoopbackTransport {
    fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }

    async fn send(&self, frame: &OutboundFrame) -> Result<(), TransportError> {
        if self.state() != ChannelState::Open {
            return Err(TransportError::NotConnected);
        }
        if self.inner.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        self.inner.sent.lock().push(frame.clone());
        Ok(())
    }

    fn request_connect(&self) {
        self.inner.connect_requests.fetch_add(1, Ordering::SeqCst);
    }
}
