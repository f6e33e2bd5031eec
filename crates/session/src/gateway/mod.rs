//! The control-message boundary between the engine and the terminal side.
//!
//! [`Gateway::pair`] connects both sides in process. Each [`Endpoint`] has
//! one inbound event stream and one outbound send operation. [`json`]
//! carries an endpoint over newline-delimited JSON instead.

pub mod json;
pub mod message;

pub use message::{CloseReason, ControlMessage, EngineInput, EngineOutput, Envelope};

use tokio::sync::mpsc;
use wisp_platform::{WispError, WispResult};

/// The engine's end: receives [`EngineInput`], sends [`EngineOutput`].
pub type EngineEnd = Endpoint<EngineInput, EngineOutput>;

/// The terminal side's end: receives [`EngineOutput`], sends [`EngineInput`].
pub type HostEnd = Endpoint<EngineOutput, EngineInput>;

/// Sending half of an endpoint. Cloning shares the same channel.
#[derive(Debug)]
pub struct Outbound<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for Outbound<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Outbound<T> {
    /// Creates an outbound handle over `tx`.
    pub fn new(tx: mpsc::UnboundedSender<T>) -> Self {
        Self { tx }
    }

    /// Sends `message` to the other end.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ConnectionFailed`] once the other end is gone.
    pub fn send(&self, message: T) -> WispResult<()> {
        self.tx
            .send(message)
            .map_err(|_| WispError::ConnectionFailed("control channel closed".into()))
    }

    /// Returns true once the other end is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One side of the control-message boundary.
#[derive(Debug)]
pub struct Endpoint<In, Out> {
    inbound: mpsc::UnboundedReceiver<In>,
    outbound: Outbound<Out>,
}

impl<In, Out> Endpoint<In, Out> {
    /// Assembles an endpoint from its channels.
    pub fn new(inbound: mpsc::UnboundedReceiver<In>, outbound: mpsc::UnboundedSender<Out>) -> Self {
        Self {
            inbound,
            outbound: Outbound::new(outbound),
        }
    }

    /// Waits for the next inbound message. `None` once the other end is gone.
    pub async fn recv(&mut self) -> Option<In> {
        self.inbound.recv().await
    }

    /// Sends one outbound message.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ConnectionFailed`] once the other end is gone.
    pub fn send(&self, message: Out) -> WispResult<()> {
        self.outbound.send(message)
    }

    /// Returns a clonable sender for outbound messages.
    pub fn sender(&self) -> Outbound<Out> {
        self.outbound.clone()
    }

    /// Splits the endpoint into its inbound stream and outbound sender.
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<In>, Outbound<Out>) {
        (self.inbound, self.outbound)
    }
}

/// Factory for connected endpoint pairs.
#[derive(Debug)]
pub struct Gateway;

impl Gateway {
    /// Creates a connected engine/host pair.
    pub fn pair() -> (EngineEnd, HostEnd) {
        let (to_engine, engine_inbound) = mpsc::unbounded_channel();
        let (to_host, host_inbound) = mpsc::unbounded_channel();
        (
            Endpoint::new(engine_inbound, to_host),
            Endpoint::new(host_inbound, to_engine),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (mut engine, mut host) = Gateway::pair();

        host.send(EngineInput::OnResize {
            width: 80,
            height: 24,
        })
        .unwrap();
        assert_eq!(
            engine.recv().await,
            Some(EngineInput::OnResize {
                width: 80,
                height: 24
            })
        );

        engine.sender().send(EngineOutput::Exit(0)).unwrap();
        assert_eq!(host.recv().await, Some(EngineOutput::Exit(0)));
    }

    #[tokio::test]
    async fn test_dropped_end_is_reported() {
        let (mut engine, host) = Gateway::pair();
        let outbound = engine.sender();
        drop(host);

        assert_eq!(engine.recv().await, None);
        assert!(outbound.is_closed());
        assert!(matches!(
            outbound.send(EngineOutput::Exit(1)),
            Err(WispError::ConnectionFailed(_))
        ));
    }
}
