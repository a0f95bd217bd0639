use std::future::Future;
use std::pin::Pin;

use futures_util::{Sink, Stream};

use crate::core::{IngestError, WebSocketBufferConfig, WsFrame};

pub mod tungstenite;

/// Future returned by [`WsTransport::connect`].
pub type WsTransportConnectFuture<R, W> =
    Pin<Box<dyn Future<Output = Result<(R, W), IngestError>> + Send>>;

/// Transport boundary for websocket IO.
///
/// The read loop lives in a task outside the actor; the actor owns state, the writer and all
/// policy. Tests substitute an in-memory implementation (see `testing::MockTransport`).
pub trait WsTransport: Clone + Send + Sync + 'static {
    type Reader: Stream<Item = Result<WsFrame, IngestError>> + Send + Unpin + 'static;
    type Writer: Sink<WsFrame, Error = IngestError> + Send + Sync + Unpin + 'static;

    fn connect(
        &self,
        url: String,
        buffers: WebSocketBufferConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer>;
}
