use bytes::Bytes;

/// Transport-neutral websocket frame.
///
/// Transports convert their native message type into/from `WsFrame`; the ingestion actor only
/// ever sees this type, which keeps the protocol logic independent of tungstenite.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsFrame {
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<WsCloseFrame>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WsCloseFrame {
    pub code: u16,
    pub reason: Bytes,
}

impl WsFrame {
    /// Build a text frame from an owned JSON payload produced by the codec.
    #[inline]
    pub fn json(payload: Vec<u8>) -> Self {
        Self::Text(Bytes::from(payload))
    }

    #[inline]
    pub fn text_static(s: &'static str) -> Self {
        Self::Text(Bytes::from_static(s.as_bytes()))
    }

    #[inline]
    pub fn close(code: u16, reason: &'static str) -> Self {
        Self::Close(Some(WsCloseFrame {
            code,
            reason: Bytes::from_static(reason.as_bytes()),
        }))
    }

    /// Human readable close description used in disconnect logs.
    pub fn close_reason(frame: Option<&WsCloseFrame>) -> String {
        frame
            .map(|f| {
                format!(
                    "code={} reason={}",
                    f.code,
                    String::from_utf8_lossy(f.reason.as_ref())
                )
            })
            .unwrap_or_else(|| "remote closed".to_string())
    }
}

/// Borrow the data payload of a frame. Control frames carry no application data.
#[inline]
pub fn data_payload(frame: &WsFrame) -> Option<&[u8]> {
    match frame {
        WsFrame::Text(bytes) | WsFrame::Binary(bytes) => Some(bytes.as_ref()),
        WsFrame::Ping(_) | WsFrame::Pong(_) | WsFrame::Close(_) => None,
    }
}
