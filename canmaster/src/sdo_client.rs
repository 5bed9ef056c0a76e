//! SDO client service
//!
//! Executes confirmed request/response transactions against a node's SDO
//! server on the COB-ID pair `0x600+id` / `0x580+id`. Transfers of up to 4
//! bytes use the expedited protocol; anything larger is segmented. Responses
//! are matched to requests by the core dispatcher, which queues every
//! `0x580+id` frame on the transaction channel for node `id`.
//!
//! At most one transaction is in flight per node: concurrent callers on the
//! same node serialise on a per-node async mutex, while transactions against
//! different nodes proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canmaster_common::{
    constants::cob_ids,
    sdo::{AbortCode, RawAbortCode, SdoRequest, SdoResponse},
    CanId, CanMessage, NodeId,
};
use paste::paste;
use snafu::Snafu;
use tokio::sync::mpsc;

/// Error returned by [`SdoClient`] methods
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum SdoClientError {
    /// No response arrived within the deadline, after exhausting all retries
    NoResponse,
    /// Received a response that could not be interpreted
    MalformedResponse,
    /// Received a valid SdoResponse, but with an unexpected command specifier
    #[snafu(display("Unexpected SDO response. Expected {expecting}, got {response:?}"))]
    UnexpectedResponse {
        /// The type of response which was expected
        expecting: String,
        /// The response which was received
        response: SdoResponse,
    },
    /// Received an abort response from the node
    #[snafu(display("Received abort accessing object 0x{index:X}sub{sub}: {abort_code}"))]
    ServerAbort {
        /// Index of the SDO access which was aborted
        index: u16,
        /// Sub index of the SDO access which was aborted
        sub: u8,
        /// Reason for the abort
        abort_code: RawAbortCode,
    },
    /// Received a response with the wrong toggle bit
    ToggleNotAlternated,
    /// An SDO upload response had a size that did not match the expected size
    UnexpectedSize,
    /// The core was stopped while the transaction was waiting
    Cancelled,
}

type Result<T> = std::result::Result<T, SdoClientError>;

/// Configuration for the SDO client
#[derive(Clone, Copy, Debug)]
pub struct SdoClientConfig {
    /// How long to wait for each response frame
    pub response_timeout: Duration,
    /// How many times a transaction is re-attempted after a response timeout
    ///
    /// Retries restart segmented transfers from the beginning. Aborts are
    /// never retried.
    pub retries: u32,
}

impl Default for SdoClientConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(100),
            retries: 1,
        }
    }
}

/// Convenience macro for expecting a particular variant of a response and
/// erroring on abort or unexpected variant
macro_rules! match_response {
    ($resp: ident, $expecting: literal, $($match:pat => $code: expr),*) => {
        match $resp {
            $($match => $code,)*
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                return ServerAbortSnafu {
                    index,
                    sub,
                    abort_code,
                }
                .fail()
            }
            _ => {
                return UnexpectedResponseSnafu {
                    expecting: $expecting,
                    response: $resp,
                }
                .fail()
            }
        }
    };
}

macro_rules! access_methods {
    ($type: ty) => {
        paste! {
            #[doc = concat!("Read a ", stringify!($type), " sub object from a node's SDO server\n\n")]
            #[doc = concat!("This is an alias for upload_", stringify!($type), " for a more intuitive API")]
            pub async fn [<read_ $type>](&self, node: NodeId, index: u16, sub: u8) -> Result<$type> {
                self.[<upload_ $type>](node, index, sub).await
            }

            #[doc = concat!("Read a ", stringify!($type), " sub object from a node's SDO server")]
            pub async fn [<upload_ $type>](&self, node: NodeId, index: u16, sub: u8) -> Result<$type> {
                let data = self.upload(node, index, sub).await?;
                if data.len() != size_of::<$type>() {
                    return UnexpectedSizeSnafu.fail();
                }
                Ok($type::from_le_bytes(data.try_into().unwrap()))
            }

            #[doc = concat!("Write a ", stringify!($type), " sub object on a node's SDO server\n\n")]
            #[doc = concat!("This is an alias for download_", stringify!($type), " for a more intuitive API")]
            pub async fn [<write_ $type>](&self, node: NodeId, index: u16, sub: u8, value: $type) -> Result<()> {
                self.[<download_ $type>](node, index, sub, value).await
            }

            #[doc = concat!("Write a ", stringify!($type), " sub object on a node's SDO server")]
            pub async fn [<download_ $type>](&self, node: NodeId, index: u16, sub: u8, value: $type) -> Result<()> {
                let data = value.to_le_bytes();
                self.download(node, index, sub, &data).await
            }
        }
    };
}

struct NodeChannel {
    rx: mpsc::UnboundedReceiver<[u8; 8]>,
}

impl NodeChannel {
    /// Discard responses left over from a previous (timed out) transaction
    fn drain(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}

struct SdoShared {
    handle: crate::CoreHandle,
    config: Mutex<SdoClientConfig>,
    routes: Mutex<HashMap<u8, mpsc::UnboundedSender<[u8; 8]>>>,
    nodes: Mutex<HashMap<u8, Arc<tokio::sync::Mutex<NodeChannel>>>>,
}

/// A client for the SDO servers of every node on the bus
///
/// Cloning is cheap and clones share all transaction state.
#[derive(Clone)]
pub struct SdoClient {
    shared: Arc<SdoShared>,
}

impl SdoClient {
    pub(crate) fn new(handle: crate::CoreHandle, config: SdoClientConfig) -> Self {
        Self {
            shared: Arc::new(SdoShared {
                handle,
                config: Mutex::new(config),
                routes: Mutex::new(HashMap::new()),
                nodes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Set the timeout for waiting on SDO server responses
    pub fn set_timeout(&self, timeout: Duration) {
        self.shared.config.lock().unwrap().response_timeout = timeout;
    }

    /// Get the current timeout for waiting on SDO server responses
    pub fn get_timeout(&self) -> Duration {
        self.shared.config.lock().unwrap().response_timeout
    }

    /// Set how many times a timed-out transaction is re-attempted
    pub fn set_retries(&self, retries: u32) {
        self.shared.config.lock().unwrap().retries = retries;
    }

    /// Called by the dispatcher for every frame on `0x580 + node`
    pub(crate) fn route_response(&self, node: u8, data: &[u8]) {
        let Ok(bytes) = <[u8; 8]>::try_from(data) else {
            log::warn!("Dropping short SDO response frame from node {node}");
            return;
        };
        let routes = self.shared.routes.lock().unwrap();
        match routes.get(&node) {
            // A send failure means the channel was torn down by cancel_pending
            Some(tx) => {
                tx.send(bytes).ok();
            }
            None => log::trace!("SDO response from node {node} with no transaction pending"),
        }
    }

    /// Wake all waiting transactions with a `Cancelled` error
    pub(crate) fn cancel_pending(&self) {
        self.shared.routes.lock().unwrap().clear();
    }

    fn node_channel(&self, node: u8) -> Arc<tokio::sync::Mutex<NodeChannel>> {
        let mut nodes = self.shared.nodes.lock().unwrap();
        nodes
            .entry(node)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                self.shared.routes.lock().unwrap().insert(node, tx);
                Arc::new(tokio::sync::Mutex::new(NodeChannel { rx }))
            })
            .clone()
    }

    fn config(&self) -> SdoClientConfig {
        *self.shared.config.lock().unwrap()
    }

    fn send(&self, node: u8, data: [u8; 8]) -> Result<()> {
        let frame = CanMessage::new(CanId::std(cob_ids::SDO_REQUEST_BASE + node as u16), &data);
        self.shared
            .handle
            .send(frame)
            .map_err(|_| SdoClientError::Cancelled)
    }

    async fn wait_for_response(
        &self,
        chan: &mut NodeChannel,
        timeout: Duration,
    ) -> Result<SdoResponse> {
        match tokio::time::timeout(timeout, chan.rx.recv()).await {
            Err(_) => NoResponseSnafu.fail(),
            Ok(None) => CancelledSnafu.fail(),
            Ok(Some(bytes)) => {
                SdoResponse::try_from(&bytes[..]).map_err(|_| MalformedResponseSnafu.build())
            }
        }
    }

    /// Read a sub-object from a node's SDO server
    ///
    /// On a response timeout the whole transaction is retried with a fresh
    /// deadline, up to the configured retry count.
    pub async fn upload(&self, node: NodeId, index: u16, sub: u8) -> Result<Vec<u8>> {
        let node = node.raw();
        let chan = self.node_channel(node);
        let mut chan = chan.lock().await;
        let config = self.config();
        let mut attempt = 0;
        loop {
            match self
                .try_upload(&mut chan, node, index, sub, config.response_timeout)
                .await
            {
                Err(SdoClientError::NoResponse) if attempt < config.retries => {
                    attempt += 1;
                    log::debug!(
                        "SDO upload of 0x{index:04X}sub{sub} from node {node} timed out, \
                         retry {attempt} of {}",
                        config.retries
                    );
                }
                other => return other,
            }
        }
    }

    async fn try_upload(
        &self,
        chan: &mut NodeChannel,
        node: u8,
        index: u16,
        sub: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        if self.shared.handle.is_stopped() {
            return CancelledSnafu.fail();
        }
        chan.drain();

        let mut read_buf = Vec::new();
        self.send(node, SdoRequest::initiate_upload(index, sub).to_bytes())?;

        let resp = self.wait_for_response(chan, timeout).await?;
        let (expedited, announced_size) = match_response!(
            resp,
            "ConfirmUpload",
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index: _,
                sub: _,
                data,
            } => {
                if e {
                    // Size defaults to the full 4 bytes when not indicated
                    let len = if s { 4 - n as usize } else { 4 };
                    read_buf.extend_from_slice(&data[0..len]);
                    (true, None)
                } else {
                    let size = s.then(|| u32::from_le_bytes(data) as usize);
                    (false, size)
                }
            }
        );

        if !expedited {
            let mut toggle = false;
            loop {
                self.send(node, SdoRequest::upload_segment_request(toggle).to_bytes())?;

                let resp = self.wait_for_response(chan, timeout).await?;
                match_response!(
                    resp,
                    "UploadSegment",
                    SdoResponse::UploadSegment { t, n, c, data } => {
                        if t != toggle {
                            self.send(
                                node,
                                SdoRequest::abort(index, sub, AbortCode::ToggleNotAlternated)
                                    .to_bytes(),
                            )?;
                            return ToggleNotAlternatedSnafu.fail();
                        }
                        read_buf.extend_from_slice(&data[0..7 - n as usize]);
                        if c {
                            break;
                        }
                    }
                );
                toggle = !toggle;
            }
            if let Some(size) = announced_size {
                if read_buf.len() > size {
                    read_buf.truncate(size);
                }
            }
        }
        Ok(read_buf)
    }

    /// Write data to a sub-object on a node's SDO server
    ///
    /// Payloads of up to 4 bytes are written expedited; anything larger uses
    /// a segmented download. The same timeout and retry policy as
    /// [`SdoClient::upload`] applies.
    pub async fn download(&self, node: NodeId, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        let node = node.raw();
        let chan = self.node_channel(node);
        let mut chan = chan.lock().await;
        let config = self.config();
        let mut attempt = 0;
        loop {
            match self
                .try_download(&mut chan, node, index, sub, data, config.response_timeout)
                .await
            {
                Err(SdoClientError::NoResponse) if attempt < config.retries => {
                    attempt += 1;
                    log::debug!(
                        "SDO download of 0x{index:04X}sub{sub} to node {node} timed out, \
                         retry {attempt} of {}",
                        config.retries
                    );
                }
                other => return other,
            }
        }
    }

    async fn try_download(
        &self,
        chan: &mut NodeChannel,
        node: u8,
        index: u16,
        sub: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        if self.shared.handle.is_stopped() {
            return CancelledSnafu.fail();
        }
        chan.drain();

        if data.len() <= 4 {
            self.send(
                node,
                SdoRequest::expedited_download(index, sub, data).to_bytes(),
            )?;

            let resp = self.wait_for_response(chan, timeout).await?;
            match_response!(
                resp,
                "ConfirmDownload",
                SdoResponse::ConfirmDownload { index: _, sub: _ } => {
                    Ok(())
                }
            )
        } else {
            self.send(
                node,
                SdoRequest::initiate_download(index, sub, data.len() as u32).to_bytes(),
            )?;

            let resp = self.wait_for_response(chan, timeout).await?;
            match_response!(
                resp,
                "ConfirmDownload",
                SdoResponse::ConfirmDownload { index: _, sub: _ } => { }
            );

            let mut toggle = false;
            let total_segments = data.len().div_ceil(7);
            for n in 0..total_segments {
                let last_segment = n == total_segments - 1;
                let segment_size = (data.len() - n * 7).min(7);
                let seg_msg = SdoRequest::download_segment(
                    toggle,
                    last_segment,
                    &data[n * 7..n * 7 + segment_size],
                );
                self.send(node, seg_msg.to_bytes())?;
                let resp = self.wait_for_response(chan, timeout).await?;
                match_response!(
                    resp,
                    "ConfirmDownloadSegment",
                    SdoResponse::ConfirmDownloadSegment { t } => {
                        if t != toggle {
                            self.send(
                                node,
                                SdoRequest::abort(index, sub, AbortCode::ToggleNotAlternated)
                                    .to_bytes(),
                            )?;
                            return ToggleNotAlternatedSnafu.fail();
                        }
                    }
                );
                toggle = !toggle;
            }
            Ok(())
        }
    }

    access_methods!(f64);
    access_methods!(f32);
    access_methods!(u64);
    access_methods!(u32);
    access_methods!(u16);
    access_methods!(u8);
    access_methods!(i64);
    access_methods!(i32);
    access_methods!(i16);
    access_methods!(i8);

    /// Read an object as a visible string
    ///
    /// The payload is read and assumed to contain valid UTF8 characters.
    pub async fn read_visible_string(&self, node: NodeId, index: u16, sub: u8) -> Result<String> {
        let bytes = self.upload(node, index, sub).await?;
        Ok(String::from_utf8_lossy(&bytes).into())
    }

    /// Read the device name object (0x1008)
    pub async fn read_device_name(&self, node: NodeId) -> Result<String> {
        self.read_visible_string(node, canmaster_common::constants::object_ids::DEVICE_NAME, 0)
            .await
    }
}
