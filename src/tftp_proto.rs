use crate::options::{negotiate, TftpOption, DEFAULT_BLOCKSIZE};
use crate::packet::{ErrorCode, Packet, TransferMode};
use crate::stream::{BlockSink, BlockSource, Chunk, StreamProvider};
use log::{info, warn};
use std::io;
use std::time::Duration;

/// Retransmissions attempted before a transfer is given up on.
pub const DEFAULT_MAX_RETRIES: u8 = 10;

#[derive(Debug, PartialEq)]
pub enum ProtoError {
    /// A transfer is already running and cannot be restarted
    TransferAlreadyRunning,

    /// The received packet type cannot be used to initiate a transfer
    NotInitiatingPacket,
}

#[derive(Debug)]
struct TransferMeta {
    blocksize: u16,
    timeout: Option<u8>,
    retries: u8,
    max_retries: u8,
}

impl TransferMeta {
    fn from_options(options: &[TftpOption], max_retries: u8) -> Self {
        let mut meta = TransferMeta {
            blocksize: DEFAULT_BLOCKSIZE,
            timeout: None,
            retries: 0,
            max_retries,
        };
        for opt in options {
            match *opt {
                TftpOption::Blocksize(size) => meta.blocksize = size,
                TftpOption::TimeoutSecs(secs) => meta.timeout = Some(secs),
                TftpOption::TransferSize(_) => {}
            }
        }
        meta
    }
}

/// The TFTP protocol front, used as backend for a TFTP server.
/// Holds the caller's stream provider and turns opening requests into
/// live transfers.
pub struct TftpServerProto<P: StreamProvider> {
    provider: P,
    max_retries: u8,
}

#[derive(Debug)]
pub struct Response {
    p: Vec<ResponseItem>,
}

impl Response {
    fn none() -> Self {
        Self { p: vec![] }
    }

    fn terminates(&self) -> bool {
        self.p.contains(&ResponseItem::Done)
    }
}

impl Iterator for Response {
    type Item = ResponseItem;
    fn next(&mut self) -> Option<Self::Item> {
        self.p.pop()
    }
}

impl<T> From<T> for Response
where
    T: Into<ResponseItem>,
{
    fn from(r: T) -> Self {
        Self { p: vec![r.into()] }
    }
}
impl From<Vec<ResponseItem>> for Response {
    fn from(mut v: Vec<ResponseItem>) -> Self {
        v.reverse();
        Self { p: v }
    }
}

#[derive(Debug, PartialEq)]
pub enum ResponseItem {
    Packet(Packet),
    Done,
    RepeatLast,
}

impl From<Packet> for ResponseItem {
    fn from(p: Packet) -> Self {
        ResponseItem::Packet(p)
    }
}

impl<P: StreamProvider> TftpServerProto<P> {
    /// Creates a new instance around the provided stream factory.
    pub fn new(provider: P, max_retries: u8) -> Self {
        Self {
            provider,
            max_retries,
        }
    }

    /// Signals the receipt of a transfer-initiating packet (either RRQ or WRQ).
    /// If a `Transfer` is returned in the first tuple member, that must be used to
    /// handle all future packets from the same client via `Transfer::rx`.
    /// If a `Transfer` is not returned, a transfer could not be started from the
    /// received packet.
    ///
    /// In both cases the frames in the `Result` should be sent back to the client.
    pub fn rx_initial(&mut self, packet: Packet) -> (Option<Transfer<P>>, Result<Response, ProtoError>) {
        let (filename, mode, options, is_write) = match packet {
            Packet::RRQ {
                filename,
                mode,
                options,
            } => (filename, mode, options, false),
            Packet::WRQ {
                filename,
                mode,
                options,
            } => (filename, mode, options, true),
            _ => return (None, Err(ProtoError::NotInitiatingPacket)),
        };

        // only octet transfers are served
        if mode != TransferMode::Octet {
            info!("rejecting {} mode request for {:?}", mode, filename);
            return (None, Ok(Packet::from(ErrorCode::IllegalTFTP).into()));
        }

        let (xfer, response) = if is_write {
            let announced = options
                .iter()
                .find(|(name, _)| name.as_str() == "tsize")
                .and_then(|(_, value)| value.parse::<u64>().ok());

            let sink = match self.provider.open_sink(&filename, announced) {
                Ok(sink) => sink,
                Err(e) => {
                    info!("provider refused sink for {:?}: {}", filename, e);
                    let code = if e.kind() == io::ErrorKind::AlreadyExists {
                        ErrorCode::FileExists
                    } else {
                        ErrorCode::AccessViolation
                    };
                    return (None, Ok(Packet::from(code).into()));
                }
            };

            let accepted = negotiate(&options, announced);
            let meta = TransferMeta::from_options(&accepted, self.max_retries);
            Transfer::<P>::new_write(sink, meta, accepted)
        } else {
            let (source, size_hint) = match self.provider.open_source(&filename) {
                Ok(pair) => pair,
                Err(e) => {
                    info!("provider has no source for {:?}: {}", filename, e);
                    return (None, Ok(Packet::from(ErrorCode::FileNotFound).into()));
                }
            };

            let accepted = negotiate(&options, size_hint);
            let meta = TransferMeta::from_options(&accepted, self.max_retries);
            Transfer::<P>::new_read(source, meta, accepted)
        };

        (xfer, Ok(response))
    }
}

/// The state of an ongoing transfer with one client
pub enum Transfer<P: StreamProvider> {
    Tx(TransferTx<P::Source>),
    Rx(TransferRx<P::Sink>),
    Complete,
}

/// Server-transmits machine (read request).
pub struct TransferTx<S: BlockSource> {
    source: S,
    state: TxState,
    /// last emitted block number; the first DATA carries block 1
    block: u16,
    sent_final: bool,
    meta: TransferMeta,
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum TxState {
    /// OACK sent, waiting for the client's ACK(0)
    AwaitOackAck,
    /// the source had nothing ready; re-pull on the next tick
    Pulling,
    /// a DATA frame is in flight
    AwaitAck,
}

/// Server-receives machine (write request).
pub struct TransferRx<K: BlockSink> {
    sink: K,
    /// block number the next DATA frame should carry
    expected_block: u16,
    meta: TransferMeta,
}

impl<P: StreamProvider> Transfer<P> {
    fn new_read(
        source: P::Source,
        meta: TransferMeta,
        options: Vec<TftpOption>,
    ) -> (Option<Self>, Response) {
        let mut xfer = TransferTx {
            source,
            state: TxState::Pulling,
            block: 0,
            sent_final: false,
            meta,
        };

        let response = if options.is_empty() {
            xfer.pull_step()
        } else {
            xfer.state = TxState::AwaitOackAck;
            ResponseItem::Packet(Packet::OACK { options }).into()
        };
        if response.terminates() {
            (None, response)
        } else {
            (Some(Transfer::Tx(xfer)), response)
        }
    }

    fn new_write(
        sink: P::Sink,
        meta: TransferMeta,
        options: Vec<TftpOption>,
    ) -> (Option<Self>, Response) {
        let xfer = TransferRx {
            sink,
            expected_block: 1,
            meta,
        };

        let packet = if options.is_empty() {
            Packet::ACK(0)
        } else {
            Packet::OACK { options }
        };
        (
            Some(Transfer::Rx(xfer)),
            ResponseItem::Packet(packet).into(),
        )
    }

    /// Checks to see if the transfer has completed
    pub fn is_done(&self) -> bool {
        match *self {
            Transfer::Complete => true,
            _ => false,
        }
    }

    /// True while the transfer is stalled on a source that had no data
    /// ready; the dispatcher then schedules a short retry tick instead of
    /// the retransmit interval.
    pub fn wants_source_retry(&self) -> bool {
        match *self {
            Transfer::Tx(TransferTx { state, .. }) => state == TxState::Pulling,
            _ => false,
        }
    }

    /// Returns the timeout negotiated via option for this transfer,
    /// or `None` if the server default should be used
    pub fn timeout(&self) -> Option<Duration> {
        match *self {
            Transfer::Rx(TransferRx { ref meta, .. })
            | Transfer::Tx(TransferTx { ref meta, .. }) => {
                meta.timeout.map(|s| Duration::from_secs(u64::from(s)))
            }
            _ => None,
        }
    }

    /// Call this to indicate that the timer since the last received packet
    /// has expired. This may return frames to (re)send or may terminate the
    /// transfer.
    pub fn timer_expired(&mut self) -> Response {
        let result = match *self {
            Transfer::Tx(ref mut tx) => tx.timer_expired(),
            Transfer::Rx(ref mut rx) => rx.timer_expired(),
            Transfer::Complete => ResponseItem::Done.into(),
        };
        if result.terminates() {
            *self = Transfer::Complete;
        }
        result
    }

    /// Process and consume a received packet.
    /// When the first `ResponseItem::Done` is returned the transfer is
    /// complete, and all future calls to `rx` will also return `Done`.
    ///
    /// Transfer completion can be checked via `Transfer::is_done()`
    pub fn rx(&mut self, packet: Packet) -> Result<Response, ProtoError> {
        if self.is_done() {
            return Ok(ResponseItem::Done.into());
        }
        let result = match (packet, &mut *self) {
            (Packet::ACK(ack_block), &mut Transfer::Tx(ref mut tx)) => Ok(tx.handle_ack(ack_block)),
            (
                Packet::DATA {
                    block_num,
                    ref data,
                },
                &mut Transfer::Rx(ref mut rx),
            ) => Ok(rx.handle_data(block_num, data)),
            (Packet::DATA { .. }, _) | (Packet::ACK(_), _) => {
                // wrong kind of packet, kill transfer
                Ok(vec![
                    ResponseItem::Packet(ErrorCode::IllegalTFTP.into()),
                    ResponseItem::Done,
                ]
                .into())
            }

            (Packet::ERROR { .. }, _) => {
                // receiving an error kills the transfer
                Ok(ResponseItem::Done.into())
            }
            _ => Err(ProtoError::TransferAlreadyRunning),
        };

        if let Ok(true) = result.as_ref().map(Response::terminates) {
            *self = Transfer::Complete;
        }
        result
    }
}

impl<S: BlockSource> TransferTx<S> {
    fn handle_ack(&mut self, ack_block: u16) -> Response {
        match self.state {
            TxState::AwaitOackAck => {
                if ack_block == 0 {
                    self.meta.retries = 0;
                    self.pull_step()
                } else {
                    Response::none()
                }
            }
            TxState::AwaitAck => {
                if ack_block == self.block {
                    self.meta.retries = 0;
                    if self.sent_final {
                        ResponseItem::Done.into()
                    } else {
                        self.pull_step()
                    }
                } else {
                    // stale or stray ack; the timer drives retransmission
                    Response::none()
                }
            }
            // a duplicate ack while the source is catching up
            TxState::Pulling => Response::none(),
        }
    }

    fn timer_expired(&mut self) -> Response {
        match self.state {
            TxState::Pulling => self.pull_step(),
            TxState::AwaitOackAck => vec![
                ResponseItem::Packet(Packet::error_msg("OACK timeout")),
                ResponseItem::Done,
            ]
            .into(),
            TxState::AwaitAck => {
                self.meta.retries += 1;
                if self.meta.retries > self.meta.max_retries {
                    vec![
                        ResponseItem::Packet(Packet::error_msg("Ack timeout")),
                        ResponseItem::Done,
                    ]
                    .into()
                } else {
                    ResponseItem::RepeatLast.into()
                }
            }
        }
    }

    fn pull_step(&mut self) -> Response {
        let chunk = match self.source.pull(self.meta.blocksize as usize) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("source failed: {}", e);
                return vec![
                    ResponseItem::Packet(Packet::error_msg("An unknown error occurred")),
                    ResponseItem::Done,
                ]
                .into();
            }
        };

        let data = match chunk {
            Chunk::Pending => {
                self.state = TxState::Pulling;
                return Response::none();
            }
            Chunk::Data(data) => {
                if data.len() > self.meta.blocksize as usize {
                    warn!(
                        "source returned {} bytes for a {} byte block",
                        data.len(),
                        self.meta.blocksize
                    );
                    return vec![
                        ResponseItem::Packet(Packet::error_msg("An unknown error occurred")),
                        ResponseItem::Done,
                    ]
                    .into();
                }
                data
            }
            Chunk::End => vec![],
        };

        let block = match self.block.checked_add(1) {
            Some(block) => block,
            None => {
                // 65535 blocks sent and the stream is still going
                return vec![
                    ResponseItem::Packet(Packet::error_msg("File too big.")),
                    ResponseItem::Done,
                ]
                .into();
            }
        };

        self.sent_final = data.len() < self.meta.blocksize as usize;
        self.block = block;
        self.state = TxState::AwaitAck;
        self.meta.retries = 0;
        ResponseItem::Packet(Packet::DATA {
            block_num: block,
            data,
        })
        .into()
    }
}

impl<K: BlockSink> TransferRx<K> {
    fn handle_data(&mut self, block: u16, data: &[u8]) -> Response {
        if data.len() > self.meta.blocksize as usize {
            warn!(
                "peer sent {} bytes against a negotiated block size of {}",
                data.len(),
                self.meta.blocksize
            );
            return vec![
                ResponseItem::Packet(ErrorCode::IllegalTFTP.into()),
                ResponseItem::Done,
            ]
            .into();
        }

        if block != self.expected_block {
            // duplicate or reordered frame; re-ack what was last taken so
            // the peer resynchronizes
            return ResponseItem::Packet(Packet::ACK(self.expected_block.wrapping_sub(1))).into();
        }

        self.meta.retries = 0;
        let last = data.len() < self.meta.blocksize as usize;
        if let Err(e) = self.sink.push(data, last) {
            warn!("sink failed: {}", e);
            return vec![
                ResponseItem::Packet(Packet::error_msg("An unknown error occurred")),
                ResponseItem::Done,
            ]
            .into();
        }

        if last {
            vec![
                ResponseItem::Packet(Packet::ACK(block)),
                ResponseItem::Done,
            ]
            .into()
        } else {
            match self.expected_block.checked_add(1) {
                Some(next) => {
                    self.expected_block = next;
                    ResponseItem::Packet(Packet::ACK(block)).into()
                }
                None => vec![
                    ResponseItem::Packet(Packet::error_msg("File too big.")),
                    ResponseItem::Done,
                ]
                .into(),
            }
        }
    }

    fn timer_expired(&mut self) -> Response {
        self.meta.retries += 1;
        if self.meta.retries > self.meta.max_retries {
            vec![
                ResponseItem::Packet(Packet::error_msg("Ack timeout")),
                ResponseItem::Done,
            ]
            .into()
        } else {
            // our last ack may have been lost; repeating it prompts the
            // peer to resend its data
            ResponseItem::RepeatLast.into()
        }
    }
}
