use crate::endpoint::Endpoint;
use crate::packet::{ErrorCode, Packet, PacketErr, MAX_PACKET_SIZE};
use crate::stream::StreamProvider;
use crate::tftp_proto::{ProtoError, Response, ResponseItem, TftpServerProto, Transfer, DEFAULT_MAX_RETRIES};
use log::*;
use mio::*;
use mio_more::timer::{Timeout, Timer, TimerError};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::result;
use std::time::Duration;

/// The token used by the timer.
const TIMER: Token = Token(0);

#[derive(Debug)]
pub enum TftpError {
    Packet(PacketErr),
    Io(io::Error),
    Timer(TimerError),
    Proto(ProtoError),
}

impl From<io::Error> for TftpError {
    fn from(err: io::Error) -> Self {
        TftpError::Io(err)
    }
}

impl From<PacketErr> for TftpError {
    fn from(err: PacketErr) -> Self {
        TftpError::Packet(err)
    }
}

impl From<TimerError> for TftpError {
    fn from(err: TimerError) -> Self {
        TftpError::Timer(err)
    }
}

impl From<ProtoError> for TftpError {
    fn from(err: ProtoError) -> Self {
        TftpError::Proto(err)
    }
}

pub type Result<T> = result::Result<T, TftpError>;

/// The state of an ongoing read/write connection with a client,
/// corresponding to a single transfer
struct ConnectionState<P: StreamProvider> {
    /// The endpoint owned by this transfer; its port is the server's TID
    endpoint: Endpoint,
    /// The pending wakeup, either a retransmit deadline or a source retry tick
    timeout: Timeout,
    /// The protocol state machine associated with this transfer
    transfer: Transfer<P>,
    /// The last frame put on the wire, re-sent verbatim on retransmission
    last_frame: Vec<u8>,
    /// Frames accepted while the endpoint would block, flushed when it
    /// becomes writable again
    outbound: VecDeque<Vec<u8>>,
    /// The address of the client socket to reply to (the peer TID)
    remote: SocketAddr,
    /// The readiness currently registered with the poll
    interest: Ready,
}

/// Struct used to specify working configuration of a server
pub struct ServerConfig {
    /// The IP addresses (and optionally ports) on which the server must listen
    pub addrs: Vec<(IpAddr, Option<u16>)>,
    /// The retransmit interval when a transfer negotiates none
    pub timeout: Duration,
    /// Retransmissions attempted before a transfer is abandoned
    pub max_retries: u8,
    /// How soon a transfer stalled on an unready source is retried
    pub source_retry: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addrs: vec![
                (IpAddr::from([127, 0, 0, 1]), Some(69)),
                (IpAddr::from([0; 16]), Some(69)),
            ],
            timeout: Duration::from_secs(5),
            max_retries: DEFAULT_MAX_RETRIES,
            source_retry: Duration::from_millis(50),
        }
    }
}

pub struct TftpServer<P: StreamProvider> {
    /// The ID of a new token used for generating different tokens.
    new_token: Token,
    /// The event loop for handling async events.
    poll: Poll,
    /// The main timer that can be used to set multiple timeout events.
    timer: Timer<Token>,
    /// The fallback retransmit interval
    timeout: Duration,
    /// The retry tick for transfers stalled on their source
    source_retry: Duration,
    /// The well-known endpoints that receive RRQ and WRQ packets; every
    /// accepted request gets its own fresh endpoint instead.
    server_sockets: HashMap<Token, Endpoint>,
    /// The separate transfers currently in flight.
    connections: HashMap<Token, ConnectionState<P>>,
    /// The TFTP protocol state machine and stream factory front
    proto_handler: TftpServerProto<P>,
}

impl<P: StreamProvider> TftpServer<P> {
    /// Creates a new TFTP server from the provided stream provider and config
    pub fn with_cfg(provider: P, cfg: &ServerConfig) -> Result<Self> {
        if cfg.addrs.is_empty() {
            return Err(TftpError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "address list empty; nothing to listen on",
            )));
        }

        let poll = Poll::new()?;
        let timer = Timer::default();
        poll.register(
            &timer,
            TIMER,
            Ready::readable(),
            PollOpt::edge() | PollOpt::level(),
        )?;

        let mut server_sockets = HashMap::new();
        let mut new_token = Token(1); // skip timer token
        for &(ip, port) in &cfg.addrs {
            let endpoint = Endpoint::bind(ip, port)?;
            poll.register(
                endpoint.inner(),
                new_token,
                Ready::readable(),
                PollOpt::edge() | PollOpt::level(),
            )?;
            server_sockets.insert(new_token, endpoint);
            new_token.0 += 1;
        }

        info!(
            "Server listening on {:?}",
            server_sockets
                .iter()
                .map(|(_, endpoint)| format!("{}", endpoint.local_addr().unwrap()))
                .collect::<Vec<_>>()
        );

        Ok(Self {
            new_token,
            poll,
            timer,
            timeout: cfg.timeout,
            source_retry: cfg.source_retry,
            server_sockets,
            connections: HashMap::new(),
            proto_handler: TftpServerProto::new(provider, cfg.max_retries),
        })
    }

    /// Returns a new token created from incrementing a counter.
    fn generate_token(&mut self) -> Token {
        use std::usize;
        if self
            .connections
            .len()
            .saturating_add(self.server_sockets.len())
            .saturating_add(1 /* timer token */)
            == usize::max_value()
        {
            panic!("no more tokens, but impressive amount of memory");
        }
        while self.new_token == TIMER
            || self.server_sockets.contains_key(&self.new_token)
            || self.connections.contains_key(&self.new_token)
        {
            self.new_token.0 = self.new_token.0.wrapping_add(1);
        }
        self.new_token
    }

    /// Cancels a connection given the connection's token. It cancels the
    /// connection's timeout and deregisters the connection's endpoint from the
    /// event loop; endpoint and handle are released together.
    fn cancel_connection(&mut self, token: Token) -> Result<()> {
        if let Some(conn) = self.connections.remove(&token) {
            info!("Closing connection with token {:?}", token);
            self.poll.deregister(conn.endpoint.inner())?;
            self.timer.cancel_timeout(&conn.timeout);
        }
        Ok(())
    }

    /// The wakeup interval appropriate to a transfer's current state.
    fn wakeup_interval(&self, transfer: &Transfer<P>) -> Duration {
        if transfer.wants_source_retry() {
            self.source_retry
        } else {
            transfer.timeout().unwrap_or(self.timeout)
        }
    }

    /// Re-arms a connection's timer given the connection's token.
    fn reset_timeout(&mut self, token: Token) -> Result<()> {
        if let Some(ref mut conn) = self.connections.get_mut(&token) {
            self.timer.cancel_timeout(&conn.timeout);
            let interval = if conn.transfer.wants_source_retry() {
                self.source_retry
            } else {
                conn.transfer.timeout().unwrap_or(self.timeout)
            };
            conn.timeout = self.timer.set_timeout(interval, token)?;
        }
        Ok(())
    }

    /// Registers a new connection from the provided arguments
    fn create_connection(
        &mut self,
        token: Token,
        endpoint: Endpoint,
        transfer: Transfer<P>,
        last_frame: Vec<u8>,
        outbound: VecDeque<Vec<u8>>,
        remote: SocketAddr,
    ) -> Result<()> {
        let interval = self.wakeup_interval(&transfer);
        let timeout = self.timer.set_timeout(interval, token)?;

        let mut interest = Ready::readable();
        if !outbound.is_empty() {
            interest |= Ready::writable();
        }
        self.poll.register(
            endpoint.inner(),
            token,
            interest,
            PollOpt::edge() | PollOpt::level(),
        )?;

        self.connections.insert(
            token,
            ConnectionState {
                endpoint,
                timeout,
                transfer,
                last_frame,
                outbound,
                remote,
                interest,
            },
        );

        info!("Created connection with token: {:?}", token);

        Ok(())
    }

    /// Handles the event when a timer times out: the matching transfer
    /// decides between retransmitting, retrying its source, and giving up.
    fn process_timer(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut tokens = vec![];
        while let Some(token) = self.timer.poll() {
            tokens.push(token);
        }

        for token in tokens {
            let response = match self.connections.get_mut(&token) {
                Some(conn) => conn.transfer.timer_expired(),
                None => continue,
            };
            self.process_response(token, response, buf)?;
            if self.connections.contains_key(&token) {
                self.reset_timeout(token)?;
            }
        }

        Ok(())
    }

    /// Called to process an available I/O event for a token.
    /// Normally these correspond to packets received on a socket or to a timeout
    fn handle_token(&mut self, token: Token, readiness: Ready, buf: &mut [u8]) -> Result<()> {
        match token {
            TIMER => self.process_timer(buf),
            _ if self.server_sockets.contains_key(&token) => self.handle_server_packet(token, buf),
            _ => {
                if readiness.is_writable() {
                    self.flush_outbound(token)?;
                }
                if readiness.is_readable() {
                    self.handle_connection_packet(token, buf)?;
                }
                Ok(())
            }
        }
    }

    fn handle_server_packet(&mut self, token: Token, buf: &mut [u8]) -> Result<()> {
        let (local_ip, amt, src) = {
            let endpoint = match self.server_sockets.get(&token) {
                Some(endpoint) => endpoint,
                None => {
                    error!("Invalid server token");
                    return Ok(());
                }
            };
            let (amt, src) = match endpoint.recv_from(buf)? {
                Some(pair) => pair,
                None => return Ok(()),
            };
            (endpoint.local_addr()?.ip(), amt, src)
        };

        let packet = match Packet::read(&buf[..amt]) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("malformed request from {}: {:?}", src, e);
                let amt_written = Packet::from(ErrorCode::IllegalTFTP).write_to_slice(buf)?;
                if let Some(endpoint) = self.server_sockets.get(&token) {
                    let _ = endpoint.send_to(&buf[..amt_written], &src);
                }
                return Ok(());
            }
        };

        let new_conn_token = self.generate_token();
        let (xfer, res) = self.proto_handler.rx_initial(packet);
        let response = match res {
            Err(e) => {
                error!("{:?}", e);
                return Ok(());
            }
            Ok(response) => response,
        };

        // the reply always leaves from a fresh endpoint: its port is the
        // server's TID for this exchange
        let endpoint = Endpoint::bind(local_ip, None)?;

        let mut last_frame = vec![];
        let mut outbound = VecDeque::new();
        for item in response {
            match item {
                ResponseItem::Packet(packet) => {
                    let amt_written = packet.write_to_slice(buf)?;
                    let frame = Vec::from(&buf[..amt_written]);
                    last_frame = frame.clone();
                    send_or_queue(&endpoint, &mut outbound, frame, &src)?;
                }
                ResponseItem::RepeatLast | ResponseItem::Done => {}
            }
        }

        if let Some(xfer) = xfer {
            self.create_connection(new_conn_token, endpoint, xfer, last_frame, outbound, src)?;
        }

        Ok(())
    }

    fn handle_connection_packet(&mut self, token: Token, buf: &mut [u8]) -> Result<()> {
        let response = {
            let conn = if let Some(conn) = self.connections.get_mut(&token) {
                conn
            } else {
                error!("No connection with token {:?}", token);
                return Ok(());
            };

            let (amt, src) = match conn.endpoint.recv_from(buf)? {
                Some(pair) => pair,
                None => return Ok(()),
            };

            if conn.remote != src {
                // a datagram from a foreign TID: the error goes to the
                // offender and the transfer itself is left untouched
                warn!(
                    "datagram from foreign TID {} on transfer with {}",
                    src, conn.remote
                );
                let amt_written = Packet::from(ErrorCode::UnknownID).write_to_slice(buf)?;
                let _ = conn.endpoint.send_to(&buf[..amt_written], &src);
                return Ok(());
            }

            let packet = match Packet::read(&buf[..amt]) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("malformed packet from {}: {:?}", src, e);
                    return Ok(());
                }
            };

            match conn.transfer.rx(packet) {
                Ok(response) => response,
                Err(e) => {
                    error!("{:?}", e);
                    return Ok(());
                }
            }
        };

        self.reset_timeout(token)?;
        self.process_response(token, response, buf)
    }

    /// Encodes and dispatches a machine's response, then tears the
    /// connection down or refreshes its readiness interest.
    fn process_response(&mut self, token: Token, response: Response, buf: &mut [u8]) -> Result<()> {
        let mut done = false;
        if let Some(conn) = self.connections.get_mut(&token) {
            for item in response {
                match item {
                    ResponseItem::Done => {
                        done = true;
                        break;
                    }
                    ResponseItem::Packet(packet) => {
                        let amt_written = packet.write_to_slice(buf)?;
                        let frame = Vec::from(&buf[..amt_written]);
                        conn.last_frame = frame.clone();
                        send_or_queue(&conn.endpoint, &mut conn.outbound, frame, &conn.remote)?;
                    }
                    ResponseItem::RepeatLast => {
                        if !conn.last_frame.is_empty() {
                            let frame = conn.last_frame.clone();
                            send_or_queue(&conn.endpoint, &mut conn.outbound, frame, &conn.remote)?;
                        }
                    }
                }
            }
        }

        if done {
            self.cancel_connection(token)
        } else {
            self.update_interest(token)
        }
    }

    /// Flushes frames parked while the endpoint would block.
    fn flush_outbound(&mut self, token: Token) -> Result<()> {
        if let Some(conn) = self.connections.get_mut(&token) {
            while let Some(frame) = conn.outbound.front() {
                match conn.endpoint.send_to(frame, &conn.remote)? {
                    Some(_) => {
                        conn.outbound.pop_front();
                    }
                    None => break,
                }
            }
        }
        self.update_interest(token)
    }

    /// Re-registers the endpoint when the wanted readiness changed.
    fn update_interest(&mut self, token: Token) -> Result<()> {
        if let Some(conn) = self.connections.get_mut(&token) {
            let mut want = Ready::readable();
            if !conn.outbound.is_empty() {
                want |= Ready::writable();
            }
            if want != conn.interest {
                self.poll.reregister(
                    conn.endpoint.inner(),
                    token,
                    want,
                    PollOpt::edge() | PollOpt::level(),
                )?;
                conn.interest = want;
            }
        }
        Ok(())
    }

    /// Runs the server's event loop.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(1024);
        let mut scratch_buf = vec![0; MAX_PACKET_SIZE];

        loop {
            self.poll.poll(&mut events, None)?;

            for event in events.iter() {
                match self.handle_token(event.token(), event.readiness(), &mut scratch_buf) {
                    Ok(_) | Err(TftpError::Io(_)) => { /* swallow Io errors */ }
                    Err(TftpError::Packet(_)) => {
                        error!("malformed packet");
                    }
                    e => return e,
                }
            }
        }
    }

    /// Stores the local listener addresses in the provided vec
    pub fn get_local_addrs(&self, bag: &mut Vec<SocketAddr>) -> Result<()> {
        for endpoint in self.server_sockets.values() {
            bag.push(endpoint.local_addr()?);
        }
        Ok(())
    }
}

/// Sends a frame right away when the endpoint accepts it, otherwise parks
/// it for the next writable event. Frames never overtake one another.
fn send_or_queue(
    endpoint: &Endpoint,
    outbound: &mut VecDeque<Vec<u8>>,
    frame: Vec<u8>,
    remote: &SocketAddr,
) -> Result<()> {
    if !outbound.is_empty() {
        outbound.push_back(frame);
        return Ok(());
    }
    match endpoint.send_to(&frame, remote)? {
        Some(_) => Ok(()),
        None => {
            debug!("endpoint not writable, parking {} byte frame", frame.len());
            outbound.push_back(frame);
            Ok(())
        }
    }
}
