use std::io::Result;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::mpsc::*;
use std::thread;
use std::time::Duration;
use streamtftp::packet::{Packet, MAX_PACKET_SIZE};

pub const TIMEOUT: u64 = 3;

pub fn create_socket(timeout: Option<Duration>) -> Result<UdpSocket> {
    let socket = UdpSocket::bind((IpAddr::from([127, 0, 0, 1]), 0))?;
    socket.set_nonblocking(false)?;
    socket.set_read_timeout(timeout)?;
    socket.set_write_timeout(timeout)?;
    Ok(socket)
}

pub fn send_packet(socket: &UdpSocket, packet: &Packet, to: &SocketAddr) {
    socket
        .send_to(packet.to_bytes().unwrap().as_slice(), to)
        .unwrap_or_else(|e| panic!("cannot send packet {:?} to {:?}: {}", packet, to, e));
}

pub fn recv_packet(socket: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buf = [0; MAX_PACKET_SIZE];
    let (amt, src) = socket.recv_from(&mut buf).expect("cannot receive");
    let packet = Packet::read(&buf[..amt]).expect("received malformed packet");
    (packet, src)
}

pub struct DeadmanThread {
    tx: Sender<()>,
}

impl DeadmanThread {
    pub fn start(dur: Duration, msg: &str) -> Self {
        let msg = msg.to_owned();
        let (tx, rx) = channel();
        thread::spawn(move || {
            if rx.recv_timeout(dur).is_err() {
                eprintln!("\nDeadman timeout expired: {}\n", msg);
                ::std::process::exit(1)
            }
        });
        Self { tx }
    }
}

impl Drop for DeadmanThread {
    fn drop(&mut self) {
        if !::std::thread::panicking() {
            self.tx.send(()).expect("cannot stop deadman thread");
        }
    }
}
