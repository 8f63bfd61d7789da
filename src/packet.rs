pub use crate::options::*;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::warn;
use std::io::Write;
use std::{io, result, str};

#[derive(Debug)]
pub enum PacketErr {
    StrOutOfBounds,
    OpCodeOutOfBounds,
    UnsupportedField,
    NotNetascii,
    OddOptionCount,
    ZeroBlock,
    PayloadTooLarge,
    Utf8Error(str::Utf8Error),
    IOError(io::Error),
}

impl From<str::Utf8Error> for PacketErr {
    fn from(err: str::Utf8Error) -> PacketErr {
        PacketErr::Utf8Error(err)
    }
}

impl From<io::Error> for PacketErr {
    fn from(err: io::Error) -> PacketErr {
        PacketErr::IOError(err)
    }
}

pub type Result<T> = result::Result<T, PacketErr>;

macro_rules! primitive_enum {
    (
        $( #[$enum_attr:meta] )*
        pub enum $enum_name:ident of $base_int:tt err $err:expr;
        {
            $( $variant:ident = $value:expr, )+
        }
    ) => {
        $( #[$enum_attr] )*
        #[repr($base_int)]
        pub enum $enum_name {
            $( $variant = $value, )+
        }

        impl $enum_name {
            fn from_u16(i: $base_int) -> Result<$enum_name> {
                match i {
                    $( $value => Ok($enum_name::$variant), )+
                    _ => Err($err)
                }
            }
        }
    }
}

primitive_enum! (
    #[derive(PartialEq, Copy, Clone, Debug)]
    pub enum OpCode of u16 err PacketErr::OpCodeOutOfBounds;
    {
        RRQ = 1,
        WRQ = 2,
        DATA = 3,
        ACK = 4,
        ERROR = 5,
        OACK = 6,
    }
);

primitive_enum! (
    #[derive(PartialEq, Clone, Copy, Debug)]
    pub enum ErrorCode of u16 err PacketErr::UnsupportedField;
    {
        NotDefined = 0,
        FileNotFound = 1,
        AccessViolation = 2,
        DiskFull = 3,
        IllegalTFTP = 4,
        UnknownID = 5,
        FileExists = 6,
        NoUser = 7,
    }
);

impl ErrorCode {
    /// Returns the string description of the error code.
    pub fn message(self) -> String {
        match self {
            ErrorCode::NotDefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalTFTP => "Illegal TFTP operation",
            ErrorCode::UnknownID => "Unknown transfer ID",
            ErrorCode::FileExists => "File already exists",
            ErrorCode::NoUser => "No such user",
        }
        .to_owned()
    }
}

impl From<ErrorCode> for Packet {
    /// Returns the ERROR packet with the error code and
    /// the default description as the error message.
    fn from(code: ErrorCode) -> Packet {
        let msg = code.message();
        Packet::ERROR { code, msg }
    }
}

impl Packet {
    /// Builds an ERROR packet from a free-text message (code 0, "Not defined").
    pub fn error_msg(msg: &str) -> Packet {
        Packet::ERROR {
            code: ErrorCode::NotDefined,
            msg: msg.to_owned(),
        }
    }
}

pub const MAX_PACKET_SIZE: usize = MAX_BLOCKSIZE as usize + 4 /*opcode + block num*/;

#[derive(PartialEq, Clone, Debug)]
pub enum Packet {
    RRQ {
        filename: String,
        mode: TransferMode,
        options: Vec<OptionPair>,
    },
    WRQ {
        filename: String,
        mode: TransferMode,
        options: Vec<OptionPair>,
    },
    DATA {
        block_num: u16,
        data: Vec<u8>,
    },
    ACK(u16),
    ERROR {
        code: ErrorCode,
        msg: String,
    },
    OACK {
        options: Vec<TftpOption>,
    },
}

#[derive(PartialEq, Copy, Clone, Debug)]
pub enum TransferMode {
    Octet,
    Mail,
    Netascii,
}

impl TransferMode {
    fn try_from(s: &str) -> Result<Self> {
        use self::TransferMode::*;
        if "octet".eq_ignore_ascii_case(s) {
            Ok(Octet)
        } else if "netascii".eq_ignore_ascii_case(s) {
            Ok(Netascii)
        } else if "mail".eq_ignore_ascii_case(s) {
            Ok(Mail)
        } else {
            Err(PacketErr::UnsupportedField)
        }
    }
}

use std::fmt;
impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use self::TransferMode::*;
        match *self {
            Octet => write!(f, "octet"),
            Mail => write!(f, "mail"),
            Netascii => write!(f, "netascii"),
        }
    }
}

/// The RFC 764 character set admissible in filenames: printable ASCII
/// plus NUL, BEL, BS, HT, LF, VT, FF, CR.
pub fn is_netascii(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| matches!(b, 32..=127 | 0 | 7..=13))
}

impl Packet {
    /// Creates and returns a packet parsed from its byte representation.
    pub fn read(mut bytes: &[u8]) -> Result<Packet> {
        let opcode = OpCode::from_u16(bytes.read_u16::<BigEndian>()?)?;
        match opcode {
            OpCode::RRQ => read_rrq_packet(bytes),
            OpCode::WRQ => read_wrq_packet(bytes),
            OpCode::DATA => read_data_packet(bytes),
            OpCode::ACK => read_ack_packet(bytes),
            OpCode::ERROR => read_error_packet(bytes),
            OpCode::OACK => read_oack_packet(bytes),
        }
    }

    /// Consumes the packet and returns the packet in byte representation.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        self.to_bytes()
    }

    /// Returns a buffer containing the packet's byte representation
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(MAX_PACKET_SIZE);
        self.write_bytes_to(&mut buf)?;
        Ok(buf)
    }

    /// Writes the packet bytes to the given slice, returning the amount of bytes written
    pub fn write_to_slice(&self, sl: &mut [u8]) -> Result<usize> {
        let left = {
            let mut buf = sl.split_at_mut(0).1;
            self.write_bytes_to(&mut buf)?;
            buf.len()
        };
        Ok(sl.len() - left)
    }

    fn write_bytes_to(&self, buf: &mut impl Write) -> Result<()> {
        match *self {
            Packet::RRQ {
                ref filename,
                mode,
                ref options,
            } => rw_packet_bytes(OpCode::RRQ, filename, mode, options, buf),
            Packet::WRQ {
                ref filename,
                mode,
                ref options,
            } => rw_packet_bytes(OpCode::WRQ, filename, mode, options, buf),
            Packet::DATA {
                block_num,
                ref data,
            } => data_packet_bytes(block_num, data.as_slice(), buf),
            Packet::ACK(block_num) => ack_packet_bytes(block_num, buf),
            Packet::ERROR { code, ref msg } => error_packet_bytes(code, msg, buf),
            Packet::OACK { ref options } => oack_packet_bytes(options, buf),
        }
    }
}

use self::strings::Strings;
mod strings {
    /// Interprets a buffer as a series of null-terminated UTF-8 strings,
    /// and iterates over them in order
    pub struct Strings<'a> {
        bytes: &'a [u8],
    }
    impl<'a> From<&'a [u8]> for Strings<'a> {
        fn from(bytes: &'a [u8]) -> Self {
            Self { bytes }
        }
    }
    impl<'a> Iterator for Strings<'a> {
        type Item = &'a str;

        fn next(&mut self) -> Option<Self::Item> {
            let zero = self.bytes.iter().position(|c| *c == 0)?;
            let s = ::std::str::from_utf8(&self.bytes[..zero]);
            self.bytes = self.bytes.split_at(zero + 1).1;
            s.ok()
        }
    }

    #[test]
    fn simple() {
        let a: &[u8] = b"hello\0";
        let mut s = Strings::from(a);
        assert_eq!(s.next(), Some("hello"));
        assert_eq!(s.next(), None);
    }
    #[test]
    fn two() {
        let a: &[u8] = b"hello\0world\0";
        let mut s = Strings::from(a);
        assert_eq!(s.next(), Some("hello"));
        assert_eq!(s.next(), Some("world"));
        assert_eq!(s.next(), None);
    }
    #[test]
    fn junk() {
        let a: &[u8] = b"hello\0dude";
        let mut s = Strings::from(a);
        assert_eq!(s.next(), Some("hello"));
        assert_eq!(s.next(), None);
        assert_eq!(s.next(), None);
    }
}

fn read_xrq_fields(bytes: &[u8]) -> Result<(String, TransferMode, Vec<OptionPair>)> {
    use self::PacketErr::StrOutOfBounds;
    if bytes.len() > 512 {
        Err(StrOutOfBounds)?;
    }
    if bytes.last() != Some(&0) {
        Err(StrOutOfBounds)?;
    }
    let mut strings = Strings::from(bytes);

    let filename = strings.next().ok_or(StrOutOfBounds)?;
    if !is_netascii(filename.as_bytes()) {
        Err(PacketErr::NotNetascii)?;
    }
    let filename = filename.to_owned();
    let mode = TransferMode::try_from(strings.next().ok_or(StrOutOfBounds)?)?;
    let options = read_option_pairs(strings)?;

    Ok((filename, mode, options))
}

fn read_rrq_packet(bytes: &[u8]) -> Result<Packet> {
    let (filename, mode, options) = read_xrq_fields(bytes)?;
    Ok(Packet::RRQ {
        filename,
        mode,
        options,
    })
}

fn read_wrq_packet(bytes: &[u8]) -> Result<Packet> {
    let (filename, mode, options) = read_xrq_fields(bytes)?;
    Ok(Packet::WRQ {
        filename,
        mode,
        options,
    })
}

fn read_option_pairs(strings: Strings) -> Result<Vec<OptionPair>> {
    let fields: Vec<&str> = strings.collect();
    if fields.len() % 2 != 0 {
        Err(PacketErr::OddOptionCount)?;
    }

    let mut options: Vec<OptionPair> = vec![];
    for pair in fields.chunks(2) {
        let name = pair[0].to_ascii_lowercase();
        let value = pair[1].to_ascii_lowercase();
        if let Some(prev) = options.iter_mut().find(|(n, _)| *n == name) {
            warn!("duplicate option {:?}, keeping last value {:?}", name, value);
            prev.1 = value;
        } else {
            options.push((name, value));
        }
    }
    Ok(options)
}

fn read_data_packet(mut bytes: &[u8]) -> Result<Packet> {
    let block_num = bytes.read_u16::<BigEndian>()?;
    if bytes.len() > MAX_BLOCKSIZE as usize {
        Err(PacketErr::PayloadTooLarge)?;
    }
    let mut data = Vec::with_capacity(bytes.len());
    use std::io::Read;
    bytes.read_to_end(&mut data)?;

    Ok(Packet::DATA { block_num, data })
}

fn read_ack_packet(mut bytes: &[u8]) -> Result<Packet> {
    let block_num = bytes.read_u16::<BigEndian>()?;
    if !bytes.is_empty() {
        Err(PacketErr::StrOutOfBounds)?;
    }
    Ok(Packet::ACK(block_num))
}

fn read_error_packet(mut bytes: &[u8]) -> Result<Packet> {
    let code = ErrorCode::from_u16(bytes.read_u16::<BigEndian>()?)?;
    let mut strings = Strings::from(bytes);
    let msg = strings.next().ok_or(PacketErr::StrOutOfBounds)?.to_owned();

    Ok(Packet::ERROR { code, msg })
}

fn read_oack_packet(bytes: &[u8]) -> Result<Packet> {
    if !bytes.is_empty() && bytes.last() != Some(&0) {
        Err(PacketErr::StrOutOfBounds)?;
    }
    let fields: Vec<&str> = Strings::from(bytes).collect();
    if fields.len() % 2 != 0 {
        Err(PacketErr::OddOptionCount)?;
    }

    // unrecognized options in an acknowledgement are dropped
    let options = fields
        .chunks(2)
        .filter_map(|pair| TftpOption::from_pair(pair[0], pair[1]))
        .collect();

    Ok(Packet::OACK { options })
}

fn rw_packet_bytes(
    packet: OpCode,
    filename: &str,
    mode: TransferMode,
    options: &[OptionPair],
    buf: &mut impl Write,
) -> Result<()> {
    if !is_netascii(filename.as_bytes()) {
        Err(PacketErr::NotNetascii)?;
    }
    buf.write_u16::<BigEndian>(packet as u16)?;
    write!(buf, "{}\0{}\0", filename, mode)?;

    for (name, value) in options {
        write!(buf, "{}\0{}\0", name, value)?;
    }

    Ok(())
}

fn data_packet_bytes(block_num: u16, data: &[u8], buf: &mut impl Write) -> Result<()> {
    if block_num == 0 {
        Err(PacketErr::ZeroBlock)?;
    }
    if data.len() > MAX_BLOCKSIZE as usize {
        Err(PacketErr::PayloadTooLarge)?;
    }
    buf.write_u16::<BigEndian>(OpCode::DATA as u16)?;
    buf.write_u16::<BigEndian>(block_num)?;
    buf.write_all(data)?;

    Ok(())
}

fn ack_packet_bytes(block_num: u16, buf: &mut impl Write) -> Result<()> {
    buf.write_u16::<BigEndian>(OpCode::ACK as u16)?;
    buf.write_u16::<BigEndian>(block_num)?;

    Ok(())
}

fn error_packet_bytes(code: ErrorCode, msg: &str, buf: &mut impl Write) -> Result<()> {
    buf.write_u16::<BigEndian>(OpCode::ERROR as u16)?;
    buf.write_u16::<BigEndian>(code as u16)?;
    write!(buf, "{}\0", msg)?;

    Ok(())
}

fn oack_packet_bytes(options: &[TftpOption], buf: &mut impl Write) -> Result<()> {
    buf.write_u16::<BigEndian>(OpCode::OACK as u16)?;

    for opt in options {
        opt.write_to(buf)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::*;

    #[test]
    fn wrq_max_size() {
        let p = Packet::WRQ {
            filename: str::from_utf8(&[b'x'; 512 - 6]).unwrap().to_owned(),
            mode: TransferMode::Octet,
            options: vec![],
        };
        let mut v = vec![];
        p.write_bytes_to(&mut v).unwrap();
        assert_matches!(Packet::read(&v), Err(_));
    }

    #[test]
    fn rrq_max_size() {
        let p = Packet::RRQ {
            filename: str::from_utf8(&[b'x'; 512 - 6]).unwrap().to_owned(),
            mode: TransferMode::Octet,
            options: vec![],
        };
        let mut v = vec![];
        p.write_bytes_to(&mut v).unwrap();
        assert_matches!(Packet::read(&v), Err(_));
    }

    #[test]
    fn rrq_rejects_non_netascii_filename() {
        let mut v = vec![0, 1];
        v.extend_from_slice(b"bad\x1bname\0octet\0");
        assert_matches!(Packet::read(&v), Err(PacketErr::NotNetascii));

        let p = Packet::RRQ {
            filename: "bad\x1bname".to_owned(),
            mode: TransferMode::Octet,
            options: vec![],
        };
        assert_matches!(p.to_bytes(), Err(PacketErr::NotNetascii));
    }

    #[test]
    fn rrq_rejects_missing_terminator() {
        let mut v = vec![0, 1];
        v.extend_from_slice(b"file\0octet");
        assert_matches!(Packet::read(&v), Err(PacketErr::StrOutOfBounds));
    }

    #[test]
    fn rrq_rejects_odd_option_fields() {
        let mut v = vec![0, 1];
        v.extend_from_slice(b"file\0octet\0blksize\0");
        assert_matches!(Packet::read(&v), Err(PacketErr::OddOptionCount));
    }

    #[test]
    fn rrq_rejects_unknown_mode() {
        let mut v = vec![0, 1];
        v.extend_from_slice(b"file\0carrierpigeon\0");
        assert_matches!(Packet::read(&v), Err(PacketErr::UnsupportedField));
    }

    #[test]
    fn rrq_lowercases_options() {
        let mut v = vec![0, 1];
        v.extend_from_slice(b"file\0octet\0BlkSize\01024\0TSIZE\00\0");
        let p = Packet::read(&v).unwrap();
        assert_eq!(
            p,
            Packet::RRQ {
                filename: "file".to_owned(),
                mode: TransferMode::Octet,
                options: vec![
                    ("blksize".to_owned(), "1024".to_owned()),
                    ("tsize".to_owned(), "0".to_owned()),
                ],
            }
        );
    }

    #[test]
    fn rrq_duplicate_option_last_wins() {
        let mut v = vec![0, 1];
        v.extend_from_slice(b"file\0octet\0blksize\0512\0blksize\01024\0");
        let p = Packet::read(&v).unwrap();
        assert_matches!(p, Packet::RRQ { ref options, .. } if *options == vec![("blksize".to_owned(), "1024".to_owned())]);
    }

    #[test]
    fn rrq_keeps_unknown_options() {
        let mut v = vec![0, 1];
        v.extend_from_slice(b"file\0octet\0windowsize\04\0");
        let p = Packet::read(&v).unwrap();
        assert_matches!(p, Packet::RRQ { ref options, .. } if *options == vec![("windowsize".to_owned(), "4".to_owned())]);
    }

    #[test]
    fn data_rejects_zero_block() {
        let p = Packet::DATA {
            block_num: 0,
            data: vec![1, 2, 3],
        };
        assert_matches!(p.to_bytes(), Err(PacketErr::ZeroBlock));
    }

    #[test]
    fn data_rejects_oversize_payload() {
        let p = Packet::DATA {
            block_num: 1,
            data: vec![0; MAX_BLOCKSIZE as usize + 1],
        };
        assert_matches!(p.to_bytes(), Err(PacketErr::PayloadTooLarge));

        let mut v = vec![0, 3, 0, 1];
        v.extend_from_slice(&vec![0; MAX_BLOCKSIZE as usize + 1]);
        assert_matches!(Packet::read(&v), Err(PacketErr::PayloadTooLarge));
    }

    #[test]
    fn ack_rejects_trailing_bytes() {
        assert_matches!(Packet::read(&[0, 4, 0, 1, 9]), Err(_));
    }

    #[test]
    fn unknown_opcode() {
        assert_matches!(
            Packet::read(&[0, 9, 0, 1]),
            Err(PacketErr::OpCodeOutOfBounds)
        );
    }

    #[test]
    fn error_from_code_carries_table_message() {
        let p = Packet::from(ErrorCode::UnknownID);
        assert_eq!(
            p,
            Packet::ERROR {
                code: ErrorCode::UnknownID,
                msg: "Unknown transfer ID".to_owned(),
            }
        );
    }

    #[test]
    fn error_from_text_is_code_zero() {
        let p = Packet::error_msg("Ack timeout");
        assert_eq!(
            p,
            Packet::ERROR {
                code: ErrorCode::NotDefined,
                msg: "Ack timeout".to_owned(),
            }
        );
    }

    macro_rules! packet_enc_dec_test {
        ($name:ident, $packet:expr) => {
            #[test]
            fn $name() {
                let bytes = $packet.clone().into_bytes();
                assert!(bytes.is_ok());
                let packet = bytes.and_then(|pd| Packet::read(pd.as_slice()));
                assert!(packet.is_ok());
                let _ = packet.map(|packet| {
                    assert_eq!(packet, $packet);
                });
            }
        };
    }

    const BYTE_DATA: [u8; 512] = [123; 512];

    packet_enc_dec_test!(
        rrq,
        Packet::RRQ {
            filename: "/a/b/c/hello.txt".to_string(),
            mode: TransferMode::Netascii,
            options: vec![],
        }
    );
    packet_enc_dec_test!(
        rrq_blocksize,
        Packet::RRQ {
            filename: "/a/b/c/hello.txt".to_string(),
            mode: TransferMode::Octet,
            options: vec![("blksize".to_owned(), "735".to_owned())],
        }
    );
    packet_enc_dec_test!(
        wrq,
        Packet::WRQ {
            filename: "./world.txt".to_string(),
            mode: TransferMode::Octet,
            options: vec![],
        }
    );
    packet_enc_dec_test!(
        wrq_blocksize,
        Packet::WRQ {
            filename: "./world.txt".to_string(),
            mode: TransferMode::Octet,
            options: vec![("blksize".to_owned(), "846".to_owned())],
        }
    );
    packet_enc_dec_test!(ack, Packet::ACK(1234));
    packet_enc_dec_test!(
        data,
        Packet::DATA {
            block_num: 1234,
            data: Vec::from(&BYTE_DATA[..]),
        }
    );
    packet_enc_dec_test!(
        err,
        Packet::ERROR {
            code: ErrorCode::NoUser,
            msg: "This is a message".to_string(),
        }
    );
    packet_enc_dec_test!(
        oack,
        Packet::OACK {
            options: vec![TftpOption::Blocksize(1234)],
        }
    );
    packet_enc_dec_test!(
        oack_full,
        Packet::OACK {
            options: vec![
                TftpOption::Blocksize(1024),
                TftpOption::TimeoutSecs(3),
                TftpOption::TransferSize(3000),
            ],
        }
    );
}
