use std::io::{self, Write};

pub const MIN_BLOCKSIZE: u16 = 8;
pub const MAX_BLOCKSIZE: u16 = 65_464;
pub const DEFAULT_BLOCKSIZE: u16 = 512;

/// An option name/value pair as carried by a request, both lowercased.
pub type OptionPair = (String, String);

#[derive(PartialEq, Clone, Copy, Debug)]
pub enum TftpOption {
    Blocksize(u16),
    TimeoutSecs(u8),
    TransferSize(u64),
}

impl TftpOption {
    pub fn write_to(&self, buf: &mut impl Write) -> io::Result<()> {
        use self::TftpOption::*;
        match *self {
            Blocksize(size) => {
                write!(buf, "blksize\0{}\0", size)?;
            }
            TimeoutSecs(t) => {
                write!(buf, "timeout\0{}\0", t)?;
            }
            TransferSize(size) => {
                write!(buf, "tsize\0{}\0", size)?;
            }
        };
        Ok(())
    }

    /// Strict parse of a wire pair, used when reading a received OACK.
    /// Out-of-range or malformed values yield `None`.
    pub fn from_pair(name: &str, value: &str) -> Option<Self> {
        if "blksize".eq_ignore_ascii_case(name) {
            let val = value.parse::<u16>().ok()?;
            if val >= MIN_BLOCKSIZE && val <= MAX_BLOCKSIZE {
                return Some(TftpOption::Blocksize(val));
            }
        } else if "timeout".eq_ignore_ascii_case(name) {
            let val = value.parse::<u8>().ok()?;
            if val >= 1 {
                return Some(TftpOption::TimeoutSecs(val));
            }
        } else if "tsize".eq_ignore_ascii_case(name) {
            let val = value.parse().ok()?;
            return Some(TftpOption::TransferSize(val));
        }
        None
    }
}

/// Filters a request's raw option pairs down to the accepted set.
///
/// Unknown names and unparseable values are dropped without complaint;
/// numeric values are clamped into their RFC ranges. `tsize_reply` is the
/// value the server answers a `tsize` probe with (the source's size hint on
/// a read, the client's announced size on a write); when it is unknown the
/// option is dropped. An empty return means no OACK is to be sent.
pub fn negotiate(pairs: &[OptionPair], tsize_reply: Option<u64>) -> Vec<TftpOption> {
    let mut accepted = vec![];
    for (name, value) in pairs {
        match name.as_str() {
            "blksize" => {
                if let Ok(size) = value.parse::<u64>() {
                    let size = size
                        .max(u64::from(MIN_BLOCKSIZE))
                        .min(u64::from(MAX_BLOCKSIZE));
                    accepted.push(TftpOption::Blocksize(size as u16));
                }
            }
            "timeout" => {
                if let Ok(secs) = value.parse::<u64>() {
                    let secs = secs.max(1).min(255);
                    accepted.push(TftpOption::TimeoutSecs(secs as u8));
                }
            }
            "tsize" => {
                if let Some(size) = tsize_reply {
                    accepted.push(TftpOption::TransferSize(size));
                }
            }
            _ => {}
        }
    }
    accepted
}

#[cfg(test)]
mod option {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<OptionPair> {
        raw.iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn blocksize_accepted() {
        assert_eq!(
            negotiate(&pairs(&[("blksize", "512")]), None),
            vec![TftpOption::Blocksize(512)]
        );
    }

    #[test]
    fn blocksize_clamped_to_bounds() {
        assert_eq!(
            negotiate(&pairs(&[("blksize", "7")]), None),
            vec![TftpOption::Blocksize(8)]
        );
        assert_eq!(
            negotiate(&pairs(&[("blksize", "8")]), None),
            vec![TftpOption::Blocksize(8)]
        );
        assert_eq!(MAX_BLOCKSIZE, 65_464);
        assert_eq!(
            negotiate(&pairs(&[("blksize", "65464")]), None),
            vec![TftpOption::Blocksize(65_464)]
        );
        assert_eq!(
            negotiate(&pairs(&[("blksize", "99999")]), None),
            vec![TftpOption::Blocksize(65_464)]
        );
    }

    #[test]
    fn blocksize_unparseable_dropped() {
        assert_eq!(negotiate(&pairs(&[("blksize", "cat")]), None), vec![]);
        assert_eq!(negotiate(&pairs(&[("blocksize", "512")]), None), vec![]);
    }

    #[test]
    fn timeout_clamped_to_bounds() {
        assert_eq!(
            negotiate(&pairs(&[("timeout", "0")]), None),
            vec![TftpOption::TimeoutSecs(1)]
        );
        assert_eq!(
            negotiate(&pairs(&[("timeout", "3")]), None),
            vec![TftpOption::TimeoutSecs(3)]
        );
        assert_eq!(
            negotiate(&pairs(&[("timeout", "300")]), None),
            vec![TftpOption::TimeoutSecs(255)]
        );
        assert_eq!(negotiate(&pairs(&[("timeout", "soon")]), None), vec![]);
    }

    #[test]
    fn tsize_replaced_by_reply_value() {
        assert_eq!(
            negotiate(&pairs(&[("tsize", "0")]), Some(3000)),
            vec![TftpOption::TransferSize(3000)]
        );
    }

    #[test]
    fn tsize_dropped_when_size_unknown() {
        assert_eq!(negotiate(&pairs(&[("tsize", "0")]), None), vec![]);
    }

    #[test]
    fn unknown_options_dropped() {
        assert_eq!(negotiate(&pairs(&[("windowsize", "4")]), None), vec![]);
    }

    #[test]
    fn client_order_preserved() {
        assert_eq!(
            negotiate(
                &pairs(&[("timeout", "3"), ("blksize", "1024"), ("tsize", "0")]),
                Some(3000)
            ),
            vec![
                TftpOption::TimeoutSecs(3),
                TftpOption::Blocksize(1024),
                TftpOption::TransferSize(3000),
            ]
        );
    }

    #[test]
    fn negotiation_idempotent() {
        let first = negotiate(
            &pairs(&[
                ("blksize", "99999"),
                ("timeout", "0"),
                ("tsize", "0"),
                ("windowsize", "4"),
            ]),
            Some(1234),
        );
        let wire: Vec<OptionPair> = first
            .iter()
            .map(|opt| {
                let mut buf = vec![];
                opt.write_to(&mut buf).unwrap();
                let mut fields = buf.split(|&b| b == 0);
                (
                    String::from_utf8(fields.next().unwrap().to_vec()).unwrap(),
                    String::from_utf8(fields.next().unwrap().to_vec()).unwrap(),
                )
            })
            .collect();
        assert_eq!(negotiate(&wire, Some(1234)), first);
    }

    #[test]
    fn blocksize_write() {
        let mut v = vec![];
        TftpOption::Blocksize(78).write_to(&mut v).unwrap();
        assert_eq!(v, b"blksize\078\0");
    }

    #[test]
    fn transfer_size_write() {
        let mut v = vec![];
        TftpOption::TransferSize(54).write_to(&mut v).unwrap();
        assert_eq!(v, b"tsize\054\0");
    }

    #[test]
    fn timeout_write() {
        let mut v = vec![];
        TftpOption::TimeoutSecs(4).write_to(&mut v).unwrap();
        assert_eq!(v, b"timeout\04\0");
    }

    #[test]
    fn oack_pair_parse() {
        assert_eq!(
            TftpOption::from_pair("bLkSIzE", "512"),
            Some(TftpOption::Blocksize(512))
        );
        assert_eq!(TftpOption::from_pair("blksize", "65465"), None);
        assert_eq!(TftpOption::from_pair("timeout", "0"), None);
        assert_eq!(
            TftpOption::from_pair("tsize", "56246"),
            Some(TftpOption::TransferSize(56246))
        );
        assert_eq!(TftpOption::from_pair("windowsize", "4"), None);
    }
}
