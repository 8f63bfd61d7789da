use std::fs::{self, File};
use std::io;
use std::net::*;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use streamtftp::stream::{ReadSource, StreamProvider, WriteSink};
use streamtftp::{ServerConfig, TftpServer};

use clap::{crate_version, App, Arg};

/// Serves the files below a root directory. Request paths must stay
/// relative: absolute paths and parent components are refused.
struct DirProvider {
    root: PathBuf,
    readonly: bool,
}

impl DirProvider {
    fn resolve(&self, filename: &str) -> io::Result<PathBuf> {
        let path = Path::new(filename);
        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, Component::RootDir | Component::ParentDir))
        {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "path escapes the served directory",
            ));
        }
        Ok(self.root.join(path))
    }
}

impl StreamProvider for DirProvider {
    type Source = ReadSource<File>;
    type Sink = WriteSink<File>;

    fn open_source(&mut self, filename: &str) -> io::Result<(Self::Source, Option<u64>)> {
        let f = File::open(self.resolve(filename)?)?;
        let len = f.metadata().ok().map(|meta| meta.len());
        Ok((ReadSource::new(f), len))
    }

    fn open_sink(&mut self, filename: &str, announced_size: Option<u64>) -> io::Result<Self::Sink> {
        if self.readonly {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "server is readonly",
            ));
        }
        let f = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.resolve(filename)?)?;
        if let Some(len) = announced_size {
            f.set_len(len)?;
        }
        Ok(WriteSink::new(f))
    }
}

fn main() {
    env_logger::init();

    let arg_ip = "IP address";
    let arg_dir = "Directory";
    let arg_timeout = "Timeout";
    let arg_retries = "Retries";
    let arg_readonly = "Readonly";

    let matches = App::new("streamtftpd")
        .about("A TFTP server (IETF RFC 1350) serving streams from a directory")
        .version(crate_version!())
        .arg(
            Arg::with_name(arg_ip)
                .short("a")
                .long("address")
                .help("specifies an address[:port] to listen on")
                .takes_value(true)
                .multiple(true)
                .value_name("IPAddr[:PORT]"),
        )
        .arg(
            Arg::with_name(arg_dir)
                .short("d")
                .long("directory")
                .help("specifies the directory to serve (current by default)")
                .takes_value(true)
                .value_name("DIRECTORY"),
        )
        .arg(
            Arg::with_name(arg_timeout)
                .short("t")
                .long("timeout")
                .help("the (non-zero) number of seconds before an unacknowledged frame is resent")
                .takes_value(true)
                .value_name("SECONDS"),
        )
        .arg(
            Arg::with_name(arg_retries)
                .short("r")
                .long("retries")
                .help("how many retransmissions to attempt before a transfer is abandoned")
                .takes_value(true)
                .value_name("COUNT"),
        )
        .arg(
            Arg::with_name(arg_readonly)
                .long("readonly")
                .help("rejects all write requests"),
        )
        .get_matches();

    let addrs = matches
        .values_of(arg_ip)
        .map(|ips| {
            ips.map(|s| {
                // try parsing in order: first ip:port, then just ip
                if let Ok(sk) = SocketAddr::from_str(s) {
                    (sk.ip(), Some(sk.port()))
                } else if let Ok(ip) = IpAddr::from_str(s) {
                    (ip, None)
                } else {
                    panic!("error parsing argument \"{}\" as ip address", s);
                }
            })
            .collect()
        })
        .unwrap_or_else(|| {
            vec![
                (IpAddr::from([127, 0, 0, 1]), Some(69)),
                (IpAddr::from([0; 16]), Some(69)),
            ]
        });

    let timeout = matches
        .value_of(arg_timeout)
        .map(|s| {
            let n = u64::from_str(s).unwrap_or_else(|_| panic!("error parsing \"{}\" as timeout", s));
            if n == 0 {
                panic!("timeout may not be 0 seconds")
            }
            n
        })
        .unwrap_or(5);
    let timeout = Duration::from_secs(timeout);

    let max_retries = matches
        .value_of(arg_retries)
        .map(|s| u8::from_str(s).unwrap_or_else(|_| panic!("error parsing \"{}\" as retry count", s)))
        .unwrap_or(10);

    let root = matches
        .value_of(arg_dir)
        .map(|dir| {
            let path = Path::new(dir);
            assert!(path.exists(), "specified path \"{}\" does not exist", dir);
            path.to_owned()
        })
        .unwrap_or_else(|| PathBuf::from("."));

    let provider = DirProvider {
        root,
        readonly: matches.is_present(arg_readonly),
    };

    let cfg = ServerConfig {
        addrs,
        timeout,
        max_retries,
        ..Default::default()
    };

    let mut server = TftpServer::with_cfg(provider, &cfg).expect("Error creating server");

    match server.run() {
        Ok(_) => println!("Server completed successfully!"),
        Err(e) => println!("Error: {:?}", e),
    }
}
