use nom::error::ErrorKind;
use pcap_parser::PcapError;
use std::convert::From;
use std::fmt;
use std::io;

/// Workspace-wide error type
#[derive(Debug)]
pub enum Error {
    /// Generic error, with a static description
    Generic(&'static str),
    /// Parser error
    Nom(ErrorKind),
    /// I/O error
    Io(io::Error),
    /// Error from the pcap reader
    Pcap(String),
    /// Error reported by the capture driver
    Capture(String),
    /// Malformed configuration
    Config(String),
}

impl From<&'static str> for Error {
    fn from(s: &'static str) -> Self {
        Error::Generic(s)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ErrorKind> for Error {
    fn from(e: ErrorKind) -> Self {
        Error::Nom(e)
    }
}

impl<I: fmt::Debug> From<PcapError<I>> for Error {
    fn from(e: PcapError<I>) -> Self {
        Error::Pcap(format!("{:?}", e))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Generic(s) => write!(f, "{}", s),
            Error::Nom(k) => write!(f, "parser error: {:?}", k),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Pcap(s) => write!(f, "pcap error: {}", s),
            Error::Capture(s) => write!(f, "capture error: {}", s),
            Error::Config(s) => write!(f, "configuration error: {}", s),
        }
    }
}

impl std::error::Error for Error {}
