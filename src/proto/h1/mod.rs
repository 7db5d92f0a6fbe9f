pub(crate) use self::conn::{Conn, ConnOptions};
pub(crate) use self::decode::Decoder;
pub(crate) use self::encode::{EncodedBuf, Encoder};

pub(crate) use crate::body::DecodedLength;

mod conn;
mod date;
mod decode;
mod encode;
pub(crate) mod io;
mod parse;
pub(crate) mod role;
