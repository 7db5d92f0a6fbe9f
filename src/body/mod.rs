//! Request and response bodies.
//!
//! Handlers receive a [`Request<Incoming>`](crate::Request) whose body is a
//! lazy stream of bytes bounded to the declared `Content-Length` or decoded
//! chunk stream. Response bodies are any [`http_body::Body<Data = Bytes>`],
//! which the exchange loop reframes before writing it out.
pub use self::incoming::Incoming;
pub(crate) use self::incoming::BodyHandle;
pub(crate) use self::length::DecodedLength;

mod incoming;
mod length;

fn _assert_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    assert_send::<Incoming>();
    assert_sync::<DecodedLength>();
}
