use std::fmt;

/// The declared or inferred length of a message body: an empty body is
/// represented as `DecodedLength::ZERO`, a known length `n` as
/// `DecodedLength(n)`, and a chunked body as the `CHUNKED` sentinel.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct DecodedLength(u64);

const MAX_LEN: u64 = u64::MAX - 2;

impl DecodedLength {
    /// Sentinel for a body whose end is the connection's close, never used
    /// for requests (neither `Content-Length` nor `Transfer-Encoding` on a
    /// request means an empty body, not read-until-close).
    pub(crate) const CLOSE_DELIMITED: DecodedLength = DecodedLength(u64::MAX);
    pub(crate) const CHUNKED: DecodedLength = DecodedLength(u64::MAX - 1);
    pub(crate) const ZERO: DecodedLength = DecodedLength(0);

    #[cfg(test)]
    pub(crate) fn new(len: u64) -> Self {
        debug_assert!(len <= MAX_LEN);
        DecodedLength(len)
    }

    /// Takes the length as a content-length without other checks. Should
    /// only be called once `CLOSE_DELIMITED`/`CHUNKED` have been ruled out.
    #[inline]
    pub(crate) fn danger_len(self) -> u64 {
        debug_assert!(self.0 < Self::CHUNKED.0);
        self.0
    }

    /// Converts to an `Option<u64>` representing a known or unknown length.
    pub(crate) fn into_opt(self) -> Option<u64> {
        match self {
            DecodedLength::CHUNKED | DecodedLength::CLOSE_DELIMITED => None,
            DecodedLength(known) => Some(known),
        }
    }

    /// Checks that `len` is within the maximum allowed `Content-Length`.
    pub(crate) fn checked_new(len: u64) -> Result<Self, crate::error::Error> {
        if len <= MAX_LEN {
            Ok(DecodedLength(len))
        } else {
            warn!("content-length bigger than maximum: {} > {}", len, MAX_LEN);
            Err(crate::error::Error::new_framing_mismatch())
        }
    }
}

impl fmt::Debug for DecodedLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DecodedLength::CLOSE_DELIMITED => f.write_str("CLOSE_DELIMITED"),
            DecodedLength::CHUNKED => f.write_str("CHUNKED"),
            DecodedLength(n) => f.debug_tuple("DecodedLength").field(&n).finish(),
        }
    }
}

impl fmt::Display for DecodedLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DecodedLength::CLOSE_DELIMITED => f.write_str("close-delimited"),
            DecodedLength::CHUNKED => f.write_str("chunked encoding"),
            DecodedLength::ZERO => f.write_str("empty"),
            DecodedLength(n) => write!(f, "content-length ({} bytes)", n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_new_within_limit() {
        assert!(DecodedLength::checked_new(1024).is_ok());
    }

    #[test]
    fn checked_new_over_limit() {
        assert!(DecodedLength::checked_new(u64::MAX).is_err());
    }

    #[test]
    fn into_opt() {
        assert_eq!(DecodedLength::new(5).into_opt(), Some(5));
        assert_eq!(DecodedLength::CHUNKED.into_opt(), None);
        assert_eq!(DecodedLength::CLOSE_DELIMITED.into_opt(), None);
    }
}
