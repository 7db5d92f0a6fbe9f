use std::time::Duration;
use std::{fmt, sync::Arc};
use std::{pin::Pin, time::Instant};

use crate::rt::Sleep;
use crate::rt::Timer;

/// A user-provided timer, used to back `timeout_idle_connection`,
/// `timeout_request_body`, and `timeout_response`.
#[derive(Clone)]
pub(crate) enum Time {
    Timer(Arc<dyn Timer + Send + Sync>),
    Empty,
}

/// Whether a timeout duration came from a built-in default or was set
/// explicitly through the builder; only the latter panics when no timer has
/// been supplied, since the former is allowed to just mean "disabled".
#[derive(Clone, Copy, Debug)]
pub(crate) enum Dur {
    Default(Option<Duration>),
    Configured(Option<Duration>),
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Time::Timer(_) => f.write_str("Time::Timer"),
            Time::Empty => f.write_str("Time::Empty"),
        }
    }
}

impl Time {
    pub(crate) fn sleep_until(&self, deadline: Instant) -> Pin<Box<dyn Sleep>> {
        match *self {
            Time::Empty => panic!("a timer must be supplied to use timeouts"),
            Time::Timer(ref t) => t.sleep_until(deadline),
        }
    }

    pub(crate) fn reset(&self, sleep: &mut Pin<Box<dyn Sleep>>, new_deadline: Instant) {
        match *self {
            Time::Empty => panic!("a timer must be supplied to use timeouts"),
            Time::Timer(ref t) => t.reset(sleep, new_deadline),
        }
    }

    pub(crate) fn check(&self, dur: Dur, name: &'static str) -> Option<Duration> {
        match dur {
            Dur::Default(Some(dur)) => match self {
                Time::Empty => {
                    warn!("timeout `{}` has a default, but no timer was set", name);
                    None
                }
                Time::Timer(..) => Some(dur),
            },
            Dur::Configured(Some(dur)) => match self {
                Time::Empty => panic!("timeout `{}` was set, but no timer was supplied", name),
                Time::Timer(..) => Some(dur),
            },
            Dur::Default(None) | Dur::Configured(None) => None,
        }
    }
}
