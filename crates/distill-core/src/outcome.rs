//! Outcome taxonomy for observed request results.
//!
//! Every handler invocation and transport call is classified into one of a
//! small set of outcome classes. The classes are the *only* signal consumed
//! by the feedback controllers, which keeps them decoupled from any
//! particular transport's error types.
//!
//! Classification works by case-insensitive substring match on the error's
//! `Display` output. This is deliberately forgiving: errors funnel in from
//! HTTP clients, the store, and task joins, and not all of them expose
//! structured kinds. Transports that *can* report structured kinds should
//! format their messages so the matcher picks them up (e.g. include the
//! numeric HTTP status).

use std::fmt;

/// Classification of a single observed request outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The request succeeded.
    Ok,
    /// The remote endpoint rejected the request for exceeding a rate limit.
    RateLimited,
    /// The request timed out before completing.
    Timeout,
    /// A network-level failure (reset, broken pipe, DNS, unreachable).
    NetError,
    /// The remote endpoint reported a server-side (5xx) failure.
    ServerError,
    /// Any other failure.
    Other,
}

impl Outcome {
    /// All outcome classes, in stable order. Useful for indexed counters.
    pub const ALL: [Outcome; 6] = [
        Outcome::Ok,
        Outcome::RateLimited,
        Outcome::Timeout,
        Outcome::NetError,
        Outcome::ServerError,
        Outcome::Other,
    ];

    /// Classify an error message into an outcome class.
    ///
    /// The match list is ordered: rate limiting takes precedence over
    /// timeouts, timeouts over generic network failures, and so on, so that
    /// a message like `"429 too many requests: request timed out"` counts as
    /// rate limited.
    pub fn classify(message: &str) -> Outcome {
        let msg = message.to_ascii_lowercase();

        if msg.contains("429") || msg.contains("too many requests") {
            return Outcome::RateLimited;
        }
        if msg.contains("deadline exceeded")
            || msg.contains("deadline has elapsed")
            || msg.contains("tls handshake timeout")
            || msg.contains("i/o timeout")
            || msg.contains("timed out")
            || msg.contains("timeout")
        {
            return Outcome::Timeout;
        }
        if msg.contains("connection reset")
            || msg.contains("connection refused")
            || msg.contains("broken pipe")
            || msg.contains("unexpected eof")
            || msg.contains("eof")
            || msg.contains("no such host")
            || msg.contains("dns")
            || msg.contains("network is unreachable")
            || msg.contains("unreachable")
        {
            return Outcome::NetError;
        }
        if msg.contains("500")
            || msg.contains("502")
            || msg.contains("503")
            || msg.contains("504")
            || msg.contains("internal server error")
            || msg.contains("bad gateway")
            || msg.contains("service unavailable")
            || msg.contains("server error")
        {
            return Outcome::ServerError;
        }

        Outcome::Other
    }

    /// Classify the error side of a result, treating `Ok` as [`Outcome::Ok`].
    pub fn of<T, E: fmt::Display>(result: &Result<T, E>) -> Outcome {
        match result {
            Ok(_) => Outcome::Ok,
            Err(e) => Outcome::classify(&e.to_string()),
        }
    }

    /// Whether this outcome represents a failure of any class.
    pub fn is_error(self) -> bool {
        self != Outcome::Ok
    }

    /// Whether this outcome is a transport-level congestion signal
    /// (rate limited, timeout, network, or server error).
    pub fn is_transport(self) -> bool {
        matches!(
            self,
            Outcome::RateLimited | Outcome::Timeout | Outcome::NetError | Outcome::ServerError
        )
    }

    /// Stable index into per-outcome counter arrays.
    pub fn index(self) -> usize {
        match self {
            Outcome::Ok => 0,
            Outcome::RateLimited => 1,
            Outcome::Timeout => 2,
            Outcome::NetError => 3,
            Outcome::ServerError => 4,
            Outcome::Other => 5,
        }
    }

    /// Short stable label, used in metrics and decision strings.
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::RateLimited => "rate_limited",
            Outcome::Timeout => "timeout",
            Outcome::NetError => "net_error",
            Outcome::ServerError => "server_error",
            Outcome::Other => "other",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
