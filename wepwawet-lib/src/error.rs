use thiserror::Error;

/// Errors surfaced by the routing core.
///
/// `up()` paths abort on the first error and roll back; `down()` paths log
/// failures at WARN, keep going, and hand back the first error once every
/// release step has been attempted.
#[derive(Debug, Error)]
pub enum Error {
    #[error("netlink {op} failed for {arg}: {source}")]
    Netlink {
        op: &'static str,
        arg: String,
        #[source]
        source: rtnetlink::Error,
    },

    #[error("resource allocation failed: {0}")]
    Allocation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{program} {args} exited with {status}")]
    Firewall {
        program: &'static str,
        args: String,
        status: String,
    },

    #[error("unable to spawn child process: {0}")]
    Child(#[source] std::io::Error),

    #[error("wireguard device error: {0}")]
    WireGuard(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid state: {0}")]
    State(&'static str),
}

impl Error {
    pub(crate) fn netlink(op: &'static str, arg: impl ToString, source: rtnetlink::Error) -> Self {
        Error::Netlink {
            op,
            arg: arg.to_string(),
            source,
        }
    }
}
