#[derive(Debug, thiserror::Error)]
pub enum CtError {
    #[error("{0}")]
    InsufficientPermission(String),
    #[error("netlink socket error: {0}")]
    Socket(#[source] std::io::Error),
    #[error("netlink socket closed")]
    SocketClosed,
    #[error("netlink request error: {0}")]
    Request(#[source] std::io::Error),
    #[error("netlink message validation error: {0}")]
    Validation(String),
    #[error("not enough data for netlink error code")]
    ShortErrorMessage,
    #[error("netlink error frame: errno {0}")]
    Kernel(i32),
    #[error("network namespace error: {0}")]
    Namespace(#[source] std::io::Error),
    #[error("invalid sampling rate {0}")]
    SamplingRate(f64),
    #[error("failed to attach BPF sampling filter: {0}")]
    FilterAttach(#[source] std::io::Error),
    #[error("fatal: {0}")]
    Fatal(String),
}
