//! Socket pumps run by [`TungsteniteTransport`](crate::TungsteniteTransport).

pub(crate) mod ping;
pub(crate) mod read;
pub(crate) mod write;
