//! Capability shared by every transport endpoint

/// Common surface of the stream and datagram endpoints
pub trait Transport {
    /// Short name used in log messages ("TCP", "UDP")
    fn transport_id(&self) -> &'static str;

    /// Local port the endpoint is bound to, 0 if not yet bound
    fn local_port(&self) -> u16;

    /// Stop background threads and release sockets
    ///
    /// Idempotent; also invoked on drop.
    fn shutdown(&mut self);
}
