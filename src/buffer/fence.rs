use std::fmt;

/// GPU completion marker produced by the writing context.
///
/// The compositor never branches on fence state when drawing; it hands the fence to the reading
/// context, which orders its sampling after the fence (see [`crate::TextureMapper::wait_fence`]).
pub trait Fence: Send + Sync + fmt::Debug {
    /// Non-blocking query. Diagnostics and tests only.
    fn is_signaled(&self) -> bool;

    /// Make the calling GPU context wait for the fence before executing further commands.
    ///
    /// On hardware this enqueues a server-side wait and returns immediately. Implementations backed
    /// by a synchronous device may block here, which is the same thing from the device's point of
    /// view.
    fn server_wait(&self);
}
