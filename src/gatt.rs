//! Generic Attribute Profile client core ([Vol 3] Part G).
//!
//! The core tracks live connections, discovers the remote attribute database,
//! issues GATT operations on behalf of two calling contexts (kernel and
//! application), and multiplexes remote notifications into per-context ring
//! buffers. All mutable state sits behind a single reentrant lock owned by
//! [`Client`].

use std::ops::{Index, IndexMut};

pub use ntf::{Consumed, NotificationHeader};
pub use {client::*, consts::*, event::*, refs::*, registry::*, tree::*};

use crate::{att, host};

mod client;
mod consts;
mod discovery;
mod event;
mod ntf;
mod ops;
mod refs;
mod registry;
mod subscribe;
mod tree;


/// Error type returned by the GATT client core.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid or stale reference")]
    InvalidParameter,
    #[error("device not connected")]
    NotConnected,
    #[error("already in the requested state")]
    AlreadyInState,
    #[error("operation already in progress")]
    InProgress,
    #[error("operation not supported by the attribute")]
    NotSupported,
    #[error("not enough resources")]
    NoResources,
    #[error("buffer too small ({need} bytes required)")]
    BufferTooSmall { need: usize },
    #[error("nothing to consume")]
    Empty,
    #[error("service discovery timed out")]
    DiscoveryTimeout,
    #[error("remote error: {0}")]
    Att(#[from] att::ErrorCode),
    #[error(transparent)]
    Host(#[from] host::Error),
}

impl Error {
    /// Returns whether the error indicates transient resource exhaustion that
    /// the caller may retry.
    #[inline]
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::NoResources | Self::Host(host::Error::OutOfResources)
        )
    }
}

/// Common GATT result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Trust domain issuing GATT requests and consuming notifications.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, enum_iterator::Sequence)]
pub enum Context {
    /// Operating system and built-in protocol clients.
    Kernel,
    /// User application behind the syscall boundary.
    App,
}

impl Context {
    #[inline(always)]
    const fn idx(self) -> usize {
        match self {
            Self::Kernel => 0,
            Self::App => 1,
        }
    }
}

crate::util::impl_display_via_debug! { Context }

/// Fixed map with one value per [`Context`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PerContext<T>([T; 2]);

impl<T> PerContext<T> {
    /// Creates a map from kernel and application values.
    #[inline]
    #[must_use]
    pub const fn new(kernel: T, app: T) -> Self {
        Self([kernel, app])
    }

    /// Returns an iterator over `(Context, &T)` pairs.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (Context, &T)> {
        enum_iterator::all::<Context>().map(|ctx| (ctx, &self[ctx]))
    }
}

impl<T> Index<Context> for PerContext<T> {
    type Output = T;

    #[inline(always)]
    fn index(&self, ctx: Context) -> &Self::Output {
        &self.0[ctx.idx()]
    }
}

impl<T> IndexMut<Context> for PerContext<T> {
    #[inline(always)]
    fn index_mut(&mut self, ctx: Context) -> &mut Self::Output {
        &mut self.0[ctx.idx()]
    }
}
