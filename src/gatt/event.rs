use std::fmt::Debug;

use crate::le::Addr;

use super::*;

/// Event delivered to a calling context.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Event {
    /// Discovery finished. Lists only the services found by this discovery
    /// round, ordered by handle.
    ServicesAdded {
        peer: Addr,
        services: Vec<ServiceRef>,
    },
    /// A service was removed after the remote database changed.
    ServiceRemoved { peer: Addr, service: ServiceRef },
    /// All services of the device were invalidated.
    ServicesInvalidated { peer: Addr },
    /// Discovery failed after exhausting all retries.
    DiscoveryFailed { peer: Addr, err: Error },
    /// Read completed. A successful read with a non-zero length must be
    /// consumed with `Client::consume_read`.
    ReadResponse {
        att: AttRef,
        len: usize,
        result: Result<()>,
    },
    /// Write with response completed.
    WriteResponse { att: AttRef, result: Result<()> },
    /// Subscription change was confirmed or rejected.
    Subscribed {
        chr: CharRef,
        typ: SubType,
        result: Result<()>,
    },
    /// The context's notification buffer has records to consume.
    NotificationsPending,
    /// Notification drained by the kernel for a kernel client that is not
    /// built into the core.
    Notification { chr: CharRef, value: Vec<u8> },
}

/// Receiver of events for one calling context. Events are delivered with the
/// connection lock held, so sinks may call back into the client but must not
/// block.
pub trait EventSink: Debug + Send + Sync {
    fn event(&self, ctx: Context, ev: Event);
}

/// Kernel-side consumer of an attribute.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum KernelClient {
    /// Built-in PPoGATT transport.
    PPoGatt,
    /// Built-in Service Changed handler.
    ServiceChanged,
    /// Any other kernel protocol client, reached through the event sink.
    External,
}

/// Side effect collected while the state is borrowed.
#[derive(Debug)]
pub(crate) enum Effect {
    Event(Context, Event),
    Session(crate::ppogatt::SessionEvent),
}
