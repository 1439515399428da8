use std::{io, time::Duration};

use crate::{config::DEFAULT_DIAL_TIMEOUT, conn::Conn, BoxFuture, Context, Network};

/// Something that dials within a [`Context`]
pub trait ContextDialer: Send + Sync {
    /// Dial `addr` over `network`, giving up when `ctx` is cancelled or expires
    fn dial_context<'a>(
        &'a self,
        ctx: &'a Context,
        network: Network,
        addr: &'a str,
    ) -> BoxFuture<'a, io::Result<Conn>>;
}

/// Timeout-based dialing for every [`ContextDialer`]
pub trait DialerExt: ContextDialer {
    /// Dial with the default timeout of one minute
    fn dial<'a>(&'a self, network: Network, addr: &'a str) -> BoxFuture<'a, io::Result<Conn>> {
        self.dial_timeout(network, addr, DEFAULT_DIAL_TIMEOUT)
    }

    /// Dial, giving up after `timeout`
    fn dial_timeout<'a>(
        &'a self,
        network: Network,
        addr: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, io::Result<Conn>> {
        Box::pin(async move {
            let guard = Context::background().with_timeout(timeout).guard();
            self.dial_context(guard.context(), network, addr).await
        })
    }
}

impl<T: ContextDialer + ?Sized> DialerExt for T {}
