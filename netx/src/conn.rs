use std::fmt::Debug;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};

/// A connected, bidirectional byte stream returned by a dial
pub trait AsyncConn: AsyncRead + AsyncWrite + Send + Unpin + Debug + 'static {
    /// The connection this one wraps, if it is a wrapper
    ///
    /// Layers such as TLS or traffic shaping typically wrap another connection. Exposing the
    /// inner connection here lets [`walk_wrapped`] inspect the whole chain.
    fn wrapped(&self) -> Option<&dyn AsyncConn> {
        None
    }
}

/// Boxed connection handed out by [`Dial`](crate::Dial) implementations
pub type Conn = Box<dyn AsyncConn>;

impl AsyncConn for tokio::net::TcpStream {}

impl AsyncConn for DuplexStream {}

impl<T: AsyncConn + ?Sized> AsyncConn for Box<T> {
    fn wrapped(&self) -> Option<&dyn AsyncConn> {
        (**self).wrapped()
    }
}

/// Walk the chain of wrapped connections starting at `conn`
///
/// `f` is called on every connection that wraps another one, outermost first. The walk stops
/// when `f` returns `false` or when a connection that wraps nothing is reached.
pub fn walk_wrapped<'a>(mut conn: &'a dyn AsyncConn, mut f: impl FnMut(&'a dyn AsyncConn) -> bool) {
    while let Some(inner) = conn.wrapped() {
        if !f(conn) {
            return;
        }
        conn = inner;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io,
        pin::Pin,
        task::{Context, Poll},
    };
    use tokio::io::ReadBuf;

    #[derive(Debug)]
    struct Layer {
        inner: Conn,
    }

    impl AsyncRead for Layer {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Layer {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    impl AsyncConn for Layer {
        fn wrapped(&self) -> Option<&dyn AsyncConn> {
            Some(&*self.inner)
        }
    }

    fn stack() -> Conn {
        let (base, _peer) = tokio::io::duplex(64);
        let inner = Layer {
            inner: Box::new(base),
        };
        Box::new(Layer {
            inner: Box::new(inner),
        })
    }

    #[test]
    fn walks_every_wrapper() {
        let conn = stack();
        let mut seen = 0;
        walk_wrapped(&*conn, |_| {
            seen += 1;
            true
        });
        assert_eq!(seen, 2);
    }

    #[test]
    fn walk_stops_when_asked() {
        let conn = stack();
        let mut seen = 0;
        walk_wrapped(&*conn, |_| {
            seen += 1;
            false
        });
        assert_eq!(seen, 1);
    }

    #[test]
    fn unwrapped_conn_is_not_visited() {
        let (base, _peer) = tokio::io::duplex(64);
        let mut seen = 0;
        walk_wrapped(&base, |_| {
            seen += 1;
            true
        });
        assert_eq!(seen, 0);
    }
}
