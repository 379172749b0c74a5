//! Connection tracking for graceful draining.
//!
//! A yielding process closes its listener and waits until every connection it
//! accepted has been closed:
//!
//! ```no_run
//! # async fn run(listener: tokio::net::TcpListener) -> std::io::Result<()> {
//! use socket_activation::TrackingListener;
//!
//! let listener = TrackingListener::new(listener);
//! let conn = listener.accept().await?;
//! tokio::spawn(async move {
//!     // serve `conn`; dropping it releases the slot
//!     drop(conn);
//! });
//! listener.close().wait().await;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

/// Anything that hands out connections.
pub trait Accept {
    type Conn: Send;

    fn accept_conn(&self) -> impl Future<Output = io::Result<Self::Conn>> + Send;
}

impl Accept for tokio::net::TcpListener {
    type Conn = tokio::net::TcpStream;

    async fn accept_conn(&self) -> io::Result<Self::Conn> {
        let (stream, _) = self.accept().await?;
        Ok(stream)
    }
}

impl Accept for tokio::net::UnixListener {
    type Conn = tokio::net::UnixStream;

    async fn accept_conn(&self) -> io::Result<Self::Conn> {
        let (stream, _) = self.accept().await?;
        Ok(stream)
    }
}

/// Listener wrapper counting connections that are still open.
pub struct TrackingListener<L> {
    inner: L,
    active: Arc<watch::Sender<usize>>,
}

impl<L: Accept> TrackingListener<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            active: Arc::new(watch::Sender::new(0)),
        }
    }

    /// Accept the next connection and start tracking it.
    pub async fn accept(&self) -> io::Result<Tracked<L::Conn>> {
        let conn = self.inner.accept_conn().await?;
        self.active.send_modify(|n| *n += 1);
        Ok(Tracked {
            conn,
            guard: ConnectionGuard {
                active: Arc::clone(&self.active),
                released: AtomicBool::new(false),
            },
        })
    }

    /// Number of accepted connections not yet closed.
    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    /// Stop accepting; the returned [`Drain`] resolves once every tracked
    /// connection is gone.
    pub fn close(self) -> Drain {
        Drain {
            active: self.active,
        }
    }
}

/// Waits for the connections of a closed [`TrackingListener`].
pub struct Drain {
    active: Arc<watch::Sender<usize>>,
}

impl Drain {
    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    pub async fn wait(self) {
        let mut rx = self.active.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// A connection counted by its [`TrackingListener`] until closed or dropped.
pub struct Tracked<C> {
    conn: C,
    guard: ConnectionGuard,
}

impl<C> Tracked<C> {
    /// Stop counting this connection. Only the first call has an effect.
    pub fn release(&self) {
        self.guard.release();
    }

    /// Release the slot and hand back the raw connection.
    pub fn into_inner(self) -> C {
        let Tracked { conn, guard } = self;
        drop(guard);
        conn
    }
}

impl<C> Deref for Tracked<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for Tracked<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

struct ConnectionGuard {
    active: Arc<watch::Sender<usize>>,
    released: AtomicBool,
}

impl ConnectionGuard {
    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.active.send_modify(|n| *n = n.saturating_sub(1));
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.release();
    }
}
